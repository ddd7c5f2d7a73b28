use crate::buffer_pool::BufferPool;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Streams that can report whether closing their write side leaves the read
/// side usable.
pub trait HalfClose {
    fn supports_half_close(&self) -> bool;
}

impl HalfClose for TcpStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

impl HalfClose for DuplexStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

/// Bytes moved by one relay, per direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    /// The enclosing scope was cancelled before both directions finished
    pub cancelled: bool,
}

enum Exit {
    /// Source reached end of stream
    Eof,
    /// The other direction or the caller tore the relay down
    Stopped,
    Failed(io::Error),
}

/// Copy bytes both ways between `client` and `upstream` until both directions
/// are done.
///
/// Each direction half-closes its destination when its source ends, so the
/// opposite direction keeps draining. A destination without half-close support
/// ends the whole relay instead. When `cancel` fires, both directions stop and
/// both streams are dropped; this function still waits for both loops and
/// returns their buffers to `pool` before returning.
///
/// Both loops are multiplexed in the caller's task with `join!`; no task is
/// spawned per direction.
pub async fn relay<A, B>(
    client: A,
    upstream: B,
    pool: &BufferPool,
    cancel: &CancellationToken,
) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + HalfClose + Unpin,
    B: AsyncRead + AsyncWrite + HalfClose + Unpin,
{
    let client_half_close = client.supports_half_close();
    let upstream_half_close = upstream.supports_half_close();

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let stop = cancel.child_token();
    let mut stats = RelayStats::default();

    let (outbound, inbound) = tokio::join!(
        pump(
            &mut client_read,
            &mut upstream_write,
            upstream_half_close,
            &mut stats.client_to_upstream,
            pool,
            &stop,
        ),
        pump(
            &mut upstream_read,
            &mut client_write,
            client_half_close,
            &mut stats.upstream_to_client,
            pool,
            &stop,
        ),
    );
    stats.cancelled = cancel.is_cancelled();

    match (outbound, inbound) {
        (Exit::Failed(e), _) | (_, Exit::Failed(e)) if !stats.cancelled => Err(e),
        _ => Ok(stats),
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    dest_half_close: bool,
    copied: &mut u64,
    pool: &BufferPool,
    stop: &CancellationToken,
) -> Exit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.acquire().await;

    let exit = tokio::select! {
        res = copy_loop(reader, writer, &mut buf, copied) => match res {
            Ok(()) => Exit::Eof,
            Err(e) => Exit::Failed(e),
        },
        _ = stop.cancelled() => Exit::Stopped,
    };

    pool.release(buf).await;

    match exit {
        Exit::Stopped => {}
        _ if dest_half_close => {
            // Peer may already be gone
            let _ = writer.shutdown().await;
        }
        _ => stop.cancel(),
    }
    exit
}

async fn copy_loop<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
