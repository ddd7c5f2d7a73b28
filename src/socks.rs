use crate::addr::TargetAddr;
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;

/// Upper bound for the TCP connect to an upstream, inside the race deadline
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for SOCKS5 protocol operations
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unknown address type: {0:#04x}")]
    UnknownAddressType(u8),

    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    #[error("upstream refused connect: {}", Reply::describe(*.0))]
    Rejected(u8),

    #[error("timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl SocksError {
    /// Whether the peer broke the SOCKS5 framing rules
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SocksError::ProtocolViolation(_)
                | SocksError::UnsupportedVersion(_)
                | SocksError::NoAcceptableMethod
                | SocksError::UnsupportedCommand(_)
                | SocksError::UnknownAddressType(_)
                | SocksError::DomainTooLong(_)
        )
    }
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

/// Reply codes (RFC 1928 section 6)
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Human-readable description of a raw reply code
    pub fn describe(code: u8) -> &'static str {
        match code {
            0x00 => "succeeded",
            0x01 => "general SOCKS server failure",
            0x02 => "connection not allowed by ruleset",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unassigned reply code",
        }
    }
}

// ---------------------------------------------------------------------------
// Server side: the client talks to us
// ---------------------------------------------------------------------------

/// Read the method-selection message and accept "no authentication".
///
/// Nothing is written back when the client does not offer it; the caller
/// closes the connection.
pub async fn accept_negotiation<S>(stream: &mut S) -> SocksResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(SocksError::UnsupportedVersion(header[0]));
    }

    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(SocksError::ProtocolViolation(
            "empty authentication method list".into(),
        ));
    }
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        return Err(SocksError::NoAcceptableMethod);
    }

    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a CONNECT request and return its destination
pub async fn read_request<S>(stream: &mut S) -> SocksResult<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(SocksError::UnsupportedVersion(header[0]));
    }
    if header[1] != CMD_CONNECT {
        return Err(SocksError::UnsupportedCommand(header[1]));
    }

    let target = TargetAddr::read_from(stream).await?;
    if target.port() == 0 {
        return Err(SocksError::ProtocolViolation(
            "destination port 0".into(),
        ));
    }
    Ok(target)
}

/// Write a reply frame carrying `bound` as BND.ADDR/BND.PORT
pub async fn write_reply<S>(stream: &mut S, reply: Reply, bound: &TargetAddr) -> SocksResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(3 + bound.encoded_len());
    buf.put_u8(VERSION);
    buf.put_u8(reply as u8);
    buf.put_u8(RESERVED);
    bound.encode(&mut buf)?;

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Client side: we talk to an upstream proxy
// ---------------------------------------------------------------------------

/// An upstream connection that finished the CONNECT handshake
#[derive(Debug)]
pub struct Connected {
    pub stream: TcpStream,
    /// Address the upstream reports as bound for this connection
    pub bound: TargetAddr,
}

/// Connect to an upstream proxy and ask it to CONNECT to `target`.
///
/// The caller bounds the whole call with its own deadline; dropping the future
/// drops (and so closes) the socket.
pub async fn dial(upstream: &str, target: &TargetAddr) -> SocksResult<Connected> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(upstream))
        .await
        .map_err(|_| SocksError::Timeout)??;
    stream.set_nodelay(true)?;

    let bound = client_handshake(&mut stream, target).await?;
    Ok(Connected { stream, bound })
}

/// Run the no-auth negotiation and CONNECT exchange over `stream`.
///
/// The reply's bound address is consumed in full before the reply code is
/// checked, so a failed exchange never leaves unread bytes behind.
pub async fn client_handshake<S>(stream: &mut S, target: &TargetAddr) -> SocksResult<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(SocksError::UnsupportedVersion(choice[0]));
    }
    if choice[1] != METHOD_NO_AUTH {
        return Err(SocksError::ProtocolViolation(format!(
            "upstream selected method {:#04x}",
            choice[1]
        )));
    }

    let mut request = BytesMut::with_capacity(3 + target.encoded_len());
    request.put_slice(&[VERSION, CMD_CONNECT, RESERVED]);
    target.write_to(&mut request)?;
    trace!("sending connect request ({} bytes) for {}", request.len(), target);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(SocksError::UnsupportedVersion(header[0]));
    }

    let bound = TargetAddr::read_after_atyp(stream, header[3]).await?;
    trace!("upstream reply: rep={:#04x} bound={}", header[1], bound);

    if header[1] != Reply::Succeeded as u8 {
        return Err(SocksError::Rejected(header[1]));
    }
    Ok(bound)
}
