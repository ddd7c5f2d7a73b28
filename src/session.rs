use crate::addr::TargetAddr;
use crate::buffer_pool::BufferPool;
use crate::connection::SessionGuard;
use crate::race::{RaceError, Racer};
use crate::relay::{self, HalfClose, RelayStats};
use crate::socks::{self, Reply, SocksError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Global session counter for generating unique session IDs
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique session ID
///
/// The session ID is composed of:
/// - Current timestamp (lower 48 bits of nanoseconds since UNIX epoch)
/// - Monotonic counter (lower 32 bits)
///
/// It only tags log lines, so it is kept short and lowercase hex.
pub fn new_session_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:x}{:x}",
        now.as_nanos() & 0xffffffffffff,
        counter & 0xffffffff
    )
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Accepted,
    Negotiated,
    RequestParsed,
    Resolved,
    Replied,
    Relaying,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Accepted => "accepted",
            State::Negotiated => "negotiated",
            State::RequestParsed => "request-parsed",
            State::Resolved => "resolved",
            State::Replied => "replied",
            State::Relaying => "relaying",
            State::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("negotiation failed: {0}")]
    Negotiation(SocksError),

    #[error("bad request: {0}")]
    Request(SocksError),

    #[error("no upstream for {target}: {source}")]
    Race { target: TargetAddr, source: RaceError },

    #[error("failed to send success reply: {0}")]
    Reply(SocksError),

    #[error("relay failed: {0}")]
    Relay(std::io::Error),

    #[error("shut down while {0}")]
    Cancelled(State),
}

impl SessionError {
    /// The last state the session reached before failing
    pub fn state(&self) -> State {
        match self {
            SessionError::Negotiation(_) => State::Accepted,
            SessionError::Request(_) => State::Negotiated,
            SessionError::Race { .. } => State::RequestParsed,
            SessionError::Reply(_) => State::Resolved,
            SessionError::Relay(_) => State::Relaying,
            SessionError::Cancelled(state) => *state,
        }
    }
}

/// One accepted client connection, from negotiation to close
pub struct Session<'a> {
    id: String,
    peer: SocketAddr,
    racer: &'a Racer,
    pool: &'a BufferPool,
    state: State,
}

impl<'a> Session<'a> {
    pub fn new(peer: SocketAddr, racer: &'a Racer, pool: &'a BufferPool) -> Self {
        Self {
            id: new_session_id(),
            peer,
            racer,
            pool,
            state: State::Accepted,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    pub fn state(&self) -> State {
        self.state
    }

    /// Serve `client` until the relay finishes or a step fails.
    ///
    /// The client stream is always dropped (closed) by the time this returns.
    pub async fn run<S>(
        &mut self,
        client: S,
        cancel: &CancellationToken,
    ) -> Result<RelayStats, SessionError>
    where
        S: AsyncRead + AsyncWrite + HalfClose + Unpin,
    {
        let _guard = SessionGuard::new();
        let result = self.drive(client, cancel).await;
        self.state = State::Closed;

        match &result {
            Ok(stats) => debug!(
                "[{}] closed: {} bytes up, {} bytes down{}",
                self.id,
                stats.client_to_upstream,
                stats.upstream_to_client,
                if stats.cancelled { " (shutdown)" } else { "" }
            ),
            Err(e) => debug!("[{}] closed after {}: {}", self.id, e.state(), e),
        }
        result
    }

    async fn drive<S>(
        &mut self,
        mut client: S,
        cancel: &CancellationToken,
    ) -> Result<RelayStats, SessionError>
    where
        S: AsyncRead + AsyncWrite + HalfClose + Unpin,
    {
        let target = tokio::select! {
            res = self.handshake(&mut client) => res?,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled(self.state)),
        };
        debug!("[{}] {} requested {}", self.id, self.peer, target);

        let winner = match self.racer.connect(&target, cancel).await {
            Ok(winner) => winner,
            Err(source) => {
                // Client is told the host is unreachable whatever the cause
                let unspecified = TargetAddr::unspecified();
                let _ = socks::write_reply(&mut client, Reply::HostUnreachable, &unspecified).await;
                return Err(SessionError::Race { target, source });
            }
        };
        self.state = State::Resolved;
        info!(
            "[{}] {} -> {} via {} in {:?}{}",
            self.id,
            self.peer,
            target,
            self.racer.upstream(winner.upstream),
            winner.latency,
            if winner.via_affinity { " (cached)" } else { "" }
        );

        // On failure the winning upstream stream is dropped here with `winner`
        socks::write_reply(&mut client, Reply::Succeeded, &winner.bound)
            .await
            .map_err(SessionError::Reply)?;
        self.state = State::Replied;

        debug!("[{}] relaying", self.id);
        self.state = State::Relaying;
        relay::relay(client, winner.stream, self.pool, cancel)
            .await
            .map_err(SessionError::Relay)
    }

    /// Negotiate and read the CONNECT request
    async fn handshake<S>(&mut self, client: &mut S) -> Result<TargetAddr, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Nothing is sent back if negotiation fails
        socks::accept_negotiation(client)
            .await
            .map_err(SessionError::Negotiation)?;
        self.state = State::Negotiated;

        match socks::read_request(client).await {
            Ok(target) => {
                self.state = State::RequestParsed;
                Ok(target)
            }
            Err(e) => {
                let unspecified = TargetAddr::unspecified();
                let _ = socks::write_reply(client, Reply::GeneralFailure, &unspecified).await;
                Err(SessionError::Request(e))
            }
        }
    }
}
