use crate::buffer_pool::BufferPool;
use crate::config::ListenerConfig;
use crate::race::Racer;
use crate::session::{Session, SessionError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// One listening socket and the racer for its upstream set
pub struct Listener {
    inner: TcpListener,
    racer: Arc<Racer>,
    pool: Arc<BufferPool>,
    sessions: TaskTracker,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig, pool: Arc<BufferPool>) -> io::Result<Self> {
        let inner = TcpListener::bind(&config.listen).await?;
        Ok(Self {
            inner,
            racer: Arc::new(Racer::from_config(config)),
            pool,
            sessions: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept and serve clients until `shutdown` fires, then wait for every
    /// session and every loser cleanup task to finish.
    pub async fn serve(self, shutdown: CancellationToken) {
        let Listener {
            inner,
            racer,
            pool,
            sessions,
        } = self;
        let local = inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = inner.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept error on {}: {} (continuing)", local, e);
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", peer, e);
            }

            let racer = racer.clone();
            let pool = pool.clone();
            let cancel = shutdown.clone();
            sessions.spawn(async move {
                let mut session = Session::new(peer, &racer, &pool);
                match session.run(stream, &cancel).await {
                    Ok(_) => {}
                    Err(SessionError::Negotiation(e) | SessionError::Request(e))
                        if e.is_protocol_violation() =>
                    {
                        debug!("[{}] protocol violation from {}: {}", session.id(), peer, e)
                    }
                    Err(
                        e @ (SessionError::Race { .. }
                        | SessionError::Reply(_)
                        | SessionError::Relay(_)),
                    ) => warn!("[{}] {}: {}", session.id(), peer, e),
                    // Early client disconnects and shutdown
                    Err(e) => debug!("[{}] {}: {}", session.id(), peer, e),
                }
            });
        }

        // Closing the socket refuses new clients while sessions drain
        drop(inner);
        sessions.close();
        if !sessions.is_empty() {
            info!("{}: waiting for {} sessions to finish", local, sessions.len());
        }
        sessions.wait().await;
        racer.shutdown().await;
        info!("{}: listener stopped", local);
    }
}
