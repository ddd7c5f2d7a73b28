use crate::addr::TargetAddr;
use crate::config::{ListenerConfig, UpstreamConfig};
use crate::socks::{self, Connected, SocksError, SocksResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// One upstream that did not produce a usable connection
#[derive(Debug)]
pub struct UpstreamFailure {
    /// Display name of the upstream, `name (address)` or just the address
    pub upstream: String,
    pub latency: Duration,
    pub error: SocksError,
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {:?}: {}", self.upstream, self.latency, self.error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("no upstream succeeded within {0:?}")]
    Timeout(Duration),

    #[error("all {} upstreams failed: {}", .0.len(), summarize(.0))]
    Exhausted(Vec<UpstreamFailure>),

    #[error("race cancelled")]
    Cancelled,
}

fn summarize(failures: &[UpstreamFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The upstream connection that won a race
#[derive(Debug)]
pub struct Winner {
    pub stream: TcpStream,
    /// Bound address reported by the upstream
    pub bound: TargetAddr,
    /// Index into the racer's upstream list
    pub upstream: usize,
    pub latency: Duration,
    /// Won through the affinity fast path rather than a full race
    pub via_affinity: bool,
}

/// Remembers the most recent race winner for a fixed TTL
pub struct WinnerCache {
    ttl: Duration,
    entry: RwLock<Option<(usize, Instant)>>,
}

impl WinnerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    /// The cached upstream, if its entry has not expired
    pub async fn get(&self) -> Option<usize> {
        let entry = self.entry.read().await;
        match *entry {
            Some((upstream, expires_at)) if Instant::now() < expires_at => Some(upstream),
            _ => None,
        }
    }

    pub async fn record(&self, upstream: usize) {
        *self.entry.write().await = Some((upstream, Instant::now() + self.ttl));
    }

    /// Forget `upstream` if it is still the cached winner
    pub async fn evict(&self, upstream: usize) {
        let mut entry = self.entry.write().await;
        if matches!(*entry, Some((cached, _)) if cached == upstream) {
            *entry = None;
        }
    }
}

struct Attempt {
    upstream: usize,
    latency: Duration,
    result: SocksResult<Connected>,
}

/// Races every configured upstream for each request.
///
/// One racer exists per listener. Losing connections are closed by cleanup
/// tasks on the racer's tracker, which [`Racer::shutdown`] waits for.
pub struct Racer {
    upstreams: Arc<[UpstreamConfig]>,
    timeout: Duration,
    affinity: Option<WinnerCache>,
    cleanup: TaskTracker,
}

impl Racer {
    pub fn new(upstreams: Vec<UpstreamConfig>, timeout: Duration, affinity_ttl: Option<Duration>) -> Self {
        Self {
            upstreams: upstreams.into(),
            timeout,
            affinity: affinity_ttl.map(WinnerCache::new),
            cleanup: TaskTracker::new(),
        }
    }

    pub fn from_config(config: &ListenerConfig) -> Self {
        Self::new(config.socks.clone(), config.race_timeout(), config.affinity_ttl())
    }

    pub fn upstream(&self, index: usize) -> &UpstreamConfig {
        &self.upstreams[index]
    }

    /// Get a connection to `target` through the fastest upstream.
    ///
    /// With the affinity cache enabled, a cached winner is tried on its own
    /// first for at most half the race timeout; if that fails the entry is
    /// evicted and a full race runs against the rest of the budget.
    pub async fn connect(
        &self,
        target: &TargetAddr,
        cancel: &CancellationToken,
    ) -> Result<Winner, RaceError> {
        let started = Instant::now();
        let deadline = started + self.timeout;

        let Some(cache) = &self.affinity else {
            return self.race(target, deadline, cancel).await;
        };

        if let Some(upstream) = cache.get().await {
            let direct_deadline = started + self.timeout / 2;
            let address = self.upstreams[upstream].address.clone();
            match attempt(address, target.clone(), direct_deadline, cancel.clone()).await {
                Ok(conn) => {
                    return Ok(Winner {
                        stream: conn.stream,
                        bound: conn.bound,
                        upstream,
                        latency: started.elapsed(),
                        via_affinity: true,
                    })
                }
                Err(SocksError::Cancelled) => return Err(RaceError::Cancelled),
                Err(e) => {
                    debug!(
                        "cached upstream {} failed for {}: {}, racing all",
                        self.upstreams[upstream], target, e
                    );
                    cache.evict(upstream).await;
                }
            }
        }

        let winner = self.race(target, deadline, cancel).await?;
        cache.record(winner.upstream).await;
        Ok(winner)
    }

    /// Dial every upstream at once and return the first completed handshake
    async fn race(
        &self,
        target: &TargetAddr,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Winner, RaceError> {
        let started = Instant::now();
        let total = self.upstreams.len();
        // Capacity covers every attempt so no sender ever waits on the receiver
        let (tx, mut rx) = mpsc::channel(total.max(1));

        for (index, upstream) in self.upstreams.iter().enumerate() {
            let tx = tx.clone();
            let address = upstream.address.clone();
            let target = target.clone();
            let cancel = cancel.clone();
            self.cleanup.spawn(async move {
                let attempt_started = Instant::now();
                let result = attempt(address, target, deadline, cancel).await;
                let _ = tx
                    .send(Attempt {
                        upstream: index,
                        latency: attempt_started.elapsed(),
                        result,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut failures = Vec::with_capacity(total);
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.discard_losers(rx);
                    return Err(RaceError::Cancelled);
                }
                received = rx.recv() => received,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("race for {} timed out after {:?}", target, started.elapsed());
                    self.discard_losers(rx);
                    return Err(RaceError::Timeout(self.timeout));
                }
            };

            let Some(Attempt { upstream, latency, result }) = received else {
                return Err(self.all_failed(failures, deadline));
            };

            match result {
                Ok(conn) => {
                    self.discard_losers(rx);
                    return Ok(Winner {
                        stream: conn.stream,
                        bound: conn.bound,
                        upstream,
                        latency,
                        via_affinity: false,
                    });
                }
                Err(error) => {
                    debug!(
                        "upstream {} failed for {} after {:?}: {}",
                        self.upstreams[upstream], target, latency, error
                    );
                    failures.push(UpstreamFailure {
                        upstream: self.upstreams[upstream].to_string(),
                        latency,
                        error,
                    });
                    if failures.len() == total {
                        return Err(self.all_failed(failures, deadline));
                    }
                }
            }
        }
    }

    /// Outcome once every attempt has reported a failure.
    ///
    /// Attempts share the race deadline, so their own expiry can be received
    /// before the race's timer fires. Any attempt cut off by the deadline
    /// makes the race a timeout rather than an exhaustion.
    fn all_failed(&self, failures: Vec<UpstreamFailure>, deadline: Instant) -> RaceError {
        let cut_off = Instant::now() >= deadline
            && failures
                .iter()
                .any(|f| matches!(f.error, SocksError::Timeout));
        if cut_off {
            RaceError::Timeout(self.timeout)
        } else {
            RaceError::Exhausted(failures)
        }
    }

    /// Close every connection still to arrive on `rx` without holding up the
    /// caller
    fn discard_losers(&self, mut rx: mpsc::Receiver<Attempt>) {
        let upstreams = self.upstreams.clone();
        self.cleanup.spawn(async move {
            while let Some(attempt) = rx.recv().await {
                if let Ok(conn) = attempt.result {
                    debug!(
                        "closing losing connection via {} ({:?})",
                        upstreams[attempt.upstream], attempt.latency
                    );
                    drop(conn);
                }
            }
        });
    }

    /// Wait for in-flight attempts and loser cleanup to finish
    pub async fn shutdown(&self) {
        self.cleanup.close();
        self.cleanup.wait().await;
    }
}

/// Dial one upstream, giving up at `deadline` or when `cancel` fires
async fn attempt(
    address: String,
    target: TargetAddr,
    deadline: Instant,
    cancel: CancellationToken,
) -> SocksResult<Connected> {
    tokio::select! {
        res = tokio::time::timeout_at(deadline, socks::dial(&address, &target)) => {
            res.map_err(|_| SocksError::Timeout)?
        }
        _ = cancel.cancelled() => Err(SocksError::Cancelled),
    }
}
