mod addr;
mod buffer_pool;
mod config;
mod connection;
mod listener;
mod race;
mod relay;
mod session;
mod socks;
#[cfg(test)]
mod testutil;

use crate::buffer_pool::BufferPool;
use crate::config::{Cli, Config};
use crate::connection::{SessionGuard, HIGH_LOAD_THRESHOLD};
use crate::listener::Listener;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sockracer=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Config::from_cli(&args)?;

    // Shared by every listener's relays
    let pool = Arc::new(BufferPool::new());
    let shutdown = CancellationToken::new();

    let mut listeners = JoinSet::new();
    for listener_config in &config.listeners {
        let listener = Listener::bind(listener_config, pool.clone())
            .await
            .wrap_err_with(|| format!("failed to listen on {}", listener_config.listen))?;

        info!("SOCKS5 listening on {}", listener.local_addr()?);
        for upstream in &listener_config.socks {
            info!("  upstream: {}", upstream);
        }
        info!(
            "  race timeout {:?}, affinity {}",
            listener_config.race_timeout(),
            match listener_config.affinity_ttl() {
                Some(ttl) => format!("{:?}", ttl),
                None => "off".to_string(),
            }
        );

        listeners.spawn(listener.serve(shutdown.clone()));
    }

    tokio::spawn(monitor(pool.clone(), shutdown.clone()));

    wait_for_signal().await?;
    info!("Shutdown signal received");
    let active = SessionGuard::active_count();
    if active > 0 {
        info!("Closing {} active sessions...", active);
    }
    shutdown.cancel();

    while let Some(res) = listeners.join_next().await {
        if let Err(e) = res {
            warn!("Listener task failed: {}", e);
        }
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Periodic session count and relay buffer report
async fn monitor(pool: Arc<BufferPool>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(300)); // 5 minutes
    interval.tick().await;
    let mut last_active = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let active = SessionGuard::active_count();
        if active > 0 && active != last_active {
            let stats = pool.stats().await;
            info!(
                "Status - active sessions: {}, relay buffers in use: {}, pooled: {} ({} KiB)",
                active,
                stats.in_use(),
                stats.available,
                stats.total_memory_pooled / 1024
            );
        }
        if active > HIGH_LOAD_THRESHOLD {
            warn!("High session load: {} active", active);
        }
        last_active = active;
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).wrap_err("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.wrap_err("failed to install CTRL+C handler")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to install CTRL+C handler")
}
