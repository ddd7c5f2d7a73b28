use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default race timeout when neither the CLI nor the config file sets one
pub const DEFAULT_RACE_TIMEOUT_MS: u64 = 5_000;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "SOCKS5 parallel racing aggregator",
    long_about = "sockracer accepts SOCKS5 CONNECT requests and races every configured upstream \
SOCKS5 proxy in parallel; the first upstream to complete the handshake carries the connection.\n\n\
Config file mode:\n  sockracer --config /path/to/config.json\n  sockracer            (uses ./config.json)\n\n\
Command line mode:\n  sockracer --listen-address 127.0.0.1 --listen-port 1080 \\\n    \
--socks upstream1:1081 --socks upstream2:1082\n"
)]
pub struct Cli {
    /// Path to the JSON config file (ignored when --listen-port is given)
    #[arg(short, long, default_value = "config.json", value_name = "FILE")]
    pub config: PathBuf,

    /// Listen address for command line mode
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_address: String,

    /// Listen port; enables command line mode
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Upstream SOCKS5 proxy (repeatable)
    #[arg(long = "socks", value_name = "HOST:PORT")]
    pub socks: Vec<String>,

    /// Race timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_RACE_TIMEOUT_MS)]
    pub race_timeout_ms: u64,

    /// Remember the last race winner for this many seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub affinity_ttl_secs: u64,
}

/// One upstream SOCKS5 proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl UpstreamConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    #[cfg(test)]
    pub fn named(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }
}

impl fmt::Display for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if !name.is_empty() => write!(f, "{} ({})", name, self.address),
            _ => f.write_str(&self.address),
        }
    }
}

/// One listening socket and the upstreams it races
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub listen: String,
    pub socks: Vec<UpstreamConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub race_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_ttl_secs: Option<u64>,
}

impl ListenerConfig {
    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms.unwrap_or(DEFAULT_RACE_TIMEOUT_MS))
    }

    /// `None` when the affinity cache is disabled
    pub fn affinity_ttl(&self) -> Option<Duration> {
        match self.affinity_ttl_secs {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.listen.is_empty() {
            return Err("listen address is empty".to_string());
        }
        let (host, _) = split_host_port(&self.listen)
            .map_err(|e| format!("invalid listen address: {}", e))?;
        if host.is_empty() {
            return Err("listen host is empty".to_string());
        }

        if self.socks.is_empty() {
            return Err("no socks upstreams configured".to_string());
        }
        for (i, upstream) in self.socks.iter().enumerate() {
            if upstream.address.is_empty() {
                return Err(format!("socks upstream {}: address is empty", i));
            }
            split_host_port(&upstream.address).map_err(|e| {
                format!("invalid socks upstream {} ({}): {}", i, upstream.address, e)
            })?;
        }

        if self.race_timeout_ms == Some(0) {
            return Err("race timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Top-level configuration: every listener the process runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.listeners.is_empty() {
            return Err("no listeners configured".to_string());
        }
        for (i, listener) in self.listeners.iter().enumerate() {
            listener
                .validate()
                .map_err(|e| format!("listener {}: {}", i, e))?;
        }
        Ok(())
    }

    /// Load and validate a JSON config file.
    ///
    /// Listeners that omit timing settings take the given defaults.
    pub fn load(path: &Path, race_timeout_ms: u64, affinity_ttl_secs: u64) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .wrap_err_with(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_defaults(race_timeout_ms, affinity_ttl_secs);
        config.validate().map_err(|e| eyre!(e))?;
        Ok(config)
    }

    /// Fill per-listener settings the file left unset
    fn apply_defaults(&mut self, race_timeout_ms: u64, affinity_ttl_secs: u64) {
        for listener in &mut self.listeners {
            listener.race_timeout_ms.get_or_insert(race_timeout_ms);
            listener.affinity_ttl_secs.get_or_insert(affinity_ttl_secs);
        }
    }

    /// Build the configuration from CLI arguments.
    ///
    /// Command line mode (a listen port was given) builds a single listener
    /// from `--socks`; otherwise the config file is loaded and the CLI timing
    /// flags act as defaults for listeners that do not set their own.
    pub fn from_cli(args: &Cli) -> Result<Self> {
        let Some(port) = args.listen_port else {
            return Self::load(&args.config, args.race_timeout_ms, args.affinity_ttl_secs);
        };

        if args.socks.is_empty() {
            return Err(eyre!("at least one --socks upstream must be specified"));
        }

        let listen = join_host_port(&args.listen_address, port);
        let config = Config {
            listeners: vec![ListenerConfig {
                listen,
                socks: args.socks.iter().map(UpstreamConfig::new).collect(),
                race_timeout_ms: Some(args.race_timeout_ms),
                affinity_ttl_secs: Some(args.affinity_ttl_secs),
            }],
        };
        config.validate().map_err(|e| eyre!(e))?;
        Ok(config)
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
fn split_host_port(addr: &str) -> Result<(&str, u16), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| "missing port".to_string())?;
    if port.is_empty() {
        return Err("missing port".to_string());
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port {:?}", port))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| "unterminated IPv6 bracket".to_string())?,
        None if host.contains(':') => return Err("IPv6 host must be bracketed".to_string()),
        None => host,
    };
    Ok((host, port))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
