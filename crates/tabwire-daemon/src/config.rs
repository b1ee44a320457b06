//! Daemon configuration: a TOML file overlaid with command-line arguments.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabwire_hub::{ConnectionConfig, HubConfig, SelectorKind};
use tabwire_relay::RelayConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug, Default)]
#[command(name = "tabwired", about = "Serve RPC calls into connected browser tabs")]
pub struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "TABWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address browser tabs connect to.
    #[arg(long, env = "TABWIRE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Address of the local HTTP console.
    #[arg(long, env = "TABWIRE_CONSOLE_LISTEN")]
    pub console_listen: Option<SocketAddr>,

    /// Do not serve the HTTP console.
    #[arg(long)]
    pub no_console: bool,

    /// How calls are spread over tabs.
    #[arg(long, value_enum, env = "TABWIRE_SELECTOR")]
    pub selector: Option<SelectorKind>,

    /// Control-plane URL; the relay stays off without one.
    #[arg(long, env = "TABWIRE_RELAY_URL")]
    pub relay_url: Option<String>,

    #[arg(long, env = "TABWIRE_RELAY_SECRET", hide_env_values = true)]
    pub relay_secret: Option<String>,

    #[arg(long, env = "TABWIRE_BIND_TOKEN", hide_env_values = true)]
    pub bind_token: Option<String>,

    #[arg(long, env = "TABWIRE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub hub: HubSection,
    pub relay: RelaySection,
    pub console: ConsoleConfig,
}

/// The WebSocket endpoint tabs connect to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub queue_capacity: usize,
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 8765)),
            queue_capacity: connection.queue_capacity,
            ping_interval_secs: connection.ping_interval.as_secs(),
            read_timeout_secs: connection.read_timeout.as_secs(),
            max_message_size: connection.max_message_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub selector: SelectorKind,
    /// Tab name to weight, for the weighted-random selector.
    pub weights: HashMap<String, u32>,
    pub call_timeout_secs: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            selector: SelectorKind::default(),
            weights: HashMap::new(),
            call_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub bind_token: Option<String>,
    pub client_id: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    /// Zero turns metrics off.
    pub metrics_interval_secs: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
    /// Zero retries forever.
    pub max_retries: u32,
    pub reconnect_delay_ms: u64,
    pub compression: bool,
    pub compression_threshold: usize,
    /// Extra per-key call timeouts on top of the built-in ones.
    pub call_timeouts_secs: HashMap<String, u64>,
}

impl Default for RelaySection {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            url: None,
            secret: None,
            bind_token: None,
            client_id: None,
            heartbeat_interval_secs: relay.heartbeat_interval.as_secs(),
            read_timeout_secs: relay.read_timeout.as_secs(),
            write_timeout_secs: relay.write_timeout.as_secs(),
            dial_timeout_secs: relay.dial_timeout.as_secs(),
            metrics_interval_secs: relay.metrics_interval.map_or(0, |d| d.as_secs()),
            base_backoff_ms: relay.base_backoff.as_millis() as u64,
            max_backoff_secs: relay.max_backoff.as_secs(),
            max_retries: relay.max_retries,
            reconnect_delay_ms: relay.reconnect_delay.as_millis() as u64,
            compression: relay.compression,
            compression_threshold: relay.compression_threshold,
            call_timeouts_secs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 8766)),
        }
    }
}

impl Config {
    /// Read a config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The file named by `args` (or defaults), with `args` applied on top.
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    /// Reject timer settings the pumps cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        nonzero("server.ping_interval_secs", server.ping_interval_secs)?;
        nonzero("server.read_timeout_secs", server.read_timeout_secs)?;
        if server.ping_interval_secs >= server.read_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "server.ping_interval_secs ({}) must be below server.read_timeout_secs ({})",
                server.ping_interval_secs, server.read_timeout_secs
            )));
        }
        nonzero("hub.call_timeout_secs", self.hub.call_timeout_secs)?;

        // Relay timers only matter once a control plane is configured.
        if self.relay_config().is_none() {
            return Ok(());
        }
        let relay = &self.relay;
        nonzero("relay.heartbeat_interval_secs", relay.heartbeat_interval_secs)?;
        nonzero("relay.read_timeout_secs", relay.read_timeout_secs)?;
        nonzero("relay.write_timeout_secs", relay.write_timeout_secs)?;
        nonzero("relay.dial_timeout_secs", relay.dial_timeout_secs)?;
        nonzero("relay.base_backoff_ms", relay.base_backoff_ms)?;
        if relay.max_backoff_secs.saturating_mul(1000) < relay.base_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "relay.max_backoff_secs ({}) is shorter than relay.base_backoff_ms ({})",
                relay.max_backoff_secs, relay.base_backoff_ms
            )));
        }
        Ok(())
    }

    /// Overlay command-line values.
    pub fn apply(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            self.server.listen = listen;
        }
        if let Some(listen) = args.console_listen {
            self.console.listen = listen;
        }
        if args.no_console {
            self.console.enabled = false;
        }
        if let Some(selector) = args.selector {
            self.hub.selector = selector;
        }
        if let Some(url) = &args.relay_url {
            self.relay.url = Some(url.clone());
        }
        if let Some(secret) = &args.relay_secret {
            self.relay.secret = Some(secret.clone());
        }
        if let Some(token) = &args.bind_token {
            self.relay.bind_token = Some(token.clone());
        }
        if let Some(client_id) = &args.client_id {
            self.relay.client_id = Some(client_id.clone());
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            selector: self.hub.selector,
            weights: self.hub.weights.clone(),
            default_call_timeout: Duration::from_secs(self.hub.call_timeout_secs),
            connection: ConnectionConfig {
                queue_capacity: self.server.queue_capacity.max(1),
                ping_interval: Duration::from_secs(self.server.ping_interval_secs),
                read_timeout: Duration::from_secs(self.server.read_timeout_secs),
                max_message_size: self.server.max_message_size,
            },
        }
    }

    /// `None` when no control-plane URL is configured.
    pub fn relay_config(&self) -> Option<RelayConfig> {
        let url = self.relay.url.as_ref().filter(|u| !u.is_empty())?;
        let relay = &self.relay;
        Some(RelayConfig {
            url: url.clone(),
            secret: relay.secret.clone(),
            bind_token: relay.bind_token.clone(),
            heartbeat_interval: Duration::from_secs(relay.heartbeat_interval_secs),
            read_timeout: Duration::from_secs(relay.read_timeout_secs),
            write_timeout: Duration::from_secs(relay.write_timeout_secs),
            dial_timeout: Duration::from_secs(relay.dial_timeout_secs),
            metrics_interval: (relay.metrics_interval_secs > 0)
                .then(|| Duration::from_secs(relay.metrics_interval_secs)),
            base_backoff: Duration::from_millis(relay.base_backoff_ms),
            max_backoff: Duration::from_secs(relay.max_backoff_secs),
            max_retries: relay.max_retries,
            reconnect_delay: Duration::from_millis(relay.reconnect_delay_ms),
            compression: relay.compression,
            compression_threshold: relay.compression_threshold,
            default_call_timeout: Duration::from_secs(self.hub.call_timeout_secs),
            call_timeouts: relay
                .call_timeouts_secs
                .iter()
                .map(|(key, secs)| (key.clone(), Duration::from_secs(*secs)))
                .collect(),
            ..RelayConfig::default()
        })
    }
}

fn nonzero(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
    }
    Ok(())
}
