//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (`FLEETHUB_*`, nested keys separated by `__`)
//! - An explicit `--config <path>` argument

use anyhow::{bail, Context, Result};
use fleethub_core::{AuthGate, AuthPolicy, RouterConfig, StaticTokenValidator};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "FLEETHUB";

/// Files searched by [`Config::load`], in order.
const CONFIG_PATHS: [&str; 3] = [
    "fleethub.toml",
    "/etc/fleethub/fleethub.toml",
    "~/.config/fleethub/fleethub.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Connection admission.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Stats reporter configuration.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections. A soft limit: concurrent upgrades can
    /// overshoot it briefly.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Events queued per connection before further events are dropped.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between server pings in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Close a connection after this long without inbound traffic.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Authentication gate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Admission policy.
    #[serde(default)]
    pub policy: AuthPolicy,

    /// Tokens accepted by the `validate_signature` policy.
    #[serde(default)]
    pub shared_tokens: Vec<String>,
}

/// Stats reporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Sampling period in seconds.
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue_capacity() -> usize {
    fleethub_core::connection::DEFAULT_OUTBOUND_CAPACITY
}

fn default_heartbeat_interval() -> u64 {
    25_000 // 25 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_stats_interval() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            stats: StatsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl HeartbeatConfig {
    /// Ping interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Idle timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from the first config file found, with environment
    /// overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::layered(file.as_deref().map(Path::new))
    }

    /// Build configuration from an optional TOML file plus `FLEETHUB_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be read or deserialized.
    pub fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Toml));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("auth.shared_tokens"),
            )
            .build()
            .context("Failed to assemble configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Check values that deserialize fine but cannot work.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        if self.limits.outbound_queue_capacity == 0 {
            bail!("limits.outbound_queue_capacity must be greater than zero");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be greater than zero");
        }
        if self.heartbeat.timeout_ms < self.heartbeat.interval_ms {
            bail!("heartbeat.timeout_ms must not be shorter than heartbeat.interval_ms");
        }
        if self.stats.interval_secs == 0 {
            bail!("stats.interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Stats reporter period.
    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats.interval_secs)
    }

    /// Router settings derived from this configuration.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_connections: self.limits.max_connections,
        }
    }

    /// Build the authentication gate.
    #[must_use]
    pub fn auth_gate(&self) -> AuthGate {
        let gate = AuthGate::new(self.auth.policy);
        if self.auth.shared_tokens.is_empty() {
            gate
        } else {
            let validator = StaticTokenValidator::new(self.auth.shared_tokens.iter().cloned());
            gate.with_validator(Arc::new(validator))
        }
    }
}
