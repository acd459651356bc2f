//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_HOST, COURIER_PORT, COURIER_REDIS_URL)
//! - TOML configuration file

use anyhow::{Context, Result};
use courier_core::PubSubConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Message log configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Long-poll configuration.
    #[serde(default)]
    pub long_poll: LongPollConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where the message log is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In this process only; lost on restart.
    #[default]
    Memory,
    /// Shared Redis server.
    Redis,
}

/// Message log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Partition served by this process.
    #[serde(default)]
    pub site_id: Option<String>,

    /// Store backend.
    #[serde(default)]
    pub store: StoreKind,

    /// Redis connection URL, used with `store = "redis"`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Maximum retained messages per channel.
    #[serde(default = "default_max_backlog_size")]
    pub max_backlog_size: usize,

    /// Maximum retained entries in the global backlog.
    #[serde(default = "default_max_global_backlog_size")]
    pub max_global_backlog_size: usize,

    /// Delay before a failed subscriber reconnects, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Notification buffer per subscriber.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

/// Long-poll configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPollConfig {
    /// How long a poll waits for messages, in milliseconds.
    #[serde(default = "default_poll_timeout")]
    pub timeout_ms: u64,

    /// Maximum channels in one poll.
    #[serde(default = "default_max_channels")]
    pub max_channels_per_client: usize,
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
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_redis_url() -> String {
    std::env::var("COURIER_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_true() -> bool {
    true
}

fn default_max_backlog_size() -> usize {
    1000
}

fn default_max_global_backlog_size() -> usize {
    100_000
}

fn default_reconnect_delay() -> u64 {
    1000 // 1 second
}

fn default_notification_capacity() -> usize {
    1024
}

fn default_poll_timeout() -> u64 {
    25_000 // 25 seconds
}

fn default_max_channels() -> usize {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bus: BusConfig::default(),
            long_poll: LongPollConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            site_id: None,
            store: StoreKind::default(),
            redis_url: default_redis_url(),
            max_backlog_size: default_max_backlog_size(),
            max_global_backlog_size: default_max_global_backlog_size(),
            reconnect_delay_ms: default_reconnect_delay(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl BusConfig {
    /// Build the log configuration.
    #[must_use]
    pub fn pubsub_config(&self) -> PubSubConfig {
        PubSubConfig {
            site_id: self.site_id.clone(),
            max_backlog_size: self.max_backlog_size,
            max_global_backlog_size: self.max_global_backlog_size,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_poll_timeout(),
            max_channels_per_client: default_max_channels(),
        }
    }
}

impl LongPollConfig {
    /// Get the poll timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
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

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
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

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
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
}
