//! Configuration loading for the relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`), then
//! overridden by environment variables. Every field has a default, so an
//! empty file (or no file at all) yields a working single-instance relay.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Shared store configuration.
    pub store: StoreConfig,
    /// Channel and queue lifetimes.
    pub channels: ChannelsConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    pub http: HttpConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for HTTP and WebSocket traffic (default: 0.0.0.0:4000).
    pub bind_address: String,
    /// Development mode: verbose logging and plaintext mirroring in queues.
    pub development: bool,
    /// Seconds to wait for sessions to close on shutdown (default: 5).
    pub shutdown_grace_secs: u64,
}

/// Shared store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store node URLs (`redis://host:port`). Empty selects the in-process store.
    pub nodes: Vec<String>,
    /// Treat `nodes` as cluster seed nodes.
    pub cluster: bool,
    /// Connect with TLS (server identity is not verified).
    pub tls: bool,
    /// Store password.
    pub password: Option<String>,
    /// Maximum pooled connections (default: 35).
    pub pool_max_size: usize,
    /// Connections kept open while idle (default: 15).
    pub pool_min_idle: usize,
    /// Seconds to wait for a pooled connection (default: 15).
    pub acquire_timeout_secs: u64,
    /// Seconds an idle connection is kept before eviction (default: 300).
    pub idle_timeout_secs: u64,
    /// Seconds between idle eviction sweeps (default: 180).
    pub eviction_interval_secs: u64,
    /// Connect timeout in seconds (default: 60 single node, 20 cluster).
    pub connect_timeout_secs: Option<u64>,
    /// Per-command timeout in seconds (default: 10).
    pub command_timeout_secs: u64,
    /// Attempts per command before giving up (default: 4).
    pub max_attempts: u32,
    /// Seconds between health probes (default: 30).
    pub health_interval_secs: u64,
    /// Consecutive probe failures before a recovery attempt (default: 10).
    pub health_failure_threshold: u32,
}

/// Channel and queue lifetimes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Channel config TTL in seconds (default: 30 days).
    pub expiry_secs: u64,
    /// Channel config TTL once rejected (default: 5 minutes).
    pub rejected_expiry_secs: u64,
    /// Message queue TTL in seconds (default: 1 hour).
    pub message_expiry_secs: u64,
    /// Delay before queued messages are delivered to a joining peer (default: 1000).
    pub delivery_delay_ms: u64,
    /// Occupancy counter TTL in seconds, refreshed by joins, leaves and pings (default: 10 minutes).
    pub occupancy_ttl_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Enable per-IP rate limiting (default: false).
    pub enabled: bool,
    /// Window length in seconds (default: 1).
    pub window_secs: u64,
    /// Joins allowed per window (default: 10).
    pub join_limit: u32,
    /// Messages allowed per window (default: 100).
    pub message_limit: u32,
    /// Upper bound for the relaxed join budget (default: 40).
    pub join_max: u32,
    /// Upper bound for the relaxed message budget (default: 400).
    pub message_max: u32,
    /// Join budget added per observed error (default: 5).
    pub join_step: u32,
    /// Message budget added per observed error (default: 50).
    pub message_step: u32,
    /// Seconds without errors before budgets return to their initial value (default: 10).
    pub recovery_secs: u64,
    /// Seconds between limiter maintenance runs (default: 60).
    pub maintenance_interval_secs: u64,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Enable the metrics endpoint (default: true).
    pub metrics_enabled: bool,
    /// Enable `/admin/rooms` (default: false).
    pub admin_ui: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_pool_max_size() -> usize {
    35
}

fn default_pool_min_idle() -> usize {
    15
}

fn default_acquire_timeout_secs() -> u64 {
    15
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_eviction_interval_secs() -> u64 {
    180
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    4
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_failure_threshold() -> u32 {
    10
}

fn default_channel_expiry() -> u64 {
    30 * 24 * 60 * 60 // 30 days
}

fn default_rejected_channel_expiry() -> u64 {
    5 * 60
}

fn default_message_expiry() -> u64 {
    60 * 60
}

fn default_delivery_delay_ms() -> u64 {
    1000
}

fn default_occupancy_ttl() -> u64 {
    10 * 60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            development: false,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            cluster: false,
            tls: false,
            password: None,
            pool_max_size: default_pool_max_size(),
            pool_min_idle: default_pool_min_idle(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            connect_timeout_secs: None,
            command_timeout_secs: default_command_timeout_secs(),
            max_attempts: default_max_attempts(),
            health_interval_secs: default_health_interval_secs(),
            health_failure_threshold: default_health_failure_threshold(),
        }
    }
}

impl StoreConfig {
    /// Effective connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        let secs = self
            .connect_timeout_secs
            .unwrap_or(if self.cluster { 20 } else { 60 });
        Duration::from_secs(secs)
    }

    /// Node URLs with the TLS scheme applied.
    pub fn node_urls(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|node| {
                let addr = node
                    .trim()
                    .trim_start_matches("rediss://")
                    .trim_start_matches("redis://");
                if self.tls {
                    format!("rediss://{addr}/#insecure")
                } else {
                    format!("redis://{addr}")
                }
            })
            .collect()
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_channel_expiry(),
            rejected_expiry_secs: default_rejected_channel_expiry(),
            message_expiry_secs: default_message_expiry(),
            delivery_delay_ms: default_delivery_delay_ms(),
            occupancy_ttl_secs: default_occupancy_ttl(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: 1,
            join_limit: 10,
            message_limit: 100,
            join_max: 40,
            message_max: 400,
            join_step: 5,
            message_step: 50,
            recovery_secs: 10,
            maintenance_interval_secs: 60,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            admin_ui: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load the file if it exists, then apply process environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(nodes) = lookup("REDIS_NODES") {
            self.store.nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("REDIS_CLUSTER") {
            self.store.cluster = parse_flag("REDIS_CLUSTER", &v)?;
        }
        if let Some(v) = lookup("REDIS_TLS") {
            self.store.tls = parse_flag("REDIS_TLS", &v)?;
        }
        if let Some(v) = lookup("REDIS_PASSWORD") {
            self.store.password = Some(v).filter(|p| !p.is_empty());
        }
        if let Some(v) = lookup("RATE_LIMITER") {
            self.limits.enabled = parse_flag("RATE_LIMITER", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMITER_WINDOW_SECS") {
            self.limits.window_secs = parse_number("RATE_LIMITER_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMITER_JOIN_LIMIT") {
            self.limits.join_limit = parse_number("RATE_LIMITER_JOIN_LIMIT", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMITER_MESSAGE_LIMIT") {
            self.limits.message_limit = parse_number("RATE_LIMITER_MESSAGE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("CHANNEL_EXPIRY") {
            self.channels.expiry_secs = parse_number("CHANNEL_EXPIRY", &v)?;
        }
        if let Some(v) = lookup("REJECTED_CHANNEL_EXPIRY") {
            self.channels.rejected_expiry_secs = parse_number("REJECTED_CHANNEL_EXPIRY", &v)?;
        }
        if let Some(v) = lookup("OCCUPANCY_EXPIRY") {
            self.channels.occupancy_ttl_secs = parse_number("OCCUPANCY_EXPIRY", &v)?;
        }
        if let Some(v) = lookup("MSG_EXPIRY") {
            self.channels.message_expiry_secs = parse_number("MSG_EXPIRY", &v)?;
        }
        if let Some(v) = lookup("ADMIN_UI") {
            self.http.admin_ui = parse_flag("ADMIN_UI", &v)?;
        }
        if let Some(v) = lookup("NODE_ENV") {
            self.server.development = v == "development";
        }
        if let Some(v) = lookup("BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        self.validate()
    }

    /// Reject values that would make the relay unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.window_secs == 0 {
            return Err(ConfigError::Invalid("limits.window_secs must be > 0".into()));
        }
        if self.limits.join_limit == 0 || self.limits.message_limit == 0 {
            return Err(ConfigError::Invalid("rate limits must be > 0".into()));
        }
        if self.channels.occupancy_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "channels.occupancy_ttl_secs must be > 0".into(),
            ));
        }
        if self.store.pool_max_size == 0 {
            return Err(ConfigError::Invalid("store.pool_max_size must be > 0".into()));
        }
        if self.store.pool_min_idle > self.store.pool_max_size {
            return Err(ConfigError::Invalid(
                "store.pool_min_idle must not exceed store.pool_max_size".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Environment variable has an unusable value.
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
    /// Configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
