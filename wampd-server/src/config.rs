//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WAMPD_CONFIG)
//! 3. Environment variables

use crate::session::WireMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use wampd_core::DealerOptions;
use wampd_protocol::uri::is_valid_procedure;
use wampd_protocol::{CancelMode, MatchPolicy, DEFAULT_PORT};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Realm served by this router.
    pub realm: RealmConfig,
    /// Dealer behavior.
    pub dealer: DealerConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("WAMPD_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.realm.apply_env_overrides();
        self.dealer.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks values that deserialize fine but cannot be served.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_procedure(&self.realm.name, MatchPolicy::Exact) {
            return Err(ConfigError::Validation(format!(
                "invalid realm name: '{}'",
                self.realm.name
            )));
        }
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.to_lowercase() == "true")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Framing used on every connection.
    pub wire_mode: WireMode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
            wire_mode: WireMode::Binary,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("WAMPD_BIND") {
            self.bind_addr = addr;
        }
        if let Some(secs) = env_parse("WAMPD_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(n) = env_parse("WAMPD_MAX_CONNECTIONS") {
            self.max_connections = n;
        }
        if let Some(mode) = env_parse("WAMPD_WIRE_MODE") {
            self.wire_mode = mode;
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Realm configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmConfig {
    /// The only realm HELLO may join.
    pub name: String,
    /// Agent string announced in WELCOME.
    pub agent: String,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            name: "realm1".to_string(),
            agent: format!("wampd-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl RealmConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("WAMPD_REALM") {
            self.name = name;
        }
    }
}

/// Dealer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DealerConfig {
    /// Mode applied to CANCEL messages without a `mode` option.
    pub default_cancel_mode: CancelMode,
    /// Fan progressive calls out to every callee of a shared registration.
    pub fan_out: bool,
    /// Honor `disclose_me` on CALL.
    pub disclose_caller: bool,
    /// Answer `wamp.registration.*` meta procedures.
    pub meta_api: bool,
    /// Interval of the dealer-side timeout sweep in milliseconds (0 = disabled).
    pub timeout_sweep_ms: u64,
}

impl Default for DealerConfig {
    fn default() -> Self {
        Self {
            default_cancel_mode: CancelMode::KillNoWait,
            fan_out: true,
            disclose_caller: true,
            meta_api: true,
            timeout_sweep_ms: 100,
        }
    }
}

impl DealerConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(mode) = env_parse("WAMPD_CANCEL_MODE") {
            self.default_cancel_mode = mode;
        }
        if let Some(ms) = env_parse("WAMPD_TIMEOUT_SWEEP_MS") {
            self.timeout_sweep_ms = ms;
        }
    }

    /// Returns the options handed to the dealer.
    pub fn options(&self) -> DealerOptions {
        DealerOptions {
            default_cancel_mode: self.default_cancel_mode,
            fan_out: self.fan_out,
            disclose_caller: self.disclose_caller,
            meta_api: self.meta_api,
        }
    }

    /// Returns the sweep interval, or `None` when sweeping is disabled.
    pub fn timeout_sweep(&self) -> Option<Duration> {
        (self.timeout_sweep_ms > 0).then(|| Duration::from_millis(self.timeout_sweep_ms))
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("WAMPD_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(addr) = env_parse("WAMPD_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
