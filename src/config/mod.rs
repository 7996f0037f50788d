use crate::balance::PoolConfig;
use crate::utils::error::{LbPoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub bind_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
}

/// Pool tuning shared by every backend. Times are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_idle_time_ms")]
    pub idle_time_ms: u64,
    #[serde(default = "default_recover_time_ms")]
    pub recover_time_ms: u64,
    #[serde(default = "default_warmup_time_ms")]
    pub warmup_time_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_idle_size")]
    pub idle_size: usize,
    #[serde(default = "default_idle_capacity")]
    pub idle_capacity: usize,
    #[serde(default)]
    pub tcp_keepalive_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM bundle of CAs trusted for secure backends
    #[serde(default)]
    pub ca_file: Option<String>,
    /// Name to verify instead of each backend's address
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartMode {
    #[default]
    Active,
    Standby,
    SessionOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub start: StartMode,
}

// Default values
fn default_api_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_socket_timeout_ms() -> u64 {
    30_000
}

fn default_idle_time_ms() -> u64 {
    10_000
}

fn default_recover_time_ms() -> u64 {
    15_000
}

fn default_warmup_time_ms() -> u64 {
    60_000
}

fn default_max_connections() -> usize {
    PoolConfig::default().max_connections
}

fn default_idle_size() -> usize {
    16
}

fn default_idle_capacity() -> usize {
    64
}

fn default_weight() -> u32 {
    100
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind_address: default_bind_address(),
            bind_port: default_api_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            idle_time_ms: default_idle_time_ms(),
            recover_time_ms: default_recover_time_ms(),
            warmup_time_ms: default_warmup_time_ms(),
            max_connections: default_max_connections(),
            idle_size: default_idle_size(),
            idle_capacity: default_idle_capacity(),
            tcp_keepalive_secs: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            logging: LoggingConfig::default(),
            heartbeat: HeartbeatSettings::default(),
            pool: PoolSettings::default(),
            tls: TlsSettings::default(),
            backends: Vec::new(),
        }
    }
}

impl PoolSettings {
    /// Pool tuning for one backend, applying its overrides.
    pub fn pool_config(&self, backend: &BackendConfig) -> PoolConfig {
        PoolConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            socket_timeout: Duration::from_millis(self.socket_timeout_ms),
            idle_time: Duration::from_millis(self.idle_time_ms),
            recover_time: Duration::from_millis(self.recover_time_ms),
            warmup_time: Duration::from_millis(self.warmup_time_ms),
            weight: backend.weight,
            max_connections: backend.max_connections.unwrap_or(self.max_connections),
            idle_size: self.idle_size,
            idle_capacity: self.idle_capacity,
            tcp_keepalive: self.tcp_keepalive_secs.map(Duration::from_secs),
            ..PoolConfig::default()
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| LbPoolError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| LbPoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(LbPoolError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        if self.heartbeat.interval_ms == 0 {
            return Err(LbPoolError::Config(
                "heartbeat.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.idle_capacity < 2 {
            return Err(LbPoolError::Config(
                "pool.idle_capacity must be at least 2".to_string(),
            ));
        }

        if self.pool.idle_size >= self.pool.idle_capacity {
            return Err(LbPoolError::Config(format!(
                "pool.idle_size ({}) must be smaller than pool.idle_capacity ({})",
                self.pool.idle_size, self.pool.idle_capacity
            )));
        }

        if self.pool.connect_timeout_ms == 0 {
            return Err(LbPoolError::Config(
                "pool.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(LbPoolError::Config("backend id cannot be empty".to_string()));
            }

            if !seen.insert(backend.id.as_str()) {
                return Err(LbPoolError::Config(format!(
                    "duplicate backend id: {}",
                    backend.id
                )));
            }

            if backend.address.trim().is_empty() {
                return Err(LbPoolError::Config(format!(
                    "backend {} has no address",
                    backend.id
                )));
            }

            if backend.port == 0 {
                return Err(LbPoolError::Config(format!(
                    "backend {} has invalid port 0",
                    backend.id
                )));
            }

            if backend.max_connections == Some(0) {
                return Err(LbPoolError::Config(format!(
                    "backend {} max_connections must be greater than 0",
                    backend.id
                )));
            }

            if backend.secure && self.tls.ca_file.is_none() {
                return Err(LbPoolError::Config(format!(
                    "backend {} is secure but tls.ca_file is not set",
                    backend.id
                )));
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[api]
enabled = true
bind_address = "127.0.0.1"
bind_port = 9090

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"

[heartbeat]
interval_ms = 1000

[pool]
connect_timeout_ms = 5000
socket_timeout_ms = 30000
idle_time_ms = 10000      # how long a connection may stay in the idle pool
recover_time_ms = 15000   # how long a failed backend is treated as dead
warmup_time_ms = 60000    # slow-start ramp after (re)start
idle_size = 16
idle_capacity = 64
# tcp_keepalive_secs = 60

# [tls]
# ca_file = "config/backend-ca.pem"
# server_name = "backend.internal"

[[backends]]
id = "app-a"
address = "127.0.0.1"
port = 6800
weight = 100
start = "active"  # Options: "active", "standby", "session-only"

[[backends]]
id = "app-b"
address = "127.0.0.1"
port = 6801
max_connections = 256
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            LbPoolError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}
