//! Runtime configuration.
//!
//! Settings come from an optional YAML file (named by `CONDUIT_CONFIG`)
//! and are then overridden by individual environment variables.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    /// Maximum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub log_level: String,
}

/// Listening side of the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name or address to bind; every address it resolves to is bound.
    pub bind_host: String,
    pub bind_port: u16,
    /// Per-connection idle timeout, applied to both legs of a session.
    pub idle_timeout_ms: u64,
    /// Capacity of the single buffer each connection owns.
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Port used when the request target does not name one.
    pub default_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8080,
            idle_timeout_ms: 60_000,
            buffer_size: 2048,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { default_port: 80 }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Config {
    /// Loads the config file named by `CONDUIT_CONFIG` (if any), then applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("CONDUIT_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Overrides fields from `BIND_HOST`, `BIND_PORT`, `IDLE_TIMEOUT_MS` and
    /// `LOG_LEVEL` as reported by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("BIND_HOST") {
            self.server.bind_host = host;
        }
        if let Some(port) = lookup("BIND_PORT") {
            self.server.bind_port = port
                .parse()
                .map_err(|_| ConfigError::Env { key: "BIND_PORT", value: port })?;
        }
        if let Some(ms) = lookup("IDLE_TIMEOUT_MS") {
            self.server.idle_timeout_ms = ms
                .parse()
                .map_err(|_| ConfigError::Env { key: "IDLE_TIMEOUT_MS", value: ms })?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind_host is empty".into()));
        }
        if self.server.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("server.idle_timeout_ms must be non-zero".into()));
        }
        if self.server.buffer_size < 64 {
            return Err(ConfigError::Invalid(format!(
                "server.buffer_size must be at least 64, got {}",
                self.server.buffer_size
            )));
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid(format!("unknown log_level {:?}", self.log_level)));
        }
        Ok(())
    }

    /// `host:port` form of the bind address, for logging.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_host, self.server.bind_port)
    }
}
