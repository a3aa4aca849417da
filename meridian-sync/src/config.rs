//! Server and client configuration.
//!
//! Both structs deserialize from TOML with every field optional:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/meridian"
//! persistence_debounce_ms = 1000
//! eviction_grace_ms = 5000
//! heartbeat_interval_secs = 30
//! max_frame_bytes = 1048576
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Quiet period before a dirty room is written
    pub persistence_debounce_ms: u64,
    /// How long an empty room lingers before it is flushed and dropped
    pub eviction_grace_ms: u64,
    /// Server-initiated ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// Larger frames are dropped unread
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            persistence_debounce_ms: 1000,
            eviction_grace_ms: 5000,
            heartbeat_interval_secs: 30,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_bytes < crate::protocol::MIN_UPDATE_FRAME_LEN {
            return Err(ConfigError::Invalid {
                field: "max_frame_bytes",
                reason: format!("must be at least {}", crate::protocol::MIN_UPDATE_FRAME_LEN),
            });
        }
        if self.bind_addr.is_empty() {
            return Err(ConfigError::Invalid {
                field: "bind_addr",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn persistence_debounce(&self) -> Duration {
        Duration::from_millis(self.persistence_debounce_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    /// `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

/// Client connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:9090`
    pub base_url: String,
    /// First reconnect delay
    pub backoff_base_ms: u64,
    /// Upper bound for any reconnect delay
    pub backoff_cap_ms: u64,
    /// Leave the local user out of `users()`
    pub exclude_self_from_users: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:9090".to_string(),
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            exclude_self_from_users: true,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.persistence_debounce(), Duration::from_secs(1));
        assert_eq!(config.eviction_grace(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            bind_addr = "0.0.0.0:7000"
            storage_path = "/tmp/meridian"
            heartbeat_interval_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/meridian")));
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.persistence_debounce_ms, 1000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ServerConfig::from_toml_str("max_frame_bytes = 1"),
            Err(ConfigError::Invalid { field: "max_frame_bytes", .. })
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("persistence_debounce_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServerConfig::load(Path::new("/nonexistent/meridian.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::from_toml_str("base_url = \"ws://example:1\"").unwrap();
        assert_eq!(config.base_url, "ws://example:1");
        assert_eq!(config.backoff_base(), Duration::from_millis(500));
        assert_eq!(config.backoff_cap(), Duration::from_secs(30));
        assert!(config.exclude_self_from_users);
    }
}
