//! Server configuration: debounce/eviction/drain timing, storage
//! location, bind address, and CORS origin — loaded from an optional
//! config file layered with `COLLAB_`-prefixed environment variables.

use std::path::PathBuf;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Flush-timer period for a document's batch, in milliseconds.
    pub debounce_delay_ms: u64,
    /// Ops retained per document for immediate-echo transform.
    pub tail_size: usize,
    /// No-session TTL for in-memory engine state, in seconds.
    pub idle_eviction_secs: u64,
    /// Deadline for the shutdown flush-all, in seconds.
    pub shutdown_drain_secs: u64,
    /// Filesystem directory for document snapshots.
    pub store_dir: String,
    pub listen_addr: String,
    pub port: u16,
    /// Cross-origin permission for the HTTP/WS surface; `"*"` allows any.
    pub allowed_origin: String,
}

impl Configuration {
    /// Load from an optional file at `path` (if it exists), then layer
    /// `COLLAB_*` environment variables over it, file-then-environment
    /// precedence.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if std::path::Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("COLLAB").separator("_"));

        let config = builder.build().map_err(|e| ConfigError::Load(e.to_string()))?;
        let settings: Configuration = config.try_deserialize().unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tail_size == 0 {
            return Err(ConfigError::Validation("tail_size must be at least 1".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation("port must be nonzero".to_string()));
        }
        Ok(())
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }

    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.store_dir)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }

    fn default_store_dir() -> String {
        dirs::data_local_dir()
            .map(|dir| dir.join("collab-text-server").join("documents"))
            .unwrap_or_else(|| PathBuf::from("./documents"))
            .to_string_lossy()
            .into_owned()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debounce_delay_ms: 500,
            tail_size: 10,
            idle_eviction_secs: 30 * 60,
            shutdown_drain_secs: 30,
            store_dir: Self::default_store_dir(),
            listen_addr: "0.0.0.0".to_string(),
            port: 5000,
            allowed_origin: "*".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = Configuration::default();
        assert_eq!(config.debounce_delay_ms, 500);
        assert_eq!(config.tail_size, 10);
        assert_eq!(config.idle_eviction_secs, 1800);
        assert_eq!(config.shutdown_drain_secs, 30);
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let config = Configuration::load(Some("/nonexistent/path.toml")).unwrap();
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn rejects_zero_tail_size() {
        let mut config = Configuration::default();
        config.tail_size = 0;
        assert!(config.validate().is_err());
    }
}
