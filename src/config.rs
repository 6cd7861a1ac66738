use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Engine configuration, usually loaded from YAML. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest wait for a user's lock before `LockTimeout`.
    pub lock_timeout_ms: u64,
    /// How long idempotency records are kept. Unset keeps them forever.
    pub idempotency_retention_secs: Option<u64>,
    /// Directory for the durable journals. Unset runs in memory.
    pub data_dir: Option<PathBuf>,
    pub history_page_size: usize,
    /// Default log filter directive; `RUST_LOG` takes precedence.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            idempotency_retention_secs: None,
            data_dir: None,
            history_page_size: 256,
            log_level: "warn".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn idempotency_retention(&self) -> Option<Duration> {
        self.idempotency_retention_secs.map(Duration::from_secs)
    }
}
