//! Daemon configuration.
//!
//! Loaded from a JSON file, with every field except `cache_root` carrying a
//! default. Validation happens once at load; a daemon never starts with a
//! config it could not fully check.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file was not valid JSON for [`DaemonConfig`].
    #[error("failed to parse config file '{path}': {reason}")]
    Parse { path: PathBuf, reason: String },

    /// A recognized option carried an unusable value.
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Root directory of the artifact store. Required.
    pub cache_root: PathBuf,

    /// Maximum bytes the store may occupy.
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: u64,

    /// Build worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Gzip-compress stored artifacts.
    #[serde(default)]
    pub compress: bool,

    /// Address to accept framed build requests on, e.g. `127.0.0.1:3977`.
    /// When absent the daemon serves local dispatch only.
    #[serde(default)]
    pub listen: Option<String>,

    /// Remote builder address, e.g. `10.0.0.2:3977`.
    #[serde(default)]
    pub remote_endpoint: Option<String>,

    /// Per-request deadline for remote dispatch, in milliseconds.
    #[serde(default = "default_remote_deadline_ms")]
    pub remote_deadline_ms: u64,

    /// Recent-failure rate at which remote dispatch is briefly avoided.
    #[serde(default = "default_remote_error_threshold")]
    pub remote_error_threshold: f64,

    /// Shared secret expected on remote build requests.
    #[serde(default)]
    pub remote_secret: Option<String>,

    /// Local queue depth above which remote dispatch is preferred.
    #[serde(default = "default_queue_high_watermark")]
    pub queue_high_watermark: usize,

    /// Optional wall-clock cap on local builds, in milliseconds.
    #[serde(default)]
    pub local_build_cap_ms: Option<u64>,
}

fn default_cache_bytes() -> u64 {
    16 * 1024 * 1024 * 1024
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_remote_deadline_ms() -> u64 {
    30_000
}

fn default_remote_error_threshold() -> f64 {
    0.5
}

fn default_queue_high_watermark() -> usize {
    4
}

impl DaemonConfig {
    /// A configuration with defaults everywhere but the cache root.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            cache_bytes: default_cache_bytes(),
            workers: default_workers(),
            compress: false,
            listen: None,
            remote_endpoint: None,
            remote_deadline_ms: default_remote_deadline_ms(),
            remote_error_threshold: default_remote_error_threshold(),
            remote_secret: None,
            queue_high_watermark: default_queue_high_watermark(),
            local_build_cap_ms: None,
        }
    }

    /// Loads and validates a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every recognized option for a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "cache_root must not be empty".into(),
            });
        }
        if self.cache_bytes == 0 {
            return Err(ConfigError::Invalid {
                reason: "cache_bytes must be positive".into(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                reason: "workers must be positive".into(),
            });
        }
        if self.remote_deadline_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "remote_deadline_ms must be positive".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.remote_error_threshold) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "remote_error_threshold must lie in [0, 1], got {}",
                    self.remote_error_threshold
                ),
            });
        }
        Ok(())
    }
}
