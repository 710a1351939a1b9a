//! Runtime configuration.
//!
//! Loaded from TOML; every key is optional and falls back to the defaults
//! below. Durations are written in milliseconds (`*_ms`) or seconds (`*_secs`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::checksums::ChecksumAlgorithm;
use crate::recovery::{millis, RetryPolicy};

const APP_DIR: &str = "shuttle";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding `jobs.json`, its backup and `errors.jsonl`
    pub data_dir: PathBuf,
    pub tools: ToolsConfig,
    /// Engine restart policy for transient network failures
    pub retry: RetryPolicy,
    pub storage: StorageConfig,
    pub manager: ManagerConfig,
    pub monitor: MonitorConfig,
    pub notify: NotifyConfig,
    pub deletion: DeletionConfig,
    pub verification: VerificationConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            tools: ToolsConfig::default(),
            retry: RetryPolicy::default(),
            storage: StorageConfig::default(),
            manager: ManagerConfig::default(),
            monitor: MonitorConfig::default(),
            notify: NotifyConfig::default(),
            deletion: DeletionConfig::default(),
            verification: VerificationConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given, else the default config file if it exists,
    /// else built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Config::default()),
            },
        }
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.data_dir.join("errors.jsonl")
    }
}

/// `<config_dir>/shuttle/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Locations of the external binaries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub rsync_path: PathBuf,
    pub rclone_path: PathBuf,
    /// Used to clean up empty directories on remote rsync sources
    pub ssh_path: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            rsync_path: PathBuf::from("rsync"),
            rclone_path: PathBuf::from("rclone"),
            ssh_path: PathBuf::from("ssh"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Retry policy for transient write failures
    pub write_retry: RetryPolicy,
    /// Consecutive failed writes before the circuit opens
    pub breaker_threshold: u32,
    #[serde(rename = "breaker_cooldown_ms", deserialize_with = "millis::deserialize")]
    pub breaker_cooldown: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            write_retry: RetryPolicy::new(5, Duration::from_millis(50), Duration::from_secs(2)),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Maximum staleness of `list_jobs`
    #[serde(rename = "list_cache_ttl_ms", deserialize_with = "millis::deserialize")]
    pub list_cache_ttl: Duration,
    /// Grace period before a stopping process is killed
    #[serde(rename = "stop_grace_ms", deserialize_with = "millis::deserialize")]
    pub stop_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            list_cache_ttl: Duration::from_secs(1),
            stop_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Tick interval while any job is running
    #[serde(rename = "active_interval_ms", deserialize_with = "millis::deserialize")]
    pub active_interval: Duration,
    /// Tick interval when idle
    #[serde(rename = "idle_interval_ms", deserialize_with = "millis::deserialize")]
    pub idle_interval: Duration,
    #[serde(rename = "cleanup_interval_ms", deserialize_with = "millis::deserialize")]
    pub cleanup_interval: Duration,
    /// How long a stopped engine stays in the engine map
    #[serde(rename = "engine_retention_ms", deserialize_with = "millis::deserialize")]
    pub engine_retention: Duration,
    #[serde(rename = "health_interval_ms", deserialize_with = "millis::deserialize")]
    pub health_interval: Duration,
    /// Errors within one health window that mark the system degraded
    pub health_error_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            active_interval: Duration::from_secs(1),
            idle_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(10),
            engine_retention: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            health_error_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    /// Minimum time between two broadcast batches
    #[serde(rename = "min_flush_interval_ms", deserialize_with = "millis::deserialize")]
    pub min_flush_interval: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            min_flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeletionConfig {
    /// Extra fraction of the source size required free at the destination
    pub free_space_margin: f64,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        DeletionConfig {
            free_space_margin: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationConfig {
    /// Algorithm for in-process checksum verification
    pub algorithm: ChecksumAlgorithm,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        VerificationConfig {
            algorithm: ChecksumAlgorithm::Blake3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `shuttle_engine=debug`
    pub level: Option<String>,
    /// Also write logs to this file
    pub file: Option<PathBuf>,
}
