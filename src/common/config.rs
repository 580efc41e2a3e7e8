//! Configuration for clustermgr
//!
//! Loaded from an optional TOML file and `CLUSTERMGR_*` environment variables
//! (`CLUSTERMGR_GROUP_COMMIT__MAX_RETRIES=8`). Command-line flags override
//! both.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Group commit retry and timeout policy
    pub group_commit: GroupCommitConfig,

    /// Record store location
    pub store: StoreConfig,

    /// Audit log file (audit entries always go to the log as well)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,

    /// Logging level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group_commit: GroupCommitConfig::default(),
            store: StoreConfig::default(),
            audit_log: None,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Group commit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupCommitConfig {
    /// Timeout for a single store read or write
    pub op_timeout_ms: u64,

    /// First backoff after a store failure
    pub initial_backoff_ms: u64,

    /// Backoff ceiling
    pub max_backoff_ms: u64,

    /// Consecutive failures before the observer is told
    pub max_retries: u32,
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: 5_000,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
            max_retries: 5,
        }
    }
}

impl GroupCommitConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.op_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "group_commit.op_timeout_ms must be positive".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(crate::Error::InvalidConfig(
                "group_commit.max_retries must be positive".into(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "group_commit.max_backoff_ms ({}) is below initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// RocksDB directory
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./cluster-data"),
        }
    }
}

impl Config {
    /// Load `clustermgr.toml` from the working directory if present, then
    /// apply environment overrides. Falls back to defaults on any error.
    pub fn load() -> Self {
        match Self::from_sources(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Load from an explicit file (required to exist) or the default
    /// location, then apply environment overrides.
    pub fn from_sources(file: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("clustermgr").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("CLUSTERMGR")
                .prefix_separator("_")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.group_commit.validate()?;
        Ok(config)
    }
}
