//! Environment/file-driven bootstrap configuration for the two binaries.
//!
//! Follows the same pattern as [`crate::db::repo_config::RepositoryConfig`]:
//! env vars first, sensible defaults second, an explicit error when a value
//! has no sane default (a missing database URL when the postgres backend is
//! selected).

use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env_or(key, default))
}

/// Bootstrap configuration for the `challenge-scheduler` binary.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the YAML file of recurring challenge definitions (C6).
    pub definitions_path: PathBuf,
    /// Log level passed to the `tracing` env-filter, e.g. `info`.
    pub log_level: String,
    /// Misfire grace window for cron-triggered jobs, seconds.
    pub misfire_grace_sec: u64,
    /// Poll interval for the crash-detection monitor, seconds.
    pub monitor_poll_interval_sec: u64,
    /// Max consecutive restart attempts before a job is given up on.
    pub max_restart_attempts: u32,
    /// Delay before a restart attempt, seconds.
    pub restart_delay_sec: u64,
}

impl SupervisorConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults matching the source's scheduler constants.
    pub fn from_env() -> CoreResult<Self> {
        let definitions_path = env_path("CHALLENGE_DEFINITIONS_PATH", "config/definitions.yaml");
        if !definitions_path.exists() {
            return Err(CoreError::invalid_config(format!(
                "definitions file not found: {}",
                definitions_path.display()
            )));
        }

        Ok(Self {
            definitions_path,
            log_level: env_or("RUST_LOG", "info"),
            misfire_grace_sec: env_or("SCHEDULER_MISFIRE_GRACE_SEC", "300")
                .parse()
                .map_err(|_| CoreError::invalid_config("SCHEDULER_MISFIRE_GRACE_SEC must be an integer"))?,
            monitor_poll_interval_sec: env_or("SCHEDULER_MONITOR_POLL_SEC", "10")
                .parse()
                .map_err(|_| CoreError::invalid_config("SCHEDULER_MONITOR_POLL_SEC must be an integer"))?,
            max_restart_attempts: env_or("SCHEDULER_MAX_RESTART_ATTEMPTS", "5")
                .parse()
                .map_err(|_| CoreError::invalid_config("SCHEDULER_MAX_RESTART_ATTEMPTS must be an integer"))?,
            restart_delay_sec: env_or("SCHEDULER_RESTART_DELAY_SEC", "5")
                .parse()
                .map_err(|_| CoreError::invalid_config("SCHEDULER_RESTART_DELAY_SEC must be an integer"))?,
        })
    }
}

/// Bootstrap configuration for the `data-collector` binary.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Path to the YAML file of adapter/request-group definitions (C5).
    pub adapters_path: PathBuf,
    pub log_level: String,
    /// Global cap on concurrently in-flight collection jobs.
    pub max_concurrent_jobs: usize,
    /// Batch size used for the initial startup fetch of single-series jobs.
    pub initial_fetch_batch_size: usize,
}

impl CollectorConfig {
    pub fn from_env() -> CoreResult<Self> {
        let adapters_path = env_path("COLLECTOR_ADAPTERS_PATH", "config/adapters.yaml");
        if !adapters_path.exists() {
            return Err(CoreError::invalid_config(format!(
                "adapters file not found: {}",
                adapters_path.display()
            )));
        }

        Ok(Self {
            adapters_path,
            log_level: env_or("RUST_LOG", "info"),
            max_concurrent_jobs: env_or("COLLECTOR_MAX_CONCURRENT_JOBS", "10")
                .parse()
                .map_err(|_| CoreError::invalid_config("COLLECTOR_MAX_CONCURRENT_JOBS must be an integer"))?,
            initial_fetch_batch_size: env_or("COLLECTOR_INITIAL_BATCH_SIZE", "5")
                .parse()
                .map_err(|_| CoreError::invalid_config("COLLECTOR_INITIAL_BATCH_SIZE must be an integer"))?,
        })
    }
}

/// Install the process-wide `tracing` subscriber, honoring `RUST_LOG` (or
/// the config's `log_level` as a default directive).
pub fn init_tracing(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
