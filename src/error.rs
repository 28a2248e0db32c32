//! Crate-level error taxonomy.
//!
//! Wraps the narrower error types produced by individual components
//! ([`crate::duration::InvalidDuration`], [`crate::db::RepositoryError`]) plus
//! the failure modes that don't belong to any single repository call:
//! malformed configuration, adapter fetch failures, and scheduler crash
//! detection. Score evaluation failures are not represented here — a failed
//! evaluation is recorded as a `Score` row with `evaluation_status = error`
//! and a truncated message, never propagated as a `CoreError`.

use thiserror::Error;

use crate::db::RepositoryError;
use crate::duration::InvalidDuration;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid duration: {0}")]
    InvalidDuration(#[from] InvalidDuration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("adapter '{adapter}' fetch failed: {message}")]
    AdapterFetchError { adapter: String, message: String },

    #[error("scheduler job '{job}' crashed after {attempts} restart attempt(s): {message}")]
    SchedulerCrash {
        job: String,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl CoreError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        CoreError::InvalidConfig(message.into())
    }

    pub fn adapter_fetch(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::AdapterFetchError {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    pub fn scheduler_crash(
        job: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        CoreError::SchedulerCrash {
            job: job.into(),
            attempts,
            message: message.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
