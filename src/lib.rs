//! # challenge_core
//!
//! Core engine for a recurring time-series forecasting competition: data
//! collection from external sources, challenge scheduling, round
//! materialization, score evaluation, and bootstrapped ELO ranking.
//!
//! The crate is split so two standalone processes can share it:
//!
//! - `data-collector`: runs the source adapter framework ([`services::adapters`])
//!   on a periodic schedule ([`services::collector`]) and writes into the
//!   time-series sink ([`db::repository::TimeSeriesRepository`]), imputing
//!   gaps ([`imputation`]) as it goes.
//! - `challenge-scheduler`: runs the supervisor ([`services::supervisor`]),
//!   which drives the challenge definition registry ([`services::registry`]),
//!   round materializer ([`services::rounds`]), score evaluator
//!   ([`services::evaluator`]), and ELO engine ([`services::elo`]) on cron
//!   and interval triggers.
//!
//! Both processes are thin wrappers: all business logic lives in this
//! library so it can be exercised directly in tests against
//! [`db::repositories::LocalRepository`] without a database.

#![allow(clippy::result_large_err)]

pub mod config;
pub mod db;
pub mod duration;
pub mod error;
pub mod imputation;
pub mod services;

pub use config::{CollectorConfig, SupervisorConfig};
pub use duration::{Duration, InvalidDuration};
pub use error::CoreError;
