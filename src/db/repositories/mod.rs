//! Repository implementations.
//!
//! - `postgres`: PostgreSQL implementation with Diesel ORM (feature `postgres-repo`)
//! - `local`: In-memory implementation for tests and local development (feature `local-repo`)

pub mod local;
#[cfg(feature = "postgres-repo")]
pub mod postgres;

pub use local::LocalRepository;
#[cfg(feature = "postgres-repo")]
pub use postgres::{PoolStats, PostgresConfig, PostgresRepository};
