//! Storage layer: repository traits plus two interchangeable backends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Services (collector, scheduler, scoring, ELO)          │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Repository traits (repository/) - abstract contracts   │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//!     ┌──────────────────────────────┬──────────────────────┐
//!     │        Local Repository      │  Postgres Repository │
//!     │          (in-memory)         │  (Diesel, feature-   │
//!     │                               │   gated)              │
//!     └──────────────────────────────┴──────────────────────┘
//! ```
//!
//! Callers depend on `Arc<dyn FullRepository>`, constructed once at process
//! startup via [`factory::RepositoryFactory`] and passed explicitly to every
//! service that needs it — this crate does not hold a process-global
//! repository handle.

#[cfg(not(any(feature = "postgres-repo", feature = "local-repo")))]
compile_error!("Enable at least one repository backend feature.");

pub mod factory;
pub mod models;
pub mod repo_config;
pub mod repositories;
pub mod repository;

// Postgres config is colocated with the repository implementation.
#[cfg(feature = "postgres-repo")]
pub use repositories::postgres::{PoolStats, PostgresConfig};
#[cfg(not(feature = "postgres-repo"))]
#[derive(Debug, Clone, Default)]
pub struct PostgresConfig {
    _private: (),
}
#[cfg(not(feature = "postgres-repo"))]
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    _private: (),
}

pub use factory::{health_check, RepositoryBuilder, RepositoryFactory, RepositoryType};
pub use repo_config::RepositoryConfig;
pub use repositories::LocalRepository;
#[cfg(feature = "postgres-repo")]
pub use repositories::PostgresRepository;
pub use repository::{
    ChallengeRepository, EloRepository, ErrorContext, ForecastRepository, FullRepository,
    RepositoryError, RepositoryResult, TimeSeriesRepository,
};
