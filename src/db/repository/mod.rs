//! Repository trait layer: storage-neutral contracts implemented by both
//! the Postgres and in-memory backends.

pub mod challenge;
pub mod elo;
pub mod error;
pub mod forecast;
pub mod time_series;

pub use challenge::ChallengeRepository;
pub use elo::EloRepository;
pub use error::{ErrorContext, RepositoryError, RepositoryResult};
pub use forecast::ForecastRepository;
pub use time_series::TimeSeriesRepository;

/// Union of every domain repository, implemented once per backend and
/// handed around as `Arc<dyn FullRepository>`.
pub trait FullRepository:
    TimeSeriesRepository + ChallengeRepository + ForecastRepository + EloRepository
{
}

impl<T> FullRepository for T where
    T: TimeSeriesRepository + ChallengeRepository + ForecastRepository + EloRepository
{
}
