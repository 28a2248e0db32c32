//! Repository trait for bootstrapped ELO ratings (C9).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::RepositoryResult;
use crate::db::models::EloRating;

/// Repository trait for ELO rating storage and the leaderboard read path.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
#[async_trait]
pub trait EloRepository: Send + Sync {
    /// Upsert keyed on `(modelId, COALESCE(definitionId,-1),
    /// COALESCE(timePeriodDays,0))`.
    async fn upsert_ratings(&self, ratings: &[EloRating]) -> RepositoryResult<usize>;

    /// True if any rating row for this scope was calculated on `today`
    /// (UTC calendar day).
    async fn has_calculated_today(
        &self,
        definition_id: Option<i64>,
        time_period_days: Option<i32>,
        today: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    async fn get_leaderboard(
        &self,
        definition_id: Option<i64>,
        time_period_days: Option<i32>,
    ) -> RepositoryResult<Vec<EloRating>>;
}
