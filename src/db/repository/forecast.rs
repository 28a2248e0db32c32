//! Repository trait for the externally-owned forecast table (read-only) and
//! the scores this crate exclusively owns (C8).

use async_trait::async_trait;

use super::error::RepositoryResult;
use crate::db::models::{Resolution, Score};

/// Forecast statistics for one `(round, model, series)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForecastStats {
    pub count: i64,
}

/// One aligned `(predicted, actual)` pair for scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationPair {
    pub predicted_value: f64,
    pub actual_value: f64,
}

/// Repository trait covering forecast reads and score writes.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
#[async_trait]
pub trait ForecastRepository: Send + Sync {
    async fn get_challenge_participants(&self, round_id: i64) -> RepositoryResult<Vec<i64>>;

    async fn get_challenge_series_ids(&self, round_id: i64) -> RepositoryResult<Vec<i64>>;

    async fn get_forecast_stats(
        &self,
        round_id: i64,
        model_id: i64,
        series_id: i64,
    ) -> RepositoryResult<ForecastStats>;

    /// Forecasts joined to the actuals view at `resolution`, aligned on
    /// truncated timestamp equality.
    async fn get_evaluation_data(
        &self,
        round_id: i64,
        model_id: i64,
        series_id: i64,
        resolution: Resolution,
    ) -> RepositoryResult<Vec<EvaluationPair>>;

    async fn bulk_upsert_scores(&self, scores: &[Score]) -> RepositoryResult<usize>;

    async fn all_scores_complete(&self, round_id: i64) -> RepositoryResult<bool>;

    async fn mark_round_scores_final(&self, round_id: i64) -> RepositoryResult<()>;

    /// All `(roundId, seriesId, modelId, mase)` tuples with
    /// `finalEvaluation=true` and finite `mase`, optionally scoped to a
    /// definition and/or a lookback window, used to build the ELO matrix.
    async fn finalized_mase_matrix_rows(
        &self,
        definition_id: Option<i64>,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> RepositoryResult<Vec<MaseRow>>;

    async fn definitions_with_finalized_scores(&self) -> RepositoryResult<Vec<i64>>;
}

/// One row of the ELO input matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaseRow {
    pub round_id: i64,
    pub series_id: i64,
    pub model_id: i64,
    pub mase: f64,
}
