//! Repository trait for challenge definitions, series assignments, rounds,
//! and round context (C6/C7).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::RepositoryResult;
use crate::db::models::{
    ChallengeDefinition, ChallengeRound, DefinitionSeriesAssignment, RoundContextPoint,
    RoundSeriesPseudo,
};

/// Repository trait for the challenge definition registry and round
/// lifecycle.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
#[async_trait]
pub trait ChallengeRepository: Send + Sync {
    /// Upsert a definition keyed by its unique `scheduleId`, preserving the
    /// surrogate id across updates.
    async fn upsert_definition(&self, definition: &ChallengeDefinition) -> RepositoryResult<i64>;

    async fn list_active_definitions(&self) -> RepositoryResult<Vec<ChallengeDefinition>>;

    async fn get_definition(&self, definition_id: i64) -> RepositoryResult<ChallengeDefinition>;

    /// Reconcile a definition's active series assignment set with SCD2
    /// semantics: entries no longer present are closed, new entries opened.
    /// An empty `active` set is a no-op close-out (never closes everything).
    async fn reconcile_series_assignments(
        &self,
        definition_id: i64,
        active: &[DefinitionSeriesAssignment],
        as_of: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    async fn list_series_assignments(
        &self,
        definition_id: i64,
    ) -> RepositoryResult<Vec<DefinitionSeriesAssignment>>;

    /// Upsert a round keyed by its unique `name`; returns the existing round
    /// unchanged if the name already exists (idempotency under double
    /// firing).
    async fn upsert_round(&self, round: &ChallengeRound) -> RepositoryResult<ChallengeRound>;

    async fn get_round(&self, round_id: i64) -> RepositoryResult<ChallengeRound>;

    /// Rounds whose computed status is `active`/`completed` and that either
    /// have a score row with `finalEvaluation=false` or no score rows at
    /// all.
    async fn rounds_needing_evaluation(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<i64>>;

    async fn upsert_round_series_pseudo(
        &self,
        rows: &[RoundSeriesPseudo],
    ) -> RepositoryResult<()>;

    async fn get_round_series_pseudo(
        &self,
        round_id: i64,
        series_id: i64,
    ) -> RepositoryResult<Option<RoundSeriesPseudo>>;

    async fn list_round_series(&self, round_id: i64) -> RepositoryResult<Vec<RoundSeriesPseudo>>;

    /// Bulk-insert immutable context snapshot points for a round.
    async fn insert_context_snapshot(
        &self,
        points: &[RoundContextPoint],
    ) -> RepositoryResult<usize>;
}
