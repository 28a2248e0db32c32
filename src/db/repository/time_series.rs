//! Repository trait for time-series identity and the two sink operations
//! (C2): operational upsert and SCD2 upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::RepositoryResult;
use crate::db::models::{OperationalPoint, Resolution, Scd2Point, Scd2UpsertStats, TimeSeries};
use crate::duration::Duration;

/// Repository trait for time-series metadata and data point storage.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
#[async_trait]
pub trait TimeSeriesRepository: Send + Sync {
    /// Look up a series by its stable `uniqueId`, creating it (and its
    /// surrogate `seriesId`) on first sight. Subsequent calls update the
    /// mutable metadata fields and return the existing id.
    #[allow(clippy::too_many_arguments)]
    async fn get_or_create_series_id(
        &self,
        unique_id: &str,
        name: &str,
        description: &str,
        frequency: Duration,
        unit: &str,
        domain: &str,
        category: &str,
        subcategory: Option<&str>,
        update_frequency: Duration,
    ) -> RepositoryResult<i64>;

    async fn update_series_timezone(&self, series_id: i64, timezone: &str) -> RepositoryResult<()>;

    async fn get_series(&self, series_id: i64) -> RepositoryResult<TimeSeries>;

    /// Deduplicate by `ts` (keeping the last occurrence) and upsert into the
    /// operational table. Returns rows affected.
    async fn upsert_operational_points(
        &self,
        series_id: i64,
        points: &[OperationalPoint],
    ) -> RepositoryResult<usize>;

    /// Single-transaction SCD2 upsert: close superseded current rows, insert
    /// new current rows, leave unchanged tuples untouched.
    async fn upsert_scd2_points(
        &self,
        series_id: i64,
        points: &[Scd2Point],
    ) -> RepositoryResult<Scd2UpsertStats>;

    /// Read the last `limit` points strictly before `before`, from the
    /// resolution view appropriate to the series frequency, as of `as_of`
    /// (time-travel read against the SCD2 history).
    async fn get_context_window(
        &self,
        series_id: i64,
        resolution: Resolution,
        before: DateTime<Utc>,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<OperationalPoint>>;

    /// Read a single point at exactly `at`, from the given resolution view.
    async fn get_point_at(
        &self,
        series_id: i64,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> RepositoryResult<Option<OperationalPoint>>;

    /// External "data availability" view: series ids with recent data,
    /// filtered by domain/subdomain/frequency, consulted by round
    /// preparation when topping up the candidate pool.
    async fn find_available_series(
        &self,
        domain: Option<&str>,
        subdomain: Option<&str>,
        frequency: Duration,
        exclude: &[i64],
        limit: usize,
    ) -> RepositoryResult<Vec<i64>>;
}
