//! Collection scheduler (C5): periodic fetch-and-store over the adapter
//! framework, grounded on the source's `DataPortalScheduler`.
//!
//! Differences from a 1:1 port, imposed by moving off APScheduler onto
//! `tokio`: `coalesce=True, max_instances=1` becomes a per-job `try_lock` that
//! skips a tick already in flight instead of queueing it; the global
//! `asyncio.Semaphore(10)` becomes a `tokio::sync::Semaphore` acquired around
//! each fetch; retry backoff is driven by `tokio::time::sleep` rather than
//! re-scheduling a one-shot job.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{info, instrument, warn};

use crate::db::repository::FullRepository;
use crate::duration::Duration;
use crate::error::{CoreError, CoreResult};
use crate::imputation::{impute_gaps, QualityCode};
use crate::services::adapters::{MultiSeriesAdapter, RawPoint, SingleSeriesAdapter};

/// Batch size for the startup fetch of single-series jobs, and the pause
/// between batches; matches the source's reduced-from-default "avoid DB/CPU
/// overload" values.
pub const INITIAL_FETCH_BATCH_SIZE: usize = 5;
const INITIAL_FETCH_BATCH_PAUSE: StdDuration = StdDuration::from_secs(2);
const INITIAL_FETCH_GROUP_PAUSE: StdDuration = StdDuration::from_millis(300);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: StdDuration::from_millis(500),
        }
    }
}

/// Summary of one batch of fetch attempts, for logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct FetchSummary {
    pub successful: usize,
    pub failed: usize,
}

/// Shared state for all collection jobs: repository handle plus the global
/// concurrency cap.
pub struct CollectorRuntime {
    repo: Arc<dyn FullRepository>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl CollectorRuntime {
    pub fn new(repo: Arc<dyn FullRepository>, max_concurrent_jobs: usize) -> Self {
        Self {
            repo,
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the startup fetch for every configured job: single-series
    /// adapters in batches with a pause between batches, multi-series
    /// adapters sequentially with a smaller pause, exactly mirroring the
    /// source's `_run_initial_fetch`.
    #[instrument(skip_all)]
    pub async fn run_initial_fetch(
        &self,
        single: &[Arc<dyn SingleSeriesAdapter>],
        multi: &[Arc<dyn MultiSeriesAdapter>],
    ) -> FetchSummary {
        let mut summary = FetchSummary::default();

        for (batch_index, batch) in single.chunks(INITIAL_FETCH_BATCH_SIZE).enumerate() {
            info!(batch = batch_index, size = batch.len(), "processing single-series batch");
            let results = futures::future::join_all(
                batch.iter().map(|adapter| self.fetch_and_store_single(adapter.clone())),
            )
            .await;
            for result in results {
                match result {
                    Ok(()) => summary.successful += 1,
                    Err(e) => {
                        warn!(error = %e, "initial fetch failed for single-series adapter");
                        summary.failed += 1;
                    }
                }
            }
            if (batch_index + 1) * INITIAL_FETCH_BATCH_SIZE < single.len() {
                tokio::time::sleep(INITIAL_FETCH_BATCH_PAUSE).await;
            }
        }

        for adapter in multi {
            match self.fetch_and_store_multi(adapter.clone()).await {
                Ok(()) => summary.successful += 1,
                Err(e) => {
                    warn!(error = %e, group = adapter.group_id(), "initial fetch failed for multi-series group");
                    summary.failed += 1;
                }
            }
            tokio::time::sleep(INITIAL_FETCH_GROUP_PAUSE).await;
        }

        info!(successful = summary.successful, failed = summary.failed, "initial fetch complete");
        summary
    }

    /// Spawn a periodic `tokio` task for one single-series adapter at its
    /// configured update frequency, with tick-coalescing: a tick that fires
    /// while the previous run is still in flight is dropped rather than
    /// queued, matching `coalesce=True, max_instances=1`.
    pub fn spawn_periodic_single(
        self: &Arc<Self>,
        adapter: Arc<dyn SingleSeriesAdapter>,
        update_frequency: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let runtime = Arc::clone(self);
        let in_flight = Arc::new(AsyncMutex::new(()));
        let period = StdDuration::from_secs(update_frequency.seconds().max(1) as u64);

        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Ok(_guard) = in_flight.clone().try_lock_owned() else {
                    warn!(unique_id = adapter.unique_id(), "skipping tick, previous run still in flight");
                    continue;
                };
                if let Err(e) = runtime.fetch_and_store_single(adapter.clone()).await {
                    warn!(unique_id = adapter.unique_id(), error = %e, "periodic fetch failed");
                }
            }
        })
    }

    pub fn spawn_periodic_multi(
        self: &Arc<Self>,
        adapter: Arc<dyn MultiSeriesAdapter>,
        update_frequency: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let runtime = Arc::clone(self);
        let in_flight = Arc::new(AsyncMutex::new(()));
        let period = StdDuration::from_secs(update_frequency.seconds().max(1) as u64);

        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Ok(_guard) = in_flight.clone().try_lock_owned() else {
                    warn!(group = adapter.group_id(), "skipping tick, previous run still in flight");
                    continue;
                };
                if let Err(e) = runtime.fetch_and_store_multi(adapter.clone()).await {
                    warn!(group = adapter.group_id(), error = %e, "periodic fetch failed");
                }
            }
        })
    }

    #[instrument(skip_all, fields(unique_id = adapter.unique_id()))]
    async fn fetch_and_store_single(&self, adapter: Arc<dyn SingleSeriesAdapter>) -> CoreResult<()> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        let metadata = adapter.metadata().clone();
        let frequency = Duration::parse(&metadata.frequency)?;
        let update_frequency = frequency.derived_update_frequency();

        let series_id = self
            .repo
            .get_or_create_series_id(
                adapter.unique_id(),
                &metadata.name,
                &metadata.description,
                frequency,
                &metadata.unit,
                &metadata.domain,
                &metadata.category,
                metadata.subcategory.as_deref(),
                update_frequency,
            )
            .await?;

        if let Some(tz) = adapter.detected_timezone() {
            self.repo.update_series_timezone(series_id, tz).await?;
        }

        let start_date = Utc::now() - update_frequency.as_chrono() * 1000;

        let points = self
            .retry_fetch(adapter.unique_id(), || {
                let adapter = adapter.clone();
                async move { adapter.fetch_historical(start_date, None).await }
            })
            .await?;

        self.store_points(series_id, frequency, points).await
    }

    #[instrument(skip_all, fields(group = adapter.group_id()))]
    async fn fetch_and_store_multi(&self, adapter: Arc<dyn MultiSeriesAdapter>) -> CoreResult<()> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        let group_id = adapter.group_id().to_string();
        let definitions = adapter.series_definitions().to_vec();

        // startDate spans the coarsest member's update frequency, so a
        // single group call backfills every series it populates.
        let coarsest_update_frequency = definitions
            .iter()
            .filter_map(|(_, metadata)| Duration::parse(&metadata.frequency).ok())
            .map(|f| f.derived_update_frequency())
            .max_by_key(|f| f.seconds())
            .unwrap_or(Duration::from_seconds(900).expect("900 is non-negative"));
        let start_date = Utc::now() - coarsest_update_frequency.as_chrono() * 1000;

        let by_unique_id = self
            .retry_fetch(&group_id, || {
                let adapter = adapter.clone();
                async move { adapter.fetch_historical_multi(start_date, None).await }
            })
            .await?;

        for (unique_id, metadata) in definitions {
            let frequency = Duration::parse(&metadata.frequency)?;
            let update_frequency = frequency.derived_update_frequency();
            let series_id = self
                .repo
                .get_or_create_series_id(
                    &unique_id,
                    &metadata.name,
                    &metadata.description,
                    frequency,
                    &metadata.unit,
                    &metadata.domain,
                    &metadata.category,
                    metadata.subcategory.as_deref(),
                    update_frequency,
                )
                .await?;

            let Some(points) = by_unique_id.get(&unique_id) else {
                warn!(unique_id, group = %group_id, "no data returned for series in multi-series response");
                continue;
            };
            self.store_points(series_id, frequency, points.clone()).await?;
        }
        Ok(())
    }

    async fn store_points(&self, series_id: i64, frequency: Duration, points: Vec<RawPoint>) -> CoreResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let imputation_points: Vec<crate::imputation::RawPoint> = points
            .into_iter()
            .map(|p| crate::imputation::RawPoint { ts: p.ts, value: p.value })
            .collect();
        let (imputed, counts) = impute_gaps(
            &imputation_points,
            frequency,
            crate::imputation::DEFAULT_MAX_GAP_FACTOR,
            true,
        );

        let scd2_points: Vec<crate::db::models::Scd2Point> = imputed
            .iter()
            .map(|p| crate::db::models::Scd2Point {
                ts: p.ts,
                value: p.value,
                quality_code: p.quality_code,
            })
            .collect();
        let stats = self.repo.upsert_scd2_points(series_id, &scd2_points).await?;
        info!(
            series_id,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            interpolated = counts.interpolated,
            null_markers = counts.null_markers,
            "stored series points"
        );

        let operational: Vec<crate::db::models::OperationalPoint> = imputed
            .iter()
            .filter(|p| p.quality_code == QualityCode::Original)
            .filter_map(|p| p.value.map(|value| crate::db::models::OperationalPoint { ts: p.ts, value }))
            .collect();
        if !operational.is_empty() {
            self.repo.upsert_operational_points(series_id, &operational).await?;
        }
        Ok(())
    }

    /// `retry_delay * 2^attempt` backoff, matching the source's retry shape.
    async fn retry_fetch<T, F, Fut>(&self, label: &str, mut f: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.base_delay * 2u32.pow(attempt);
                    warn!(label, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(CoreError::adapter_fetch(label, e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::LocalRepository;
    use crate::services::adapters::SeriesMetadata;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyAdapter {
        attempts: AtomicUsize,
        fail_until: usize,
        metadata: SeriesMetadata,
    }

    #[async_trait]
    impl SingleSeriesAdapter for FlakyAdapter {
        fn unique_id(&self) -> &str {
            "flaky-1"
        }
        fn metadata(&self) -> &SeriesMetadata {
            &self.metadata
        }
        async fn fetch_historical(
            &self,
            _start: chrono::DateTime<Utc>,
            _end: Option<chrono::DateTime<Utc>>,
        ) -> CoreResult<Vec<RawPoint>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_until {
                return Err(CoreError::adapter_fetch("flaky-1", "transient failure"));
            }
            Ok(vec![RawPoint { ts: Utc::now(), value: 42.0 }])
        }
    }

    fn meta() -> SeriesMetadata {
        SeriesMetadata {
            name: "n".into(),
            description: "d".into(),
            frequency: "1 hour".into(),
            unit: "u".into(),
            domain: "energy".into(),
            category: "generation".into(),
            subcategory: None,
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_policy() {
        let repo: Arc<dyn FullRepository> = Arc::new(LocalRepository::new());
        let runtime = CollectorRuntime::new(repo, 4)
            .with_retry_policy(RetryPolicy { max_retries: 3, base_delay: StdDuration::from_millis(1) });
        let adapter: Arc<dyn SingleSeriesAdapter> = Arc::new(FlakyAdapter {
            attempts: AtomicUsize::new(0),
            fail_until: 2,
            metadata: meta(),
        });
        runtime.fetch_and_store_single(adapter).await.unwrap();
    }

    #[tokio::test]
    async fn initial_fetch_batches_and_reports_summary() {
        let repo: Arc<dyn FullRepository> = Arc::new(LocalRepository::new());
        let runtime = CollectorRuntime::new(repo, 4);
        let adapters: Vec<Arc<dyn SingleSeriesAdapter>> = (0..3)
            .map(|i| {
                Arc::new(FlakyAdapter {
                    attempts: AtomicUsize::new(0),
                    fail_until: 0,
                    metadata: SeriesMetadata { name: format!("s{i}"), ..meta() },
                }) as Arc<dyn SingleSeriesAdapter>
            })
            .collect();
        let summary = runtime.run_initial_fetch(&adapters, &[]).await;
        assert_eq!(summary.successful, 3);
        assert_eq!(summary.failed, 0);
    }
}
