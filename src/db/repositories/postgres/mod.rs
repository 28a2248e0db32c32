//! Postgres repository implementation using Diesel.
//!
//! Implements the four domain repository traits against a Postgres schema:
//! time series identity and data sinks, the challenge/round lifecycle,
//! forecast reads and score writes, and ELO ratings.
//!
//! ## Features
//!
//! - Connection pooling with r2d2
//! - Automatic retry for transient failures
//! - Automatic migration execution
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATABASE_URL` or `PG_DATABASE_URL`: Connection string (required)
//! - `PG_POOL_MAX`: Maximum pool size (default: 10)
//! - `PG_POOL_MIN`: Minimum pool size (default: 1)
//! - `PG_CONN_TIMEOUT_SEC`: Connection timeout in seconds (default: 30)
//! - `PG_IDLE_TIMEOUT_SEC`: Idle connection timeout in seconds (default: 600)
//! - `PG_MAX_RETRIES`: Maximum retry attempts for transient failures (default: 3)
//! - `PG_RETRY_DELAY_MS`: Initial retry delay in milliseconds (default: 100)

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_query;
use diesel::sql_types::{BigInt, Double, Integer, Nullable, Timestamptz};
use diesel::upsert::excluded;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task;

use crate::db::models::{
    ChallengeDefinition, ChallengeRound, DefinitionSeriesAssignment, EloRating, EvaluationStatus,
    OperationalPoint, Resolution, RoundContextPoint, RoundSeriesPseudo, Scd2Point,
    Scd2UpsertStats, Score, TimeSeries,
};
use crate::db::repository::challenge::ChallengeRepository;
use crate::db::repository::elo::EloRepository;
use crate::db::repository::error::{ErrorContext, RepositoryError, RepositoryResult};
use crate::db::repository::forecast::{EvaluationPair, ForecastRepository, ForecastStats, MaseRow};
use crate::db::repository::time_series::TimeSeriesRepository;
use crate::duration::Duration as IsoDuration;

mod models;
mod schema;

use models::*;
use schema::*;

type PgPool = Pool<ConnectionManager<PgConnection>>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("src/db/repositories/postgres/migrations");

/// Configuration for connecting to Postgres.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub connection_timeout_sec: u64,
    pub idle_timeout_sec: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_pool_size: 10,
            min_pool_size: 1,
            connection_timeout_sec: 30,
            idle_timeout_sec: 600,
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

impl PostgresConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("PG_DATABASE_URL"))
            .map_err(|_| "DATABASE_URL or PG_DATABASE_URL must be set".to_string())?;

        let max_pool_size = std::env::var("PG_POOL_MAX")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        let min_pool_size = std::env::var("PG_POOL_MIN")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);
        let connection_timeout_sec = std::env::var("PG_CONN_TIMEOUT_SEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        let idle_timeout_sec = std::env::var("PG_IDLE_TIMEOUT_SEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(600);
        let max_retries = std::env::var("PG_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(3);
        let retry_delay_ms = std::env::var("PG_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(100);

        Ok(Self {
            database_url,
            max_pool_size,
            min_pool_size,
            connection_timeout_sec,
            idle_timeout_sec,
            max_retries,
            retry_delay_ms,
        })
    }

    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// Pool health statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub connections_in_use: u32,
    pub idle_connections: u32,
    pub total_connections: u32,
    pub max_size: u32,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub retried_operations: u64,
}

/// Diesel-backed repository for Postgres.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
    config: PostgresConfig,
    total_queries: std::sync::Arc<AtomicU64>,
    failed_queries: std::sync::Arc<AtomicU64>,
    retried_operations: std::sync::Arc<AtomicU64>,
}

impl PostgresRepository {
    pub fn new(config: PostgresConfig) -> RepositoryResult<Self> {
        let manager = ConnectionManager::<PgConnection>::new(&config.database_url);

        let pool = Pool::builder()
            .max_size(config.max_pool_size)
            .min_idle(Some(config.min_pool_size))
            .connection_timeout(Duration::from_secs(config.connection_timeout_sec))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_sec)))
            .test_on_check_out(true)
            .build(manager)
            .map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("create_pool")
                        .with_details(format!("max_size={}", config.max_pool_size)),
                )
            })?;

        {
            let mut conn = pool.get().map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("get_connection_for_migrations"),
                )
            })?;
            Self::run_migrations(&mut conn)?;
        }

        Ok(Self {
            pool,
            config,
            total_queries: std::sync::Arc::new(AtomicU64::new(0)),
            failed_queries: std::sync::Arc::new(AtomicU64::new(0)),
            retried_operations: std::sync::Arc::new(AtomicU64::new(0)),
        })
    }

    fn run_migrations(conn: &mut PgConnection) -> RepositoryResult<()> {
        conn.run_pending_migrations(MIGRATIONS).map_err(|e| {
            RepositoryError::internal_with_context(
                format!("Migration failed: {}", e),
                ErrorContext::new("run_migrations"),
            )
        })?;
        Ok(())
    }

    /// Execute a database operation with automatic retry for transient failures.
    async fn with_conn<T, F>(&self, f: F) -> RepositoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> RepositoryResult<T> + Send + 'static + Clone,
    {
        let pool = self.pool.clone();
        let max_retries = self.config.max_retries;
        let retry_delay_ms = self.config.retry_delay_ms;
        let total_queries = self.total_queries.clone();
        let failed_queries = self.failed_queries.clone();
        let retried_operations = self.retried_operations.clone();

        task::spawn_blocking(move || {
            let mut last_error = None;
            let mut retry_delay = Duration::from_millis(retry_delay_ms);

            for attempt in 0..=max_retries {
                if attempt > 0 {
                    retried_operations.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(retry_delay);
                    retry_delay *= 2;
                }

                let mut conn = match pool.get() {
                    Ok(c) => c,
                    Err(e) => {
                        let err = RepositoryError::connection_with_context(
                            e.to_string(),
                            ErrorContext::new("get_connection")
                                .with_details(format!("attempt={}", attempt + 1))
                                .retryable(),
                        );
                        if attempt < max_retries {
                            last_error = Some(err);
                            continue;
                        }
                        failed_queries.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                };

                total_queries.fetch_add(1, Ordering::Relaxed);
                match f.clone()(&mut conn) {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_retryable() && attempt < max_retries => {
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => {
                        failed_queries.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                }
            }

            failed_queries.fetch_add(1, Ordering::Relaxed);
            Err(last_error.unwrap_or_else(|| {
                RepositoryError::internal("Max retries exceeded with no error captured")
            }))
        })
        .await
        .map_err(|e| {
            RepositoryError::internal_with_context(
                format!("Task join error: {}", e),
                ErrorContext::new("spawn_blocking"),
            )
        })?
    }

    pub fn get_pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections_in_use: state.connections - state.idle_connections,
            idle_connections: state.idle_connections,
            total_connections: state.connections,
            max_size: self.config.max_pool_size,
            total_queries: self.total_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            retried_operations: self.retried_operations.load(Ordering::Relaxed),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.with_conn(|conn| {
            diesel::sql_query("SELECT 1")
                .execute(conn)
                .map(|_| true)
                .map_err(RepositoryError::from)
        })
        .await
        .unwrap_or(false)
    }
}

fn row_to_series(row: TimeSeriesRow) -> RepositoryResult<TimeSeries> {
    Ok(TimeSeries {
        series_id: row.series_id,
        unique_id: row.unique_id,
        name: row.name,
        description: row.description,
        frequency: IsoDuration::from_stored_seconds(row.frequency_seconds),
        unit: row.unit,
        domain: row.domain,
        category: row.category,
        subcategory: row.subcategory,
        update_frequency: IsoDuration::from_stored_seconds(row.update_frequency_seconds),
        timezone: row.timezone,
    })
}

fn row_to_definition(row: ChallengeDefinitionRow) -> ChallengeDefinition {
    ChallengeDefinition {
        definition_id: row.definition_id,
        schedule_id: row.schedule_id,
        name: row.name,
        description: row.description,
        domain: row.domain,
        subdomain: row.subdomain,
        context_length: row.context_length,
        horizon: IsoDuration::from_stored_seconds(row.horizon_seconds),
        frequency: IsoDuration::from_stored_seconds(row.frequency_seconds),
        cron_expression: row.cron_expression,
        n_series: row.n_series,
        announce_lead: IsoDuration::from_stored_seconds(row.announce_lead_seconds),
        registration_duration: IsoDuration::from_stored_seconds(row.registration_duration_seconds),
        evaluation_delay: IsoDuration::from_stored_seconds(row.evaluation_delay_seconds),
        is_active: row.is_active,
        run_on_startup: row.run_on_startup,
    }
}

fn row_to_round(row: ChallengeRoundRow) -> ChallengeRound {
    ChallengeRound {
        round_id: row.round_id,
        definition_id: row.definition_id,
        name: row.name,
        context_length: row.context_length,
        horizon: IsoDuration::from_stored_seconds(row.horizon_seconds),
        frequency: IsoDuration::from_stored_seconds(row.frequency_seconds),
        registration_start: row.registration_start,
        registration_end: row.registration_end,
        start_time: row.start_time,
        end_time: row.end_time,
        preparation_params: row.preparation_params,
        is_cancelled: row.is_cancelled,
    }
}

fn evaluation_status_str(status: EvaluationStatus) -> &'static str {
    match status {
        EvaluationStatus::Pending => "pending",
        EvaluationStatus::NoForecasts => "no_forecasts",
        EvaluationStatus::NoOverlap => "no_overlap",
        EvaluationStatus::Partial => "partial",
        EvaluationStatus::Complete => "complete",
        EvaluationStatus::Error => "error",
    }
}

fn parse_evaluation_status(s: &str) -> EvaluationStatus {
    match s {
        "no_forecasts" => EvaluationStatus::NoForecasts,
        "no_overlap" => EvaluationStatus::NoOverlap,
        "partial" => EvaluationStatus::Partial,
        "complete" => EvaluationStatus::Complete,
        "error" => EvaluationStatus::Error,
        _ => EvaluationStatus::Pending,
    }
}

#[async_trait]
impl TimeSeriesRepository for PostgresRepository {
    async fn get_or_create_series_id(
        &self,
        unique_id: &str,
        name: &str,
        description: &str,
        frequency: IsoDuration,
        unit: &str,
        domain: &str,
        category: &str,
        subcategory: Option<&str>,
        update_frequency: IsoDuration,
    ) -> RepositoryResult<i64> {
        let new_row = NewTimeSeriesRow {
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            frequency_seconds: frequency.seconds(),
            unit: unit.to_string(),
            domain: domain.to_string(),
            category: category.to_string(),
            subcategory: subcategory.map(|s| s.to_string()),
            update_frequency_seconds: update_frequency.seconds(),
        };

        self.with_conn(move |conn| {
            let id: i64 = diesel::insert_into(time_series::table)
                .values(&new_row)
                .on_conflict(time_series::unique_id)
                .do_update()
                .set((
                    time_series::name.eq(excluded(time_series::name)),
                    time_series::description.eq(excluded(time_series::description)),
                    time_series::frequency_seconds.eq(excluded(time_series::frequency_seconds)),
                    time_series::unit.eq(excluded(time_series::unit)),
                    time_series::domain.eq(excluded(time_series::domain)),
                    time_series::category.eq(excluded(time_series::category)),
                    time_series::subcategory.eq(excluded(time_series::subcategory)),
                    time_series::update_frequency_seconds
                        .eq(excluded(time_series::update_frequency_seconds)),
                ))
                .returning(time_series::series_id)
                .get_result(conn)
                .map_err(RepositoryError::from)?;
            Ok(id)
        })
        .await
    }

    async fn update_series_timezone(&self, series_id: i64, timezone: &str) -> RepositoryResult<()> {
        let timezone = timezone.to_string();
        self.with_conn(move |conn| {
            diesel::update(time_series::table.find(series_id))
                .set(time_series::timezone.eq(Some(timezone.clone())))
                .execute(conn)
                .map_err(RepositoryError::from)?;
            Ok(())
        })
        .await
    }

    async fn get_series(&self, series_id: i64) -> RepositoryResult<TimeSeries> {
        let row: TimeSeriesRow = self
            .with_conn(move |conn| {
                time_series::table
                    .find(series_id)
                    .select(TimeSeriesRow::as_select())
                    .first(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        row_to_series(row)
    }

    async fn upsert_operational_points(
        &self,
        series_id: i64,
        points: &[OperationalPoint],
    ) -> RepositoryResult<usize> {
        let mut dedup: std::collections::HashMap<DateTime<Utc>, f64> =
            std::collections::HashMap::with_capacity(points.len());
        for p in points {
            dedup.insert(p.ts, p.value);
        }
        let values: Vec<_> = dedup
            .into_iter()
            .map(|(ts, value)| {
                (
                    schema::time_series_data::series_id.eq(series_id),
                    schema::time_series_data::ts.eq(ts),
                    schema::time_series_data::value.eq(value),
                )
            })
            .collect();

        self.with_conn(move |conn| {
            let n = diesel::insert_into(schema::time_series_data::table)
                .values(&values)
                .on_conflict((
                    schema::time_series_data::series_id,
                    schema::time_series_data::ts,
                ))
                .do_update()
                .set(schema::time_series_data::value.eq(excluded(schema::time_series_data::value)))
                .execute(conn)
                .map_err(RepositoryError::from)?;
            Ok(n)
        })
        .await
    }

    async fn upsert_scd2_points(
        &self,
        series_id: i64,
        points: &[Scd2Point],
    ) -> RepositoryResult<Scd2UpsertStats> {
        let mut stats = Scd2UpsertStats::default();
        for point in points {
            let ts = point.ts;
            let value = point.value;
            let quality_code = point.quality_code as i16;

            let outcome = self
                .with_conn(move |conn| {
                    conn.transaction::<_, RepositoryError, _>(|conn| {
                        #[derive(QueryableByName)]
                        struct CurrentRow {
                            #[diesel(sql_type = Nullable<Double>)]
                            value: Option<f64>,
                            #[diesel(sql_type = diesel::sql_types::Int2)]
                            quality_code: i16,
                        }

                        let current: Option<CurrentRow> = sql_query(
                            "SELECT value, quality_code FROM time_series_data_scd2 \
                             WHERE series_id = $1 AND ts = $2 AND is_current = true",
                        )
                        .bind::<BigInt, _>(series_id)
                        .bind::<Timestamptz, _>(ts)
                        .get_result(conn)
                        .optional()
                        .map_err(RepositoryError::from)?;

                        match current {
                            None => {
                                sql_query(
                                    "INSERT INTO time_series_data_scd2 \
                                     (series_id, ts, value, quality_code, valid_from, is_current) \
                                     VALUES ($1, $2, $3, $4, now(), true)",
                                )
                                .bind::<BigInt, _>(series_id)
                                .bind::<Timestamptz, _>(ts)
                                .bind::<Nullable<Double>, _>(value)
                                .bind::<diesel::sql_types::Int2, _>(quality_code)
                                .execute(conn)
                                .map_err(RepositoryError::from)?;
                                Ok("inserted")
                            }
                            Some(row) if row.value == value && row.quality_code == quality_code => {
                                Ok("unchanged")
                            }
                            Some(_) => {
                                sql_query(
                                    "UPDATE time_series_data_scd2 SET valid_to = now(), \
                                     is_current = false \
                                     WHERE series_id = $1 AND ts = $2 AND is_current = true",
                                )
                                .bind::<BigInt, _>(series_id)
                                .bind::<Timestamptz, _>(ts)
                                .execute(conn)
                                .map_err(RepositoryError::from)?;

                                sql_query(
                                    "INSERT INTO time_series_data_scd2 \
                                     (series_id, ts, value, quality_code, valid_from, is_current) \
                                     VALUES ($1, $2, $3, $4, now(), true)",
                                )
                                .bind::<BigInt, _>(series_id)
                                .bind::<Timestamptz, _>(ts)
                                .bind::<Nullable<Double>, _>(value)
                                .bind::<diesel::sql_types::Int2, _>(quality_code)
                                .execute(conn)
                                .map_err(RepositoryError::from)?;
                                Ok("updated")
                            }
                        }
                    })
                })
                .await?;

            match outcome {
                "inserted" => stats.inserted += 1,
                "updated" => stats.updated += 1,
                _ => stats.unchanged += 1,
            }
        }
        Ok(stats)
    }

    async fn get_context_window(
        &self,
        series_id: i64,
        resolution: Resolution,
        before: DateTime<Utc>,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<OperationalPoint>> {
        let view = format!("time_series_data_scd2_{}", resolution.view_suffix());
        #[derive(QueryableByName)]
        struct PointRow {
            #[diesel(sql_type = Timestamptz)]
            ts: DateTime<Utc>,
            #[diesel(sql_type = Double)]
            value: f64,
        }
        let query = format!(
            "SELECT ts, value FROM {view} WHERE series_id = $1 AND ts < $2 \
             AND valid_from <= $3 AND (valid_to IS NULL OR valid_to > $3) \
             AND value IS NOT NULL ORDER BY ts DESC LIMIT $4"
        );
        let limit_i64 = limit as i64;
        let rows: Vec<PointRow> = self
            .with_conn(move |conn| {
                sql_query(query.clone())
                    .bind::<BigInt, _>(series_id)
                    .bind::<Timestamptz, _>(before)
                    .bind::<Timestamptz, _>(as_of)
                    .bind::<BigInt, _>(limit_i64)
                    .get_results(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        let mut points: Vec<OperationalPoint> = rows
            .into_iter()
            .map(|r| OperationalPoint { ts: r.ts, value: r.value })
            .collect();
        points.reverse();
        Ok(points)
    }

    async fn get_point_at(
        &self,
        series_id: i64,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> RepositoryResult<Option<OperationalPoint>> {
        let view = format!("time_series_data_scd2_{}", resolution.view_suffix());
        #[derive(QueryableByName)]
        struct PointRow {
            #[diesel(sql_type = Double)]
            value: f64,
        }
        let query = format!(
            "SELECT value FROM {view} WHERE series_id = $1 AND ts = $2 AND value IS NOT NULL LIMIT 1"
        );
        let row: Option<PointRow> = self
            .with_conn(move |conn| {
                sql_query(query.clone())
                    .bind::<BigInt, _>(series_id)
                    .bind::<Timestamptz, _>(at)
                    .get_result(conn)
                    .optional()
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(row.map(|r| OperationalPoint { ts: at, value: r.value }))
    }

    async fn find_available_series(
        &self,
        domain: Option<&str>,
        subdomain: Option<&str>,
        frequency: IsoDuration,
        exclude: &[i64],
        limit: usize,
    ) -> RepositoryResult<Vec<i64>> {
        let mut query = time_series::table
            .filter(time_series::frequency_seconds.eq(frequency.seconds()))
            .into_boxed();
        if let Some(domain) = domain {
            query = query.filter(time_series::domain.eq(domain.to_string()));
        }
        if let Some(subdomain) = subdomain {
            query = query.filter(time_series::subcategory.eq(Some(subdomain.to_string())));
        }
        let exclude = exclude.to_vec();
        let limit_i64 = limit as i64;
        self.with_conn(move |conn| {
            let mut ids: Vec<i64> = query
                .select(time_series::series_id)
                .load(conn)
                .map_err(RepositoryError::from)?;
            ids.retain(|id| !exclude.contains(id));
            ids.truncate(limit_i64 as usize);
            Ok(ids)
        })
        .await
    }
}

#[async_trait]
impl ChallengeRepository for PostgresRepository {
    async fn upsert_definition(&self, definition: &ChallengeDefinition) -> RepositoryResult<i64> {
        let new_row = NewChallengeDefinitionRow {
            schedule_id: definition.schedule_id.clone(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            domain: definition.domain.clone(),
            subdomain: definition.subdomain.clone(),
            context_length: definition.context_length,
            horizon_seconds: definition.horizon.seconds(),
            frequency_seconds: definition.frequency.seconds(),
            cron_expression: definition.cron_expression.clone(),
            n_series: definition.n_series,
            announce_lead_seconds: definition.announce_lead.seconds(),
            registration_duration_seconds: definition.registration_duration.seconds(),
            evaluation_delay_seconds: definition.evaluation_delay.seconds(),
            is_active: definition.is_active,
            run_on_startup: definition.run_on_startup,
        };

        self.with_conn(move |conn| {
            let id: i64 = diesel::insert_into(challenge_definitions::table)
                .values(&new_row)
                .on_conflict(challenge_definitions::schedule_id)
                .do_update()
                .set(&new_row)
                .returning(challenge_definitions::definition_id)
                .get_result(conn)
                .map_err(RepositoryError::from)?;
            Ok(id)
        })
        .await
    }

    async fn list_active_definitions(&self) -> RepositoryResult<Vec<ChallengeDefinition>> {
        let rows: Vec<ChallengeDefinitionRow> = self
            .with_conn(|conn| {
                challenge_definitions::table
                    .filter(challenge_definitions::is_active.eq(true))
                    .select(ChallengeDefinitionRow::as_select())
                    .load(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(rows.into_iter().map(row_to_definition).collect())
    }

    async fn get_definition(&self, definition_id: i64) -> RepositoryResult<ChallengeDefinition> {
        let row: ChallengeDefinitionRow = self
            .with_conn(move |conn| {
                challenge_definitions::table
                    .find(definition_id)
                    .select(ChallengeDefinitionRow::as_select())
                    .first(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(row_to_definition(row))
    }

    async fn reconcile_series_assignments(
        &self,
        definition_id: i64,
        active: &[DefinitionSeriesAssignment],
        as_of: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        if active.is_empty() {
            return Ok(());
        }
        let active = active.to_vec();
        self.with_conn(move |conn| {
            conn.transaction::<_, RepositoryError, _>(|conn| {
                let current: Vec<DefinitionSeriesAssignmentRow> =
                    definition_series_assignments::table
                        .filter(definition_series_assignments::definition_id.eq(definition_id))
                        .filter(definition_series_assignments::is_current.eq(true))
                        .select(DefinitionSeriesAssignmentRow::as_select())
                        .load(conn)
                        .map_err(RepositoryError::from)?;

                let active_ids: std::collections::HashSet<i64> =
                    active.iter().map(|a| a.series_id).collect();

                for row in &current {
                    let still_active = active
                        .iter()
                        .find(|a| a.series_id == row.series_id)
                        .map(|a| a.is_required == row.is_required && a.is_excluded == row.is_excluded)
                        .unwrap_or(false);
                    if !still_active {
                        diesel::update(
                            definition_series_assignments::table.find(row.id),
                        )
                        .set((
                            definition_series_assignments::valid_to.eq(Some(as_of)),
                            definition_series_assignments::is_current.eq(false),
                        ))
                        .execute(conn)
                        .map_err(RepositoryError::from)?;
                    }
                }

                let current_ids: std::collections::HashSet<i64> =
                    current.iter().map(|r| r.series_id).collect();
                for assignment in &active {
                    let unchanged = current.iter().any(|r| {
                        r.series_id == assignment.series_id
                            && r.is_required == assignment.is_required
                            && r.is_excluded == assignment.is_excluded
                    });
                    if unchanged {
                        continue;
                    }
                    if current_ids.contains(&assignment.series_id) {
                        // superseded above; nothing else to do, next insert opens new row
                    }
                    if active_ids.contains(&assignment.series_id) {
                        diesel::insert_into(definition_series_assignments::table)
                            .values(NewDefinitionSeriesAssignmentRow {
                                definition_id,
                                series_id: assignment.series_id,
                                is_required: assignment.is_required,
                                is_excluded: assignment.is_excluded,
                                valid_from: as_of,
                                is_current: true,
                            })
                            .execute(conn)
                            .map_err(RepositoryError::from)?;
                    }
                }

                Ok(())
            })
        })
        .await
    }

    async fn list_series_assignments(
        &self,
        definition_id: i64,
    ) -> RepositoryResult<Vec<DefinitionSeriesAssignment>> {
        let rows: Vec<DefinitionSeriesAssignmentRow> = self
            .with_conn(move |conn| {
                definition_series_assignments::table
                    .filter(definition_series_assignments::definition_id.eq(definition_id))
                    .filter(definition_series_assignments::is_current.eq(true))
                    .select(DefinitionSeriesAssignmentRow::as_select())
                    .load(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| DefinitionSeriesAssignment {
                definition_id: r.definition_id,
                series_id: r.series_id,
                is_required: r.is_required,
                is_excluded: r.is_excluded,
            })
            .collect())
    }

    async fn upsert_round(&self, round: &ChallengeRound) -> RepositoryResult<ChallengeRound> {
        let new_row = NewChallengeRoundRow {
            definition_id: round.definition_id,
            name: round.name.clone(),
            context_length: round.context_length,
            horizon_seconds: round.horizon.seconds(),
            frequency_seconds: round.frequency.seconds(),
            registration_start: round.registration_start,
            registration_end: round.registration_end,
            start_time: round.start_time,
            end_time: round.end_time,
            preparation_params: round.preparation_params.clone(),
            is_cancelled: round.is_cancelled,
        };

        let row: ChallengeRoundRow = self
            .with_conn(move |conn| {
                let existing: Option<ChallengeRoundRow> = challenge_rounds::table
                    .filter(challenge_rounds::name.eq(&new_row.name))
                    .select(ChallengeRoundRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(RepositoryError::from)?;
                if let Some(row) = existing {
                    return Ok(row);
                }
                diesel::insert_into(challenge_rounds::table)
                    .values(&new_row)
                    .get_result(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(row_to_round(row))
    }

    async fn get_round(&self, round_id: i64) -> RepositoryResult<ChallengeRound> {
        let row: ChallengeRoundRow = self
            .with_conn(move |conn| {
                challenge_rounds::table
                    .find(round_id)
                    .select(ChallengeRoundRow::as_select())
                    .first(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(row_to_round(row))
    }

    async fn rounds_needing_evaluation(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<i64>> {
        #[derive(QueryableByName)]
        struct IdRow {
            #[diesel(sql_type = BigInt)]
            round_id: i64,
        }
        let rows: Vec<IdRow> = self
            .with_conn(move |conn| {
                sql_query(
                    "SELECT DISTINCT r.round_id FROM challenge_rounds r \
                     WHERE r.is_cancelled = false AND r.start_time <= $1 \
                     AND NOT EXISTS ( \
                         SELECT 1 FROM scores s WHERE s.round_id = r.round_id \
                         AND s.final_evaluation = true \
                     )",
                )
                .bind::<Timestamptz, _>(now)
                .get_results(conn)
                .map_err(RepositoryError::from)
            })
            .await?;
        Ok(rows.into_iter().map(|r| r.round_id).collect())
    }

    async fn upsert_round_series_pseudo(
        &self,
        rows: &[RoundSeriesPseudo],
    ) -> RepositoryResult<()> {
        let rows: Vec<RoundSeriesPseudoRow> = rows
            .iter()
            .map(|r| RoundSeriesPseudoRow {
                round_id: r.round_id,
                series_id: r.series_id,
                challenge_series_name: r.challenge_series_name.clone(),
                min_ts: r.min_ts,
                max_ts: r.max_ts,
                value_avg: r.value_avg,
                value_std: r.value_std,
            })
            .collect();
        self.with_conn(move |conn| {
            diesel::insert_into(round_series_pseudo::table)
                .values(&rows)
                .on_conflict((round_series_pseudo::round_id, round_series_pseudo::series_id))
                .do_update()
                .set((
                    round_series_pseudo::challenge_series_name
                        .eq(excluded(round_series_pseudo::challenge_series_name)),
                    round_series_pseudo::min_ts.eq(excluded(round_series_pseudo::min_ts)),
                    round_series_pseudo::max_ts.eq(excluded(round_series_pseudo::max_ts)),
                    round_series_pseudo::value_avg.eq(excluded(round_series_pseudo::value_avg)),
                    round_series_pseudo::value_std.eq(excluded(round_series_pseudo::value_std)),
                ))
                .execute(conn)
                .map_err(RepositoryError::from)?;
            Ok(())
        })
        .await
    }

    async fn get_round_series_pseudo(
        &self,
        round_id: i64,
        series_id: i64,
    ) -> RepositoryResult<Option<RoundSeriesPseudo>> {
        let row: Option<RoundSeriesPseudoRow> = self
            .with_conn(move |conn| {
                round_series_pseudo::table
                    .find((round_id, series_id))
                    .select(RoundSeriesPseudoRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(row.map(|r| RoundSeriesPseudo {
            round_id: r.round_id,
            series_id: r.series_id,
            challenge_series_name: r.challenge_series_name,
            min_ts: r.min_ts,
            max_ts: r.max_ts,
            value_avg: r.value_avg,
            value_std: r.value_std,
        }))
    }

    async fn list_round_series(&self, round_id: i64) -> RepositoryResult<Vec<RoundSeriesPseudo>> {
        let rows: Vec<RoundSeriesPseudoRow> = self
            .with_conn(move |conn| {
                round_series_pseudo::table
                    .filter(round_series_pseudo::round_id.eq(round_id))
                    .select(RoundSeriesPseudoRow::as_select())
                    .load(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| RoundSeriesPseudo {
                round_id: r.round_id,
                series_id: r.series_id,
                challenge_series_name: r.challenge_series_name,
                min_ts: r.min_ts,
                max_ts: r.max_ts,
                value_avg: r.value_avg,
                value_std: r.value_std,
            })
            .collect())
    }

    async fn insert_context_snapshot(&self, points: &[RoundContextPoint]) -> RepositoryResult<usize> {
        let rows: Vec<NewRoundContextPointRow> = points
            .iter()
            .map(|p| NewRoundContextPointRow {
                round_id: p.round_id,
                series_id: p.series_id,
                ts: p.ts,
                value: p.value,
            })
            .collect();
        self.with_conn(move |conn| {
            diesel::insert_into(round_context_snapshot::table)
                .values(&rows)
                .execute(conn)
                .map_err(RepositoryError::from)
        })
        .await
    }
}

#[async_trait]
impl ForecastRepository for PostgresRepository {
    async fn get_challenge_participants(&self, round_id: i64) -> RepositoryResult<Vec<i64>> {
        self.with_conn(move |conn| {
            forecasts::table
                .filter(forecasts::round_id.eq(round_id))
                .select(forecasts::model_id)
                .distinct()
                .load(conn)
                .map_err(RepositoryError::from)
        })
        .await
    }

    async fn get_challenge_series_ids(&self, round_id: i64) -> RepositoryResult<Vec<i64>> {
        self.with_conn(move |conn| {
            round_series_pseudo::table
                .filter(round_series_pseudo::round_id.eq(round_id))
                .select(round_series_pseudo::series_id)
                .load(conn)
                .map_err(RepositoryError::from)
        })
        .await
    }

    async fn get_forecast_stats(
        &self,
        round_id: i64,
        model_id: i64,
        series_id: i64,
    ) -> RepositoryResult<ForecastStats> {
        let count: i64 = self
            .with_conn(move |conn| {
                forecasts::table
                    .filter(forecasts::round_id.eq(round_id))
                    .filter(forecasts::model_id.eq(model_id))
                    .filter(forecasts::series_id.eq(series_id))
                    .count()
                    .get_result(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(ForecastStats { count })
    }

    async fn get_evaluation_data(
        &self,
        round_id: i64,
        model_id: i64,
        series_id: i64,
        resolution: Resolution,
    ) -> RepositoryResult<Vec<EvaluationPair>> {
        let view = format!("time_series_data_scd2_{}", resolution.view_suffix());
        #[derive(QueryableByName)]
        struct PairRow {
            #[diesel(sql_type = Double)]
            predicted_value: f64,
            #[diesel(sql_type = Double)]
            actual_value: f64,
        }
        let query = format!(
            "SELECT f.predicted_value, a.value AS actual_value \
             FROM forecasts f JOIN {view} a \
             ON a.series_id = f.series_id AND date_trunc('minute', a.ts) = date_trunc('minute', f.ts) \
             WHERE f.round_id = $1 AND f.model_id = $2 AND f.series_id = $3 \
             AND a.value IS NOT NULL"
        );
        let rows: Vec<PairRow> = self
            .with_conn(move |conn| {
                sql_query(query.clone())
                    .bind::<BigInt, _>(round_id)
                    .bind::<BigInt, _>(model_id)
                    .bind::<BigInt, _>(series_id)
                    .get_results(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| EvaluationPair {
                predicted_value: r.predicted_value,
                actual_value: r.actual_value,
            })
            .collect())
    }

    async fn bulk_upsert_scores(&self, scores: &[Score]) -> RepositoryResult<usize> {
        let rows: Vec<ScoreRow> = scores
            .iter()
            .map(|s| ScoreRow {
                round_id: s.round_id,
                model_id: s.model_id,
                series_id: s.series_id,
                mase: s.mase,
                rmse: s.rmse,
                forecast_count: s.forecast_count,
                actual_count: s.actual_count,
                evaluated_count: s.evaluated_count,
                data_coverage: s.data_coverage,
                evaluation_status: evaluation_status_str(s.evaluation_status).to_string(),
                error_message: s.error_message.clone(),
                final_evaluation: s.final_evaluation,
                calculated_at: s.calculated_at,
            })
            .collect();
        self.with_conn(move |conn| {
            diesel::insert_into(scores::table)
                .values(&rows)
                .on_conflict((scores::round_id, scores::model_id, scores::series_id))
                .do_update()
                .set((
                    scores::mase.eq(excluded(scores::mase)),
                    scores::rmse.eq(excluded(scores::rmse)),
                    scores::forecast_count.eq(excluded(scores::forecast_count)),
                    scores::actual_count.eq(excluded(scores::actual_count)),
                    scores::evaluated_count.eq(excluded(scores::evaluated_count)),
                    scores::data_coverage.eq(excluded(scores::data_coverage)),
                    scores::evaluation_status.eq(excluded(scores::evaluation_status)),
                    scores::error_message.eq(excluded(scores::error_message)),
                    scores::final_evaluation.eq(excluded(scores::final_evaluation)),
                    scores::calculated_at.eq(excluded(scores::calculated_at)),
                ))
                .execute(conn)
                .map_err(RepositoryError::from)
        })
        .await
    }

    async fn all_scores_complete(&self, round_id: i64) -> RepositoryResult<bool> {
        let pending: i64 = self
            .with_conn(move |conn| {
                scores::table
                    .filter(scores::round_id.eq(round_id))
                    .filter(
                        scores::evaluation_status
                            .eq("pending")
                            .or(scores::evaluation_status.eq("partial")),
                    )
                    .count()
                    .get_result(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(pending == 0)
    }

    async fn mark_round_scores_final(&self, round_id: i64) -> RepositoryResult<()> {
        self.with_conn(move |conn| {
            diesel::update(scores::table.filter(scores::round_id.eq(round_id)))
                .set(scores::final_evaluation.eq(true))
                .execute(conn)
                .map_err(RepositoryError::from)?;
            Ok(())
        })
        .await
    }

    async fn finalized_mase_matrix_rows(
        &self,
        definition_id: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> RepositoryResult<Vec<MaseRow>> {
        #[derive(QueryableByName)]
        struct Row {
            #[diesel(sql_type = BigInt)]
            round_id: i64,
            #[diesel(sql_type = BigInt)]
            series_id: i64,
            #[diesel(sql_type = BigInt)]
            model_id: i64,
            #[diesel(sql_type = Double)]
            mase: f64,
        }
        const BASE: &str = "SELECT s.round_id, s.series_id, s.model_id, s.mase \
             FROM scores s JOIN challenge_rounds r ON r.round_id = s.round_id \
             WHERE s.final_evaluation = true AND s.mase IS NOT NULL";

        let rows: Vec<Row> = self
            .with_conn(move |conn| {
                match (definition_id, since) {
                    (Some(def_id), Some(since)) => sql_query(format!(
                        "{BASE} AND r.definition_id = $1 AND s.calculated_at >= $2"
                    ))
                    .bind::<BigInt, _>(def_id)
                    .bind::<Timestamptz, _>(since)
                    .get_results(conn),
                    (Some(def_id), None) => sql_query(format!("{BASE} AND r.definition_id = $1"))
                        .bind::<BigInt, _>(def_id)
                        .get_results(conn),
                    (None, Some(since)) => {
                        sql_query(format!("{BASE} AND s.calculated_at >= $1"))
                            .bind::<Timestamptz, _>(since)
                            .get_results(conn)
                    }
                    (None, None) => sql_query(BASE).get_results(conn),
                }
                .map_err(RepositoryError::from)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| MaseRow {
                round_id: r.round_id,
                series_id: r.series_id,
                model_id: r.model_id,
                mase: r.mase,
            })
            .collect())
    }

    async fn definitions_with_finalized_scores(&self) -> RepositoryResult<Vec<i64>> {
        #[derive(QueryableByName)]
        struct Row {
            #[diesel(sql_type = BigInt)]
            definition_id: i64,
        }
        let rows: Vec<Row> = self
            .with_conn(|conn| {
                sql_query(
                    "SELECT DISTINCT r.definition_id FROM challenge_rounds r \
                     JOIN scores s ON s.round_id = r.round_id \
                     WHERE s.final_evaluation = true AND r.definition_id IS NOT NULL",
                )
                .get_results(conn)
                .map_err(RepositoryError::from)
            })
            .await?;
        Ok(rows.into_iter().map(|r| r.definition_id).collect())
    }
}

#[async_trait]
impl EloRepository for PostgresRepository {
    async fn upsert_ratings(&self, ratings: &[EloRating]) -> RepositoryResult<usize> {
        let rows: Vec<EloRatingRow> = ratings
            .iter()
            .map(|r| EloRatingRow {
                model_id: r.model_id,
                definition_id: r.definition_id,
                time_period_days: r.time_period_days,
                elo_score: r.elo_score,
                elo_ci_lower: r.elo_ci_lower,
                elo_ci_upper: r.elo_ci_upper,
                n_matches: r.n_matches,
                n_bootstraps: r.n_bootstraps,
                calculation_duration_ms: r.calculation_duration_ms,
                calculated_at: r.calculated_at,
            })
            .collect();
        self.with_conn(move |conn| {
            let mut affected = 0;
            for row in &rows {
                affected += sql_query(
                    "INSERT INTO elo_ratings \
                     (model_id, definition_id, time_period_days, elo_score, elo_ci_lower, \
                      elo_ci_upper, n_matches, n_bootstraps, calculation_duration_ms, calculated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                     ON CONFLICT (model_id, (COALESCE(definition_id,-1)), (COALESCE(time_period_days,0))) \
                     DO UPDATE SET elo_score = EXCLUDED.elo_score, \
                       elo_ci_lower = EXCLUDED.elo_ci_lower, elo_ci_upper = EXCLUDED.elo_ci_upper, \
                       n_matches = EXCLUDED.n_matches, n_bootstraps = EXCLUDED.n_bootstraps, \
                       calculation_duration_ms = EXCLUDED.calculation_duration_ms, \
                       calculated_at = EXCLUDED.calculated_at",
                )
                .bind::<BigInt, _>(row.model_id)
                .bind::<Nullable<BigInt>, _>(row.definition_id)
                .bind::<Nullable<Integer>, _>(row.time_period_days)
                .bind::<Double, _>(row.elo_score)
                .bind::<Double, _>(row.elo_ci_lower)
                .bind::<Double, _>(row.elo_ci_upper)
                .bind::<BigInt, _>(row.n_matches)
                .bind::<Integer, _>(row.n_bootstraps)
                .bind::<BigInt, _>(row.calculation_duration_ms)
                .bind::<Timestamptz, _>(row.calculated_at)
                .execute(conn)
                .map_err(RepositoryError::from)?;
            }
            Ok(affected)
        })
        .await
    }

    async fn has_calculated_today(
        &self,
        definition_id: Option<i64>,
        time_period_days: Option<i32>,
        today: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let day_start = today
            .with_hour(0)
            .and_then(|d| d.with_minute(0))
            .and_then(|d| d.with_second(0))
            .unwrap_or(today);
        let count: i64 = self
            .with_conn(move |conn| {
                let mut query = elo_ratings::table
                    .filter(elo_ratings::calculated_at.ge(day_start))
                    .into_boxed();
                query = match definition_id {
                    Some(id) => query.filter(elo_ratings::definition_id.eq(Some(id))),
                    None => query.filter(elo_ratings::definition_id.is_null()),
                };
                query = match time_period_days {
                    Some(days) => query.filter(elo_ratings::time_period_days.eq(Some(days))),
                    None => query.filter(elo_ratings::time_period_days.is_null()),
                };
                query.count().get_result(conn).map_err(RepositoryError::from)
            })
            .await?;
        Ok(count > 0)
    }

    async fn get_leaderboard(
        &self,
        definition_id: Option<i64>,
        time_period_days: Option<i32>,
    ) -> RepositoryResult<Vec<EloRating>> {
        let rows: Vec<EloRatingRow> = self
            .with_conn(move |conn| {
                let mut query = elo_ratings::table.into_boxed();
                query = match definition_id {
                    Some(id) => query.filter(elo_ratings::definition_id.eq(Some(id))),
                    None => query.filter(elo_ratings::definition_id.is_null()),
                };
                query = match time_period_days {
                    Some(days) => query.filter(elo_ratings::time_period_days.eq(Some(days))),
                    None => query.filter(elo_ratings::time_period_days.is_null()),
                };
                query
                    .order(elo_ratings::elo_score.desc())
                    .select(EloRatingRow::as_select())
                    .load(conn)
                    .map_err(RepositoryError::from)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| EloRating {
                model_id: r.model_id,
                definition_id: r.definition_id,
                time_period_days: r.time_period_days,
                elo_score: r.elo_score,
                elo_ci_lower: r.elo_ci_lower,
                elo_ci_upper: r.elo_ci_upper,
                n_matches: r.n_matches,
                n_bootstraps: r.n_bootstraps,
                calculation_duration_ms: r.calculation_duration_ms,
                calculated_at: r.calculated_at,
            })
            .collect())
    }
}

