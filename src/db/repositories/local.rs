//! In-memory repository implementation for tests and local development.
//!
//! State lives behind a single `parking_lot::Mutex` guarding a plain struct;
//! this repository is not meant to be fast, only to faithfully replicate the
//! SCD2 and idempotency invariants the Postgres backend enforces so that
//! higher-level code can be exercised without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::db::models::{
    ChallengeDefinition, ChallengeRound, DefinitionSeriesAssignment, EloRating, EvaluationStatus,
    Forecast, OperationalPoint, Resolution, RoundContextPoint, RoundSeriesPseudo, Scd2Point,
    Scd2UpsertStats, Score, TimeSeries,
};
use crate::db::repository::challenge::ChallengeRepository;
use crate::db::repository::elo::EloRepository;
use crate::db::repository::error::{RepositoryError, RepositoryResult};
use crate::db::repository::forecast::{EvaluationPair, ForecastRepository, ForecastStats, MaseRow};
use crate::db::repository::time_series::TimeSeriesRepository;
use crate::duration::Duration;
use crate::imputation::QualityCode;

/// Floor a timestamp to the start of its minute, mirroring the Postgres
/// backend's `date_trunc('minute', ts)` used to join forecasts to actuals.
fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(60);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

#[derive(Clone)]
struct Scd2Row {
    value: Option<f64>,
    quality_code: QualityCode,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    is_current: bool,
}

#[derive(Clone)]
struct AssignmentRow {
    series_id: i64,
    is_required: bool,
    is_excluded: bool,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    is_current: bool,
}

#[derive(Default)]
struct State {
    series: HashMap<i64, TimeSeries>,
    series_by_unique_id: HashMap<String, i64>,
    next_series_id: i64,
    operational: HashMap<i64, std::collections::BTreeMap<DateTime<Utc>, f64>>,
    scd2: HashMap<i64, std::collections::BTreeMap<DateTime<Utc>, Vec<Scd2Row>>>,

    definitions: HashMap<i64, ChallengeDefinition>,
    definitions_by_schedule_id: HashMap<String, i64>,
    next_definition_id: i64,
    assignments: HashMap<i64, Vec<AssignmentRow>>,

    rounds: HashMap<i64, ChallengeRound>,
    rounds_by_name: HashMap<String, i64>,
    next_round_id: i64,
    round_series_pseudo: HashMap<(i64, i64), RoundSeriesPseudo>,
    context_snapshot: Vec<RoundContextPoint>,

    forecasts: Vec<Forecast>,
    scores: HashMap<(i64, i64, i64), Score>,
    elo_ratings: HashMap<(i64, Option<i64>, Option<i32>), EloRating>,
}

/// In-memory repository backing all four domain traits.
pub struct LocalRepository {
    state: Mutex<State>,
}

impl LocalRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Test/fixture hook: seed a forecast row as if written by the external
    /// forecasting pipeline this crate never itself populates.
    pub fn seed_forecast(&self, forecast: Forecast) {
        self.state.lock().forecasts.push(forecast);
    }
}

impl Default for LocalRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSeriesRepository for LocalRepository {
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
    ) -> RepositoryResult<i64> {
        let mut state = self.state.lock();
        if let Some(&id) = state.series_by_unique_id.get(unique_id) {
            if let Some(series) = state.series.get_mut(&id) {
                series.name = name.to_string();
                series.description = description.to_string();
                series.frequency = frequency;
                series.unit = unit.to_string();
                series.domain = domain.to_string();
                series.category = category.to_string();
                series.subcategory = subcategory.map(|s| s.to_string());
                series.update_frequency = update_frequency;
            }
            return Ok(id);
        }

        state.next_series_id += 1;
        let id = state.next_series_id;
        state.series.insert(
            id,
            TimeSeries {
                series_id: id,
                unique_id: unique_id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                frequency,
                unit: unit.to_string(),
                domain: domain.to_string(),
                category: category.to_string(),
                subcategory: subcategory.map(|s| s.to_string()),
                update_frequency,
                timezone: None,
            },
        );
        state.series_by_unique_id.insert(unique_id.to_string(), id);
        Ok(id)
    }

    async fn update_series_timezone(&self, series_id: i64, timezone: &str) -> RepositoryResult<()> {
        let mut state = self.state.lock();
        let series = state
            .series
            .get_mut(&series_id)
            .ok_or_else(|| RepositoryError::not_found(format!("series {series_id} not found")))?;
        series.timezone = Some(timezone.to_string());
        Ok(())
    }

    async fn get_series(&self, series_id: i64) -> RepositoryResult<TimeSeries> {
        self.state
            .lock()
            .series
            .get(&series_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("series {series_id} not found")))
    }

    async fn upsert_operational_points(
        &self,
        series_id: i64,
        points: &[OperationalPoint],
    ) -> RepositoryResult<usize> {
        let mut state = self.state.lock();
        let table = state.operational.entry(series_id).or_default();
        for p in points {
            table.insert(p.ts, p.value);
        }
        Ok(points.len())
    }

    async fn upsert_scd2_points(
        &self,
        series_id: i64,
        points: &[Scd2Point],
    ) -> RepositoryResult<Scd2UpsertStats> {
        let mut state = self.state.lock();
        let table = state.scd2.entry(series_id).or_default();
        let mut stats = Scd2UpsertStats::default();
        let now = Utc::now();

        for point in points {
            let history = table.entry(point.ts).or_default();
            let current = history.iter_mut().find(|r| r.is_current);
            match current {
                None => {
                    history.push(Scd2Row {
                        value: point.value,
                        quality_code: point.quality_code,
                        valid_from: now,
                        valid_to: None,
                        is_current: true,
                    });
                    stats.inserted += 1;
                }
                Some(row) if row.value == point.value && row.quality_code == point.quality_code => {
                    stats.unchanged += 1;
                }
                Some(row) => {
                    row.is_current = false;
                    row.valid_to = Some(now);
                    history.push(Scd2Row {
                        value: point.value,
                        quality_code: point.quality_code,
                        valid_from: now,
                        valid_to: None,
                        is_current: true,
                    });
                    stats.updated += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn get_context_window(
        &self,
        series_id: i64,
        _resolution: Resolution,
        before: DateTime<Utc>,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<OperationalPoint>> {
        let state = self.state.lock();
        let Some(table) = state.scd2.get(&series_id) else {
            return Ok(Vec::new());
        };

        let mut points: Vec<OperationalPoint> = table
            .iter()
            .filter(|(ts, _)| **ts < before)
            .filter_map(|(ts, history)| {
                let row = history
                    .iter()
                    .find(|r| r.valid_from <= as_of && r.valid_to.map(|vt| vt > as_of).unwrap_or(true))?;
                row.value.map(|value| OperationalPoint { ts: *ts, value })
            })
            .collect();
        points.sort_by_key(|p| p.ts);
        if points.len() > limit {
            let skip = points.len() - limit;
            points.drain(0..skip);
        }
        Ok(points)
    }

    async fn get_point_at(
        &self,
        series_id: i64,
        _resolution: Resolution,
        at: DateTime<Utc>,
    ) -> RepositoryResult<Option<OperationalPoint>> {
        let state = self.state.lock();
        let Some(table) = state.scd2.get(&series_id) else {
            return Ok(None);
        };
        Ok(table
            .get(&at)
            .and_then(|history| history.iter().find(|r| r.is_current))
            .and_then(|row| row.value)
            .map(|value| OperationalPoint { ts: at, value }))
    }

    async fn find_available_series(
        &self,
        domain: Option<&str>,
        subdomain: Option<&str>,
        frequency: Duration,
        exclude: &[i64],
        limit: usize,
    ) -> RepositoryResult<Vec<i64>> {
        let state = self.state.lock();
        let mut ids: Vec<i64> = state
            .series
            .values()
            .filter(|s| s.frequency == frequency)
            .filter(|s| domain.map(|d| s.domain == d).unwrap_or(true))
            .filter(|s| subdomain.map(|sd| s.subcategory.as_deref() == Some(sd)).unwrap_or(true))
            .filter(|s| !exclude.contains(&s.series_id))
            .map(|s| s.series_id)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }
}

#[async_trait]
impl ChallengeRepository for LocalRepository {
    async fn upsert_definition(&self, definition: &ChallengeDefinition) -> RepositoryResult<i64> {
        let mut state = self.state.lock();
        if let Some(&id) = state.definitions_by_schedule_id.get(&definition.schedule_id) {
            let mut updated = definition.clone();
            updated.definition_id = id;
            state.definitions.insert(id, updated);
            return Ok(id);
        }
        state.next_definition_id += 1;
        let id = state.next_definition_id;
        let mut new_def = definition.clone();
        new_def.definition_id = id;
        state
            .definitions_by_schedule_id
            .insert(definition.schedule_id.clone(), id);
        state.definitions.insert(id, new_def);
        Ok(id)
    }

    async fn list_active_definitions(&self) -> RepositoryResult<Vec<ChallengeDefinition>> {
        Ok(self
            .state
            .lock()
            .definitions
            .values()
            .filter(|d| d.is_active)
            .cloned()
            .collect())
    }

    async fn get_definition(&self, definition_id: i64) -> RepositoryResult<ChallengeDefinition> {
        self.state
            .lock()
            .definitions
            .get(&definition_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("definition {definition_id} not found")))
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

        let mut state = self.state.lock();
        let history = state.assignments.entry(definition_id).or_default();

        for row in history.iter_mut().filter(|r| r.is_current) {
            let still_active = active.iter().find(|a| a.series_id == row.series_id).map(|a| {
                a.is_required == row.is_required && a.is_excluded == row.is_excluded
            });
            if still_active != Some(true) {
                row.is_current = false;
                row.valid_to = Some(as_of);
            }
        }

        for assignment in active {
            let unchanged = history.iter().any(|r| {
                r.is_current
                    && r.series_id == assignment.series_id
                    && r.is_required == assignment.is_required
                    && r.is_excluded == assignment.is_excluded
            });
            if unchanged {
                continue;
            }
            history.push(AssignmentRow {
                series_id: assignment.series_id,
                is_required: assignment.is_required,
                is_excluded: assignment.is_excluded,
                valid_from: as_of,
                valid_to: None,
                is_current: true,
            });
        }
        Ok(())
    }

    async fn list_series_assignments(
        &self,
        definition_id: i64,
    ) -> RepositoryResult<Vec<DefinitionSeriesAssignment>> {
        let state = self.state.lock();
        Ok(state
            .assignments
            .get(&definition_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|r| r.is_current)
                    .map(|r| DefinitionSeriesAssignment {
                        definition_id,
                        series_id: r.series_id,
                        is_required: r.is_required,
                        is_excluded: r.is_excluded,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_round(&self, round: &ChallengeRound) -> RepositoryResult<ChallengeRound> {
        let mut state = self.state.lock();
        if let Some(&id) = state.rounds_by_name.get(&round.name) {
            return Ok(state.rounds.get(&id).cloned().expect("indexed round exists"));
        }
        state.next_round_id += 1;
        let id = state.next_round_id;
        let mut new_round = round.clone();
        new_round.round_id = id;
        state.rounds_by_name.insert(round.name.clone(), id);
        state.rounds.insert(id, new_round.clone());
        Ok(new_round)
    }

    async fn get_round(&self, round_id: i64) -> RepositoryResult<ChallengeRound> {
        self.state
            .lock()
            .rounds
            .get(&round_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("round {round_id} not found")))
    }

    async fn rounds_needing_evaluation(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<i64>> {
        let state = self.state.lock();
        let mut ids: Vec<i64> = state
            .rounds
            .values()
            .filter(|r| !r.is_cancelled && r.start_time <= now)
            .filter(|r| {
                let round_scores: Vec<&Score> = state
                    .scores
                    .values()
                    .filter(|s| s.round_id == r.round_id)
                    .collect();
                round_scores.is_empty() || round_scores.iter().any(|s| !s.final_evaluation)
            })
            .map(|r| r.round_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn upsert_round_series_pseudo(&self, rows: &[RoundSeriesPseudo]) -> RepositoryResult<()> {
        let mut state = self.state.lock();
        for row in rows {
            state
                .round_series_pseudo
                .insert((row.round_id, row.series_id), row.clone());
        }
        Ok(())
    }

    async fn get_round_series_pseudo(
        &self,
        round_id: i64,
        series_id: i64,
    ) -> RepositoryResult<Option<RoundSeriesPseudo>> {
        Ok(self
            .state
            .lock()
            .round_series_pseudo
            .get(&(round_id, series_id))
            .cloned())
    }

    async fn list_round_series(&self, round_id: i64) -> RepositoryResult<Vec<RoundSeriesPseudo>> {
        Ok(self
            .state
            .lock()
            .round_series_pseudo
            .values()
            .filter(|r| r.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn insert_context_snapshot(&self, points: &[RoundContextPoint]) -> RepositoryResult<usize> {
        let mut state = self.state.lock();
        state.context_snapshot.extend_from_slice(points);
        Ok(points.len())
    }
}

#[async_trait]
impl ForecastRepository for LocalRepository {
    async fn get_challenge_participants(&self, round_id: i64) -> RepositoryResult<Vec<i64>> {
        let state = self.state.lock();
        let mut ids: Vec<i64> = state
            .forecasts
            .iter()
            .filter(|f| f.round_id == round_id)
            .map(|f| f.model_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn get_challenge_series_ids(&self, round_id: i64) -> RepositoryResult<Vec<i64>> {
        Ok(self
            .state
            .lock()
            .round_series_pseudo
            .values()
            .filter(|r| r.round_id == round_id)
            .map(|r| r.series_id)
            .collect())
    }

    async fn get_forecast_stats(
        &self,
        round_id: i64,
        model_id: i64,
        series_id: i64,
    ) -> RepositoryResult<ForecastStats> {
        let count = self
            .state
            .lock()
            .forecasts
            .iter()
            .filter(|f| f.round_id == round_id && f.model_id == model_id && f.series_id == series_id)
            .count() as i64;
        Ok(ForecastStats { count })
    }

    async fn get_evaluation_data(
        &self,
        round_id: i64,
        model_id: i64,
        series_id: i64,
        _resolution: Resolution,
    ) -> RepositoryResult<Vec<EvaluationPair>> {
        let state = self.state.lock();
        let Some(scd2) = state.scd2.get(&series_id) else {
            return Ok(Vec::new());
        };
        let pairs = state
            .forecasts
            .iter()
            .filter(|f| f.round_id == round_id && f.model_id == model_id && f.series_id == series_id)
            .filter_map(|f| {
                let bucket_start = truncate_to_minute(f.ts);
                let bucket_end = bucket_start + chrono::Duration::minutes(1);
                let actual = scd2
                    .range(bucket_start..bucket_end)
                    .find_map(|(_, history)| history.iter().find(|r| r.is_current).and_then(|row| row.value))?;
                Some(EvaluationPair {
                    predicted_value: f.predicted_value,
                    actual_value: actual,
                })
            })
            .collect();
        Ok(pairs)
    }

    async fn bulk_upsert_scores(&self, scores: &[Score]) -> RepositoryResult<usize> {
        let mut state = self.state.lock();
        for score in scores {
            state
                .scores
                .insert((score.round_id, score.model_id, score.series_id), score.clone());
        }
        Ok(scores.len())
    }

    async fn all_scores_complete(&self, round_id: i64) -> RepositoryResult<bool> {
        Ok(self.state.lock().scores.values().filter(|s| s.round_id == round_id).all(|s| {
            matches!(
                s.evaluation_status,
                EvaluationStatus::Complete
                    | EvaluationStatus::NoForecasts
                    | EvaluationStatus::NoOverlap
                    | EvaluationStatus::Error
            )
        }))
    }

    async fn mark_round_scores_final(&self, round_id: i64) -> RepositoryResult<()> {
        let mut state = self.state.lock();
        for score in state.scores.values_mut().filter(|s| s.round_id == round_id) {
            score.final_evaluation = true;
        }
        Ok(())
    }

    async fn finalized_mase_matrix_rows(
        &self,
        definition_id: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> RepositoryResult<Vec<MaseRow>> {
        let state = self.state.lock();
        Ok(state
            .scores
            .values()
            .filter(|s| s.final_evaluation && s.mase.is_some())
            .filter(|s| since.map(|since| s.calculated_at >= since).unwrap_or(true))
            .filter(|s| {
                definition_id
                    .map(|def_id| {
                        state
                            .rounds
                            .get(&s.round_id)
                            .and_then(|r| r.definition_id)
                            == Some(def_id)
                    })
                    .unwrap_or(true)
            })
            .map(|s| MaseRow {
                round_id: s.round_id,
                series_id: s.series_id,
                model_id: s.model_id,
                mase: s.mase.expect("filtered for Some above"),
            })
            .collect())
    }

    async fn definitions_with_finalized_scores(&self) -> RepositoryResult<Vec<i64>> {
        let state = self.state.lock();
        let mut ids: Vec<i64> = state
            .scores
            .values()
            .filter(|s| s.final_evaluation)
            .filter_map(|s| state.rounds.get(&s.round_id).and_then(|r| r.definition_id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

#[async_trait]
impl EloRepository for LocalRepository {
    async fn upsert_ratings(&self, ratings: &[EloRating]) -> RepositoryResult<usize> {
        let mut state = self.state.lock();
        for rating in ratings {
            state.elo_ratings.insert(
                (rating.model_id, rating.definition_id, rating.time_period_days),
                rating.clone(),
            );
        }
        Ok(ratings.len())
    }

    async fn has_calculated_today(
        &self,
        definition_id: Option<i64>,
        time_period_days: Option<i32>,
        today: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        Ok(self.state.lock().elo_ratings.values().any(|r| {
            r.definition_id == definition_id
                && r.time_period_days == time_period_days
                && r.calculated_at.date_naive() == today.date_naive()
        }))
    }

    async fn get_leaderboard(
        &self,
        definition_id: Option<i64>,
        time_period_days: Option<i32>,
    ) -> RepositoryResult<Vec<EloRating>> {
        let mut ratings: Vec<EloRating> = self
            .state
            .lock()
            .elo_ratings
            .values()
            .filter(|r| r.definition_id == definition_id && r.time_period_days == time_period_days)
            .cloned()
            .collect();
        ratings.sort_by(|a, b| b.elo_score.partial_cmp(&a.elo_score).unwrap());
        Ok(ratings)
    }
}
