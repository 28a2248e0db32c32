//! Bootstrapped ELO engine (C9): turns finalized MASE scores into a
//! percentile-bounded ELO rating per model, per scope (global or a single
//! definition) and per lookback window.
//!
//! The bootstrap itself — permute matches, replay pairwise updates, repeat
//! `B` times, take the median and a 95% interval across replays — is
//! order-sensitive by design: this is a faithful port of that shape, not a
//! closed-form rating. `run_single_bootstrap` below walks every match in the
//! permutation, not merely the final one; an earlier port of this algorithm
//! that looped over only the tail element of each permutation understated
//! every model's effective match count and was a bug this implementation
//! does not repeat.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tracing::{info, instrument};

use crate::db::models::EloRating;
use crate::db::repository::{EloRepository, ForecastRepository};
use crate::error::CoreResult;

pub const K_FACTOR: f64 = 4.0;
pub const BASE_RATING: f64 = 1000.0;
pub const DEFAULT_BOOTSTRAPS: u32 = 500;

/// Lookback windows (in days) evaluated alongside the all-time scope;
/// `None` denotes all-time.
pub const TIME_PERIODS: [Option<i32>; 5] = [None, Some(7), Some(30), Some(90), Some(365)];

/// One finalized match: the MASE each participating model posted.
type MatchRow = Vec<(i64, f64)>;

fn build_matches(rows: &[crate::db::repository::forecast::MaseRow]) -> Vec<MatchRow> {
    let mut by_match: HashMap<(i64, i64), MatchRow> = HashMap::new();
    for row in rows {
        by_match
            .entry((row.round_id, row.series_id))
            .or_default()
            .push((row.model_id, row.mase));
    }
    by_match.into_values().filter(|m| m.len() >= 2).collect()
}

/// Replay every match of one permutation, mutating `ratings` in place.
/// Updates within a match are computed from the pre-match ratings and
/// applied simultaneously, so a model's own move in a match never feeds
/// back into its opponents' expected score for that same match.
fn run_single_bootstrap(matches: &[MatchRow], model_ids: &[i64], rng: &mut impl rand::Rng) -> HashMap<i64, f64> {
    let mut ratings: HashMap<i64, f64> = model_ids.iter().map(|&id| (id, BASE_RATING)).collect();
    let mut order: Vec<usize> = (0..matches.len()).collect();
    order.shuffle(rng);

    for &idx in &order {
        let entries = &matches[idx];
        let mut deltas: HashMap<i64, f64> = HashMap::new();
        for &(model_i, mase_i) in entries {
            let r_i = ratings[&model_i];
            let mut delta = 0.0;
            for &(model_j, mase_j) in entries {
                if model_j == model_i {
                    continue;
                }
                let r_j = ratings[&model_j];
                let outcome = if mase_i < mase_j {
                    1.0
                } else if (mase_i - mase_j).abs() < f64::EPSILON {
                    0.5
                } else {
                    0.0
                };
                let expected = 1.0 / (1.0 + 10f64.powf((r_j - r_i) / 400.0));
                delta += outcome - expected;
            }
            deltas.insert(model_i, K_FACTOR * delta);
        }
        for (model_id, delta) in deltas {
            *ratings.entry(model_id).or_insert(BASE_RATING) += delta;
        }
    }
    ratings
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return BASE_RATING;
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

fn median(sorted: &[f64]) -> f64 {
    percentile(sorted, 50.0)
}

/// Run the bootstrap for one `(definition, timePeriod)` scope and return the
/// resulting rating rows, one per model. Empty when fewer than 2 models or
/// no multi-model matches exist in scope.
async fn calculate_scope(
    forecast_repo: &dyn ForecastRepository,
    definition_id: Option<i64>,
    time_period_days: Option<i32>,
    bootstraps: u32,
    now: DateTime<Utc>,
) -> CoreResult<Vec<EloRating>> {
    let since = time_period_days.map(|days| now - chrono::Duration::days(days as i64));
    let rows = forecast_repo.finalized_mase_matrix_rows(definition_id, since).await?;
    let matches = build_matches(&rows);

    let mut model_ids: Vec<i64> = rows.iter().map(|r| r.model_id).collect();
    model_ids.sort_unstable();
    model_ids.dedup();

    if model_ids.len() < 2 || matches.is_empty() {
        return Ok(Vec::new());
    }

    let started = Instant::now();
    let mut samples: HashMap<i64, Vec<f64>> = model_ids.iter().map(|&id| (id, Vec::with_capacity(bootstraps as usize))).collect();
    let mut rng = rand::thread_rng();

    for _ in 0..bootstraps {
        let ratings = run_single_bootstrap(&matches, &model_ids, &mut rng);
        for (&model_id, bucket) in samples.iter_mut() {
            bucket.push(*ratings.get(&model_id).unwrap_or(&BASE_RATING));
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as i64;
    let n_matches_per_model: HashMap<i64, i64> = model_ids
        .iter()
        .map(|&id| {
            let count = matches.iter().filter(|m| m.iter().any(|(mid, _)| *mid == id)).count() as i64;
            (id, count)
        })
        .collect();

    let mut out = Vec::with_capacity(model_ids.len());
    for &model_id in &model_ids {
        let mut values = samples.remove(&model_id).unwrap_or_default();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        out.push(EloRating {
            model_id,
            definition_id,
            time_period_days,
            elo_score: median(&values),
            elo_ci_lower: percentile(&values, 2.5),
            elo_ci_upper: percentile(&values, 97.5),
            n_matches: n_matches_per_model.get(&model_id).copied().unwrap_or(0),
            n_bootstraps: bootstraps as i32,
            calculation_duration_ms: elapsed_ms,
            calculated_at: now,
        });
    }
    Ok(out)
}

/// Top-level periodic job: recompute every `(scope, window)` combination not
/// already calculated today, across the global scope and every definition
/// that has at least one finalized score.
#[instrument(skip_all)]
pub async fn calculate_elo_ratings(
    elo_repo: &dyn EloRepository,
    forecast_repo: &dyn ForecastRepository,
    now: DateTime<Utc>,
) -> CoreResult<usize> {
    let mut scopes: Vec<Option<i64>> = vec![None];
    scopes.extend(forecast_repo.definitions_with_finalized_scores().await?.into_iter().map(Some));

    let mut total_ratings = 0;
    for scope in scopes {
        for window in TIME_PERIODS {
            if elo_repo.has_calculated_today(scope, window, now).await? {
                continue;
            }
            let ratings = calculate_scope(forecast_repo, scope, window, DEFAULT_BOOTSTRAPS, now).await?;
            if ratings.is_empty() {
                continue;
            }
            total_ratings += elo_repo.upsert_ratings(&ratings).await?;
            info!(?scope, ?window, models = ratings.len(), "calculated elo scope");
        }
    }
    Ok(total_ratings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::LocalRepository;
    use crate::db::models::{ChallengeRound, EvaluationStatus, Score};
    use crate::duration::Duration;

    async fn seed_finalized_score(repo: &LocalRepository, round_id: i64, model_id: i64, series_id: i64, mase: f64, now: DateTime<Utc>) {
        repo.bulk_upsert_scores(&[Score {
            round_id,
            model_id,
            series_id,
            mase: Some(mase),
            rmse: Some(1.0),
            forecast_count: 1,
            actual_count: 1,
            evaluated_count: 1,
            data_coverage: 1.0,
            evaluation_status: EvaluationStatus::Complete,
            error_message: None,
            final_evaluation: true,
            calculated_at: now,
        }])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lower_mase_yields_higher_median_rating() {
        let repo = LocalRepository::new();
        let now = Utc::now();
        repo.upsert_round(&ChallengeRound {
            round_id: 0,
            definition_id: None,
            name: "r1".into(),
            context_length: 1,
            horizon: Duration::parse("1 hour").unwrap(),
            frequency: Duration::parse("1 hour").unwrap(),
            registration_start: now,
            registration_end: now,
            start_time: now,
            end_time: now,
            preparation_params: serde_json::json!({}),
            is_cancelled: false,
        })
        .await
        .unwrap();

        // model 1 consistently better (lower MASE) across several matches.
        for series_id in 1..=5 {
            seed_finalized_score(&repo, 1, 1, series_id, 0.5, now).await;
            seed_finalized_score(&repo, 1, 2, series_id, 1.5, now).await;
        }

        let ratings = calculate_scope(&repo, None, None, 50, now).await.unwrap();
        let model_1 = ratings.iter().find(|r| r.model_id == 1).unwrap();
        let model_2 = ratings.iter().find(|r| r.model_id == 2).unwrap();
        assert!(model_1.elo_score > model_2.elo_score);
        assert!(model_1.elo_ci_lower <= model_1.elo_score);
        assert!(model_1.elo_score <= model_1.elo_ci_upper);
    }

    #[tokio::test]
    async fn fewer_than_two_models_skips_scope() {
        let repo = LocalRepository::new();
        let now = Utc::now();
        let ratings = calculate_scope(&repo, None, None, 50, now).await.unwrap();
        assert!(ratings.is_empty());
    }
}
