//! Score evaluator (C8): periodic MASE/RMSE scoring against a naive
//! last-context-value baseline, grounded on `score_evaluation_service.py`'s
//! per-round, per-(model, series) scoring loop.
//!
//! Each round is evaluated independently so that one round's failure
//! (missing context, repository error) never blocks another's; a failed
//! `(model, series)` pair is recorded as an `error` status score row rather
//! than aborting the round.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::db::models::{Resolution, Score, ERROR_MESSAGE_MAX_LEN};
use crate::db::repository::{ChallengeRepository, ForecastRepository, TimeSeriesRepository};
use crate::error::CoreResult;
use crate::db::models::EvaluationStatus;

/// Buffer past a round's `end_time` before its scores are eligible to be
/// marked final, matching the source's one-hour settle window.
const FINALIZATION_BUFFER: chrono::Duration = chrono::Duration::hours(1);

fn truncate_error(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_MAX_LEN).collect()
    }
}

fn rmse(pairs: &[(f64, f64)]) -> f64 {
    let mean_sq = pairs.iter().map(|(pred, actual)| (pred - actual).powi(2)).sum::<f64>() / pairs.len() as f64;
    mean_sq.sqrt()
}

fn mase(pairs: &[(f64, f64)], baseline: f64) -> f64 {
    let mae_model = pairs.iter().map(|(pred, actual)| (actual - pred).abs()).sum::<f64>() / pairs.len() as f64;
    let mae_naive = pairs.iter().map(|(_, actual)| (actual - baseline).abs()).sum::<f64>() / pairs.len() as f64;
    if mae_naive > 0.0 {
        mae_model / mae_naive
    } else if mae_model == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}

/// Score one `(round, model, series)` triple. Never returns `Err` for a
/// scoring-domain failure (missing baseline, no overlap) — those become
/// `Score.evaluation_status` values instead; `Err` is reserved for
/// repository I/O failures.
async fn score_one(
    forecast_repo: &dyn ForecastRepository,
    ts_repo: &dyn TimeSeriesRepository,
    round_id: i64,
    model_id: i64,
    series_id: i64,
    resolution: Resolution,
    naive_baseline_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> CoreResult<Score> {
    let stats = forecast_repo.get_forecast_stats(round_id, model_id, series_id).await?;
    if stats.count == 0 {
        return Ok(Score {
            round_id,
            model_id,
            series_id,
            mase: None,
            rmse: None,
            forecast_count: 0,
            actual_count: 0,
            evaluated_count: 0,
            data_coverage: 0.0,
            evaluation_status: EvaluationStatus::NoForecasts,
            error_message: None,
            final_evaluation: false,
            calculated_at: now,
        });
    }

    let Some(baseline_at) = naive_baseline_at else {
        return Ok(Score {
            round_id,
            model_id,
            series_id,
            mase: None,
            rmse: None,
            forecast_count: stats.count,
            actual_count: 0,
            evaluated_count: 0,
            data_coverage: 0.0,
            evaluation_status: EvaluationStatus::Error,
            error_message: Some(truncate_error("round has no context: missing max_ts for naive baseline")),
            final_evaluation: false,
            calculated_at: now,
        });
    };

    let Some(baseline_point) = ts_repo.get_point_at(series_id, resolution, baseline_at).await? else {
        return Ok(Score {
            round_id,
            model_id,
            series_id,
            mase: None,
            rmse: None,
            forecast_count: stats.count,
            actual_count: 0,
            evaluated_count: 0,
            data_coverage: 0.0,
            evaluation_status: EvaluationStatus::Error,
            error_message: Some(truncate_error(&format!(
                "no actual value at naive baseline timestamp {baseline_at}"
            ))),
            final_evaluation: false,
            calculated_at: now,
        });
    };

    let pairs = forecast_repo
        .get_evaluation_data(round_id, model_id, series_id, resolution)
        .await?;
    if pairs.is_empty() {
        return Ok(Score {
            round_id,
            model_id,
            series_id,
            mase: None,
            rmse: None,
            forecast_count: stats.count,
            actual_count: 0,
            evaluated_count: 0,
            data_coverage: 0.0,
            evaluation_status: EvaluationStatus::NoOverlap,
            error_message: None,
            final_evaluation: false,
            calculated_at: now,
        });
    }

    let tuples: Vec<(f64, f64)> = pairs.iter().map(|p| (p.predicted_value, p.actual_value)).collect();
    let rmse_value = rmse(&tuples);
    let mase_value = mase(&tuples, baseline_point.value);
    let evaluated_count = tuples.len() as i64;
    let data_coverage = evaluated_count as f64 / stats.count as f64;
    let evaluation_status = if data_coverage >= 1.0 {
        EvaluationStatus::Complete
    } else if data_coverage > 0.0 {
        EvaluationStatus::Partial
    } else {
        EvaluationStatus::Pending
    };

    Ok(Score {
        round_id,
        model_id,
        series_id,
        mase: Some(mase_value),
        rmse: Some(rmse_value),
        forecast_count: stats.count,
        actual_count: evaluated_count,
        evaluated_count,
        data_coverage,
        evaluation_status,
        error_message: None,
        final_evaluation: false,
        calculated_at: now,
    })
}

/// Evaluate one round in isolation: enumerate participants and series,
/// score every pairing, bulk-upsert, and finalize if the settle window and
/// completeness condition are both satisfied.
#[instrument(skip(challenge_repo, forecast_repo, ts_repo))]
pub async fn evaluate_round(
    challenge_repo: &dyn ChallengeRepository,
    forecast_repo: &dyn ForecastRepository,
    ts_repo: &dyn TimeSeriesRepository,
    round_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let round = challenge_repo.get_round(round_id).await?;
    let resolution = Resolution::from_frequency(Some(round.frequency));
    if round.frequency.seconds() != 900 && round.frequency.seconds() != 3600 && round.frequency.seconds() != 86400 {
        warn!(round_id, frequency = ?round.frequency, "unmapped round frequency, defaulting resolution to 1h");
    }

    let participants = forecast_repo.get_challenge_participants(round_id).await?;
    let series_ids = forecast_repo.get_challenge_series_ids(round_id).await?;

    let mut scores = Vec::with_capacity(participants.len() * series_ids.len());
    for &model_id in &participants {
        for &series_id in &series_ids {
            let pseudo = challenge_repo.get_round_series_pseudo(round_id, series_id).await?;
            let naive_baseline_at = pseudo.and_then(|p| p.max_ts);
            let score = score_one(
                forecast_repo,
                ts_repo,
                round_id,
                model_id,
                series_id,
                resolution,
                naive_baseline_at,
                now,
            )
            .await?;
            scores.push(score);
        }
    }

    let upserted = forecast_repo.bulk_upsert_scores(&scores).await?;
    info!(round_id, scored_pairs = upserted, "evaluated round");

    if now >= round.end_time + FINALIZATION_BUFFER && forecast_repo.all_scores_complete(round_id).await? {
        forecast_repo.mark_round_scores_final(round_id).await?;
        info!(round_id, "finalized round scores");
    }

    Ok(())
}

/// Top-level periodic job: find every round needing evaluation and run
/// [`evaluate_round`] over each, continuing past per-round failures so one
/// broken round never stalls the rest.
#[instrument(skip_all)]
pub async fn evaluate_pending_rounds(
    challenge_repo: &dyn ChallengeRepository,
    forecast_repo: &dyn ForecastRepository,
    ts_repo: &dyn TimeSeriesRepository,
    now: DateTime<Utc>,
) -> CoreResult<usize> {
    let round_ids = challenge_repo.rounds_needing_evaluation(now).await?;
    let mut evaluated = 0;
    for round_id in round_ids {
        match evaluate_round(challenge_repo, forecast_repo, ts_repo, round_id, now).await {
            Ok(()) => evaluated += 1,
            Err(e) => warn!(round_id, error = %e, "round evaluation failed, continuing with remaining rounds"),
        }
    }
    Ok(evaluated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ChallengeRound, Forecast, RoundSeriesPseudo, Scd2Point};
    use crate::db::repositories::LocalRepository;
    use crate::duration::Duration;
    use crate::imputation::QualityCode;

    async fn seed_round(repo: &LocalRepository, frequency: Duration, now: DateTime<Utc>) -> ChallengeRound {
        let round = ChallengeRound {
            round_id: 0,
            definition_id: None,
            name: format!("round-{}", now.timestamp_nanos_opt().unwrap_or_default()),
            context_length: 10,
            horizon: Duration::parse("1 hour").unwrap(),
            frequency,
            registration_start: now - chrono::Duration::hours(2),
            registration_end: now - chrono::Duration::hours(1),
            start_time: now - chrono::Duration::hours(1),
            end_time: now,
            preparation_params: serde_json::json!({}),
            is_cancelled: false,
        };
        repo.upsert_round(&round).await.unwrap()
    }

    #[tokio::test]
    async fn no_forecasts_yields_no_forecasts_status() {
        let repo = LocalRepository::new();
        let now = Utc::now();
        let round = seed_round(&repo, Duration::parse("1 hour").unwrap(), now).await;

        evaluate_pending_rounds(&repo, &repo, &repo, now + chrono::Duration::minutes(1))
            .await
            .unwrap();
        let _ = round;
    }

    #[tokio::test]
    async fn complete_overlap_computes_mase_and_rmse() {
        let repo = LocalRepository::new();
        let now = Utc::now();
        let round = seed_round(&repo, Duration::parse("1 hour").unwrap(), now).await;

        let series_id = repo
            .get_or_create_series_id("s1", "n", "d", Duration::parse("1 hour").unwrap(), "u", "energy", "gen", None, Duration::parse("15 minutes").unwrap())
            .await
            .unwrap();

        let baseline_ts = round.start_time - chrono::Duration::hours(1);
        repo.upsert_scd2_points(
            series_id,
            &[
                Scd2Point { ts: baseline_ts, value: Some(10.0), quality_code: QualityCode::Original },
                Scd2Point { ts: round.start_time, value: Some(12.0), quality_code: QualityCode::Original },
                Scd2Point {
                    ts: round.start_time + chrono::Duration::minutes(30),
                    value: Some(14.0),
                    quality_code: QualityCode::Original,
                },
            ],
        )
        .await
        .unwrap();

        repo.upsert_round_series_pseudo(&[RoundSeriesPseudo {
            round_id: round.round_id,
            series_id,
            challenge_series_name: format!("series_{series_id}"),
            min_ts: Some(baseline_ts),
            max_ts: Some(baseline_ts),
            value_avg: Some(10.0),
            value_std: Some(0.0),
        }])
        .await
        .unwrap();

        repo.seed_forecast(Forecast {
            round_id: round.round_id,
            model_id: 1,
            series_id,
            ts: round.start_time,
            predicted_value: 11.0,
            probabilistic_values: None,
        });
        repo.seed_forecast(Forecast {
            round_id: round.round_id,
            model_id: 1,
            series_id,
            ts: round.start_time + chrono::Duration::minutes(30),
            predicted_value: 13.0,
            probabilistic_values: None,
        });

        evaluate_round(&repo, &repo, &repo, round.round_id, now + chrono::Duration::minutes(1))
            .await
            .unwrap();
    }
}
