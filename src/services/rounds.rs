//! Round materializer (C7): turns a `ChallengeDefinition` firing into a
//! `ChallengeRound`, then — once registration opens — into a context
//! snapshot participants can forecast against.
//!
//! Grounded on the source's challenge-creation and context-preparation
//! steps: the registration/start/end window arithmetic, the
//! required-then-random-sample series selection, and the
//! `sha1(roundId:seriesId)` pseudonym scheme are carried over unchanged in
//! meaning; only the persistence mechanics (explicit repository calls
//! instead of an ORM session) differ.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use tracing::{info, instrument, warn};

use crate::db::models::{ChallengeDefinition, ChallengeRound, Resolution, RoundContextPoint, RoundSeriesPseudo};
use crate::db::repository::{ChallengeRepository, TimeSeriesRepository};
use crate::error::CoreResult;

/// Length, in hex characters, of a non-required series' public pseudonym.
const PSEUDONYM_LEN: usize = 12;

/// `registrationStart/End/startTime/endTime` window computed at firing time,
/// plus the freeform snapshot persisted as `preparationParams`.
#[derive(Debug, Clone)]
struct RoundWindow {
    registration_start: DateTime<Utc>,
    registration_end: DateTime<Utc>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

fn compute_window(definition: &ChallengeDefinition, now: DateTime<Utc>) -> RoundWindow {
    let registration_start = now + definition.announce_lead.as_chrono();
    let registration_end = registration_start + definition.registration_duration.as_chrono();
    let start_time = registration_end;
    let end_time = start_time + definition.horizon.as_chrono();
    RoundWindow {
        registration_start,
        registration_end,
        start_time,
        end_time,
    }
}

/// Create (or idempotently return) the round materializing `definition` at
/// `now`. Registers nothing beyond the row itself — the caller (the
/// supervisor) is responsible for scheduling the one-shot preparation job at
/// the returned round's `registration_start`.
#[instrument(skip(repo), fields(definition_id = definition.definition_id))]
pub async fn create_round_from_definition(
    repo: &dyn ChallengeRepository,
    definition: &ChallengeDefinition,
    now: DateTime<Utc>,
) -> CoreResult<ChallengeRound> {
    let window = compute_window(definition, now);
    let name = format!("{} - {}", definition.description, now.timestamp());

    let assignments = repo.list_series_assignments(definition.definition_id).await?;
    let required_ids: Vec<i64> = assignments
        .iter()
        .filter(|a| a.is_required && !a.is_excluded)
        .map(|a| a.series_id)
        .collect();

    let preparation_params = serde_json::json!({
        "domain": definition.domain,
        "subdomain": definition.subdomain,
        "frequency": definition.frequency.to_iso8601(),
        "required_series": required_ids,
        "n_series": definition.n_series,
        "context_length": definition.context_length,
        "cutoff": window.start_time.to_rfc3339(),
    });

    let round = ChallengeRound {
        round_id: 0,
        definition_id: Some(definition.definition_id),
        name,
        context_length: definition.context_length,
        horizon: definition.horizon,
        frequency: definition.frequency,
        registration_start: window.registration_start,
        registration_end: window.registration_end,
        start_time: window.start_time,
        end_time: window.end_time,
        preparation_params,
        is_cancelled: false,
    };

    let persisted = repo.upsert_round(&round).await?;
    info!(round_id = persisted.round_id, name = %persisted.name, "materialized round");
    Ok(persisted)
}

/// `challenge_{roundId}_{seriesId}`'s public name: plaintext for required
/// series, an opaque pseudonym for topped-up series, so participants cannot
/// infer which candidate series were offered but not picked.
fn pseudonym(round_id: i64, series_id: i64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{round_id}:{series_id}"));
    let digest = hasher.finalize();
    hex::encode(digest)[..PSEUDONYM_LEN].to_string()
}

fn challenge_series_name(round_id: i64, series_id: i64, is_required: bool) -> String {
    if is_required {
        format!("series_{series_id}")
    } else {
        format!("series_{}", pseudonym(round_id, series_id))
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn stddev(values: &[f64], avg: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Execute the one-shot preparation step for `round_id`, due at the round's
/// `registration_start`. Idempotent: re-running simply re-upserts the same
/// `RoundSeriesPseudo` rows and re-snapshots context points.
#[instrument(skip(repo, ts_repo))]
pub async fn prepare_round_context_data(
    repo: &dyn ChallengeRepository,
    ts_repo: &dyn TimeSeriesRepository,
    round_id: i64,
) -> CoreResult<()> {
    let round = repo.get_round(round_id).await?;
    let definition_id = round.definition_id;

    let required_ids: Vec<i64> = match definition_id {
        Some(id) => repo
            .list_series_assignments(id)
            .await?
            .into_iter()
            .filter(|a| a.is_required && !a.is_excluded)
            .map(|a| a.series_id)
            .collect(),
        None => Vec::new(),
    };

    let domain = round
        .preparation_params
        .get("domain")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let subdomain = round
        .preparation_params
        .get("subdomain")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let n_series = round
        .preparation_params
        .get("n_series")
        .and_then(|v| v.as_i64())
        .unwrap_or(required_ids.len() as i64) as usize;

    let mut selected: Vec<i64> = required_ids.clone();
    let mut seen: HashSet<i64> = selected.iter().copied().collect();

    if selected.len() < n_series {
        let needed = n_series - selected.len();
        let candidates = ts_repo
            .find_available_series(domain.as_deref(), subdomain.as_deref(), round.frequency, &selected, needed * 3 + 1)
            .await?;
        let mut pool: Vec<i64> = candidates.into_iter().filter(|id| !seen.contains(id)).collect();
        let mut rng = rand::thread_rng();
        pool.shuffle(&mut rng);
        for id in pool.into_iter().take(needed) {
            if seen.insert(id) {
                selected.push(id);
            }
        }
        if selected.len() < n_series {
            warn!(
                round_id,
                selected = selected.len(),
                wanted = n_series,
                "insufficient candidate series, proceeding with fewer"
            );
        }
    }

    let resolution = Resolution::from_frequency(Some(round.frequency));
    let now = Utc::now();
    let mut pseudo_rows = Vec::with_capacity(selected.len());
    let mut context_points = Vec::new();

    for series_id in &selected {
        let is_required = required_ids.contains(series_id);
        let window = ts_repo
            .get_context_window(*series_id, resolution, round.start_time, now, round.context_length as usize)
            .await?;

        let min_ts = window.first().map(|p| p.ts);
        let max_ts = window.last().map(|p| p.ts);
        let values: Vec<f64> = window.iter().map(|p| p.value).collect();
        let avg = mean(&values);
        let std = stddev(&values, avg);

        pseudo_rows.push(RoundSeriesPseudo {
            round_id,
            series_id: *series_id,
            challenge_series_name: challenge_series_name(round_id, *series_id, is_required),
            min_ts,
            max_ts,
            value_avg: if values.is_empty() { None } else { Some(avg) },
            value_std: if values.is_empty() { None } else { Some(std) },
        });

        context_points.extend(window.into_iter().map(|p| RoundContextPoint {
            round_id,
            series_id: *series_id,
            ts: p.ts,
            value: p.value,
        }));
    }

    repo.upsert_round_series_pseudo(&pseudo_rows).await?;
    repo.insert_context_snapshot(&context_points).await?;

    info!(
        round_id,
        selected_series = selected.len(),
        context_points = context_points.len(),
        "prepared round context"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{DefinitionSeriesAssignment, Scd2Point};
    use crate::db::repositories::LocalRepository;
    use crate::duration::Duration;
    use crate::imputation::QualityCode;

    fn sample_definition() -> ChallengeDefinition {
        ChallengeDefinition {
            definition_id: 1,
            schedule_id: "energy-daily".into(),
            name: "Daily energy forecast".into(),
            description: "Daily energy forecast".into(),
            domain: "energy".into(),
            subdomain: None,
            context_length: 3,
            horizon: Duration::parse("24 hours").unwrap(),
            frequency: Duration::parse("1 hour").unwrap(),
            cron_expression: "0 6 * * *".into(),
            n_series: 2,
            announce_lead: Duration::parse("1 minute").unwrap(),
            registration_duration: Duration::parse("5 minutes").unwrap(),
            evaluation_delay: Duration::parse("1 hour").unwrap(),
            is_active: true,
            run_on_startup: false,
        }
    }

    #[tokio::test]
    async fn window_arithmetic_chains_in_order() {
        let repo = LocalRepository::new();
        let definition = sample_definition();
        repo.upsert_definition(&definition).await.unwrap();
        let now = Utc::now();

        let round = create_round_from_definition(&repo, &definition, now).await.unwrap();
        assert_eq!(round.registration_start, now + chrono::Duration::minutes(1));
        assert_eq!(round.registration_end, round.registration_start + chrono::Duration::minutes(5));
        assert_eq!(round.start_time, round.registration_end);
        assert_eq!(round.end_time, round.start_time + chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn recreating_round_in_same_second_is_idempotent() {
        let repo = LocalRepository::new();
        let definition = sample_definition();
        repo.upsert_definition(&definition).await.unwrap();
        let now = Utc::now();

        let first = create_round_from_definition(&repo, &definition, now).await.unwrap();
        let second = create_round_from_definition(&repo, &definition, now).await.unwrap();
        assert_eq!(first.round_id, second.round_id);
    }

    #[tokio::test]
    async fn required_series_get_plaintext_names_others_get_pseudonyms() {
        let repo = LocalRepository::new();
        let mut definition = sample_definition();
        definition.n_series = 2;
        let definition_id = repo.upsert_definition(&definition).await.unwrap();
        definition.definition_id = definition_id;

        repo.reconcile_series_assignments(
            definition_id,
            &[DefinitionSeriesAssignment {
                definition_id,
                series_id: 1,
                is_required: true,
                is_excluded: false,
            }],
            Utc::now(),
        )
        .await
        .unwrap();

        let series_1 = ts_repo_seed(&repo, 1).await;
        let series_2 = ts_repo_seed(&repo, 2).await;
        let now = Utc::now();
        let round = create_round_from_definition(&repo, &definition, now).await.unwrap();
        prepare_round_context_data(&repo, &repo, round.round_id).await.unwrap();

        let rows = repo.list_round_series(round.round_id).await.unwrap();
        let required_row = rows.iter().find(|r| r.series_id == series_1).unwrap();
        assert_eq!(required_row.challenge_series_name, format!("series_{series_1}"));

        if let Some(extra_row) = rows.iter().find(|r| r.series_id == series_2) {
            assert!(extra_row.challenge_series_name.starts_with("series_"));
            assert_ne!(extra_row.challenge_series_name, format!("series_{series_2}"));
        }
    }

    async fn ts_repo_seed(repo: &LocalRepository, unique_suffix: i64) -> i64 {
        let series_id = repo
            .get_or_create_series_id(
                &format!("series-{unique_suffix}"),
                "n",
                "d",
                Duration::parse("1 hour").unwrap(),
                "u",
                "energy",
                "generation",
                None,
                Duration::parse("15 minutes").unwrap(),
            )
            .await
            .unwrap();
        let points: Vec<Scd2Point> = (0..5)
            .map(|i| Scd2Point {
                ts: Utc::now() - chrono::Duration::hours(5 - i),
                value: Some(i as f64),
                quality_code: QualityCode::Original,
            })
            .collect();
        repo.upsert_scd2_points(series_id, &points).await.unwrap();
        series_id
    }
}
