//! Challenge definition registry (C6): loads the recurring-round schedule
//! from YAML and reconciles it into storage.
//!
//! Grounded on the source's definition-loading step of challenge bootstrap:
//! each YAML entry becomes a `ChallengeDefinition` row keyed by a stable
//! `scheduleId`, with required-series membership reconciled under SCD2
//! semantics rather than a destructive delete-then-insert.

use std::collections::HashSet;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::db::models::{ChallengeDefinition, DefinitionSeriesAssignment};
use crate::db::repository::ChallengeRepository;
use crate::duration::Duration;
use crate::error::{CoreError, CoreResult};

/// One entry of the `schedules:` YAML list, in its as-written shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub cron: String,
    #[serde(default)]
    pub run_on_startup: bool,
    pub description: String,
    pub context_length: i32,
    pub forecast_horizon: String,
    pub frequency: String,
    #[serde(default = "default_announce_lead")]
    pub announce_lead: String,
    pub registration_duration: String,
    pub n_time_series: i32,
    #[serde(default)]
    pub required_time_series: Vec<i64>,
    pub domain: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    /// Delay between a round's end and when its scores may be considered
    /// final, e.g. "1 hour"; defaults to the canonical evaluator buffer.
    #[serde(default = "default_evaluation_delay")]
    pub evaluation_delay: String,
}

/// The canonical default lead time between a definition firing and its
/// round's registration window opening. Deliberately "1 minute", not the
/// source's typo'd "1 minuteute" (which that dialect's parser rejects).
fn default_announce_lead() -> String {
    "1 minute".to_string()
}

fn default_evaluation_delay() -> String {
    "1 hour".to_string()
}

#[derive(Debug, Deserialize)]
struct SchedulesFile {
    schedules: Vec<ScheduleEntry>,
}

/// Parse the raw YAML document, rejecting duplicate `id`s before any
/// definition is touched — a malformed file must not partially apply.
pub fn parse_schedules(yaml: &str) -> CoreResult<Vec<ScheduleEntry>> {
    let parsed: SchedulesFile =
        serde_yaml::from_str(yaml).map_err(|e| CoreError::invalid_config(format!("invalid schedules file: {e}")))?;

    let mut seen = HashSet::new();
    for entry in &parsed.schedules {
        if !seen.insert(entry.id.clone()) {
            return Err(CoreError::invalid_config(format!(
                "duplicate scheduleId '{}' in schedules file",
                entry.id
            )));
        }
    }
    Ok(parsed.schedules)
}

impl ScheduleEntry {
    fn to_definition(&self, definition_id: i64) -> CoreResult<ChallengeDefinition> {
        Ok(ChallengeDefinition {
            definition_id,
            schedule_id: self.id.clone(),
            name: self.description.clone(),
            description: self.description.clone(),
            domain: self.domain.clone(),
            subdomain: self.subdomain.clone(),
            context_length: self.context_length,
            horizon: Duration::parse(&self.forecast_horizon)?,
            frequency: Duration::parse(&self.frequency)?,
            cron_expression: self.cron.clone(),
            n_series: self.n_time_series,
            announce_lead: Duration::parse(&self.announce_lead)?,
            registration_duration: Duration::parse(&self.registration_duration)?,
            evaluation_delay: Duration::parse(&self.evaluation_delay)?,
            is_active: true,
            run_on_startup: self.run_on_startup,
        })
    }
}

/// Load `yaml`, upsert every entry's `ChallengeDefinition`, and reconcile its
/// required-series assignment set. Returns the upserted definition ids, in
/// file order, for the caller to register triggers against.
#[instrument(skip_all)]
pub async fn load_schedules(
    repo: &dyn ChallengeRepository,
    yaml: &str,
) -> CoreResult<Vec<i64>> {
    let entries = parse_schedules(yaml)?;
    let now = Utc::now();
    let mut definition_ids = Vec::with_capacity(entries.len());

    for entry in &entries {
        // `definition_id` is a placeholder the repository overwrites for an
        // existing schedule_id and assigns fresh for a new one.
        let placeholder = entry.to_definition(0)?;
        let definition_id = repo.upsert_definition(&placeholder).await?;
        definition_ids.push(definition_id);

        let active: Vec<DefinitionSeriesAssignment> = entry
            .required_time_series
            .iter()
            .map(|&series_id| DefinitionSeriesAssignment {
                definition_id,
                series_id,
                is_required: true,
                is_excluded: false,
            })
            .collect();
        repo.reconcile_series_assignments(definition_id, &active, now).await?;

        info!(
            schedule_id = %entry.id,
            definition_id,
            required_series = entry.required_time_series.len(),
            "reconciled challenge definition"
        );
    }

    Ok(definition_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::LocalRepository;

    const SAMPLE: &str = r#"
schedules:
  - id: energy-daily
    cron: "0 6 * * *"
    run_on_startup: true
    description: Daily energy forecast
    context_length: 168
    forecast_horizon: "24 hours"
    frequency: "1 hour"
    announce_lead: "1 minute"
    registration_duration: "5 minutes"
    n_time_series: 20
    required_time_series: [1, 2, 3]
    domain: energy
"#;

    #[test]
    fn parses_sample_schedule() {
        let entries = parse_schedules(SAMPLE).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "energy-daily");
        assert_eq!(entries[0].required_time_series, vec![1, 2, 3]);
        assert_eq!(entries[0].evaluation_delay, "1 hour");
    }

    #[test]
    fn rejects_duplicate_schedule_ids() {
        let yaml = r#"
schedules:
  - id: dup
    cron: "0 6 * * *"
    description: A
    context_length: 10
    forecast_horizon: "1 hour"
    frequency: "1 hour"
    registration_duration: "5 minutes"
    n_time_series: 5
    domain: energy
  - id: dup
    cron: "0 7 * * *"
    description: B
    context_length: 10
    forecast_horizon: "1 hour"
    frequency: "1 hour"
    registration_duration: "5 minutes"
    n_time_series: 5
    domain: energy
"#;
        let err = parse_schedules(yaml).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn load_schedules_upserts_definition_and_series() {
        let repo = LocalRepository::new();
        let ids = load_schedules(&repo, SAMPLE).await.unwrap();
        assert_eq!(ids.len(), 1);

        let definition = repo.get_definition(ids[0]).await.unwrap();
        assert_eq!(definition.schedule_id, "energy-daily");
        assert_eq!(definition.n_series, 20);

        let assignments = repo.list_series_assignments(ids[0]).await.unwrap();
        assert_eq!(assignments.len(), 3);
        assert!(assignments.iter().all(|a| a.is_required));
    }

    #[tokio::test]
    async fn reloading_schedule_preserves_definition_id_and_reconciles_series() {
        let repo = LocalRepository::new();
        let ids_first = load_schedules(&repo, SAMPLE).await.unwrap();

        let shrunk = SAMPLE.replace("required_time_series: [1, 2, 3]", "required_time_series: [1]");
        let ids_second = load_schedules(&repo, &shrunk).await.unwrap();

        assert_eq!(ids_first, ids_second);
        let assignments = repo.list_series_assignments(ids_second[0]).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].series_id, 1);
    }

    #[tokio::test]
    async fn reconciling_with_empty_active_set_is_a_no_op() {
        let repo = LocalRepository::new();
        let ids = load_schedules(&repo, SAMPLE).await.unwrap();

        repo.reconcile_series_assignments(ids[0], &[], Utc::now()).await.unwrap();

        let assignments = repo.list_series_assignments(ids[0]).await.unwrap();
        assert_eq!(assignments.len(), 3, "empty active set must not close out existing assignments");
    }
}
