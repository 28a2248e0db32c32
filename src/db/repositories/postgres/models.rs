use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

use super::schema::{
    challenge_definitions, challenge_rounds, definition_series_assignments, elo_ratings,
    round_context_snapshot, round_series_pseudo, scores, time_series,
};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = time_series)]
pub struct TimeSeriesRow {
    pub series_id: i64,
    pub unique_id: String,
    pub name: String,
    pub description: String,
    pub frequency_seconds: i64,
    pub unit: String,
    pub domain: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub update_frequency_seconds: i64,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = time_series)]
pub struct NewTimeSeriesRow {
    pub unique_id: String,
    pub name: String,
    pub description: String,
    pub frequency_seconds: i64,
    pub unit: String,
    pub domain: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub update_frequency_seconds: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = challenge_definitions)]
pub struct ChallengeDefinitionRow {
    pub definition_id: i64,
    pub schedule_id: String,
    pub name: String,
    pub description: String,
    pub domain: String,
    pub subdomain: Option<String>,
    pub context_length: i32,
    pub horizon_seconds: i64,
    pub frequency_seconds: i64,
    pub cron_expression: String,
    pub n_series: i32,
    pub announce_lead_seconds: i64,
    pub registration_duration_seconds: i64,
    pub evaluation_delay_seconds: i64,
    pub is_active: bool,
    pub run_on_startup: bool,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = challenge_definitions)]
pub struct NewChallengeDefinitionRow {
    pub schedule_id: String,
    pub name: String,
    pub description: String,
    pub domain: String,
    pub subdomain: Option<String>,
    pub context_length: i32,
    pub horizon_seconds: i64,
    pub frequency_seconds: i64,
    pub cron_expression: String,
    pub n_series: i32,
    pub announce_lead_seconds: i64,
    pub registration_duration_seconds: i64,
    pub evaluation_delay_seconds: i64,
    pub is_active: bool,
    pub run_on_startup: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = definition_series_assignments)]
pub struct DefinitionSeriesAssignmentRow {
    pub id: i64,
    pub definition_id: i64,
    pub series_id: i64,
    pub is_required: bool,
    pub is_excluded: bool,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = definition_series_assignments)]
pub struct NewDefinitionSeriesAssignmentRow {
    pub definition_id: i64,
    pub series_id: i64,
    pub is_required: bool,
    pub is_excluded: bool,
    pub valid_from: DateTime<Utc>,
    pub is_current: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = challenge_rounds)]
pub struct ChallengeRoundRow {
    pub round_id: i64,
    pub definition_id: Option<i64>,
    pub name: String,
    pub context_length: i32,
    pub horizon_seconds: i64,
    pub frequency_seconds: i64,
    pub registration_start: DateTime<Utc>,
    pub registration_end: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub preparation_params: Value,
    pub is_cancelled: bool,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = challenge_rounds)]
pub struct NewChallengeRoundRow {
    pub definition_id: Option<i64>,
    pub name: String,
    pub context_length: i32,
    pub horizon_seconds: i64,
    pub frequency_seconds: i64,
    pub registration_start: DateTime<Utc>,
    pub registration_end: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub preparation_params: Value,
    pub is_cancelled: bool,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = round_series_pseudo)]
pub struct RoundSeriesPseudoRow {
    pub round_id: i64,
    pub series_id: i64,
    pub challenge_series_name: String,
    pub min_ts: Option<DateTime<Utc>>,
    pub max_ts: Option<DateTime<Utc>>,
    pub value_avg: Option<f64>,
    pub value_std: Option<f64>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = round_context_snapshot)]
pub struct NewRoundContextPointRow {
    pub round_id: i64,
    pub series_id: i64,
    pub ts: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = scores)]
pub struct ScoreRow {
    pub round_id: i64,
    pub model_id: i64,
    pub series_id: i64,
    pub mase: Option<f64>,
    pub rmse: Option<f64>,
    pub forecast_count: i64,
    pub actual_count: i64,
    pub evaluated_count: i64,
    pub data_coverage: f64,
    pub evaluation_status: String,
    pub error_message: Option<String>,
    pub final_evaluation: bool,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = elo_ratings)]
pub struct EloRatingRow {
    pub model_id: i64,
    pub definition_id: Option<i64>,
    pub time_period_days: Option<i32>,
    pub elo_score: f64,
    pub elo_ci_lower: f64,
    pub elo_ci_upper: f64,
    pub n_matches: i64,
    pub n_bootstraps: i32,
    pub calculation_duration_ms: i64,
    pub calculated_at: DateTime<Utc>,
}
