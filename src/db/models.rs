//! Domain types shared across the repository layer and the scheduling
//! components that consume it. Storage-neutral: Diesel-specific `Queryable`
//! impls live in `repositories::postgres::models`, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::Duration;
use crate::imputation::QualityCode;

/// Stable textual identity plus integer surrogate key for a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub series_id: i64,
    pub unique_id: String,
    pub name: String,
    pub description: String,
    pub frequency: Duration,
    pub unit: String,
    pub domain: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub update_frequency: Duration,
    pub timezone: Option<String>,
}

/// A single `(ts, value)` pair destined for the operational sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationalPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// A single `(ts, value, qualityCode)` tuple destined for the SCD2 sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scd2Point {
    pub ts: DateTime<Utc>,
    pub value: Option<f64>,
    pub quality_code: QualityCode,
}

/// Outcome of an SCD2 batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scd2UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// One resolution a time series can be read at for scoring/context purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    FifteenMin,
    OneHour,
    OneDay,
}

impl Resolution {
    /// Maps a frequency to the nearest supported resolution view, defaulting
    /// to one hour (with a caller-side warning) when unmapped.
    pub fn from_frequency(frequency: Option<Duration>) -> Self {
        match frequency.map(|f| f.seconds()) {
            Some(900) => Resolution::FifteenMin,
            Some(3600) => Resolution::OneHour,
            Some(86400) => Resolution::OneDay,
            _ => Resolution::OneHour,
        }
    }

    pub fn view_suffix(&self) -> &'static str {
        match self {
            Resolution::FifteenMin => "15min",
            Resolution::OneHour => "1h",
            Resolution::OneDay => "1d",
        }
    }
}

/// Template for recurring rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeDefinition {
    pub definition_id: i64,
    pub schedule_id: String,
    pub name: String,
    pub description: String,
    pub domain: String,
    pub subdomain: Option<String>,
    pub context_length: i32,
    pub horizon: Duration,
    pub frequency: Duration,
    pub cron_expression: String,
    pub n_series: i32,
    pub announce_lead: Duration,
    pub registration_duration: Duration,
    pub evaluation_delay: Duration,
    pub is_active: bool,
    pub run_on_startup: bool,
}

/// SCD2-versioned `(definitionId, seriesId)` assignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSeriesAssignment {
    pub definition_id: i64,
    pub series_id: i64,
    pub is_required: bool,
    pub is_excluded: bool,
}

/// Closed set of round lifecycle states, computed from timestamps and the
/// cancellation flag — never stored as a free-form string in application
/// code (conversion happens only at the persistence boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Announced,
    Registration,
    Active,
    Completed,
    Cancelled,
}

impl RoundStatus {
    /// Derive the status of a round purely from its timestamps, per the
    /// state machine in the round materializer design.
    pub fn compute(
        now: DateTime<Utc>,
        registration_start: DateTime<Utc>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        is_cancelled: bool,
    ) -> Self {
        if is_cancelled {
            return RoundStatus::Cancelled;
        }
        if now >= end_time {
            RoundStatus::Completed
        } else if now >= start_time {
            RoundStatus::Active
        } else if now >= registration_start {
            RoundStatus::Registration
        } else {
            RoundStatus::Announced
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundStatus::Completed | RoundStatus::Cancelled)
    }
}

/// One materialization of a `ChallengeDefinition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeRound {
    pub round_id: i64,
    pub definition_id: Option<i64>,
    pub name: String,
    pub context_length: i32,
    pub horizon: Duration,
    pub frequency: Duration,
    pub registration_start: DateTime<Utc>,
    pub registration_end: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub preparation_params: serde_json::Value,
    pub is_cancelled: bool,
}

impl ChallengeRound {
    pub fn status(&self, now: DateTime<Utc>) -> RoundStatus {
        RoundStatus::compute(
            now,
            self.registration_start,
            self.start_time,
            self.end_time,
            self.is_cancelled,
        )
    }
}

/// Public-facing identifier for a series within a round, plus summary
/// statistics over its context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSeriesPseudo {
    pub round_id: i64,
    pub series_id: i64,
    pub challenge_series_name: String,
    pub min_ts: Option<DateTime<Utc>>,
    pub max_ts: Option<DateTime<Utc>>,
    pub value_avg: Option<f64>,
    pub value_std: Option<f64>,
}

/// Immutable copy of a series' context window at preparation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundContextPoint {
    pub round_id: i64,
    pub series_id: i64,
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Read-model for externally-owned forecast rows; this crate never writes
/// `Forecast` rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub round_id: i64,
    pub model_id: i64,
    pub series_id: i64,
    pub ts: DateTime<Utc>,
    pub predicted_value: f64,
    pub probabilistic_values: Option<serde_json::Value>,
}

/// Closed set of per-(model,series) evaluation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    NoForecasts,
    NoOverlap,
    Partial,
    Complete,
    Error,
}

/// Per-(round, model, series) scoring outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub round_id: i64,
    pub model_id: i64,
    pub series_id: i64,
    pub mase: Option<f64>,
    pub rmse: Option<f64>,
    pub forecast_count: i64,
    pub actual_count: i64,
    pub evaluated_count: i64,
    pub data_coverage: f64,
    pub evaluation_status: EvaluationStatus,
    pub error_message: Option<String>,
    pub final_evaluation: bool,
    pub calculated_at: DateTime<Utc>,
}

/// Maximum length, in characters, of a truncated evaluation error message.
pub const ERROR_MESSAGE_MAX_LEN: usize = 500;

/// Bootstrapped ELO result for one `(modelId, definitionId?, timePeriodDays?)`
/// scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EloRating {
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
