//! Duration/interval codec.
//!
//! Accepts either ISO-8601 (`P[nY][nM][nD][T[nH][nM][nS]]`) or a free-form
//! `N unit[s]` phrase (second/minute/hour/day/week, case-insensitive). Both
//! dialects normalize to a single whole-second internal representation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A non-negative elapsed-time quantity at whole-second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Duration {
    seconds: i64,
}

/// Failure parsing a duration from either dialect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidDuration {
    #[error("empty duration string")]
    Empty,
    #[error("could not parse duration: {0:?}")]
    Unparseable(String),
    #[error("duration must be non-negative, got {0} seconds")]
    Negative(i64),
}

impl Duration {
    pub const ZERO: Duration = Duration { seconds: 0 };

    /// Construct from a whole-second count. Rejects negative values.
    pub fn from_seconds(seconds: i64) -> Result<Self, InvalidDuration> {
        if seconds < 0 {
            return Err(InvalidDuration::Negative(seconds));
        }
        Ok(Self { seconds })
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Reconstruct a duration from a value already known to be non-negative,
    /// such as one previously stored in the database. Clamps to zero instead
    /// of panicking if that invariant is ever violated.
    pub fn from_stored_seconds(seconds: i64) -> Self {
        Self::from_seconds(seconds).unwrap_or(Duration::ZERO)
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.seconds)
    }

    /// Parse either ISO-8601 or the free-form "N unit[s]" dialect.
    pub fn parse(input: &str) -> Result<Self, InvalidDuration> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(InvalidDuration::Empty);
        }
        if trimmed.starts_with('P') || trimmed.starts_with('p') {
            return Self::parse_iso8601(trimmed);
        }
        Self::parse_freeform(trimmed)
    }

    fn parse_iso8601(input: &str) -> Result<Self, InvalidDuration> {
        let bytes = input.as_bytes();
        if bytes.is_empty() || (bytes[0] != b'P' && bytes[0] != b'p') {
            return Err(InvalidDuration::Unparseable(input.to_string()));
        }
        let rest = &input[1..];
        let (date_part, time_part) = match rest.find(['T', 't']) {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        let mut total_seconds: i64 = 0;
        let mut saw_any = false;

        let mut consume = |part: &str, units: &[(char, i64)]| -> Result<(), InvalidDuration> {
            let mut num = String::new();
            for ch in part.chars() {
                if ch.is_ascii_digit() {
                    num.push(ch);
                    continue;
                }
                let upper = ch.to_ascii_uppercase();
                let factor = units
                    .iter()
                    .find(|(u, _)| *u == upper)
                    .map(|(_, f)| *f)
                    .ok_or_else(|| InvalidDuration::Unparseable(input.to_string()))?;
                if num.is_empty() {
                    return Err(InvalidDuration::Unparseable(input.to_string()));
                }
                let value: i64 = num
                    .parse()
                    .map_err(|_| InvalidDuration::Unparseable(input.to_string()))?;
                total_seconds += value * factor;
                saw_any = true;
                num.clear();
            }
            if !num.is_empty() {
                return Err(InvalidDuration::Unparseable(input.to_string()));
            }
            Ok(())
        };

        // Y/M/D use approximations that are exact enough for whole-day arithmetic:
        // a year is 365 days, a month is 30 days, matching the source's treatment
        // of calendar components as fixed-length for interval math.
        consume(date_part, &[('Y', 365 * 86400), ('M', 30 * 86400), ('D', 86400)])?;
        if let Some(time_part) = time_part {
            consume(time_part, &[('H', 3600), ('M', 60), ('S', 1)])?;
        }

        if !saw_any {
            return Err(InvalidDuration::Unparseable(input.to_string()));
        }

        Self::from_seconds(total_seconds)
    }

    fn parse_freeform(input: &str) -> Result<Self, InvalidDuration> {
        let lower = input.to_ascii_lowercase();
        let mut parts = lower.splitn(2, char::is_whitespace);
        let number = parts
            .next()
            .ok_or_else(|| InvalidDuration::Unparseable(input.to_string()))?;
        let unit = parts
            .next()
            .ok_or_else(|| InvalidDuration::Unparseable(input.to_string()))?
            .trim();

        let value: i64 = number
            .parse()
            .map_err(|_| InvalidDuration::Unparseable(input.to_string()))?;

        let unit = unit.strip_suffix('s').unwrap_or(unit);
        let factor = match unit {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            "day" => 86400,
            "week" => 7 * 86400,
            _ => return Err(InvalidDuration::Unparseable(input.to_string())),
        };

        Self::from_seconds(value * factor)
    }

    /// Render as ISO-8601 (`PT...` form, using only H/M/S components since the
    /// canonical representation is a flat second count).
    pub fn to_iso8601(&self) -> String {
        if self.seconds == 0 {
            return "PT0S".to_string();
        }
        let days = self.seconds / 86400;
        let remainder = self.seconds % 86400;
        let hours = remainder / 3600;
        let minutes = (remainder % 3600) / 60;
        let secs = remainder % 60;

        let mut out = String::from("P");
        if days > 0 {
            out.push_str(&format!("{}D", days));
        }
        if hours > 0 || minutes > 0 || secs > 0 {
            out.push('T');
            if hours > 0 {
                out.push_str(&format!("{}H", hours));
            }
            if minutes > 0 {
                out.push_str(&format!("{}M", minutes));
            }
            if secs > 0 {
                out.push_str(&format!("{}S", secs));
            }
        }
        out
    }

    /// Render as a PostgreSQL-native interval literal, e.g. `"3600 seconds"`.
    pub fn to_sql_interval(&self) -> String {
        format!("{} seconds", self.seconds)
    }

    /// One-quarter of this duration, clamped to at least one minute and
    /// rounded down to the coarsest natural unit (days, then hours, then
    /// minutes) that evenly bounds it.
    pub fn derived_update_frequency(&self) -> Duration {
        let quarter = (self.seconds / 4).max(60);
        let rounded = if quarter >= 86400 {
            (quarter / 86400) * 86400
        } else if quarter >= 3600 {
            (quarter / 3600) * 3600
        } else {
            (quarter / 60) * 60
        };
        Duration {
            seconds: rounded.max(60),
        }
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_iso8601())
    }
}

impl TryFrom<String> for Duration {
    type Error = InvalidDuration;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Duration::parse(&value)
    }
}

impl From<Duration> for String {
    fn from(value: Duration) -> Self {
        value.to_iso8601()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso8601_hours_minutes_seconds() {
        let d = Duration::parse("PT1H30M").unwrap();
        assert_eq!(d.seconds(), 5400);
    }

    #[test]
    fn parses_iso8601_days() {
        let d = Duration::parse("P1D").unwrap();
        assert_eq!(d.seconds(), 86400);
    }

    #[test]
    fn parses_freeform_singular_and_plural() {
        assert_eq!(Duration::parse("1 hour").unwrap().seconds(), 3600);
        assert_eq!(Duration::parse("2 hours").unwrap().seconds(), 7200);
        assert_eq!(Duration::parse("15 minutes").unwrap().seconds(), 900);
        assert_eq!(Duration::parse("1 day").unwrap().seconds(), 86400);
        assert_eq!(Duration::parse("1 week").unwrap().seconds(), 604800);
    }

    #[test]
    fn parses_freeform_case_insensitive_and_whitespace_tolerant() {
        assert_eq!(Duration::parse("  1   Hour ").unwrap().seconds(), 3600);
        assert_eq!(Duration::parse("5 SECONDS").unwrap().seconds(), 5);
    }

    #[test]
    fn rejects_unparseable_input() {
        assert!(matches!(
            Duration::parse("1 minuteute"),
            Err(InvalidDuration::Unparseable(_))
        ));
        assert!(matches!(Duration::parse(""), Err(InvalidDuration::Empty)));
        assert!(matches!(
            Duration::parse("banana"),
            Err(InvalidDuration::Unparseable(_))
        ));
    }

    #[test]
    fn rejects_negative_seconds() {
        assert!(matches!(
            Duration::from_seconds(-1),
            Err(InvalidDuration::Negative(-1))
        ));
    }

    #[test]
    fn duration_roundtrip_iso8601() {
        for input in ["PT1H", "PT15M", "P1D", "PT0S", "P2DT3H4M5S"] {
            let parsed = Duration::parse(input).unwrap();
            let rendered = parsed.to_iso8601();
            let reparsed = Duration::parse(&rendered).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn derived_update_frequency_clamps_to_one_minute() {
        let tiny = Duration::parse("PT1S").unwrap();
        assert_eq!(tiny.derived_update_frequency().seconds(), 60);
    }

    #[test]
    fn derived_update_frequency_rounds_to_coarsest_unit() {
        let hourly = Duration::parse("1 hour").unwrap();
        // one quarter of 3600s = 900s -> rounds down to whole minutes (15 min)
        assert_eq!(hourly.derived_update_frequency().seconds(), 900);

        let daily = Duration::parse("1 day").unwrap();
        // one quarter of 86400s = 21600s (6h) -> whole hours
        assert_eq!(daily.derived_update_frequency().seconds(), 21600);
    }

    #[test]
    fn to_sql_interval_renders_seconds_literal() {
        let d = Duration::parse("PT1H").unwrap();
        assert_eq!(d.to_sql_interval(), "3600 seconds");
    }
}
