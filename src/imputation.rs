//! Gap detection and linear interpolation for time-series ingestion.
//!
//! Pure and deterministic: given a chronologically sortable batch of points
//! and an expected frequency, produces the merged sequence of original plus
//! imputed points. No I/O; the scheduler (C5) is the only caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::Duration;

/// Tag on a data point indicating whether the value came from the source or
/// was synthesized by imputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum QualityCode {
    Original = 0,
    Imputed = 1,
}

/// A raw, unvalidated point as received from a source adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// A point after imputation: value is `None` for large-gap NULL markers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImputedPoint {
    pub ts: DateTime<Utc>,
    pub value: Option<f64>,
    pub quality_code: QualityCode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImputationCounts {
    pub interpolated: usize,
    pub null_markers: usize,
}

/// Default multiple of `frequency` beyond which a gap is too large to
/// interpolate and is filled with NULL markers instead.
pub const DEFAULT_MAX_GAP_FACTOR: i64 = 6;

/// Detect and fill gaps in a batch of points.
///
/// `enabled = false` passes the input through unchanged, tagging every point
/// `ORIGINAL`. Points are stable-sorted by timestamp before processing.
pub fn impute_gaps(
    points: &[RawPoint],
    frequency: Duration,
    max_gap_factor: i64,
    enabled: bool,
) -> (Vec<ImputedPoint>, ImputationCounts) {
    if !enabled {
        let tagged = points
            .iter()
            .map(|p| ImputedPoint {
                ts: p.ts,
                value: Some(p.value),
                quality_code: QualityCode::Original,
            })
            .collect();
        return (tagged, ImputationCounts::default());
    }

    if points.len() < 2 {
        let tagged = points
            .iter()
            .map(|p| ImputedPoint {
                ts: p.ts,
                value: Some(p.value),
                quality_code: QualityCode::Original,
            })
            .collect();
        return (tagged, ImputationCounts::default());
    }

    let mut sorted: Vec<RawPoint> = points.to_vec();
    sorted.sort_by_key(|p| p.ts);

    let mut result = Vec::with_capacity(sorted.len());
    let mut counts = ImputationCounts::default();

    for (i, point) in sorted.iter().enumerate() {
        result.push(ImputedPoint {
            ts: point.ts,
            value: Some(point.value),
            quality_code: QualityCode::Original,
        });

        if i + 1 < sorted.len() {
            let next = sorted[i + 1];
            fill_gap(*point, next, frequency, max_gap_factor, &mut result, &mut counts);
        }
    }

    (result, counts)
}

fn fill_gap(
    start: RawPoint,
    end: RawPoint,
    frequency: Duration,
    max_gap_factor: i64,
    out: &mut Vec<ImputedPoint>,
    counts: &mut ImputationCounts,
) {
    let freq_secs = frequency.seconds();
    if freq_secs <= 0 {
        return;
    }
    let gap_secs = (end.ts - start.ts).num_seconds();

    // 1.5x tolerance: anything within one and a half intervals is not a gap.
    let tolerance_secs = freq_secs + freq_secs / 2;
    if gap_secs <= tolerance_secs {
        return;
    }

    let n_missing = gap_secs / freq_secs - 1;
    if n_missing <= 0 {
        return;
    }

    let is_large_gap = gap_secs > max_gap_factor * freq_secs;

    for k in 1..=n_missing {
        let imputed_ts = start.ts + chrono::Duration::seconds(freq_secs * k);
        if is_large_gap {
            out.push(ImputedPoint {
                ts: imputed_ts,
                value: None,
                quality_code: QualityCode::Imputed,
            });
            counts.null_markers += 1;
        } else {
            let fraction = k as f64 / (n_missing + 1) as f64;
            let value = start.value + (end.value - start.value) * fraction;
            out.push(ImputedPoint {
                ts: imputed_ts,
                value: Some(value),
                quality_code: QualityCode::Imputed,
            });
            counts.interpolated += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(0, 0).unwrap() + chrono::Duration::hours(hour)
    }

    #[test]
    fn small_gap_is_linearly_interpolated() {
        let points = vec![
            RawPoint { ts: ts(0), value: 10.0 },
            RawPoint { ts: ts(3), value: 13.0 },
        ];
        let freq = Duration::parse("PT1H").unwrap();
        let (out, counts) = impute_gaps(&points, freq, DEFAULT_MAX_GAP_FACTOR, true);

        assert_eq!(counts.interpolated, 2);
        assert_eq!(counts.null_markers, 0);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], ImputedPoint { ts: ts(0), value: Some(10.0), quality_code: QualityCode::Original });
        assert_eq!(out[1], ImputedPoint { ts: ts(1), value: Some(11.0), quality_code: QualityCode::Imputed });
        assert_eq!(out[2], ImputedPoint { ts: ts(2), value: Some(12.0), quality_code: QualityCode::Imputed });
        assert_eq!(out[3], ImputedPoint { ts: ts(3), value: Some(13.0), quality_code: QualityCode::Original });
    }

    #[test]
    fn large_gap_emits_null_markers() {
        let points = vec![
            RawPoint { ts: ts(0), value: 10.0 },
            RawPoint { ts: ts(10), value: 20.0 },
        ];
        let freq = Duration::parse("PT1H").unwrap();
        let (out, counts) = impute_gaps(&points, freq, 6, true);

        assert_eq!(counts.null_markers, 9);
        assert_eq!(counts.interpolated, 0);
        let imputed: Vec<_> = out
            .iter()
            .filter(|p| p.quality_code == QualityCode::Imputed)
            .collect();
        assert_eq!(imputed.len(), 9);
        assert!(imputed.iter().all(|p| p.value.is_none()));
    }

    #[test]
    fn no_gap_when_within_tolerance() {
        let points = vec![
            RawPoint { ts: ts(0), value: 1.0 },
            RawPoint { ts: ts(1), value: 2.0 },
        ];
        let freq = Duration::parse("PT1H").unwrap();
        let (out, counts) = impute_gaps(&points, freq, 6, true);
        assert_eq!(out.len(), 2);
        assert_eq!(counts, ImputationCounts::default());
    }

    #[test]
    fn disabled_mode_tags_everything_original() {
        let points = vec![
            RawPoint { ts: ts(0), value: 1.0 },
            RawPoint { ts: ts(10), value: 2.0 },
        ];
        let freq = Duration::parse("PT1H").unwrap();
        let (out, counts) = impute_gaps(&points, freq, 6, false);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| p.quality_code == QualityCode::Original));
        assert_eq!(counts, ImputationCounts::default());
    }

    #[test]
    fn points_are_sorted_before_processing() {
        let points = vec![
            RawPoint { ts: ts(3), value: 13.0 },
            RawPoint { ts: ts(0), value: 10.0 },
        ];
        let freq = Duration::parse("PT1H").unwrap();
        let (out, _) = impute_gaps(&points, freq, 6, true);
        assert_eq!(out.first().unwrap().ts, ts(0));
        assert_eq!(out.last().unwrap().ts, ts(3));
    }

    #[test]
    fn single_point_passes_through() {
        let points = vec![RawPoint { ts: ts(0), value: 1.0 }];
        let freq = Duration::parse("PT1H").unwrap();
        let (out, counts) = impute_gaps(&points, freq, 6, true);
        assert_eq!(out.len(), 1);
        assert_eq!(counts, ImputationCounts::default());
    }
}
