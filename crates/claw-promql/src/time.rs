//! Time selection for compiled queries.
//!
//! A request resolves to either an instant query or a range query. Range
//! queries without an explicit step get one from [`default_step`], which keeps
//! every series under [`MAX_POINTS_PER_SERIES`] points.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::config::UnixTimeUnit;
use crate::error::{PromqlError, Result};

/// Maximum number of points the store returns per series.
pub const MAX_POINTS_PER_SERIES: u64 = 11_000;

/// Range in seconds used when only the end of a range is known.
pub const DEFAULT_LOOKBACK_SECS: i64 = 3600;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// `(largest range in seconds, step in seconds)`, ascending by range.
static STEP_TABLE: &[(u64, u64)] = &[
    (5 * MINUTE, 1),
    (30 * MINUTE, 5),
    (HOUR, 10),
    (3 * HOUR, 30),
    (6 * HOUR, MINUTE),
    (12 * HOUR, 2 * MINUTE),
    (DAY, 5 * MINUTE),
    (7 * DAY, 30 * MINUTE),
    (30 * DAY, 2 * HOUR),
    (90 * DAY, 6 * HOUR),
    (365 * DAY, DAY),
];

/// Returns the step used for a range query over `range` when none was requested.
#[must_use]
pub fn default_step(range: Duration) -> Duration {
    let seconds = range.as_secs();
    for &(max_range, step) in STEP_TABLE {
        if seconds <= max_range {
            return Duration::from_secs(step);
        }
    }
    Duration::from_secs(seconds.div_ceil(MAX_POINTS_PER_SERIES).max(DAY))
}

/// The bounds of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSelection {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Inclusive end.
    pub end: DateTime<Utc>,
    /// Resolution.
    pub step: Duration,
}

/// Instant or range evaluation of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSelection {
    /// Evaluate once at the given instant.
    Instant(DateTime<Utc>),
    /// Evaluate over a range.
    Range(RangeSelection),
}

impl TimeSelection {
    /// Resolves predicate bounds into a selection.
    ///
    /// - an instant alone selects an instant query
    /// - no bounds at all selects an instant query at `now`
    /// - otherwise a missing end defaults to `now` and a missing start to
    ///   `end - 1h`
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::InvalidTimeRange`] if `start > end`, and
    /// [`PromqlError::UnsupportedPredicate`] if an instant is combined with
    /// range bounds.
    pub fn resolve(
        instant: Option<DateTime<Utc>>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        step: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        match (instant, start, end) {
            (Some(at), None, None) => return Ok(Self::Instant(at)),
            (Some(_), _, _) => {
                return Err(PromqlError::UnsupportedPredicate {
                    reason: "timestamp equality cannot be combined with range bounds".to_string(),
                });
            }
            (None, None, None) => return Ok(Self::Instant(now)),
            _ => {}
        }

        let end = end.unwrap_or(now);
        let start = match start {
            Some(start) => start,
            None => end - chrono::Duration::seconds(DEFAULT_LOOKBACK_SECS),
        };
        if start > end {
            return Err(PromqlError::InvalidTimeRange {
                start: start.timestamp_millis(),
                end: end.timestamp_millis(),
            });
        }

        let step = match step {
            Some(step) if !step.is_zero() => step,
            _ => default_step((end - start).to_std().unwrap_or_default()),
        };
        Ok(Self::Range(RangeSelection { start, end, step }))
    }

    /// Returns the step of a range selection.
    #[must_use]
    pub const fn step(&self) -> Option<Duration> {
        match self {
            Self::Instant(_) => None,
            Self::Range(range) => Some(range.step),
        }
    }

    /// Returns true for an instant selection.
    #[must_use]
    pub const fn is_instant(&self) -> bool {
        matches!(self, Self::Instant(_))
    }
}

/// Parses a timestamp comparison value.
///
/// Accepts an RFC 3339 string, an integer string, or a JSON number. Numbers
/// are read in `unit`.
///
/// # Errors
///
/// Returns [`PromqlError::InvalidTimestamp`] naming `field` if the value
/// cannot be read.
pub fn parse_timestamp(field: &str, value: &Value, unit: UnixTimeUnit) -> Result<DateTime<Utc>> {
    let invalid = || PromqlError::InvalidTimestamp {
        field: field.to_string(),
        input: value.to_string(),
    };

    let millis = match value {
        Value::String(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s.trim()) {
                return Ok(parsed.with_timezone(&Utc));
            }
            let count: i64 = s.trim().parse().map_err(|_| invalid())?;
            #[allow(clippy::cast_precision_loss)]
            unit.to_millis(count as f64)
        }
        Value::Number(n) => unit.to_millis(n.as_f64().ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };

    if !millis.is_finite() {
        return Err(invalid());
    }
    #[allow(clippy::cast_possible_truncation)]
    Utc.timestamp_millis_opt(millis.round() as i64)
        .single()
        .ok_or_else(invalid)
}

/// Converts a millisecond timestamp into a UTC datetime.
#[must_use]
pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    mod step_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(60, 1 ; "one minute")]
        #[test_case(3600, 10 ; "one hour")]
        #[test_case(86_400, 300 ; "one day")]
        #[test_case(7 * 86_400, 1800 ; "one week")]
        fn table_lookup(range: u64, step: u64) {
            assert_eq!(
                default_step(Duration::from_secs(range)),
                Duration::from_secs(step)
            );
        }

        #[test]
        fn step_never_exceeds_point_cap() {
            for range in [1, 299, 301, 10_000, 200_000, 5_000_000, 40_000_000, 400_000_000] {
                let step = default_step(Duration::from_secs(range)).as_secs();
                assert!(range / step <= MAX_POINTS_PER_SERIES, "range {range}");
            }
        }
    }

    mod resolve_tests {
        use super::*;

        #[test]
        fn instant_only() {
            let sel = TimeSelection::resolve(Some(at(100)), None, None, None, at(500)).unwrap();
            assert_eq!(sel, TimeSelection::Instant(at(100)));
        }

        #[test]
        fn no_bounds_is_instant_now() {
            let sel = TimeSelection::resolve(None, None, None, None, at(500)).unwrap();
            assert_eq!(sel, TimeSelection::Instant(at(500)));
        }

        #[test]
        fn missing_start_looks_back_an_hour() {
            let sel = TimeSelection::resolve(None, None, Some(at(7200)), None, at(9000)).unwrap();
            let TimeSelection::Range(range) = sel else {
                panic!("expected range");
            };
            assert_eq!(range.start, at(3600));
            assert_eq!(range.end, at(7200));
            assert_eq!(range.step, Duration::from_secs(10));
        }

        #[test]
        fn missing_end_is_now() {
            let sel = TimeSelection::resolve(None, Some(at(0)), None, Some(Duration::from_secs(30)), at(600))
                .unwrap();
            assert_eq!(
                sel,
                TimeSelection::Range(RangeSelection {
                    start: at(0),
                    end: at(600),
                    step: Duration::from_secs(30),
                })
            );
        }

        #[test]
        fn inverted_range_is_rejected() {
            let err = TimeSelection::resolve(None, Some(at(10)), Some(at(5)), None, at(20));
            assert!(matches!(err, Err(PromqlError::InvalidTimeRange { .. })));
        }

        #[test]
        fn instant_with_bounds_is_rejected() {
            let err = TimeSelection::resolve(Some(at(1)), Some(at(0)), None, None, at(20));
            assert!(matches!(err, Err(PromqlError::UnsupportedPredicate { .. })));
        }
    }

    mod parse_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn rfc3339() {
            let ts = parse_timestamp("start", &json!("2024-01-01T00:00:00Z"), UnixTimeUnit::Millisecond).unwrap();
            assert_eq!(ts.timestamp(), 1_704_067_200);
        }

        #[test]
        fn integer_string_in_unit() {
            let ts = parse_timestamp("start", &json!("1704067200"), UnixTimeUnit::Second).unwrap();
            assert_eq!(ts.timestamp(), 1_704_067_200);
        }

        #[test]
        fn number_in_millis() {
            let ts = parse_timestamp("start", &json!(1_704_067_200_500_i64), UnixTimeUnit::Millisecond).unwrap();
            assert_eq!(ts.timestamp_millis(), 1_704_067_200_500);
        }

        #[test]
        fn error_names_the_field() {
            let err = parse_timestamp("end", &json!("yesterday"), UnixTimeUnit::Second).unwrap_err();
            assert_eq!(err.to_string(), r#"invalid timestamp `"yesterday"` for `end`"#);
        }

        #[test_case(json!("yesterday") ; "garbage string")]
        #[test_case(json!(true) ; "boolean")]
        #[test_case(json!(null) ; "null")]
        fn rejects(value: Value) {
            assert!(matches!(
                parse_timestamp("start", &value, UnixTimeUnit::Second),
                Err(PromqlError::InvalidTimestamp { .. })
            ));
        }
    }
}
