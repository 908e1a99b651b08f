//! Duration parsing and formatting.
//!
//! Two textual forms are produced:
//!
//! - [`format_range`] renders the compact `PromQL` form used inside range
//!   brackets (`5m`, `1h30m`, `1w`)
//! - [`format_offset`] renders the `h/m/s` form used after `offset`
//!   (`5m0s`, `1h0m0s`, `1.5s`)
//!
//! [`parse_duration`] accepts both forms, plain seconds and the sub-second
//! units `ms`, `us`/`µs` and `ns`.

use std::fmt::Write as _;
use std::time::Duration;

use serde_json::Value;

use crate::error::{PromqlError, Result};

const MILLIS_PER_SECOND: u128 = 1_000;
const MILLIS_PER_MINUTE: u128 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u128 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u128 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: u128 = 7 * MILLIS_PER_DAY;
const MILLIS_PER_YEAR: u128 = 365 * MILLIS_PER_DAY;

/// Parses a duration string such as `5m`, `1h30m`, `5m0s`, `1.5s` or `300`.
///
/// A bare number is read as seconds.
///
/// # Errors
///
/// Returns [`PromqlError::InvalidDuration`] for empty, negative or malformed
/// input and for unknown units.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let invalid = |reason: &str| PromqlError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty duration"));
    }

    if let Ok(seconds) = trimmed.parse::<f64>() {
        return seconds_to_duration(seconds).ok_or_else(|| invalid("must be a finite, non-negative number"));
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "d" => 86_400.0 * 1e9,
            "w" => 7.0 * 86_400.0 * 1e9,
            "y" => 365.0 * 86_400.0 * 1e9,
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_len..];
        total_nanos += number * unit_nanos;
    }

    #[allow(clippy::cast_precision_loss)]
    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid("duration overflow"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Reads a duration from a JSON value: a duration string or a number of seconds.
///
/// # Errors
///
/// Returns [`PromqlError::InvalidArgument`] naming `name` for negative
/// numbers, unparsable strings and other JSON types.
pub fn duration_from_value(name: &str, value: &Value) -> Result<Duration> {
    match value {
        Value::String(s) => parse_duration(s).map_err(|err| PromqlError::invalid_argument(name, err.to_string())),
        Value::Number(n) => n
            .as_f64()
            .and_then(seconds_to_duration)
            .ok_or_else(|| PromqlError::invalid_argument(name, "duration must be non-negative")),
        other => Err(PromqlError::invalid_argument(
            name,
            format!("expected a duration string or number of seconds, got {other}"),
        )),
    }
}

fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if seconds.is_finite() && seconds >= 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}

/// Formats a duration for a range bracket, with millisecond precision.
///
/// Years and weeks are only used when they divide the duration exactly.
#[must_use]
pub fn format_range(duration: Duration) -> String {
    let mut millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    let mut emit = |unit: &str, mult: u128, exact: bool| {
        if exact && millis % mult != 0 {
            return;
        }
        let v = millis / mult;
        if v > 0 {
            let _ = write!(out, "{v}{unit}");
            millis -= v * mult;
        }
    };
    emit("y", MILLIS_PER_YEAR, true);
    emit("w", MILLIS_PER_WEEK, true);
    emit("d", MILLIS_PER_DAY, false);
    emit("h", MILLIS_PER_HOUR, false);
    emit("m", MILLIS_PER_MINUTE, false);
    emit("s", MILLIS_PER_SECOND, false);
    emit("ms", 1, false);
    out
}

/// Formats a duration for an `offset` modifier.
#[must_use]
pub fn format_offset(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", fraction(nanos, 1_000, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", fraction(nanos, 1_000_000, 6));
    }

    let whole_seconds = nanos / 1_000_000_000;
    let hours = whole_seconds / 3600;
    let minutes = (whole_seconds / 60) % 60;
    let seconds_nanos = nanos - (hours * 3600 + minutes * 60) * 1_000_000_000;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{}s", fraction(seconds_nanos, 1_000_000_000, 9));
    out
}

/// Renders `value / unit` with trailing zeros of the fraction removed.
fn fraction(value: u128, unit: u128, digits: usize) -> String {
    let whole = value / unit;
    let rem = value % unit;
    if rem == 0 {
        return whole.to_string();
    }
    let frac = format!("{rem:0digits$}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("5m", 300 ; "minutes")]
    #[test_case("1h30m", 5400 ; "compound")]
    #[test_case("5m0s", 300 ; "offset form")]
    #[test_case("1d", 86_400 ; "days")]
    #[test_case("2w", 1_209_600 ; "weeks")]
    #[test_case("90", 90 ; "bare seconds")]
    fn parse_whole_seconds(input: &str, expected: u64) {
        assert_eq!(parse_duration(input).unwrap(), Duration::from_secs(expected));
    }

    #[test]
    fn parse_sub_second_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
    }

    #[test_case("" ; "empty")]
    #[test_case("5x" ; "unknown unit")]
    #[test_case("m5" ; "unit first")]
    #[test_case("-5" ; "negative")]
    fn parse_rejects(input: &str) {
        assert!(matches!(
            parse_duration(input),
            Err(PromqlError::InvalidDuration { .. })
        ));
    }

    #[test_case(300, "5m" ; "five minutes")]
    #[test_case(5400, "1h30m" ; "hour and a half")]
    #[test_case(86_400, "1d" ; "one day")]
    #[test_case(604_800, "1w" ; "one week")]
    #[test_case(691_200, "8d" ; "inexact week")]
    #[test_case(0, "0s" ; "zero")]
    fn range_format(seconds: u64, expected: &str) {
        assert_eq!(format_range(Duration::from_secs(seconds)), expected);
    }

    #[test]
    fn range_format_keeps_millis() {
        assert_eq!(format_range(Duration::from_millis(1500)), "1s500ms");
    }

    #[test_case(Duration::from_secs(300), "5m0s" ; "five minutes")]
    #[test_case(Duration::from_secs(3600), "1h0m0s" ; "one hour")]
    #[test_case(Duration::from_secs(90), "1m30s" ; "ninety seconds")]
    #[test_case(Duration::from_secs(30), "30s" ; "thirty seconds")]
    #[test_case(Duration::from_millis(1500), "1.5s" ; "fractional seconds")]
    #[test_case(Duration::from_millis(250), "250ms" ; "milliseconds")]
    #[test_case(Duration::from_micros(1500), "1.5ms" ; "fractional millis")]
    #[test_case(Duration::ZERO, "0s" ; "zero")]
    fn offset_format(duration: Duration, expected: &str) {
        assert_eq!(format_offset(duration), expected);
    }

    #[test]
    fn duration_from_json_number_is_seconds() {
        let d = duration_from_value("step", &serde_json::json!(30)).unwrap();
        assert_eq!(d, Duration::from_secs(30));
        assert!(duration_from_value("step", &serde_json::json!(true)).is_err());
    }

    #[test]
    fn duration_from_json_string_names_the_argument() {
        let err = duration_from_value("step", &serde_json::json!("5x")).unwrap_err();
        assert!(matches!(&err, PromqlError::InvalidArgument { name, .. } if name == "step"));
        assert_eq!(
            err.to_string(),
            "invalid argument for `step`: invalid duration `5x`: unknown unit"
        );
    }
}
