//! Runtime settings for result formatting and execution.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::duration::{format_offset, parse_duration};
use crate::error::Result;

/// How timestamps are written into result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    /// RFC 3339 string, e.g. `2024-01-01T00:00:00Z`.
    #[default]
    Rfc3339,
    /// Unix count in the configured [`UnixTimeUnit`].
    Unix,
}

/// How sample values are written into result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueFormat {
    /// Decimal string, with `NaN`, `+Inf` and `-Inf` spelled out.
    #[default]
    String,
    /// JSON number. Non-finite values fall back to their string form.
    Float64,
}

/// Sub-second unit of unix timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnixTimeUnit {
    /// Seconds.
    #[serde(rename = "s")]
    Second,
    /// Milliseconds.
    #[default]
    #[serde(rename = "ms")]
    Millisecond,
    /// Microseconds.
    #[serde(rename = "us")]
    Microsecond,
    /// Nanoseconds.
    #[serde(rename = "ns")]
    Nanosecond,
}

impl UnixTimeUnit {
    /// Converts a millisecond timestamp into this unit.
    #[must_use]
    pub const fn from_millis(self, millis: i64) -> i64 {
        match self {
            Self::Second => millis.div_euclid(1000),
            Self::Millisecond => millis,
            Self::Microsecond => millis.saturating_mul(1_000),
            Self::Nanosecond => millis.saturating_mul(1_000_000),
        }
    }

    /// Converts a count in this unit into milliseconds.
    #[must_use]
    pub fn to_millis(self, count: f64) -> f64 {
        match self {
            Self::Second => count * 1000.0,
            Self::Millisecond => count,
            Self::Microsecond => count / 1_000.0,
            Self::Nanosecond => count / 1_000_000.0,
        }
    }
}

/// Process-wide settings consumed by the compiler, shaper and executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    /// Emit one row per point instead of one row per series.
    pub flat: bool,
    /// Timestamp representation.
    pub timestamp_format: TimestampFormat,
    /// Value representation.
    pub value_format: ValueFormat,
    /// Unit of unix timestamps, for both output and predicate input.
    pub unix_time_unit: UnixTimeUnit,
    /// Maximum number of batch units in flight.
    pub concurrency_limit: usize,
    /// Timeout passed to the execution client when a request sets none.
    #[serde(
        serialize_with = "serialize_timeout",
        deserialize_with = "deserialize_timeout"
    )]
    pub default_timeout: Option<Duration>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            flat: false,
            timestamp_format: TimestampFormat::default(),
            value_format: ValueFormat::default(),
            unix_time_unit: UnixTimeUnit::default(),
            concurrency_limit: 1,
            default_timeout: None,
        }
    }
}

impl RuntimeSettings {
    /// Parses settings from a JSON document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::InvalidSettings`](crate::PromqlError::InvalidSettings)
    /// on malformed JSON or an unknown key.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the default result shape.
    #[must_use]
    pub const fn with_flat(mut self, flat: bool) -> Self {
        self.flat = flat;
        self
    }

    /// Set the timestamp format.
    #[must_use]
    pub const fn with_timestamp_format(mut self, format: TimestampFormat) -> Self {
        self.timestamp_format = format;
        self
    }

    /// Set the value format.
    #[must_use]
    pub const fn with_value_format(mut self, format: ValueFormat) -> Self {
        self.value_format = format;
        self
    }

    /// Set the unix time unit.
    #[must_use]
    pub const fn with_unix_time_unit(mut self, unit: UnixTimeUnit) -> Self {
        self.unix_time_unit = unit;
        self
    }

    /// Set the batch concurrency limit.
    #[must_use]
    pub const fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Set the default client timeout.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

#[allow(clippy::ref_option)] // serde's serialize_with hands us &Option<T>
fn serialize_timeout<S: Serializer>(
    timeout: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match timeout {
        Some(d) => serializer.serialize_some(&format_offset(*d)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_timeout<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RuntimeSettings::default();

        assert!(!settings.flat);
        assert_eq!(settings.timestamp_format, TimestampFormat::Rfc3339);
        assert_eq!(settings.value_format, ValueFormat::String);
        assert_eq!(settings.unix_time_unit, UnixTimeUnit::Millisecond);
        assert_eq!(settings.concurrency_limit, 1);
        assert!(settings.default_timeout.is_none());
    }

    #[test]
    fn test_settings_builder() {
        let settings = RuntimeSettings::default()
            .with_flat(true)
            .with_timestamp_format(TimestampFormat::Unix)
            .with_value_format(ValueFormat::Float64)
            .with_unix_time_unit(UnixTimeUnit::Second)
            .with_concurrency_limit(8)
            .with_default_timeout(Duration::from_secs(30));

        assert!(settings.flat);
        assert_eq!(settings.timestamp_format, TimestampFormat::Unix);
        assert_eq!(settings.value_format, ValueFormat::Float64);
        assert_eq!(settings.unix_time_unit, UnixTimeUnit::Second);
        assert_eq!(settings.concurrency_limit, 8);
        assert_eq!(settings.default_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_settings_from_json() {
        let settings = RuntimeSettings::from_json_str(
            r#"{"flat": true, "timestamp_format": "unix", "unix_time_unit": "s", "default_timeout": "1m"}"#,
        )
        .unwrap();

        assert!(settings.flat);
        assert_eq!(settings.timestamp_format, TimestampFormat::Unix);
        assert_eq!(settings.unix_time_unit, UnixTimeUnit::Second);
        assert_eq!(settings.value_format, ValueFormat::String);
        assert_eq!(settings.default_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_settings_rejects_unknown_key() {
        let err = RuntimeSettings::from_json_str(r#"{"flatten": true}"#);
        assert!(matches!(err, Err(crate::PromqlError::InvalidSettings(_))));
    }

    #[test]
    fn test_settings_json_roundtrip_timeout() {
        let settings = RuntimeSettings::default().with_default_timeout(Duration::from_secs(90));
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"1m30s\""));
        assert_eq!(RuntimeSettings::from_json_str(&json).unwrap(), settings);
    }

    #[test]
    fn test_unix_units() {
        assert_eq!(UnixTimeUnit::Second.from_millis(1_500), 1);
        assert_eq!(UnixTimeUnit::Microsecond.from_millis(2), 2_000);
        assert_eq!(UnixTimeUnit::Nanosecond.from_millis(2), 2_000_000);
        assert!((UnixTimeUnit::Second.to_millis(1.5) - 1500.0).abs() < f64::EPSILON);
    }
}
