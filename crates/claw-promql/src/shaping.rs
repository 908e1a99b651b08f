//! Result shaping.
//!
//! Raw Vector/Matrix results become uniform rows. In flat mode every point is
//! a row; in grouped mode every series is a row carrying its points, with the
//! top-level `timestamp` and `value` mirroring the last point.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{Number, Value};

use crate::aggregation::GroupRow;
use crate::config::{RuntimeSettings, TimestampFormat, UnixTimeUnit, ValueFormat};
use crate::sorting::{paginate, sort_by_columns, ColumnOrder};
use crate::time::millis_to_datetime;
use crate::types::{Labels, Point, QueryValue, Sample, Series};

/// Formats a value as text: `NaN`, `+Inf`, `-Inf` or the shortest decimal.
#[must_use]
pub fn format_value_string(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

/// Timestamp and value formatting taken from [`RuntimeSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultFormatter {
    timestamp_format: TimestampFormat,
    value_format: ValueFormat,
    unix_time_unit: UnixTimeUnit,
}

impl ResultFormatter {
    /// Creates a formatter from settings.
    #[must_use]
    pub const fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            timestamp_format: settings.timestamp_format,
            value_format: settings.value_format,
            unix_time_unit: settings.unix_time_unit,
        }
    }

    /// Formats a millisecond timestamp.
    #[must_use]
    pub fn timestamp(&self, millis: i64) -> Value {
        match self.timestamp_format {
            TimestampFormat::Unix => Value::from(self.unix_time_unit.from_millis(millis)),
            TimestampFormat::Rfc3339 => match millis_to_datetime(millis) {
                Some(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                None => Value::from(millis),
            },
        }
    }

    /// Formats a sample value.
    #[must_use]
    pub fn value(&self, value: f64) -> Value {
        match self.value_format {
            ValueFormat::String => Value::String(format_value_string(value)),
            ValueFormat::Float64 => Number::from_f64(value)
                .map_or_else(|| Value::String(format_value_string(value)), Value::Number),
        }
    }

    /// Formats an optional aggregate value; `None` is JSON null.
    #[must_use]
    pub fn optional_value(&self, value: Option<f64>) -> Value {
        value.map_or(Value::Null, |v| self.value(v))
    }

    /// Formats a point.
    #[must_use]
    pub fn point(&self, point: &Point) -> FormattedPoint {
        FormattedPoint {
            timestamp: self.timestamp(point.timestamp),
            value: self.value(point.value),
        }
    }
}

/// A formatted `(timestamp, value)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedPoint {
    /// Formatted timestamp.
    pub timestamp: Value,
    /// Formatted value.
    pub value: Value,
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    /// The full label set of the series.
    pub labels: Labels,
    /// Timestamp of the row's point, or of the last point in grouped mode.
    pub timestamp: Value,
    /// Value of the row's point, or of the last point in grouped mode.
    pub value: Value,
    /// Every point of the series, in grouped mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<FormattedPoint>>,
}

/// Sorting, paging and shape options for row results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowOptions<'a> {
    /// One row per point.
    pub flat: bool,
    /// Sort keys.
    pub order_by: &'a [ColumnOrder],
    /// Rows to skip.
    pub offset: Option<usize>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

/// Sorts, pages and shapes a raw result.
///
/// Flat Matrix results are flattened before sorting, so keys and paging apply
/// to points. Grouped Matrix results sort series by their last point.
#[must_use]
pub fn shape_rows(value: QueryValue, options: &RowOptions<'_>, formatter: &ResultFormatter) -> Vec<Row> {
    match value {
        QueryValue::Vector(samples) => shape_samples(samples, options, formatter),
        QueryValue::Matrix(series) if options.flat => {
            let samples = series
                .into_iter()
                .flat_map(|s| {
                    let labels = s.labels;
                    s.points.into_iter().map(move |point| Sample {
                        labels: labels.clone(),
                        point,
                    })
                })
                .collect();
            shape_samples(samples, options, formatter)
        }
        QueryValue::Matrix(mut series) => {
            sort_by_columns(&mut series, options.order_by);
            paginate(series, options.offset, options.limit)
                .into_iter()
                .map(|s| series_row(s, formatter))
                .collect()
        }
    }
}

fn shape_samples(mut samples: Vec<Sample>, options: &RowOptions<'_>, formatter: &ResultFormatter) -> Vec<Row> {
    sort_by_columns(&mut samples, options.order_by);
    paginate(samples, options.offset, options.limit)
        .into_iter()
        .map(|sample| {
            let point = formatter.point(&sample.point);
            Row {
                labels: sample.labels,
                timestamp: point.timestamp.clone(),
                value: point.value.clone(),
                values: (!options.flat).then(|| vec![point]),
            }
        })
        .collect()
}

fn series_row(series: Series, formatter: &ResultFormatter) -> Row {
    let (timestamp, value) = series.last_point().map_or((Value::Null, Value::Null), |p| {
        (formatter.timestamp(p.timestamp), formatter.value(p.value))
    });
    Row {
        timestamp,
        value,
        values: Some(series.points.iter().map(|p| formatter.point(p)).collect()),
        labels: series.labels,
    }
}

/// One shaped group row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupOutput {
    /// Dimension values in dimension order; absent labels are null.
    pub dimensions: Vec<Value>,
    /// Formatted aggregate values by key.
    pub aggregates: BTreeMap<String, Value>,
}

/// Shapes merged group rows.
#[must_use]
pub fn shape_groups(rows: Vec<GroupRow>, formatter: &ResultFormatter) -> Vec<GroupOutput> {
    rows.into_iter()
        .map(|row| GroupOutput {
            dimensions: row
                .dimensions
                .into_iter()
                .map(|d| d.map_or(Value::Null, Value::String))
                .collect(),
            aggregates: row
                .aggregates
                .into_iter()
                .map(|(key, value)| (key, formatter.optional_value(value)))
                .collect(),
        })
        .collect()
}

/// Shapes ungrouped aggregate values.
#[must_use]
pub fn shape_aggregates(
    values: BTreeMap<String, Option<f64>>,
    formatter: &ResultFormatter,
) -> BTreeMap<String, Value> {
    values
        .into_iter()
        .map(|(key, value)| (key, formatter.optional_value(value)))
        .collect()
}

/// The shaped output of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutput {
    /// Row results.
    Rows(Vec<Row>),
    /// Ungrouped aggregates.
    Aggregates(BTreeMap<String, Value>),
    /// Group rows.
    Groups(Vec<GroupOutput>),
}

impl QueryOutput {
    /// Returns the rows of a row result.
    #[must_use]
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Returns the number of rows, groups or aggregates.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Aggregates(values) => values.len(),
            Self::Groups(groups) => groups.len(),
        }
    }

    /// Returns true if there is nothing to return.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
