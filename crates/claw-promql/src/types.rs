//! Core types shared by the compiler, the execution client and the shaper.
//!
//! - [`Labels`]: the immutable label set of a series
//! - [`Point`]: a single `(timestamp, value)` pair
//! - [`Sample`]: one point of an instant-query Vector
//! - [`Series`]: one series of a range-query Matrix
//! - [`QueryValue`]: the Vector/Matrix result of an execution

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label set of a series, ordered by label name.
pub type Labels = BTreeMap<String, String>;

/// Name of the label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single data point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// The sample value.
    pub value: f64,
}

impl Point {
    /// Creates a new point.
    #[must_use]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// One element of an instant-query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Label set of the series the point belongs to.
    pub labels: Labels,
    /// The point itself.
    pub point: Point,
}

impl Sample {
    /// Creates a sample with no labels.
    #[must_use]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self {
            labels: Labels::new(),
            point: Point::new(timestamp, value),
        }
    }

    /// Adds a label and returns self for chaining.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// One element of a range-query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Label set of the series.
    pub labels: Labels,
    /// Points in ascending timestamp order.
    pub points: Vec<Point>,
}

impl Series {
    /// Creates an empty series with no labels.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            labels: Labels::new(),
            points: Vec::new(),
        }
    }

    /// Adds a label and returns self for chaining.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Appends a point and returns self for chaining.
    #[must_use]
    pub fn point(mut self, timestamp: i64, value: f64) -> Self {
        self.points.push(Point::new(timestamp, value));
        self
    }

    /// Returns the most recent point, if any.
    #[must_use]
    pub fn last_point(&self) -> Option<&Point> {
        self.points.last()
    }
}

impl Default for Series {
    fn default() -> Self {
        Self::new()
    }
}

/// The value returned by the execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryValue {
    /// Instant-query result: one point per series.
    Vector(Vec<Sample>),
    /// Range-query result: an ordered list of points per series.
    Matrix(Vec<Series>),
}

impl QueryValue {
    /// Returns the number of series in the result.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Vector(samples) => samples.len(),
            Self::Matrix(series) => series.len(),
        }
    }

    /// Returns true if the result contains no series.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over `(labels, last point)` for every series.
    ///
    /// Matrix series without points are skipped.
    pub fn latest(&self) -> Box<dyn Iterator<Item = (&Labels, &Point)> + '_> {
        match self {
            Self::Vector(samples) => Box::new(samples.iter().map(|s| (&s.labels, &s.point))),
            Self::Matrix(series) => Box::new(
                series
                    .iter()
                    .filter_map(|s| s.last_point().map(|p| (&s.labels, p))),
            ),
        }
    }
}

/// A response from the execution client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// The returned series.
    pub value: QueryValue,
    /// Advisory, non-fatal warnings.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ClientResponse {
    /// Creates a response without warnings.
    #[must_use]
    pub const fn new(value: QueryValue) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    /// Adds a warning and returns self for chaining.
    #[must_use]
    pub fn warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_builder_keeps_point_order() {
        let series = Series::new()
            .label("job", "api")
            .point(1000, 1.0)
            .point(2000, 2.0);

        assert_eq!(series.labels.get("job").map(String::as_str), Some("api"));
        assert_eq!(series.points.len(), 2);
        assert_eq!(series.last_point().map(|p| p.timestamp), Some(2000));
    }

    #[test]
    fn latest_skips_empty_matrix_series() {
        let value = QueryValue::Matrix(vec![
            Series::new().label("a", "1"),
            Series::new().label("a", "2").point(10, 3.0),
        ]);

        let latest: Vec<_> = value.latest().collect();
        assert_eq!(latest.len(), 1);
        assert!((latest[0].1.value - 3.0).abs() < f64::EPSILON);
        assert_eq!(value.len(), 2);
    }

    #[test]
    fn query_value_json_shape() {
        let value = QueryValue::Vector(vec![Sample::new(1000, 1.5).label("job", "api")]);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["resultType"], "vector");
        assert_eq!(json["result"][0]["labels"]["job"], "api");
    }
}
