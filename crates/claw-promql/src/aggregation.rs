//! Aggregates, grouping and the histogram-quantile path.
//!
//! Every aggregate compiles to its own query over the same base expression.
//! Grouped results come back as one series per dimension tuple per aggregate
//! and are merged into [`GroupRow`]s keyed by the dimension values.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PromqlError, Result};
use crate::functions::{render_by, FunctionCall, FunctionArgs, PromFunction};
use crate::predicate::{TIMESTAMP_COLUMN, VALUE_COLUMN};
use crate::render::PromqlQuery;
use crate::types::QueryValue;

/// Bucket boundary label of classic histograms.
pub const BUCKET_LABEL: &str = "le";

/// Statistical aggregate over the value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum AggregateFunction {
    Sum,
    Min,
    Max,
    Avg,
    Stddev,
    Stdvar,
}

impl AggregateFunction {
    /// Returns the `PromQL` aggregation operator.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Stddev => "stddev",
            Self::Stdvar => "stdvar",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregateSpec {
    /// Number of series.
    StarCount,
    /// Number of series with the column, or of its distinct values.
    ColumnCount {
        /// Counted column.
        column: String,
        /// Count distinct values only.
        #[serde(default)]
        distinct: bool,
    },
    /// Statistical aggregate of a column.
    SingleColumn {
        /// Aggregated column. Only `value` is supported.
        column: String,
        /// Aggregate function.
        function: AggregateFunction,
    },
}

impl AggregateSpec {
    /// Returns true for counting aggregates, which report 0 on empty results.
    #[must_use]
    pub const fn is_count(&self) -> bool {
        matches!(self, Self::StarCount | Self::ColumnCount { .. })
    }

    /// Compiles the aggregate over `base`, grouped by `dimensions`.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::UnsupportedAggregate`] for statistical
    /// aggregates on a column other than `value`, and for distinct counts of
    /// `value` or `timestamp`.
    pub fn compile(&self, key: &str, base: &str, dimensions: &[String]) -> Result<String> {
        match self {
            Self::StarCount | Self::ColumnCount { distinct: false, .. } => {
                Ok(render_by("count", dimensions, base))
            }
            Self::ColumnCount {
                column,
                distinct: true,
            } => {
                if column == VALUE_COLUMN || column == TIMESTAMP_COLUMN {
                    return Err(PromqlError::UnsupportedAggregate {
                        key: key.to_string(),
                        reason: format!("`{column}` can only be counted, not counted distinct"),
                    });
                }
                let mut inner_by = dimensions.to_vec();
                if !inner_by.contains(column) {
                    inner_by.push(column.clone());
                }
                Ok(render_by(
                    "count",
                    dimensions,
                    &render_by("count", &inner_by, base),
                ))
            }
            Self::SingleColumn { column, function } => {
                if column != VALUE_COLUMN {
                    return Err(PromqlError::UnsupportedAggregate {
                        key: key.to_string(),
                        reason: format!("`{function}` is only supported on `{VALUE_COLUMN}`, not `{column}`"),
                    });
                }
                Ok(render_by(function.as_str(), dimensions, base))
            }
        }
    }
}

/// A requested grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Label names to group by, in order.
    pub dimensions: Vec<String>,
    /// Aggregates computed per group.
    #[serde(default)]
    pub aggregates: BTreeMap<String, AggregateSpec>,
    /// Compute this quantile over histogram buckets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram_quantile: Option<f64>,
    /// Limit on group rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Offset into group rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl GroupSpec {
    /// Creates a grouping by `dimensions`.
    #[must_use]
    pub fn new<I, S>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            aggregates: BTreeMap::new(),
            histogram_quantile: None,
            limit: None,
            offset: None,
        }
    }

    /// Adds an aggregate.
    #[must_use]
    pub fn with_aggregate(mut self, key: impl Into<String>, spec: AggregateSpec) -> Self {
        self.aggregates.insert(key.into(), spec);
        self
    }

    /// Computes a quantile over histogram buckets.
    #[must_use]
    pub const fn with_histogram_quantile(mut self, quantile: f64) -> Self {
        self.histogram_quantile = Some(quantile);
        self
    }

    /// Pages the group rows.
    #[must_use]
    pub const fn with_page(mut self, offset: Option<usize>, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// Compiles ungrouped aggregates over `base`.
///
/// # Errors
///
/// Propagates [`AggregateSpec::compile`] errors.
pub fn compile_aggregates(
    base: &str,
    aggregates: &BTreeMap<String, AggregateSpec>,
) -> Result<BTreeMap<String, String>> {
    aggregates
        .iter()
        .map(|(key, spec)| Ok((key.clone(), spec.compile(key, base, &[])?)))
        .collect()
}

/// Compiles group aggregates for `query`.
///
/// With a histogram quantile, the pipeline first takes
/// `rate(bucket[window])`, the grouping gains the `le` dimension and every
/// aggregate is wrapped in `histogram_quantile(q, ...)`.
///
/// # Errors
///
/// Returns [`PromqlError::UnsupportedGrouping`] without dimensions or
/// aggregates, [`PromqlError::OutOfRange`] for a quantile outside `[0, 1]`,
/// and propagates aggregate errors.
pub fn compile_groups(
    query: &PromqlQuery,
    groups: &GroupSpec,
    histogram_window: Duration,
) -> Result<BTreeMap<String, String>> {
    if groups.dimensions.is_empty() {
        return Err(PromqlError::UnsupportedGrouping {
            reason: "at least one dimension is required".to_string(),
        });
    }
    if groups.aggregates.is_empty() {
        return Err(PromqlError::UnsupportedGrouping {
            reason: "at least one aggregate is required".to_string(),
        });
    }
    if let Some(dimension) = groups
        .dimensions
        .iter()
        .find(|d| d.as_str() == VALUE_COLUMN || d.as_str() == TIMESTAMP_COLUMN)
    {
        return Err(PromqlError::UnsupportedGrouping {
            reason: format!("cannot group by `{dimension}`"),
        });
    }

    let Some(quantile) = groups.histogram_quantile else {
        let base = query.render();
        return groups
            .aggregates
            .iter()
            .map(|(key, spec)| Ok((key.clone(), spec.compile(key, &base, &groups.dimensions)?)))
            .collect();
    };

    let quantile_call = FunctionCall::new(PromFunction::HistogramQuantile, &serde_json::json!(quantile))?;
    let rate = FunctionCall {
        function: PromFunction::Rate,
        args: FunctionArgs::Range(histogram_window),
    };
    let base = query.clone().with_leading_function(rate).render();

    let mut dimensions = groups.dimensions.clone();
    if !dimensions.iter().any(|d| d == BUCKET_LABEL) {
        dimensions.push(BUCKET_LABEL.to_string());
    }

    groups
        .aggregates
        .iter()
        .map(|(key, spec)| {
            let aggregate = spec.compile(key, &base, &dimensions)?;
            Ok((key.clone(), quantile_call.render(&aggregate)))
        })
        .collect()
}

/// Reads an ungrouped aggregate result: the latest point of the first series.
///
/// Empty results report 0 for counts and `None` otherwise.
#[must_use]
pub fn aggregate_value(spec: &AggregateSpec, value: &QueryValue) -> Option<f64> {
    match value.latest().next() {
        Some((_, point)) => Some(point.value),
        None if spec.is_count() => Some(0.0),
        None => None,
    }
}

/// One merged group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRow {
    /// Dimension values in dimension order. Absent labels are `None`.
    pub dimensions: Vec<Option<String>>,
    /// Aggregate values by key.
    pub aggregates: BTreeMap<String, Option<f64>>,
}

/// Merges per-aggregate grouped results into one row per dimension tuple.
#[derive(Debug, Clone)]
pub struct GroupRowMerger<'a> {
    dimensions: &'a [String],
    aggregates: &'a BTreeMap<String, AggregateSpec>,
    rows: Vec<GroupRow>,
}

impl<'a> GroupRowMerger<'a> {
    /// Creates a merger for the given dimensions and aggregates.
    #[must_use]
    pub const fn new(dimensions: &'a [String], aggregates: &'a BTreeMap<String, AggregateSpec>) -> Self {
        Self {
            dimensions,
            aggregates,
            rows: Vec::new(),
        }
    }

    fn empty_aggregates(&self) -> BTreeMap<String, Option<f64>> {
        self.aggregates
            .iter()
            .map(|(key, spec)| (key.clone(), spec.is_count().then_some(0.0)))
            .collect()
    }

    /// Folds the result of aggregate `key` into the rows.
    pub fn merge(&mut self, key: &str, value: &QueryValue) {
        for (labels, point) in value.latest() {
            let dimensions: Vec<Option<String>> = self
                .dimensions
                .iter()
                .map(|d| labels.get(d).cloned())
                .collect();

            let index = match self.rows.iter().position(|row| row.dimensions == dimensions) {
                Some(index) => index,
                None => {
                    let aggregates = self.empty_aggregates();
                    self.rows.push(GroupRow {
                        dimensions,
                        aggregates,
                    });
                    self.rows.len() - 1
                }
            };
            self.rows[index]
                .aggregates
                .insert(key.to_string(), Some(point.value));
        }
    }

    /// Returns the merged rows in first-seen order.
    #[must_use]
    pub fn finish(self) -> Vec<GroupRow> {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Sample, Series};
    use serde_json::json;

    fn sum_value() -> AggregateSpec {
        AggregateSpec::SingleColumn {
            column: "value".to_string(),
            function: AggregateFunction::Sum,
        }
    }

    mod compile_tests {
        use super::*;

        #[test]
        fn star_count() {
            let query = AggregateSpec::StarCount.compile("n", "up", &[]).unwrap();
            assert_eq!(query, "count(up)");
        }

        #[test]
        fn grouped_statistical_aggregate() {
            let dims = vec!["job".to_string()];
            let query = sum_value().compile("total", "up > 0.000000", &dims).unwrap();
            assert_eq!(query, "sum by (job) (up > 0.000000)");
        }

        #[test]
        fn distinct_label_count() {
            let spec = AggregateSpec::ColumnCount {
                column: "instance".to_string(),
                distinct: true,
            };
            assert_eq!(
                spec.compile("n", "up", &[]).unwrap(),
                "count(count by (instance) (up))"
            );
            let dims = vec!["job".to_string()];
            assert_eq!(
                spec.compile("n", "up", &dims).unwrap(),
                "count by (job) (count by (job, instance) (up))"
            );
        }

        #[test]
        fn value_column_count() {
            let plain = AggregateSpec::ColumnCount {
                column: "value".to_string(),
                distinct: false,
            };
            assert_eq!(plain.compile("n", "up", &[]).unwrap(), "count(up)");

            let distinct = AggregateSpec::ColumnCount {
                column: "value".to_string(),
                distinct: true,
            };
            assert!(matches!(
                distinct.compile("n", "up", &[]),
                Err(PromqlError::UnsupportedAggregate { .. })
            ));
        }

        #[test]
        fn statistical_aggregate_on_label_is_rejected() {
            let spec = AggregateSpec::SingleColumn {
                column: "job".to_string(),
                function: AggregateFunction::Max,
            };
            let err = spec.compile("top", "up", &[]).unwrap_err();
            assert!(err.to_string().contains("`top`"));
        }

        #[test]
        fn range_function_then_grouping() {
            let query = PromqlQuery::new("m")
                .with_pipeline(FunctionCall::parse_pipeline(&json!([{"increase": "5m"}])).unwrap());
            let groups = GroupSpec::new(["job", "instance"]).with_aggregate("total", sum_value());

            let compiled = compile_groups(&query, &groups, Duration::from_secs(60)).unwrap();
            assert_eq!(compiled["total"], "sum by (job, instance) (increase(m[5m]))");
        }

        #[test]
        fn histogram_quantile_appends_bucket_dimension() {
            let query = PromqlQuery::new("bucket_metric").with_matcher(r#"env="prod""#);
            let groups = GroupSpec::new(["job", "instance"])
                .with_aggregate("p95", sum_value())
                .with_histogram_quantile(0.95);

            let compiled = compile_groups(&query, &groups, Duration::from_secs(300)).unwrap();
            assert_eq!(
                compiled["p95"],
                r#"histogram_quantile(0.95, sum by (job, instance, le) (rate(bucket_metric{env="prod"}[5m])))"#
            );
        }

        #[test]
        fn histogram_quantile_out_of_range() {
            let groups = GroupSpec::new(["job"])
                .with_aggregate("p", sum_value())
                .with_histogram_quantile(1.5);
            let err = compile_groups(&PromqlQuery::new("m"), &groups, Duration::from_secs(300));
            assert!(matches!(err, Err(PromqlError::OutOfRange { .. })));
        }

        #[test]
        fn grouping_requires_dimensions_and_aggregates() {
            let query = PromqlQuery::new("m");
            let no_dims = GroupSpec::new(Vec::<String>::new()).with_aggregate("n", AggregateSpec::StarCount);
            assert!(compile_groups(&query, &no_dims, Duration::from_secs(60)).is_err());

            let no_aggs = GroupSpec::new(["job"]);
            assert!(compile_groups(&query, &no_aggs, Duration::from_secs(60)).is_err());

            let by_value = GroupSpec::new(["value"]).with_aggregate("n", AggregateSpec::StarCount);
            assert!(matches!(
                compile_groups(&query, &by_value, Duration::from_secs(60)),
                Err(PromqlError::UnsupportedGrouping { .. })
            ));
        }
    }

    mod merge_tests {
        use super::*;

        #[test]
        fn same_dimensions_update_one_row() {
            let dims = vec!["job".to_string()];
            let mut aggregates = BTreeMap::new();
            aggregates.insert("n".to_string(), AggregateSpec::StarCount);
            aggregates.insert("total".to_string(), sum_value());
            aggregates.insert("peak".to_string(), sum_value());

            let mut merger = GroupRowMerger::new(&dims, &aggregates);
            merger.merge(
                "n",
                &QueryValue::Matrix(vec![
                    Series::new().label("job", "api").point(1, 1.0).point(2, 3.0),
                    Series::new().label("job", "db").point(2, 1.0),
                ]),
            );
            merger.merge(
                "total",
                &QueryValue::Matrix(vec![Series::new().label("job", "api").point(2, 42.0)]),
            );

            let rows = merger.finish();
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].dimensions, vec![Some("api".to_string())]);
            assert_eq!(rows[0].aggregates["n"], Some(3.0));
            assert_eq!(rows[0].aggregates["total"], Some(42.0));
            assert_eq!(rows[0].aggregates["peak"], None);
            assert_eq!(rows[1].aggregates["total"], None);
        }

        #[test]
        fn missing_count_reports_zero() {
            let dims = vec!["job".to_string()];
            let mut aggregates = BTreeMap::new();
            aggregates.insert("n".to_string(), AggregateSpec::StarCount);
            aggregates.insert("total".to_string(), sum_value());

            let mut merger = GroupRowMerger::new(&dims, &aggregates);
            merger.merge(
                "total",
                &QueryValue::Vector(vec![Sample::new(0, 2.0)]),
            );
            let rows = merger.finish();
            assert_eq!(rows[0].dimensions, vec![None]);
            assert_eq!(rows[0].aggregates["n"], Some(0.0));
        }

        #[test]
        fn ungrouped_aggregate_values() {
            let empty = QueryValue::Vector(Vec::new());
            assert_eq!(aggregate_value(&AggregateSpec::StarCount, &empty), Some(0.0));
            assert_eq!(aggregate_value(&sum_value(), &empty), None);

            let one = QueryValue::Vector(vec![Sample::new(0, 7.0)]);
            assert_eq!(aggregate_value(&sum_value(), &one), Some(7.0));
        }
    }
}
