//! Native and raw `PromQL` queries.
//!
//! A native query is a `PromQL` template with `${name}` placeholders and
//! typed arguments. A raw query takes its template from the `query`
//! argument. Both accept full AND/OR/NOT predicates: timestamp bounds are
//! taken from the top-level conjunction, and every other comparison filters
//! returned series after the fetch.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::RuntimeSettings;
use crate::duration::{duration_from_value, format_range};
use crate::error::{PromqlError, Result};
use crate::labels::{compile_anchored, LabelConstraint, LabelOperator};
use crate::plan::{Argument, QUERY_KEY};
use crate::predicate::{
    extract_ordering, number_value, string_list, string_value, ComparisonOperator, ComparisonTarget,
    Expression, OrderByElement, ValueOperator, Variables, TIMESTAMP_COLUMN,
};
use crate::sorting::ColumnOrder;
use crate::time::{parse_timestamp, TimeSelection};
use crate::types::{Labels, QueryValue};

/// Arguments every native and raw query accepts.
pub const RESERVED_ARGUMENTS: &[&str] = &["start", "end", "time", "step", "timeout", "flat"];

/// Argument carrying the text of a raw query.
pub const RAW_QUERY_ARGUMENT: &str = "query";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|_| unreachable!()));

/// Type of a native query argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeArgumentType {
    /// Integer, written in decimal.
    Int64,
    /// Float, written in shortest decimal form.
    Float64,
    /// Duration, written in `PromQL` form (`5m`).
    Duration,
    /// String, written verbatim.
    String,
}

/// Declaration of one native query argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeArgument {
    /// Argument type.
    #[serde(rename = "type")]
    pub argument_type: NativeArgumentType,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A configured native query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeQueryTemplate {
    /// `PromQL` text with `${name}` placeholders.
    pub query: String,
    /// Declared arguments.
    #[serde(default)]
    pub arguments: BTreeMap<String, NativeArgument>,
}

impl NativeQueryTemplate {
    /// Creates a template without arguments.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            arguments: BTreeMap::new(),
        }
    }

    /// Declares an argument.
    #[must_use]
    pub fn with_argument(mut self, name: impl Into<String>, argument_type: NativeArgumentType) -> Self {
        self.arguments.insert(
            name.into(),
            NativeArgument {
                argument_type,
                description: None,
            },
        );
        self
    }
}

/// Converts an argument value to its template text.
///
/// # Errors
///
/// Returns [`PromqlError::InvalidArgument`] if the value does not have the
/// declared type.
pub fn coerce_argument(name: &str, argument_type: NativeArgumentType, value: &Value) -> Result<String> {
    let mismatch = |expected: &str| {
        PromqlError::invalid_argument(name, format!("expected {expected}, got {value}"))
    };
    match argument_type {
        NativeArgumentType::Int64 => match value {
            Value::Number(n) => n.as_i64().map(|i| i.to_string()).ok_or_else(|| mismatch("an integer")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| i.to_string())
                .map_err(|_| mismatch("an integer")),
            _ => Err(mismatch("an integer")),
        },
        NativeArgumentType::Float64 => number_value(name, value)
            .map(|f| f.to_string())
            .map_err(|_| mismatch("a number")),
        NativeArgumentType::Duration => duration_from_value(name, value).map(format_range),
        NativeArgumentType::String => string_value(name, value).map_err(|_| mismatch("a string")),
    }
}

/// Replaces every `${name}` in `template` with `values[name]`.
///
/// Substituted text is not scanned again.
///
/// # Errors
///
/// Returns [`PromqlError::UnresolvedPlaceholder`] naming every placeholder
/// without a value, in order of first appearance.
pub fn substitute(template: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut missing: Vec<String> = Vec::new();
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        values.get(name).cloned().unwrap_or_else(|| {
            if !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
            caps[0].to_string()
        })
    });
    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(PromqlError::UnresolvedPlaceholder { names: missing })
    }
}

/// A request against a native query, or a raw query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeQueryRequest {
    /// Template and reserved arguments.
    #[serde(default)]
    pub arguments: BTreeMap<String, Argument>,
    /// Predicate over timestamps, labels and the final value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Expression>,
    /// Post-fetch ordering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderByElement>,
    /// Maximum number of rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Rows to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl NativeQueryRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an argument.
    #[must_use]
    pub fn with_argument(mut self, name: impl Into<String>, argument: Argument) -> Self {
        self.arguments.insert(name.into(), argument);
        self
    }

    /// Sets the predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Expression) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Sets offset and limit.
    #[must_use]
    pub const fn with_page(mut self, offset: Option<usize>, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// Matcher of a single label in a post-fetch filter.
#[derive(Debug, Clone)]
enum LabelMatcher {
    Equal(String),
    NotEqual(String),
    AnyOf(Vec<String>),
    NoneOf(Vec<String>),
    Matches(Regex),
    NotMatches(Regex),
}

impl LabelMatcher {
    fn from_constraint(label: &str, constraint: &LabelConstraint) -> Result<Self> {
        let first = || constraint.values.first().cloned().unwrap_or_default();
        let matcher = match constraint.operator {
            LabelOperator::Eq => Self::Equal(first()),
            LabelOperator::Neq => Self::NotEqual(first()),
            LabelOperator::In => Self::AnyOf(constraint.values.clone()),
            LabelOperator::Nin => Self::NoneOf(constraint.values.clone()),
            op => {
                let source = constraint.regex_source().unwrap_or_default();
                let re = compile_anchored(label, &source)?;
                if op.is_negative() {
                    Self::NotMatches(re)
                } else {
                    Self::Matches(re)
                }
            }
        };
        Ok(matcher)
    }

    /// Absent labels match as the empty string.
    fn matches(&self, value: Option<&str>) -> bool {
        let value = value.unwrap_or("");
        match self {
            Self::Equal(v) => value == v,
            Self::NotEqual(v) => value != v,
            Self::AnyOf(vs) => vs.iter().any(|v| v == value),
            Self::NoneOf(vs) => vs.iter().all(|v| v != value),
            Self::Matches(re) => re.is_match(value),
            Self::NotMatches(re) => !re.is_match(value),
        }
    }
}

/// A compiled post-fetch filter over series.
#[derive(Debug, Clone)]
pub struct SeriesFilter(FilterNode);

#[derive(Debug, Clone)]
enum FilterNode {
    All(Vec<FilterNode>),
    Any(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Label { label: String, matcher: LabelMatcher },
    Value { operator: ValueOperator, value: f64 },
}

impl FilterNode {
    fn matches(&self, labels: &Labels, value: Option<f64>) -> bool {
        match self {
            Self::All(nodes) => nodes.iter().all(|n| n.matches(labels, value)),
            Self::Any(nodes) => nodes.iter().any(|n| n.matches(labels, value)),
            Self::Not(node) => !node.matches(labels, value),
            Self::Label { label, matcher } => matcher.matches(labels.get(label).map(String::as_str)),
            Self::Value { operator, value: rhs } => value.is_some_and(|v| operator.evaluate(v, *rhs)),
        }
    }
}

impl SeriesFilter {
    /// Returns true if a series with `labels` and final `value` passes.
    #[must_use]
    pub fn matches(&self, labels: &Labels, value: Option<f64>) -> bool {
        self.0.matches(labels, value)
    }

    /// Keeps the series that pass. Matrix series are judged by their last point.
    #[must_use]
    pub fn apply(&self, value: QueryValue) -> QueryValue {
        match value {
            QueryValue::Vector(mut samples) => {
                samples.retain(|s| self.matches(&s.labels, Some(s.point.value)));
                QueryValue::Vector(samples)
            }
            QueryValue::Matrix(mut series) => {
                series.retain(|s| self.matches(&s.labels, s.last_point().map(|p| p.value)));
                QueryValue::Matrix(series)
            }
        }
    }
}

/// Timestamp bounds and residual filter of a native predicate.
#[derive(Debug, Clone, Default)]
pub struct NativePredicate {
    /// Instant from `timestamp eq`.
    pub timestamp: Option<DateTime<Utc>>,
    /// Start from `timestamp gt|gte`.
    pub start: Option<DateTime<Utc>>,
    /// End from `timestamp lt|lte`.
    pub end: Option<DateTime<Utc>>,
    /// Post-fetch filter, if anything besides timestamps was compared.
    pub filter: Option<SeriesFilter>,
}

impl NativePredicate {
    /// Splits a predicate into timestamp bounds and a post-fetch filter.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::UnsupportedPredicate`] for a timestamp comparison
    /// under OR/NOT, [`PromqlError::DuplicatePredicate`] for a bound set twice,
    /// and comparison errors for unsupported operators or malformed values.
    pub fn from_expression(
        predicate: Option<&Expression>,
        variables: &Variables,
        settings: &RuntimeSettings,
    ) -> Result<Self> {
        let mut out = Self::default();
        let Some(expression) = predicate else {
            return Ok(out);
        };

        let mut conjuncts = Vec::new();
        flatten_and(expression, &mut conjuncts);

        let mut residual = Vec::new();
        for conjunct in conjuncts {
            if let Expression::BinaryComparisonOperator {
                column,
                operator,
                value,
            } = conjunct
            {
                if column == TIMESTAMP_COLUMN {
                    let value = parse_timestamp(TIMESTAMP_COLUMN, value.resolve(variables)?, settings.unix_time_unit)?;
                    out.push_bound(*operator, value)?;
                    continue;
                }
            }
            residual.push(compile_filter(conjunct, variables)?);
        }

        if !residual.is_empty() {
            out.filter = Some(SeriesFilter(FilterNode::All(residual)));
        }
        Ok(out)
    }

    fn push_bound(&mut self, operator: ComparisonOperator, value: DateTime<Utc>) -> Result<()> {
        let (slot, field) = match operator {
            ComparisonOperator::Eq => (&mut self.timestamp, "timestamp"),
            ComparisonOperator::Lt | ComparisonOperator::Lte => (&mut self.end, "end"),
            ComparisonOperator::Gt | ComparisonOperator::Gte => (&mut self.start, "start"),
            other => {
                return Err(PromqlError::UnsupportedComparison {
                    target: TIMESTAMP_COLUMN.to_string(),
                    operator: other.to_string(),
                });
            }
        };
        if slot.is_some() {
            return Err(PromqlError::DuplicatePredicate { field });
        }
        *slot = Some(value);
        Ok(())
    }
}

fn flatten_and<'a>(expression: &'a Expression, out: &mut Vec<&'a Expression>) {
    match expression {
        Expression::And { expressions } => {
            for child in expressions {
                flatten_and(child, out);
            }
        }
        other => out.push(other),
    }
}

fn compile_filter(expression: &Expression, variables: &Variables) -> Result<FilterNode> {
    match expression {
        Expression::And { expressions } => Ok(FilterNode::All(
            expressions
                .iter()
                .map(|e| compile_filter(e, variables))
                .collect::<Result<_>>()?,
        )),
        Expression::Or { expressions } => Ok(FilterNode::Any(
            expressions
                .iter()
                .map(|e| compile_filter(e, variables))
                .collect::<Result<_>>()?,
        )),
        Expression::Not { expression } => Ok(FilterNode::Not(Box::new(compile_filter(expression, variables)?))),
        Expression::UnaryComparisonOperator { column, .. } => match ComparisonTarget::from_column(column)? {
            ComparisonTarget::Label(label) => Ok(FilterNode::Label {
                label,
                matcher: LabelMatcher::Equal(String::new()),
            }),
            _ => Err(PromqlError::UnsupportedComparison {
                target: column.clone(),
                operator: "is_null".to_string(),
            }),
        },
        Expression::BinaryComparisonOperator {
            column,
            operator,
            value,
        } => {
            let value = value.resolve(variables)?;
            match ComparisonTarget::from_column(column)? {
                ComparisonTarget::Timestamp => Err(PromqlError::UnsupportedPredicate {
                    reason: "timestamp comparisons are only supported in the top-level conjunction"
                        .to_string(),
                }),
                ComparisonTarget::Value => {
                    let op = operator
                        .value_operator()
                        .ok_or_else(|| PromqlError::UnsupportedComparison {
                            target: column.clone(),
                            operator: operator.to_string(),
                        })?;
                    Ok(FilterNode::Value {
                        operator: op,
                        value: number_value(column, value)?,
                    })
                }
                ComparisonTarget::Label(label) => {
                    let op = operator
                        .label_operator()
                        .ok_or_else(|| PromqlError::UnsupportedComparison {
                            target: label.clone(),
                            operator: operator.to_string(),
                        })?;
                    let values = if op.takes_list() {
                        string_list(&label, value)?
                    } else {
                        vec![string_value(&label, value)?]
                    };
                    let matcher = LabelMatcher::from_constraint(&label, &LabelConstraint::new(op, values))?;
                    Ok(FilterNode::Label { label, matcher })
                }
            }
        }
    }
}

/// A compiled native or raw query.
#[derive(Debug, Clone)]
pub struct NativePlan {
    /// Query text after substitution.
    pub query: String,
    /// Instant or range evaluation.
    pub time: TimeSelection,
    /// Client timeout.
    pub timeout: Option<Duration>,
    /// One row per point instead of one row per series.
    pub flat: bool,
    /// Post-fetch filter.
    pub filter: Option<SeriesFilter>,
    /// Post-fetch ordering.
    pub order_by: Vec<ColumnOrder>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: Option<usize>,
}

impl NativePlan {
    /// The compiled query, keyed by `query`.
    #[must_use]
    pub fn explain(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(QUERY_KEY.to_string(), self.query.clone())])
    }
}

#[derive(Default)]
struct ReservedArguments {
    time: Option<DateTime<Utc>>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    step: Option<Duration>,
    timeout: Option<Duration>,
    flat: Option<bool>,
}

impl ReservedArguments {
    fn set(&mut self, name: &str, value: &Value, settings: &RuntimeSettings) -> Result<()> {
        let unit = settings.unix_time_unit;
        match name {
            "time" => self.time = Some(parse_timestamp(name, value, unit)?),
            "start" => self.start = Some(parse_timestamp(name, value, unit)?),
            "end" => self.end = Some(parse_timestamp(name, value, unit)?),
            "step" => self.step = Some(duration_from_value(name, value)?),
            "timeout" => self.timeout = Some(duration_from_value(name, value)?),
            "flat" => {
                self.flat = Some(value.as_bool().ok_or_else(|| {
                    PromqlError::invalid_argument(name, format!("expected a boolean, got {value}"))
                })?);
            }
            _ => return Err(PromqlError::UnknownArgument(name.to_string())),
        }
        Ok(())
    }
}

fn merge_bound(
    argument: Option<DateTime<Utc>>,
    predicate: Option<DateTime<Utc>>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>> {
    match (argument, predicate) {
        (Some(_), Some(_)) => Err(PromqlError::DuplicatePredicate { field }),
        (a, p) => Ok(a.or(p)),
    }
}

/// Compiles a native query (`template` is `Some`) or a raw query.
///
/// # Errors
///
/// Returns [`PromqlError::UnknownArgument`] for undeclared arguments,
/// [`PromqlError::MissingField`] for a raw query without `query`,
/// [`PromqlError::UnresolvedPlaceholder`] for placeholders left after
/// substitution, and predicate errors.
pub fn compile_native(
    template: Option<&NativeQueryTemplate>,
    request: &NativeQueryRequest,
    variables: &Variables,
    settings: &RuntimeSettings,
    now: DateTime<Utc>,
) -> Result<NativePlan> {
    let mut reserved = ReservedArguments::default();
    let mut substitutions = BTreeMap::new();
    let mut raw_query: Option<String> = None;

    for (name, argument) in &request.arguments {
        let is_reserved = RESERVED_ARGUMENTS.contains(&name.as_str());
        let declared = match template {
            _ if is_reserved => None,
            Some(template) => Some(
                template
                    .arguments
                    .get(name)
                    .ok_or_else(|| PromqlError::UnknownArgument(name.clone()))?,
            ),
            None if name == RAW_QUERY_ARGUMENT => None,
            None => return Err(PromqlError::UnknownArgument(name.clone())),
        };

        let value = argument.resolve(variables)?;
        if value.is_null() {
            continue;
        }
        if is_reserved {
            reserved.set(name, value, settings)?;
            continue;
        }
        match declared {
            Some(declared) => {
                substitutions.insert(
                    name.clone(),
                    coerce_argument(name, declared.argument_type, value)?,
                );
            }
            None => raw_query = Some(string_value(name, value)?),
        }
    }

    let query = match template {
        Some(template) => substitute(&template.query, &substitutions)?,
        None => {
            let text = raw_query.ok_or_else(|| PromqlError::MissingField {
                name: "promql_query".to_string(),
                field: RAW_QUERY_ARGUMENT,
            })?;
            substitute(&text, &substitutions)?
        }
    };

    let predicate = NativePredicate::from_expression(request.predicate.as_ref(), variables, settings)?;
    let time = TimeSelection::resolve(
        merge_bound(reserved.time, predicate.timestamp, "timestamp")?,
        merge_bound(reserved.start, predicate.start, "start")?,
        merge_bound(reserved.end, predicate.end, "end")?,
        reserved.step,
        now,
    )?;

    debug!(query = %query, instant = time.is_instant(), "compiled native query");
    Ok(NativePlan {
        query,
        time,
        timeout: reserved.timeout.or(settings.default_timeout),
        flat: reserved.flat.unwrap_or(settings.flat),
        filter: predicate.filter,
        order_by: extract_ordering(&request.order_by)?,
        limit: request.limit,
        offset: request.offset,
    })
}
