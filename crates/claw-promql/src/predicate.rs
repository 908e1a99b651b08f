//! Predicate model and decomposition.
//!
//! A collection predicate is an AND tree of comparisons. Decomposition
//! classifies every comparison by its target once:
//!
//! - `timestamp` bounds become the query's time selection
//! - `value` becomes the trailing scalar comparison
//! - anything else is a label constraint
//!
//! The same module extracts the post-fetch ordering from an ORDER BY clause.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::UnixTimeUnit;
use crate::error::{PromqlError, Result};
use crate::labels::{merge_constraints, LabelConstraint, LabelConstraintSet, LabelOperator};
use crate::sorting::{ColumnOrder, SortField};
use crate::time::parse_timestamp;

/// Name of the timestamp column.
pub const TIMESTAMP_COLUMN: &str = "timestamp";
/// Name of the value column.
pub const VALUE_COLUMN: &str = "value";
/// Name of the computed label-set column.
pub const LABELS_COLUMN: &str = "labels";
/// Name of the computed point-list column.
pub const VALUES_COLUMN: &str = "values";

/// One variable binding: variable name to JSON value.
pub type Variables = BTreeMap<String, Value>;

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ComparisonOperator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Nin,
    Regex,
    Nregex,
    Contains,
    NotContains,
    Icontains,
    NotIcontains,
    StartsWith,
    NotStartsWith,
    IstartsWith,
    NotIstartsWith,
    EndsWith,
    NotEndsWith,
    IendsWith,
    NotIendsWith,
}

impl ComparisonOperator {
    /// Returns the operator name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            other => match other.label_operator() {
                Some(op) => op.as_str(),
                None => "unknown",
            },
        }
    }

    /// Maps the operator to its label form, if labels support it.
    #[must_use]
    pub const fn label_operator(&self) -> Option<LabelOperator> {
        let op = match self {
            Self::Eq => LabelOperator::Eq,
            Self::Neq => LabelOperator::Neq,
            Self::In => LabelOperator::In,
            Self::Nin => LabelOperator::Nin,
            Self::Regex => LabelOperator::Regex,
            Self::Nregex => LabelOperator::Nregex,
            Self::Contains => LabelOperator::Contains,
            Self::NotContains => LabelOperator::NotContains,
            Self::Icontains => LabelOperator::Icontains,
            Self::NotIcontains => LabelOperator::NotIcontains,
            Self::StartsWith => LabelOperator::StartsWith,
            Self::NotStartsWith => LabelOperator::NotStartsWith,
            Self::IstartsWith => LabelOperator::IstartsWith,
            Self::NotIstartsWith => LabelOperator::NotIstartsWith,
            Self::EndsWith => LabelOperator::EndsWith,
            Self::NotEndsWith => LabelOperator::NotEndsWith,
            Self::IendsWith => LabelOperator::IendsWith,
            Self::NotIendsWith => LabelOperator::NotIendsWith,
            Self::Lt | Self::Lte | Self::Gt | Self::Gte => return None,
        };
        Some(op)
    }

    /// Maps the operator to a `PromQL` scalar comparison, if it has one.
    #[must_use]
    pub const fn value_operator(&self) -> Option<ValueOperator> {
        match self {
            Self::Eq => Some(ValueOperator::Eq),
            Self::Neq => Some(ValueOperator::Neq),
            Self::Lt => Some(ValueOperator::Lt),
            Self::Lte => Some(ValueOperator::Lte),
            Self::Gt => Some(ValueOperator::Gt),
            Self::Gte => Some(ValueOperator::Gte),
            _ => None,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `PromQL` comparison operators between a vector and a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOperator {
    /// `==`
    Eq,
    /// `!=`
    Neq,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
}

impl ValueOperator {
    /// Returns the `PromQL` symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    /// Evaluates `left OP right`. Any comparison with NaN is false except `!=`.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn evaluate(&self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Neq => left != right,
            Self::Lt => left < right,
            Self::Lte => left <= right,
            Self::Gt => left > right,
            Self::Gte => left >= right,
        }
    }
}

/// Unary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryComparisonOperator {
    /// The column has no value.
    IsNull,
}

/// Right-hand side of a binary comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComparisonValue {
    /// A literal JSON value.
    Scalar {
        /// The value.
        value: Value,
    },
    /// A reference to a variable of the current binding.
    Variable {
        /// Variable name.
        name: String,
    },
}

impl ComparisonValue {
    /// Creates a literal comparison value.
    #[must_use]
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar {
            value: value.into(),
        }
    }

    /// Creates a variable reference.
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable { name: name.into() }
    }

    /// Resolves the value against a variable binding.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::UnboundVariable`] if the variable is not bound.
    pub fn resolve<'a>(&'a self, variables: &'a Variables) -> Result<&'a Value> {
        match self {
            Self::Scalar { value } => Ok(value),
            Self::Variable { name } => variables
                .get(name)
                .ok_or_else(|| PromqlError::UnboundVariable(name.clone())),
        }
    }
}

/// A predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    /// All sub-expressions hold.
    And {
        /// Conjuncts.
        expressions: Vec<Expression>,
    },
    /// At least one sub-expression holds.
    Or {
        /// Disjuncts.
        expressions: Vec<Expression>,
    },
    /// The sub-expression does not hold.
    Not {
        /// Negated expression.
        expression: Box<Expression>,
    },
    /// A unary test on a column.
    UnaryComparisonOperator {
        /// Target column.
        column: String,
        /// Operator.
        operator: UnaryComparisonOperator,
    },
    /// A binary comparison between a column and a value.
    BinaryComparisonOperator {
        /// Target column.
        column: String,
        /// Operator.
        operator: ComparisonOperator,
        /// Right-hand side.
        value: ComparisonValue,
    },
}

impl Expression {
    /// Builds a conjunction.
    #[must_use]
    pub const fn and(expressions: Vec<Self>) -> Self {
        Self::And { expressions }
    }

    /// Builds a disjunction.
    #[must_use]
    pub const fn or(expressions: Vec<Self>) -> Self {
        Self::Or { expressions }
    }

    /// Builds a negation.
    #[must_use]
    pub fn not(expression: Self) -> Self {
        Self::Not {
            expression: Box::new(expression),
        }
    }

    /// Builds a binary comparison against a literal.
    #[must_use]
    pub fn compare(column: impl Into<String>, operator: ComparisonOperator, value: impl Into<Value>) -> Self {
        Self::BinaryComparisonOperator {
            column: column.into(),
            operator,
            value: ComparisonValue::scalar(value),
        }
    }

    /// Builds a binary comparison against a variable.
    #[must_use]
    pub fn compare_variable(
        column: impl Into<String>,
        operator: ComparisonOperator,
        variable: impl Into<String>,
    ) -> Self {
        Self::BinaryComparisonOperator {
            column: column.into(),
            operator,
            value: ComparisonValue::variable(variable),
        }
    }

    /// Builds an `is_null` test.
    #[must_use]
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::UnaryComparisonOperator {
            column: column.into(),
            operator: UnaryComparisonOperator::IsNull,
        }
    }
}

/// The target of a comparison, resolved once from its column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonTarget {
    /// The sample timestamp.
    Timestamp,
    /// The sample value.
    Value,
    /// A label.
    Label(String),
}

impl ComparisonTarget {
    /// Classifies a column name.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::UnsupportedPredicate`] for the computed
    /// `labels` and `values` columns.
    pub fn from_column(column: &str) -> Result<Self> {
        match column {
            TIMESTAMP_COLUMN => Ok(Self::Timestamp),
            VALUE_COLUMN => Ok(Self::Value),
            LABELS_COLUMN | VALUES_COLUMN => Err(PromqlError::UnsupportedPredicate {
                reason: format!("cannot compare the computed column `{column}`"),
            }),
            label => Ok(Self::Label(label.to_string())),
        }
    }
}

/// The trailing scalar comparison of a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueComparison {
    /// The operator.
    pub operator: ValueOperator,
    /// The scalar operand.
    pub value: f64,
}

/// A decomposed collection predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposition {
    /// Instant requested with `timestamp eq`.
    pub timestamp: Option<DateTime<Utc>>,
    /// Range start from `timestamp gt|gte`.
    pub start: Option<DateTime<Utc>>,
    /// Range end from `timestamp lt|lte`.
    pub end: Option<DateTime<Utc>>,
    /// The single value comparison.
    pub value: Option<ValueComparison>,
    /// Constraints per label, in predicate order.
    pub labels: BTreeMap<String, Vec<LabelConstraint>>,
}

impl Decomposition {
    /// Walks an AND-only predicate.
    ///
    /// # Errors
    ///
    /// Returns an error for OR/NOT nodes, for a timestamp or value bound set
    /// twice, for operators the target does not support, and for values of the
    /// wrong shape.
    pub fn from_predicate(
        predicate: Option<&Expression>,
        variables: &Variables,
        unit: UnixTimeUnit,
    ) -> Result<Self> {
        let mut out = Self::default();
        if let Some(expression) = predicate {
            out.visit(expression, variables, unit)?;
        }
        Ok(out)
    }

    fn visit(&mut self, expression: &Expression, variables: &Variables, unit: UnixTimeUnit) -> Result<()> {
        match expression {
            Expression::And { expressions } => {
                for child in expressions {
                    self.visit(child, variables, unit)?;
                }
                Ok(())
            }
            Expression::Or { .. } => Err(PromqlError::UnsupportedPredicate {
                reason: "OR is only supported on native queries".to_string(),
            }),
            Expression::Not { .. } => Err(PromqlError::UnsupportedPredicate {
                reason: "NOT is only supported on native queries".to_string(),
            }),
            Expression::UnaryComparisonOperator { column, operator } => {
                match ComparisonTarget::from_column(column)? {
                    ComparisonTarget::Label(label) => {
                        self.labels
                            .entry(label)
                            .or_default()
                            .push(LabelConstraint::eq(""));
                        Ok(())
                    }
                    _ => Err(PromqlError::UnsupportedComparison {
                        target: column.clone(),
                        operator: unary_name(*operator).to_string(),
                    }),
                }
            }
            Expression::BinaryComparisonOperator {
                column,
                operator,
                value,
            } => {
                let value = value.resolve(variables)?;
                match ComparisonTarget::from_column(column)? {
                    ComparisonTarget::Timestamp => self.push_timestamp(*operator, value, unit),
                    ComparisonTarget::Value => self.push_value(*operator, value),
                    ComparisonTarget::Label(label) => {
                        let constraint = label_constraint(&label, *operator, value)?;
                        self.labels.entry(label).or_default().push(constraint);
                        Ok(())
                    }
                }
            }
        }
    }

    fn push_timestamp(&mut self, operator: ComparisonOperator, value: &Value, unit: UnixTimeUnit) -> Result<()> {
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
        *slot = Some(parse_timestamp(TIMESTAMP_COLUMN, value, unit)?);
        Ok(())
    }

    fn push_value(&mut self, operator: ComparisonOperator, value: &Value) -> Result<()> {
        let op = operator
            .value_operator()
            .ok_or_else(|| PromqlError::UnsupportedComparison {
                target: VALUE_COLUMN.to_string(),
                operator: operator.to_string(),
            })?;
        if self.value.is_some() {
            return Err(PromqlError::DuplicatePredicate { field: "value" });
        }
        self.value = Some(ValueComparison {
            operator: op,
            value: number_value(VALUE_COLUMN, value)?,
        });
        Ok(())
    }

    /// Merges the label constraints.
    ///
    /// Returns `Ok(None)` when any label's constraints are unsatisfiable.
    ///
    /// # Errors
    ///
    /// Propagates regex compilation errors from the merge.
    pub fn merged_labels(&self) -> Result<Option<BTreeMap<String, LabelConstraintSet>>> {
        let mut merged = BTreeMap::new();
        for (label, constraints) in &self.labels {
            match merge_constraints(label, constraints)? {
                Some(set) => {
                    merged.insert(label.clone(), set);
                }
                None => return Ok(None),
            }
        }
        Ok(Some(merged))
    }
}

const fn unary_name(operator: UnaryComparisonOperator) -> &'static str {
    match operator {
        UnaryComparisonOperator::IsNull => "is_null",
    }
}

fn label_constraint(label: &str, operator: ComparisonOperator, value: &Value) -> Result<LabelConstraint> {
    let op = operator
        .label_operator()
        .ok_or_else(|| PromqlError::UnsupportedComparison {
            target: label.to_string(),
            operator: operator.to_string(),
        })?;
    let values = if op.takes_list() {
        string_list(label, value)?
    } else {
        vec![string_value(label, value)?]
    };
    Ok(LabelConstraint::new(op, values))
}

/// Reads a scalar as a label value.
pub(crate) fn string_value(field: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(PromqlError::invalid_value(
            field,
            format!("expected a string, got {other}"),
        )),
    }
}

/// Reads an array of scalars, or a single scalar, as label values.
pub(crate) fn string_list(field: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items.iter().map(|item| string_value(field, item)).collect(),
        Value::Null => Err(PromqlError::invalid_value(field, "expected an array, got null")),
        scalar => Ok(vec![string_value(field, scalar)?]),
    }
}

/// Reads a number, or a numeric string.
pub(crate) fn number_value(field: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| PromqlError::invalid_value(field, "number out of range")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| PromqlError::invalid_value(field, format!("expected a number, got {s:?}"))),
        other => Err(PromqlError::invalid_value(
            field,
            format!("expected a number, got {other}"),
        )),
    }
}

/// Direction of an ORDER BY element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Target of an ORDER BY element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderByTarget {
    /// A column, optionally with a path into an object column.
    Column {
        /// Column name.
        name: String,
        /// Path into the column. `labels` accepts a single label name.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        path: Vec<String>,
    },
    /// The row count of a relationship.
    StarCountAggregate,
    /// An aggregate over a relationship column.
    SingleColumnAggregate {
        /// Column name.
        column: String,
        /// Aggregate function.
        function: String,
    },
}

/// One ORDER BY element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByElement {
    /// Direction.
    #[serde(default)]
    pub order_direction: OrderDirection,
    /// Target.
    pub target: OrderByTarget,
}

impl OrderByElement {
    /// Orders by a column.
    #[must_use]
    pub fn column(name: impl Into<String>, order_direction: OrderDirection) -> Self {
        Self {
            order_direction,
            target: OrderByTarget::Column {
                name: name.into(),
                path: Vec::new(),
            },
        }
    }
}

/// Extracts the post-fetch ordering from ORDER BY elements.
///
/// # Errors
///
/// Returns [`PromqlError::UnsupportedOrderBy`] for computed columns and for
/// non-column targets.
pub fn extract_ordering(elements: &[OrderByElement]) -> Result<Vec<ColumnOrder>> {
    elements
        .iter()
        .map(|element| {
            let field = match &element.target {
                OrderByTarget::Column { name, path } => match (name.as_str(), path.as_slice()) {
                    (LABELS_COLUMN, [label]) => SortField::Label(label.clone()),
                    (LABELS_COLUMN | VALUES_COLUMN, _) => {
                        return Err(PromqlError::UnsupportedOrderBy {
                            reason: format!("cannot order by the computed column `{name}`"),
                        });
                    }
                    (_, [_, ..]) => {
                        return Err(PromqlError::UnsupportedOrderBy {
                            reason: format!("column `{name}` has no nested fields"),
                        });
                    }
                    (TIMESTAMP_COLUMN, []) => SortField::Timestamp,
                    (VALUE_COLUMN, []) => SortField::Value,
                    (label, []) => SortField::Label(label.to_string()),
                },
                OrderByTarget::StarCountAggregate | OrderByTarget::SingleColumnAggregate { .. } => {
                    return Err(PromqlError::UnsupportedOrderBy {
                        reason: "only columns can be ordered by".to_string(),
                    });
                }
            };
            Ok(ColumnOrder {
                field,
                descending: element.order_direction == OrderDirection::Desc,
            })
        })
        .collect()
}
