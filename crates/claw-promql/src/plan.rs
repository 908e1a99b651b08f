//! Request model and query planning.
//!
//! [`compile`] turns a [`CollectionRequest`] and one variable binding into a
//! [`QueryPlan`]: the compiled query text, the time selection and everything
//! the shaper needs afterwards. A plan with `ok == false` was proven empty and
//! must not be executed.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::aggregation::{compile_aggregates, compile_groups, AggregateSpec, GroupSpec};
use crate::config::RuntimeSettings;
use crate::duration::duration_from_value;
use crate::error::{PromqlError, Result};
use crate::functions::FunctionCall;
use crate::predicate::{extract_ordering, Decomposition, Expression, OrderByElement, Variables};
use crate::render::PromqlQuery;
use crate::sorting::ColumnOrder;
use crate::time::TimeSelection;

/// Range of the bucket rate in histogram-quantile groupings of instant queries.
pub const DEFAULT_HISTOGRAM_WINDOW: Duration = Duration::from_secs(300);

/// Arguments a collection request accepts.
pub const COLLECTION_ARGUMENTS: &[&str] = &["step", "offset", "timeout", "fn", "flat"];

/// Key of the single query of a row plan in [`QueryPlan::explain`].
pub const QUERY_KEY: &str = "query";

/// A request argument: a literal or a variable reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Argument {
    /// A literal JSON value.
    Literal {
        /// The value.
        value: Value,
    },
    /// A variable of the current binding.
    Variable {
        /// Variable name.
        name: String,
    },
}

impl Argument {
    /// Creates a literal argument.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    /// Creates a variable argument.
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable { name: name.into() }
    }

    /// Resolves the argument against a variable binding.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::UnboundVariable`] if the variable is not bound.
    pub fn resolve<'a>(&'a self, variables: &'a Variables) -> Result<&'a Value> {
        match self {
            Self::Literal { value } => Ok(value),
            Self::Variable { name } => variables
                .get(name)
                .ok_or_else(|| PromqlError::UnboundVariable(name.clone())),
        }
    }
}

/// A query against a metric collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRequest {
    /// Metric name.
    pub collection: String,
    /// Named arguments: `step`, `offset`, `timeout`, `fn` and `flat`.
    #[serde(default)]
    pub arguments: BTreeMap<String, Argument>,
    /// Row predicate.
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
    /// Ungrouped aggregates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aggregates: BTreeMap<String, AggregateSpec>,
    /// Grouping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<GroupSpec>,
}

impl CollectionRequest {
    /// Creates a request returning every series of `collection`.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            arguments: BTreeMap::new(),
            predicate: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            aggregates: BTreeMap::new(),
            groups: None,
        }
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

    /// Appends an ORDER BY element.
    #[must_use]
    pub fn with_order_by(mut self, element: OrderByElement) -> Self {
        self.order_by.push(element);
        self
    }

    /// Sets offset and limit.
    #[must_use]
    pub const fn with_page(mut self, offset: Option<usize>, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    /// Adds an ungrouped aggregate.
    #[must_use]
    pub fn with_aggregate(mut self, key: impl Into<String>, spec: AggregateSpec) -> Self {
        self.aggregates.insert(key.into(), spec);
        self
    }

    /// Sets the grouping.
    #[must_use]
    pub fn with_groups(mut self, groups: GroupSpec) -> Self {
        self.groups = Some(groups);
        self
    }
}

/// Collection arguments after variable resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedArguments {
    /// Range query resolution.
    pub step: Option<Duration>,
    /// Offset modifier.
    pub offset: Option<Duration>,
    /// Client timeout.
    pub timeout: Option<Duration>,
    /// Function pipeline.
    pub pipeline: Vec<FunctionCall>,
    /// Result shape override.
    pub flat: Option<bool>,
}

impl ResolvedArguments {
    /// Resolves and validates collection arguments.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::UnknownArgument`] for an unrecognised name,
    /// [`PromqlError::UnboundVariable`] for an unbound variable, and the
    /// validation errors of each argument.
    pub fn resolve(arguments: &BTreeMap<String, Argument>, variables: &Variables) -> Result<Self> {
        let mut out = Self::default();
        for (name, argument) in arguments {
            if !COLLECTION_ARGUMENTS.contains(&name.as_str()) {
                return Err(PromqlError::UnknownArgument(name.clone()));
            }
            let value = argument.resolve(variables)?;
            if value.is_null() {
                continue;
            }
            match name.as_str() {
                "step" => out.step = Some(duration_from_value(name, value)?),
                "offset" => out.offset = Some(duration_from_value(name, value)?),
                "timeout" => out.timeout = Some(duration_from_value(name, value)?),
                "fn" => out.pipeline = FunctionCall::parse_pipeline(value)?,
                "flat" => {
                    out.flat = Some(value.as_bool().ok_or_else(|| {
                        PromqlError::invalid_argument(name, format!("expected a boolean, got {value}"))
                    })?);
                }
                _ => return Err(PromqlError::UnknownArgument(name.clone())),
            }
        }
        Ok(out)
    }
}

/// What a plan computes.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanKind {
    /// One row per series or per point.
    Rows {
        /// Compiled query text. Empty when the plan is unsatisfiable.
        query: String,
    },
    /// One row of ungrouped aggregates.
    Aggregates {
        /// Compiled query per aggregate key. Empty when unsatisfiable.
        queries: BTreeMap<String, String>,
        /// The requested aggregates.
        specs: BTreeMap<String, AggregateSpec>,
    },
    /// One row per dimension tuple.
    Groups {
        /// Compiled query per aggregate key. Empty when unsatisfiable.
        queries: BTreeMap<String, String>,
        /// The requested grouping.
        spec: GroupSpec,
    },
}

/// A compiled request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// False when the predicate was proven unsatisfiable.
    pub ok: bool,
    /// What to compute.
    pub kind: PlanKind,
    /// Instant or range evaluation.
    pub time: TimeSelection,
    /// Client timeout.
    pub timeout: Option<Duration>,
    /// One row per point instead of one row per series.
    pub flat: bool,
    /// Post-fetch ordering.
    pub order_by: Vec<ColumnOrder>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: Option<usize>,
}

impl QueryPlan {
    /// Returns true unless the plan was proven to yield no rows.
    #[must_use]
    pub const fn ok(&self) -> bool {
        self.ok
    }

    /// Every compiled query, keyed by `query`, aggregate key or group aggregate key.
    #[must_use]
    pub fn explain(&self) -> BTreeMap<String, String> {
        if !self.ok {
            return BTreeMap::new();
        }
        match &self.kind {
            PlanKind::Rows { query } => BTreeMap::from([(QUERY_KEY.to_string(), query.clone())]),
            PlanKind::Aggregates { queries, .. } | PlanKind::Groups { queries, .. } => queries.clone(),
        }
    }
}

/// Compiles `request` for one variable binding.
///
/// # Errors
///
/// Returns an error for malformed requests. An unsatisfiable predicate is not
/// an error; it yields a plan with `ok == false`.
pub fn compile(
    request: &CollectionRequest,
    variables: &Variables,
    settings: &RuntimeSettings,
    now: DateTime<Utc>,
) -> Result<QueryPlan> {
    let arguments = ResolvedArguments::resolve(&request.arguments, variables)?;
    let decomposition = Decomposition::from_predicate(
        request.predicate.as_ref(),
        variables,
        settings.unix_time_unit,
    )?;
    let order_by = extract_ordering(&request.order_by)?;
    let time = TimeSelection::resolve(
        decomposition.timestamp,
        decomposition.start,
        decomposition.end,
        arguments.step,
        now,
    )?;
    let labels = decomposition.merged_labels()?;

    let mut plan = QueryPlan {
        ok: labels.is_some(),
        kind: PlanKind::Rows {
            query: String::new(),
        },
        time,
        timeout: arguments.timeout.or(settings.default_timeout),
        flat: arguments.flat.unwrap_or(settings.flat),
        order_by,
        limit: request.limit,
        offset: request.offset,
    };

    let Some(labels) = labels else {
        debug!(metric = %request.collection, "predicate is unsatisfiable, skipping execution");
        plan.kind = empty_kind(request);
        return Ok(plan);
    };

    let query = PromqlQuery::new(request.collection.as_str())
        .with_labels(&labels)
        .with_offset(arguments.offset)
        .with_pipeline(arguments.pipeline)
        .with_value_comparison(decomposition.value);

    plan.kind = if let Some(groups) = &request.groups {
        let window = time.step().unwrap_or(DEFAULT_HISTOGRAM_WINDOW);
        let queries = compile_groups(&query, groups, window)?;
        PlanKind::Groups {
            queries,
            spec: groups.clone(),
        }
    } else if !request.aggregates.is_empty() {
        PlanKind::Aggregates {
            queries: compile_aggregates(&query.render(), &request.aggregates)?,
            specs: request.aggregates.clone(),
        }
    } else {
        PlanKind::Rows {
            query: query.render(),
        }
    };

    for (key, text) in plan.explain() {
        debug!(metric = %request.collection, key = %key, query = %text, instant = plan.time.is_instant(), "compiled query");
    }
    Ok(plan)
}

fn empty_kind(request: &CollectionRequest) -> PlanKind {
    if let Some(groups) = &request.groups {
        PlanKind::Groups {
            queries: BTreeMap::new(),
            spec: groups.clone(),
        }
    } else if !request.aggregates.is_empty() {
        PlanKind::Aggregates {
            queries: BTreeMap::new(),
            specs: request.aggregates.clone(),
        }
    } else {
        PlanKind::Rows {
            query: String::new(),
        }
    }
}
