//! Error types for the claw-promql crate.

use thiserror::Error;

use crate::client::ClientError;

/// Errors that can occur while compiling or executing a metric query.
///
/// An unsatisfiable predicate is not an error: it is reported through
/// [`QueryPlan::ok`](crate::plan::QueryPlan::ok) and yields zero rows.
#[derive(Debug, Error)]
pub enum PromqlError {
    /// The comparison target or operator is not supported on this path.
    #[error("unsupported comparison: operator `{operator}` on `{target}`")]
    UnsupportedComparison {
        /// The comparison target (`timestamp`, `value` or a label name).
        target: String,
        /// The operator name.
        operator: String,
    },

    /// The predicate shape is not supported on this path.
    #[error("unsupported predicate: {reason}")]
    UnsupportedPredicate {
        /// Why the predicate was rejected.
        reason: String,
    },

    /// A single-valued predicate field was set more than once.
    #[error("duplicate predicate on `{field}`")]
    DuplicatePredicate {
        /// The field that was constrained twice (`timestamp`, `start`, `end` or `value`).
        field: &'static str,
    },

    /// A comparison value does not have the expected shape.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// The field or label being compared.
        field: String,
        /// The reason the value is invalid.
        reason: String,
    },

    /// A function or argument received a value of the wrong shape.
    #[error("invalid argument for `{name}`: {reason}")]
    InvalidArgument {
        /// The function or argument name.
        name: String,
        /// The reason the argument is invalid.
        reason: String,
    },

    /// A numeric argument is outside its allowed range.
    #[error("argument for `{name}` out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        /// The function or argument name.
        name: String,
        /// The provided value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// A structured argument is missing a mandatory sub-field.
    #[error("missing field `{field}` in argument for `{name}`")]
    MissingField {
        /// The function name.
        name: String,
        /// The missing sub-field.
        field: &'static str,
    },

    /// The function name is not a known `PromQL` function.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// The request carries an argument this collection does not accept.
    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    /// A variable referenced by the request is not bound.
    #[error("unbound variable: {0}")]
    UnboundVariable(String),

    /// Placeholders remained in a native query after substitution.
    #[error("unresolved placeholders in native query: {}", .names.join(", "))]
    UnresolvedPlaceholder {
        /// The placeholder names that were not substituted.
        names: Vec<String>,
    },

    /// The aggregate request cannot be compiled.
    #[error("unsupported aggregate `{key}`: {reason}")]
    UnsupportedAggregate {
        /// The aggregate key.
        key: String,
        /// The reason it is unsupported.
        reason: String,
    },

    /// The grouping request cannot be compiled.
    #[error("unsupported grouping: {reason}")]
    UnsupportedGrouping {
        /// The reason it is unsupported.
        reason: String,
    },

    /// The requested ordering is not supported.
    #[error("unsupported order by: {reason}")]
    UnsupportedOrderBy {
        /// The reason the ordering is rejected.
        reason: String,
    },

    /// A duration string could not be parsed.
    #[error("invalid duration `{input}`: {reason}")]
    InvalidDuration {
        /// The input that failed to parse.
        input: String,
        /// The reason it failed.
        reason: String,
    },

    /// A timestamp could not be parsed.
    #[error("invalid timestamp `{input}` for `{field}`")]
    InvalidTimestamp {
        /// The argument or column the timestamp was given for.
        field: String,
        /// The input that failed to parse.
        input: String,
    },

    /// The time range is inverted.
    #[error("invalid time range: start={start}, end={end}")]
    InvalidTimeRange {
        /// Start timestamp in milliseconds.
        start: i64,
        /// End timestamp in milliseconds.
        end: i64,
    },

    /// A regular expression in a label constraint does not compile.
    #[error("invalid regex `{pattern}` on label `{label}`: {reason}")]
    InvalidRegex {
        /// The label being matched.
        label: String,
        /// The offending pattern.
        pattern: String,
        /// The compiler error.
        reason: String,
    },

    /// The settings document could not be parsed.
    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),

    /// The execution backend failed.
    #[error("query `{query}` failed: {source}")]
    Backend {
        /// The query text that was sent to the backend.
        query: String,
        /// The underlying client error.
        #[source]
        source: ClientError,
    },

    /// The request was cancelled by the caller or by a failing sibling.
    #[error("query cancelled")]
    Cancelled,

    /// A spawned batch unit terminated abnormally.
    #[error("batch unit {index} terminated: {reason}")]
    TaskFailed {
        /// Index of the binding in the batch.
        index: usize,
        /// Why the task ended.
        reason: String,
    },
}

impl PromqlError {
    /// Shorthand for an [`InvalidArgument`](Self::InvalidArgument) error.
    pub(crate) fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`InvalidValue`](Self::InvalidValue) error.
    pub(crate) fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error came from the execution backend.
    #[must_use]
    pub const fn is_backend(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

/// Result type for query compilation and execution.
pub type Result<T> = std::result::Result<T, PromqlError>;
