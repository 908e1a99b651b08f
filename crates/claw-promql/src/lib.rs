//! Relational queries over Prometheus-compatible metric stores.
#![forbid(unsafe_code)]
//!
//! `claw-promql` turns structured requests (predicates, aggregates,
//! groupings, ordering and paging) into `PromQL`, sends the compiled text to
//! a pluggable [`QueryClient`], and shapes the returned series into uniform
//! rows.
//!
//! # Features
//!
//! - **Label constraint algebra**: per-label constraints are merged before
//!   rendering, and contradictions short-circuit without touching the store
//! - **Function pipelines**: a closed table of `PromQL` functions with typed
//!   arguments, rendered byte-exactly
//! - **Grouping**: `by (...)` aggregates and histogram quantiles
//! - **Native queries**: `${name}` templates with typed arguments
//! - **Batches**: one request over many variable bindings, bounded and in order
//!
//! # Example
//!
//! ```rust
//! use claw_promql::{compile, CollectionRequest, ComparisonOperator, Expression, RuntimeSettings, Variables};
//! use chrono::Utc;
//!
//! let request = CollectionRequest::new("http_requests_total").with_predicate(Expression::and(vec![
//!     Expression::compare("job", ComparisonOperator::Eq, "api"),
//!     Expression::compare("value", ComparisonOperator::Gt, 5),
//! ]));
//!
//! let plan = compile(&request, &Variables::new(), &RuntimeSettings::default(), Utc::now())?;
//! assert_eq!(plan.explain()["query"], r#"http_requests_total{job="api"} > 5.000000"#);
//! # Ok::<(), claw_promql::PromqlError>(())
//! ```

#![doc(html_root_url = "https://docs.rs/claw-promql/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod aggregation;
pub mod client;
pub mod config;
pub mod duration;
pub mod error;
pub mod executor;
pub mod functions;
pub mod labels;
pub mod native;
pub mod plan;
pub mod predicate;
pub mod render;
pub mod shaping;
pub mod sorting;
pub mod time;
pub mod types;

// Re-export main types at crate root
pub use aggregation::{AggregateFunction, AggregateSpec, GroupSpec};
pub use client::{ClientError, QueryClient};
pub use config::{RuntimeSettings, TimestampFormat, UnixTimeUnit, ValueFormat};
pub use error::{PromqlError, Result};
pub use executor::{QueryExecutor, QueryResult};
pub use functions::{FunctionCall, PromFunction};
pub use labels::{merge_constraints, LabelConstraint, LabelOperator};
pub use native::{NativeArgumentType, NativeQueryRequest, NativeQueryTemplate};
pub use plan::{compile, Argument, CollectionRequest, PlanKind, QueryPlan};
pub use predicate::{ComparisonOperator, Expression, OrderByElement, OrderDirection, Variables};
pub use render::PromqlQuery;
pub use shaping::{GroupOutput, QueryOutput, Row};
pub use sorting::{ColumnOrder, SortField};
pub use time::TimeSelection;
pub use types::{ClientResponse, Labels, Point, QueryValue, Sample, Series};
