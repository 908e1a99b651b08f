//! `PromQL` text rendering.
//!
//! A query is a metric selector wrapped by the function pipeline, left to
//! right, with an optional trailing scalar comparison. Rendering is
//! byte-exact: the text is what the backend receives and what `explain`
//! returns.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::duration::{format_offset, format_range};
use crate::functions::FunctionCall;
use crate::labels::LabelConstraintSet;
use crate::predicate::ValueComparison;

/// Renders `metric{matchers}`, or the bare metric name without matchers.
#[must_use]
pub fn render_selector(metric: &str, matchers: &[String]) -> String {
    if matchers.is_empty() {
        metric.to_string()
    } else {
        format!("{metric}{{{}}}", matchers.join(", "))
    }
}

/// Renders `expr OP value` with six decimals.
#[must_use]
pub fn render_value_comparison(expr: &str, comparison: &ValueComparison) -> String {
    format!(
        "{expr} {} {:.6}",
        comparison.operator.as_symbol(),
        comparison.value
    )
}

/// A query over one metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromqlQuery {
    metric: String,
    matchers: Vec<String>,
    offset: Option<Duration>,
    pipeline: Vec<FunctionCall>,
    value: Option<ValueComparison>,
}

impl PromqlQuery {
    /// Creates a query selecting every series of `metric`.
    #[must_use]
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            ..Self::default()
        }
    }

    /// Adds the matchers of merged label constraints, in label order.
    #[must_use]
    pub fn with_labels(mut self, labels: &BTreeMap<String, LabelConstraintSet>) -> Self {
        for (label, set) in labels {
            self.matchers.extend(set.matchers(label));
        }
        self
    }

    /// Adds a raw matcher such as `job="api"`.
    #[must_use]
    pub fn with_matcher(mut self, matcher: impl Into<String>) -> Self {
        self.matchers.push(matcher.into());
        self
    }

    /// Sets the offset modifier.
    #[must_use]
    pub const fn with_offset(mut self, offset: Option<Duration>) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the function pipeline.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Vec<FunctionCall>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Prepends a function to the pipeline.
    #[must_use]
    pub fn with_leading_function(mut self, call: FunctionCall) -> Self {
        self.pipeline.insert(0, call);
        self
    }

    /// Sets the trailing scalar comparison.
    #[must_use]
    pub const fn with_value_comparison(mut self, value: Option<ValueComparison>) -> Self {
        self.value = value;
        self
    }

    /// The metric name.
    #[must_use]
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// The function pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &[FunctionCall] {
        &self.pipeline
    }

    /// Renders the bare selector.
    #[must_use]
    pub fn selector(&self) -> String {
        render_selector(&self.metric, &self.matchers)
    }

    /// Renders the full query.
    ///
    /// The offset is emitted exactly once: after the range bracket when a
    /// range function consumes the selector directly, else right after the
    /// selector.
    #[must_use]
    pub fn render(&self) -> String {
        let mut expr = self.selector();
        let mut is_selector = true;
        let mut pending_offset = self.offset.filter(|d| !d.is_zero()).map(format_offset);

        for call in &self.pipeline {
            let rendered = match call.range() {
                Some(range) if is_selector => {
                    let mut ranged = format!("{expr}[{}]", format_range(range));
                    if let Some(offset) = pending_offset.take() {
                        ranged = format!("{ranged} offset {offset}");
                    }
                    call.render(&ranged)
                }
                Some(range) => call.render(&format!("{expr}[{}:]", format_range(range))),
                None => {
                    let wrapped = call.render(&expr);
                    if wrapped == expr {
                        continue;
                    }
                    if let Some(offset) = pending_offset.take() {
                        call.render(&format!("{expr} offset {offset}"))
                    } else {
                        wrapped
                    }
                }
            };
            expr = rendered;
            is_selector = false;
        }

        if let Some(offset) = pending_offset {
            expr = format!("{expr} offset {offset}");
        }
        match &self.value {
            Some(comparison) => render_value_comparison(&expr, comparison),
            None => expr,
        }
    }
}
