//! Label constraint merging.
//!
//! All constraints on one label are folded into a single
//! [`LabelConstraintSet`] in one pass, in priority order:
//!
//! 1. `eq` and `in` bound the candidate domain to a literal set
//! 2. positive regex forms filter that set, or become regex includes
//! 3. negative forms remove candidates, or become excludes
//!
//! A provably empty domain makes the whole predicate unsatisfiable, which is
//! reported as `None` rather than an error.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PromqlError, Result};

/// Comparison operators applicable to a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOperator {
    /// Equal to the value.
    Eq,
    /// Not equal to the value.
    Neq,
    /// Equal to one of the values.
    In,
    /// Equal to none of the values.
    Nin,
    /// Fully matches the regex.
    Regex,
    /// Does not fully match the regex.
    Nregex,
    /// Contains the substring.
    Contains,
    /// Does not contain the substring.
    NotContains,
    /// Contains the substring, ignoring case.
    Icontains,
    /// Does not contain the substring, ignoring case.
    NotIcontains,
    /// Starts with the prefix.
    StartsWith,
    /// Does not start with the prefix.
    NotStartsWith,
    /// Starts with the prefix, ignoring case.
    IstartsWith,
    /// Does not start with the prefix, ignoring case.
    NotIstartsWith,
    /// Ends with the suffix.
    EndsWith,
    /// Does not end with the suffix.
    NotEndsWith,
    /// Ends with the suffix, ignoring case.
    IendsWith,
    /// Does not end with the suffix, ignoring case.
    NotIendsWith,
}

impl LabelOperator {
    /// Returns the operator name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::In => "in",
            Self::Nin => "nin",
            Self::Regex => "regex",
            Self::Nregex => "nregex",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::Icontains => "icontains",
            Self::NotIcontains => "not_icontains",
            Self::StartsWith => "starts_with",
            Self::NotStartsWith => "not_starts_with",
            Self::IstartsWith => "istarts_with",
            Self::NotIstartsWith => "not_istarts_with",
            Self::EndsWith => "ends_with",
            Self::NotEndsWith => "not_ends_with",
            Self::IendsWith => "iends_with",
            Self::NotIendsWith => "not_iends_with",
        }
    }

    /// Returns true for operators that exclude values.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        matches!(
            self,
            Self::Neq
                | Self::Nin
                | Self::Nregex
                | Self::NotContains
                | Self::NotIcontains
                | Self::NotStartsWith
                | Self::NotIstartsWith
                | Self::NotEndsWith
                | Self::NotIendsWith
        )
    }

    /// Returns true for `eq` and `in`.
    #[must_use]
    pub const fn is_literal_include(&self) -> bool {
        matches!(self, Self::Eq | Self::In)
    }

    /// Returns true for operators that take a list of values.
    #[must_use]
    pub const fn takes_list(&self) -> bool {
        matches!(self, Self::In | Self::Nin)
    }
}

impl fmt::Display for LabelOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One comparison on a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConstraint {
    /// The operator.
    pub operator: LabelOperator,
    /// The operand. Single-valued operators carry exactly one value.
    pub values: Vec<String>,
}

impl LabelConstraint {
    /// Creates a constraint.
    #[must_use]
    pub fn new<I, S>(operator: LabelOperator, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `label = value`.
    #[must_use]
    pub fn eq(value: impl Into<String>) -> Self {
        Self::new(LabelOperator::Eq, [value])
    }

    /// `label != value`.
    #[must_use]
    pub fn neq(value: impl Into<String>) -> Self {
        Self::new(LabelOperator::Neq, [value])
    }

    /// `label =~ pattern`.
    #[must_use]
    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::new(LabelOperator::Regex, [pattern])
    }

    /// `label !~ pattern`.
    #[must_use]
    pub fn nregex(pattern: impl Into<String>) -> Self {
        Self::new(LabelOperator::Nregex, [pattern])
    }

    /// `label in values`.
    #[must_use]
    pub fn any_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(LabelOperator::In, values)
    }

    /// `label not in values`.
    #[must_use]
    pub fn none_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(LabelOperator::Nin, values)
    }

    /// Returns the regex source equivalent to a regex-class operator.
    pub(crate) fn regex_source(&self) -> Option<String> {
        let value = self.values.first()?;
        let escaped = regex::escape(value);
        let source = match self.operator {
            LabelOperator::Regex | LabelOperator::Nregex => value.clone(),
            LabelOperator::Contains | LabelOperator::NotContains => format!(".*{escaped}.*"),
            LabelOperator::Icontains | LabelOperator::NotIcontains => {
                format!("(?i).*{escaped}.*")
            }
            LabelOperator::StartsWith | LabelOperator::NotStartsWith => format!("{escaped}.*"),
            LabelOperator::IstartsWith | LabelOperator::NotIstartsWith => {
                format!("(?i){escaped}.*")
            }
            LabelOperator::EndsWith | LabelOperator::NotEndsWith => format!(".*{escaped}"),
            LabelOperator::IendsWith | LabelOperator::NotIendsWith => format!("(?i).*{escaped}"),
            LabelOperator::Eq | LabelOperator::Neq | LabelOperator::In | LabelOperator::Nin => {
                return None;
            }
        };
        Some(source)
    }
}

/// A literal value or a regex source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pattern {
    /// The literal value or the regex source.
    pub value: String,
    /// True if `value` is a regex.
    pub is_regex: bool,
}

impl Pattern {
    /// Creates a literal pattern.
    #[must_use]
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_regex: false,
        }
    }

    /// Creates a regex pattern.
    #[must_use]
    pub fn regex(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_regex: true,
        }
    }

    /// The pattern as a regex alternative: literals are escaped.
    fn as_regex_source(&self) -> String {
        if self.is_regex {
            self.value.clone()
        } else {
            regex::escape(&self.value)
        }
    }
}

/// The merged constraint on one label.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelConstraintSet {
    /// Alternatives the value must match. Empty means unconstrained.
    pub includes: Vec<Pattern>,
    /// Additional regexes the value must also match.
    pub required: Vec<String>,
    /// Patterns the value must not match, in lexicographic order.
    pub excludes: BTreeSet<Pattern>,
}

impl LabelConstraintSet {
    /// Returns true if the set places no restriction on the label.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.includes.is_empty() && self.required.is_empty() && self.excludes.is_empty()
    }

    /// Renders the set as `PromQL` label matchers for `label`.
    #[must_use]
    pub fn matchers(&self, label: &str) -> Vec<String> {
        let mut out = Vec::new();

        match self.includes.as_slice() {
            [] => {}
            [single] if !single.is_regex => {
                out.push(format!("{label}=\"{}\"", escape_string(&single.value)));
            }
            includes => {
                out.push(format!("{label}=~\"{}\"", escape_string(&alternation(includes))));
            }
        }

        for pattern in &self.required {
            out.push(format!("{label}=~\"{}\"", escape_string(pattern)));
        }

        let excludes: Vec<Pattern> = self.excludes.iter().cloned().collect();
        match excludes.as_slice() {
            [] => {}
            [single] if !single.is_regex => {
                out.push(format!("{label}!=\"{}\"", escape_string(&single.value)));
            }
            excludes => {
                out.push(format!("{label}!~\"{}\"", escape_string(&alternation(excludes))));
            }
        }

        out
    }
}

/// Joins patterns with `|`. Regex alternatives are grouped so inline flags
/// such as `(?i)` stay local to their own alternative.
fn alternation(patterns: &[Pattern]) -> String {
    if let [single] = patterns {
        return single.as_regex_source();
    }
    patterns
        .iter()
        .map(|pattern| {
            if pattern.is_regex {
                format!("(?:{})", pattern.value)
            } else {
                pattern.as_regex_source()
            }
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Escapes a value for a double-quoted `PromQL` string literal.
#[must_use]
pub fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Compiles a regex source with full-string anchoring, as `PromQL` evaluates it.
///
/// # Errors
///
/// Returns [`PromqlError::InvalidRegex`] if the pattern does not compile.
pub fn compile_anchored(label: &str, source: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{source})$")).map_err(|e| PromqlError::InvalidRegex {
        label: label.to_string(),
        pattern: source.to_string(),
        reason: e.to_string(),
    })
}

/// Incremental merge state for one label.
struct MergeState<'a> {
    label: &'a str,
    /// `None` until a positive constraint is seen.
    includes: Option<Vec<Pattern>>,
    required: Vec<String>,
    excludes: BTreeSet<Pattern>,
}

impl<'a> MergeState<'a> {
    const fn new(label: &'a str) -> Self {
        Self {
            label,
            includes: None,
            required: Vec::new(),
            excludes: BTreeSet::new(),
        }
    }

    fn includes_are_literal(&self) -> bool {
        self.includes
            .as_ref()
            .is_some_and(|includes| includes.iter().all(|p| !p.is_regex))
    }

    /// Applies `eq`/`in`. Returns false when the domain becomes empty.
    fn apply_literals(&mut self, values: &[String]) -> bool {
        let mut incoming: Vec<Pattern> = Vec::with_capacity(values.len());
        for value in values {
            let pattern = Pattern::literal(value.as_str());
            if !incoming.contains(&pattern) {
                incoming.push(pattern);
            }
        }

        let next = match self.includes.take() {
            None => incoming,
            Some(current) => current
                .into_iter()
                .filter(|p| incoming.contains(p))
                .collect(),
        };
        let satisfiable = !next.is_empty();
        self.includes = Some(next);
        satisfiable
    }

    /// Applies a positive regex. Returns false when the domain becomes empty.
    fn apply_positive_regex(&mut self, source: String) -> Result<bool> {
        if self.includes_are_literal() {
            let re = compile_anchored(self.label, &source)?;
            let includes = self.includes.get_or_insert_with(Vec::new);
            includes.retain(|p| re.is_match(&p.value));
            return Ok(!includes.is_empty());
        }

        compile_anchored(self.label, &source)?;
        match &mut self.includes {
            None => self.includes = Some(vec![Pattern::regex(source)]),
            Some(includes) => {
                let seen = includes.iter().any(|p| p.value == source)
                    || self.required.contains(&source);
                if !seen {
                    self.required.push(source);
                }
            }
        }
        Ok(true)
    }

    /// Applies a negative constraint. Returns false when the domain becomes empty.
    fn apply_negative(&mut self, exclude: Pattern) -> Result<bool> {
        let matcher = if exclude.is_regex {
            Some(compile_anchored(self.label, &exclude.value)?)
        } else {
            None
        };

        if self.includes_are_literal() {
            let includes = self.includes.get_or_insert_with(Vec::new);
            includes.retain(|p| match &matcher {
                Some(re) => !re.is_match(&p.value),
                None => p.value != exclude.value,
            });
            return Ok(!includes.is_empty());
        }

        self.excludes.insert(exclude);
        Ok(true)
    }

    fn finish(self) -> LabelConstraintSet {
        LabelConstraintSet {
            includes: self.includes.unwrap_or_default(),
            required: self.required,
            excludes: self.excludes,
        }
    }
}

/// Merges every constraint on `label` into one set.
///
/// Returns `Ok(None)` when the constraints cannot all hold.
///
/// # Errors
///
/// Returns [`PromqlError::InvalidRegex`] if a regex operand does not compile,
/// and [`PromqlError::InvalidValue`] if a single-valued operator has no operand.
pub fn merge_constraints(
    label: &str,
    constraints: &[LabelConstraint],
) -> Result<Option<LabelConstraintSet>> {
    for constraint in constraints {
        if !constraint.operator.takes_list() && constraint.values.len() != 1 {
            return Err(PromqlError::invalid_value(
                label,
                format!("operator `{}` takes exactly one value", constraint.operator),
            ));
        }
    }

    let mut state = MergeState::new(label);

    let literal = constraints.iter().filter(|c| c.operator.is_literal_include());
    for constraint in literal {
        if !state.apply_literals(&constraint.values) {
            return Ok(None);
        }
    }

    let positive = constraints
        .iter()
        .filter(|c| !c.operator.is_literal_include() && !c.operator.is_negative());
    for constraint in positive {
        if let Some(source) = constraint.regex_source() {
            if !state.apply_positive_regex(source)? {
                return Ok(None);
            }
        }
    }

    for constraint in constraints.iter().filter(|c| c.operator.is_negative()) {
        let excludes: Vec<Pattern> = match constraint.operator {
            LabelOperator::Neq | LabelOperator::Nin => constraint
                .values
                .iter()
                .map(|v| Pattern::literal(v.as_str()))
                .collect(),
            _ => constraint.regex_source().map(Pattern::regex).into_iter().collect(),
        };
        for exclude in excludes {
            if !state.apply_negative(exclude)? {
                return Ok(None);
            }
        }
    }

    Ok(Some(state.finish()))
}
