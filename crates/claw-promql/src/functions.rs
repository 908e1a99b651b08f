//! `PromQL` functions applied in a request's function pipeline.
//!
//! Every function belongs to exactly one [`FunctionClass`], which fixes the
//! shape of its argument and its rendering grammar. Arguments are validated
//! once into [`FunctionArgs`]; rendering cannot fail afterwards.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::duration::duration_from_value;
use crate::error::{PromqlError, Result};
use crate::labels::escape_string;

/// Rendering grammar of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionClass {
    /// `fn(expr)` when the argument is `true`, pass-through otherwise.
    Toggle,
    /// `fn(expr)` or `fn by (l1, l2) (expr)`; pass-through when absent.
    AggregateByLabels,
    /// `fn(expr, "l1", "l2")`.
    SortByLabel,
    /// `fn(k, expr)` with an integer `k`.
    TopK,
    /// `fn(q, expr)` with `q` in `[0, 1]`.
    QuantileLike,
    /// `fn(expr, n)`.
    TrailingScalar,
    /// `fn(expr, min, max)`.
    Clamp,
    /// `fn(min, max, expr)`.
    HistogramFraction,
    /// `fn(expr[range], sf, tf)`.
    HoltWinters,
    /// `fn(expr[range], t)`.
    PredictLinear,
    /// `fn(q, expr[range])`.
    QuantileOverTime,
    /// `fn(expr, "dst", "sep", "src"...)`.
    LabelJoin,
    /// `fn(expr, "dst", "replacement", "src", "regex")`.
    LabelReplace,
    /// `fn("label", expr)`.
    CountValues,
    /// `fn(expr[range])`.
    RangeVector,
}

impl FunctionClass {
    /// Returns true if the input must be a range vector.
    #[must_use]
    pub const fn takes_range(&self) -> bool {
        matches!(
            self,
            Self::RangeVector | Self::HoltWinters | Self::PredictLinear | Self::QuantileOverTime
        )
    }
}

macro_rules! prom_functions {
    ($($variant:ident => $name:literal : $class:ident,)+) => {
        /// A supported `PromQL` function.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum PromFunction {
            $($variant,)+
        }

        impl PromFunction {
            /// Every supported function.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            /// Returns the `PromQL` name.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            /// Returns the rendering class.
            #[must_use]
            pub const fn class(&self) -> FunctionClass {
                match self {
                    $(Self::$variant => FunctionClass::$class,)+
                }
            }
        }
    };
}

prom_functions! {
    Abs => "abs": Toggle,
    Absent => "absent": Toggle,
    Ceil => "ceil": Toggle,
    Exp => "exp": Toggle,
    Floor => "floor": Toggle,
    Ln => "ln": Toggle,
    Log2 => "log2": Toggle,
    Log10 => "log10": Toggle,
    Scalar => "scalar": Toggle,
    Sgn => "sgn": Toggle,
    Sort => "sort": Toggle,
    SortDesc => "sort_desc": Toggle,
    Sqrt => "sqrt": Toggle,
    Timestamp => "timestamp": Toggle,
    Vector => "vector": Toggle,
    Deg => "deg": Toggle,
    Rad => "rad": Toggle,
    Acos => "acos": Toggle,
    Acosh => "acosh": Toggle,
    Asin => "asin": Toggle,
    Asinh => "asinh": Toggle,
    Atan => "atan": Toggle,
    Atanh => "atanh": Toggle,
    Cos => "cos": Toggle,
    Cosh => "cosh": Toggle,
    Sin => "sin": Toggle,
    Sinh => "sinh": Toggle,
    Tan => "tan": Toggle,
    Tanh => "tanh": Toggle,
    DayOfMonth => "day_of_month": Toggle,
    DayOfWeek => "day_of_week": Toggle,
    DayOfYear => "day_of_year": Toggle,
    DaysInMonth => "days_in_month": Toggle,
    Hour => "hour": Toggle,
    Minute => "minute": Toggle,
    Month => "month": Toggle,
    Year => "year": Toggle,
    HistogramAvg => "histogram_avg": Toggle,
    HistogramCount => "histogram_count": Toggle,
    HistogramSum => "histogram_sum": Toggle,
    HistogramStddev => "histogram_stddev": Toggle,
    HistogramStdvar => "histogram_stdvar": Toggle,
    Sum => "sum": AggregateByLabels,
    Avg => "avg": AggregateByLabels,
    Min => "min": AggregateByLabels,
    Max => "max": AggregateByLabels,
    Count => "count": AggregateByLabels,
    Stddev => "stddev": AggregateByLabels,
    Stdvar => "stdvar": AggregateByLabels,
    Group => "group": AggregateByLabels,
    SortByLabel => "sort_by_label": SortByLabel,
    SortByLabelDesc => "sort_by_label_desc": SortByLabel,
    Topk => "topk": TopK,
    Bottomk => "bottomk": TopK,
    Limitk => "limitk": TopK,
    Quantile => "quantile": QuantileLike,
    LimitRatio => "limit_ratio": QuantileLike,
    HistogramQuantile => "histogram_quantile": QuantileLike,
    Round => "round": TrailingScalar,
    ClampMax => "clamp_max": TrailingScalar,
    ClampMin => "clamp_min": TrailingScalar,
    Clamp => "clamp": Clamp,
    HistogramFraction => "histogram_fraction": HistogramFraction,
    HoltWinters => "holt_winters": HoltWinters,
    PredictLinear => "predict_linear": PredictLinear,
    QuantileOverTime => "quantile_over_time": QuantileOverTime,
    LabelJoin => "label_join": LabelJoin,
    LabelReplace => "label_replace": LabelReplace,
    CountValues => "count_values": CountValues,
    Rate => "rate": RangeVector,
    Irate => "irate": RangeVector,
    Increase => "increase": RangeVector,
    Delta => "delta": RangeVector,
    Idelta => "idelta": RangeVector,
    Deriv => "deriv": RangeVector,
    Changes => "changes": RangeVector,
    Resets => "resets": RangeVector,
    AvgOverTime => "avg_over_time": RangeVector,
    MinOverTime => "min_over_time": RangeVector,
    MaxOverTime => "max_over_time": RangeVector,
    SumOverTime => "sum_over_time": RangeVector,
    CountOverTime => "count_over_time": RangeVector,
    StddevOverTime => "stddev_over_time": RangeVector,
    StdvarOverTime => "stdvar_over_time": RangeVector,
    LastOverTime => "last_over_time": RangeVector,
    PresentOverTime => "present_over_time": RangeVector,
    AbsentOverTime => "absent_over_time": RangeVector,
    MadOverTime => "mad_over_time": RangeVector,
}

static FUNCTIONS_BY_NAME: Lazy<HashMap<&'static str, PromFunction>> =
    Lazy::new(|| PromFunction::ALL.iter().map(|f| (f.as_str(), *f)).collect());

impl FromStr for PromFunction {
    type Err = PromqlError;

    fn from_str(s: &str) -> Result<Self> {
        FUNCTIONS_BY_NAME
            .get(s)
            .copied()
            .ok_or_else(|| PromqlError::UnknownFunction(s.to_string()))
    }
}

impl fmt::Display for PromFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated function argument.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionArgs {
    /// Apply or skip.
    Toggle(bool),
    /// Aggregate, optionally by labels. `None` skips the function.
    ByLabels(Option<Vec<String>>),
    /// Label names for `sort_by_label`.
    Labels(Vec<String>),
    /// Integer `k`.
    Integer(i64),
    /// Fraction in `[0, 1]`.
    Fraction(f64),
    /// Trailing scalar.
    Scalar(f64),
    /// Lower and upper bound.
    Bounds {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// Range of a range-vector function.
    Range(Duration),
    /// `holt_winters` parameters.
    HoltWinters {
        /// Range.
        range: Duration,
        /// Smoothing factor.
        smoothing: f64,
        /// Trend factor.
        trend: f64,
    },
    /// `predict_linear` parameters.
    PredictLinear {
        /// Range.
        range: Duration,
        /// Seconds into the future.
        seconds: f64,
    },
    /// `quantile_over_time` parameters.
    QuantileOverTime {
        /// Range.
        range: Duration,
        /// Quantile in `[0, 1]`.
        quantile: f64,
    },
    /// `label_join` parameters.
    LabelJoin {
        /// Destination label.
        dest_label: String,
        /// Separator.
        separator: String,
        /// Source labels, never empty.
        source_labels: Vec<String>,
    },
    /// `label_replace` parameters.
    LabelReplace {
        /// Destination label.
        dest_label: String,
        /// Replacement template.
        replacement: String,
        /// Source label.
        source_label: String,
        /// Regex matched against the source label.
        regex: String,
    },
    /// Output label of `count_values`.
    CountValues(String),
}

/// One validated entry of a function pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// The function.
    pub function: PromFunction,
    /// Its validated argument.
    pub args: FunctionArgs,
}

impl FunctionCall {
    /// Validates `argument` for `function`.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::InvalidArgument`] for a wrong-shaped argument,
    /// [`PromqlError::OutOfRange`] for an out-of-range number and
    /// [`PromqlError::MissingField`] for a missing mandatory sub-field.
    pub fn new(function: PromFunction, argument: &Value) -> Result<Self> {
        let name = function.as_str();
        let args = match function.class() {
            FunctionClass::Toggle => match argument {
                Value::Bool(b) => FunctionArgs::Toggle(*b),
                Value::Null => FunctionArgs::Toggle(false),
                other => return Err(shape(name, "a boolean", other)),
            },
            FunctionClass::AggregateByLabels => match argument {
                Value::Null => FunctionArgs::ByLabels(None),
                Value::Bool(true) => FunctionArgs::ByLabels(Some(Vec::new())),
                Value::Bool(false) => FunctionArgs::ByLabels(None),
                Value::Array(_) => FunctionArgs::ByLabels(Some(string_array(name, argument)?)),
                other => return Err(shape(name, "a list of label names", other)),
            },
            FunctionClass::SortByLabel => {
                let labels = string_array(name, argument)?;
                if labels.is_empty() {
                    return Err(PromqlError::invalid_argument(name, "expected at least one label"));
                }
                FunctionArgs::Labels(labels)
            }
            FunctionClass::TopK => FunctionArgs::Integer(integer(name, argument)?),
            FunctionClass::QuantileLike => FunctionArgs::Fraction(fraction(name, argument)?),
            FunctionClass::TrailingScalar => FunctionArgs::Scalar(number(name, argument)?),
            FunctionClass::Clamp | FunctionClass::HistogramFraction => {
                let fields = object(name, argument)?;
                FunctionArgs::Bounds {
                    min: number(name, required(name, fields, "min")?)?,
                    max: number(name, required(name, fields, "max")?)?,
                }
            }
            FunctionClass::RangeVector => FunctionArgs::Range(range(name, argument)?),
            FunctionClass::HoltWinters => {
                let fields = object(name, argument)?;
                FunctionArgs::HoltWinters {
                    range: range(name, required(name, fields, "range")?)?,
                    smoothing: fraction(name, required(name, fields, "sf")?)?,
                    trend: fraction(name, required(name, fields, "tf")?)?,
                }
            }
            FunctionClass::PredictLinear => {
                let fields = object(name, argument)?;
                FunctionArgs::PredictLinear {
                    range: range(name, required(name, fields, "range")?)?,
                    seconds: number(name, required(name, fields, "t")?)?,
                }
            }
            FunctionClass::QuantileOverTime => {
                let fields = object(name, argument)?;
                FunctionArgs::QuantileOverTime {
                    range: range(name, required(name, fields, "range")?)?,
                    quantile: fraction(name, required(name, fields, "quantile")?)?,
                }
            }
            FunctionClass::LabelJoin => {
                let fields = object(name, argument)?;
                let source_labels = string_array(name, required(name, fields, "source_labels")?)?;
                if source_labels.is_empty() {
                    return Err(PromqlError::invalid_argument(
                        name,
                        "source_labels must not be empty",
                    ));
                }
                FunctionArgs::LabelJoin {
                    dest_label: string(name, required(name, fields, "dest_label")?)?,
                    separator: optional_string(name, fields, "separator", "")?,
                    source_labels,
                }
            }
            FunctionClass::LabelReplace => {
                let fields = object(name, argument)?;
                FunctionArgs::LabelReplace {
                    dest_label: string(name, required(name, fields, "dest_label")?)?,
                    replacement: optional_string(name, fields, "replacement", "")?,
                    source_label: optional_string(name, fields, "source_label", "")?,
                    regex: optional_string(name, fields, "regex", "(.*)")?,
                }
            }
            FunctionClass::CountValues => FunctionArgs::CountValues(string(name, argument)?),
        };
        Ok(Self { function, args })
    }

    /// Looks up `name` and validates `argument`.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::UnknownFunction`] for an unknown name, and the
    /// errors of [`FunctionCall::new`].
    pub fn parse(name: &str, argument: &Value) -> Result<Self> {
        Self::new(name.parse()?, argument)
    }

    /// Parses a pipeline: an array of single-key objects `{"<function>": <argument>}`.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::InvalidArgument`] if the pipeline is not an array
    /// of single-key objects, and the errors of [`FunctionCall::parse`].
    pub fn parse_pipeline(value: &Value) -> Result<Vec<Self>> {
        let entries = match value {
            Value::Null => return Ok(Vec::new()),
            Value::Array(entries) => entries,
            other => return Err(shape("fn", "an array of functions", other)),
        };
        entries
            .iter()
            .map(|entry| match entry {
                Value::Object(map) if map.len() == 1 => {
                    let (name, argument) = map
                        .iter()
                        .next()
                        .ok_or_else(|| PromqlError::invalid_argument("fn", "empty function entry"))?;
                    Self::parse(name, argument)
                }
                other => Err(shape("fn", "a single-key object", other)),
            })
            .collect()
    }

    /// Returns the range of a range-vector function.
    #[must_use]
    pub const fn range(&self) -> Option<Duration> {
        match &self.args {
            FunctionArgs::Range(range)
            | FunctionArgs::HoltWinters { range, .. }
            | FunctionArgs::PredictLinear { range, .. }
            | FunctionArgs::QuantileOverTime { range, .. } => Some(*range),
            _ => None,
        }
    }

    /// Wraps `expr`. For range-vector functions `expr` is already a range vector.
    #[must_use]
    pub fn render(&self, expr: &str) -> String {
        let name = self.function.as_str();
        match &self.args {
            FunctionArgs::Toggle(false) | FunctionArgs::ByLabels(None) => expr.to_string(),
            FunctionArgs::Toggle(true) | FunctionArgs::Range(_) => format!("{name}({expr})"),
            FunctionArgs::ByLabels(Some(labels)) => render_by(name, labels, expr),
            FunctionArgs::Labels(labels) => {
                let quoted: Vec<String> = labels.iter().map(|l| quote(l)).collect();
                format!("{name}({expr}, {})", quoted.join(", "))
            }
            FunctionArgs::Integer(k) => format!("{name}({k}, {expr})"),
            FunctionArgs::Fraction(q) => format!("{name}({q}, {expr})"),
            FunctionArgs::Scalar(n) => format!("{name}({expr}, {n})"),
            FunctionArgs::Bounds { min, max } => {
                if self.function.class() == FunctionClass::HistogramFraction {
                    format!("{name}({min}, {max}, {expr})")
                } else {
                    format!("{name}({expr}, {min}, {max})")
                }
            }
            FunctionArgs::HoltWinters {
                smoothing, trend, ..
            } => format!("{name}({expr}, {smoothing}, {trend})"),
            FunctionArgs::PredictLinear { seconds, .. } => format!("{name}({expr}, {seconds})"),
            FunctionArgs::QuantileOverTime { quantile, .. } => format!("{name}({quantile}, {expr})"),
            FunctionArgs::LabelJoin {
                dest_label,
                separator,
                source_labels,
            } => {
                let sources: Vec<String> = source_labels.iter().map(|l| quote(l)).collect();
                format!(
                    "{name}({expr}, {}, {}, {})",
                    quote(dest_label),
                    quote(separator),
                    sources.join(", ")
                )
            }
            FunctionArgs::LabelReplace {
                dest_label,
                replacement,
                source_label,
                regex,
            } => format!(
                "{name}({expr}, {}, {}, {}, {})",
                quote(dest_label),
                quote(replacement),
                quote(source_label),
                quote(regex)
            ),
            FunctionArgs::CountValues(label) => format!("{name}({}, {expr})", quote(label)),
        }
    }
}

/// Renders `name(expr)` or `name by (l1, l2) (expr)`.
#[must_use]
pub fn render_by(name: &str, labels: &[String], expr: &str) -> String {
    if labels.is_empty() {
        format!("{name}({expr})")
    } else {
        format!("{name} by ({}) ({expr})", labels.join(", "))
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", escape_string(value))
}

fn shape(name: &str, expected: &str, got: &Value) -> PromqlError {
    PromqlError::invalid_argument(name, format!("expected {expected}, got {got}"))
}

fn object<'a>(name: &str, value: &'a Value) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| shape(name, "an object", value))
}

fn required<'a>(name: &str, fields: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value> {
    match fields.get(field) {
        Some(Value::Null) | None => Err(PromqlError::MissingField {
            name: name.to_string(),
            field,
        }),
        Some(value) => Ok(value),
    }
}

fn number(name: &str, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| shape(name, "a number", value))
}

fn integer(name: &str, value: &Value) -> Result<i64> {
    if let Some(k) = value.as_i64() {
        return Ok(k);
    }
    match value.as_f64() {
        #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
        Some(f) if f.is_finite() && f.trunc() == f && f.abs() < 9.0e15 => Ok(f as i64),
        _ => Err(shape(name, "an integer", value)),
    }
}

fn fraction(name: &str, value: &Value) -> Result<f64> {
    let q = number(name, value)?;
    if (0.0..=1.0).contains(&q) {
        Ok(q)
    } else {
        Err(PromqlError::OutOfRange {
            name: name.to_string(),
            value: q,
            min: 0.0,
            max: 1.0,
        })
    }
}

/// Range brackets render with millisecond precision.
const MIN_RANGE: Duration = Duration::from_millis(1);

fn range(name: &str, value: &Value) -> Result<Duration> {
    let range = duration_from_value(name, value)?;
    if range < MIN_RANGE {
        return Err(PromqlError::invalid_argument(
            name,
            "range must be at least 1ms",
        ));
    }
    Ok(range)
}

fn string(name: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| shape(name, "a string", value))
}

fn optional_string(
    name: &str,
    fields: &Map<String, Value>,
    field: &str,
    default: &str,
) -> Result<String> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(value) => string(name, value),
    }
}

fn string_array(name: &str, value: &Value) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| shape(name, "a list of strings", value))?;
    items.iter().map(|item| string(name, item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn call(name: &str, argument: Value) -> FunctionCall {
        FunctionCall::parse(name, &argument).unwrap()
    }

    mod table_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn every_name_round_trips() {
            for function in PromFunction::ALL {
                assert_eq!(function.as_str().parse::<PromFunction>().unwrap(), *function);
            }
        }

        #[test]
        fn unknown_function() {
            let err = FunctionCall::parse("rate_of_change", &json!("5m")).unwrap_err();
            assert!(matches!(err, PromqlError::UnknownFunction(name) if name == "rate_of_change"));
        }

        #[test_case(PromFunction::Rate, true ; "rate")]
        #[test_case(PromFunction::QuantileOverTime, true ; "quantile over time")]
        #[test_case(PromFunction::Sum, false ; "sum")]
        #[test_case(PromFunction::Abs, false ; "abs")]
        fn range_classes(function: PromFunction, takes_range: bool) {
            assert_eq!(function.class().takes_range(), takes_range);
        }
    }

    mod render_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("abs", json!(true), "abs(m)" ; "toggle on")]
        #[test_case("abs", json!(false), "m" ; "toggle off")]
        #[test_case("sum", json!([]), "sum(m)" ; "sum without labels")]
        #[test_case("sum", json!(["job", "instance"]), "sum by (job, instance) (m)" ; "sum by labels")]
        #[test_case("max", json!(null), "m" ; "aggregate absent")]
        #[test_case("topk", json!(5), "topk(5, m)" ; "topk")]
        #[test_case("quantile", json!(0.95), "quantile(0.95, m)" ; "quantile")]
        #[test_case("histogram_quantile", json!(0.5), "histogram_quantile(0.5, m)" ; "histogram quantile")]
        #[test_case("round", json!(10), "round(m, 10)" ; "round")]
        #[test_case("clamp_max", json!(2.5), "clamp_max(m, 2.5)" ; "clamp max")]
        #[test_case("clamp", json!({"min": 0, "max": 100}), "clamp(m, 0, 100)" ; "clamp")]
        #[test_case("histogram_fraction", json!({"min": 0, "max": 0.2}), "histogram_fraction(0, 0.2, m)" ; "histogram fraction")]
        #[test_case("count_values", json!("version"), "count_values(\"version\", m)" ; "count values")]
        #[test_case("sort_by_label", json!(["job"]), "sort_by_label(m, \"job\")" ; "sort by label")]
        fn renders(name: &str, argument: Value, expected: &str) {
            assert_eq!(call(name, argument).render("m"), expected);
        }

        #[test]
        fn range_functions_wrap_range_vector() {
            let rate = call("rate", json!("5m"));
            assert_eq!(rate.range(), Some(Duration::from_secs(300)));
            assert_eq!(rate.render("m[5m]"), "rate(m[5m])");

            let holt = call("holt_winters", json!({"range": "10m", "sf": 0.5, "tf": 0.1}));
            assert_eq!(holt.render("m[10m]"), "holt_winters(m[10m], 0.5, 0.1)");

            let predict = call("predict_linear", json!({"range": "1h", "t": 3600}));
            assert_eq!(predict.render("m[1h]"), "predict_linear(m[1h], 3600)");

            let quantile = call("quantile_over_time", json!({"range": "5m", "quantile": 0.9}));
            assert_eq!(quantile.render("m[5m]"), "quantile_over_time(0.9, m[5m])");
        }

        #[test]
        fn label_join_and_replace() {
            let join = call(
                "label_join",
                json!({"dest_label": "dst", "separator": ",", "source_labels": ["a", "b"]}),
            );
            assert_eq!(join.render("m"), r#"label_join(m, "dst", ",", "a", "b")"#);

            let replace = call(
                "label_replace",
                json!({"dest_label": "svc", "replacement": "$1", "source_label": "job", "regex": "(.*)-api"}),
            );
            assert_eq!(
                replace.render("m"),
                r#"label_replace(m, "svc", "$1", "job", "(.*)-api")"#
            );
        }
    }

    mod validation_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("quantile", json!(1.5) ; "quantile above one")]
        #[test_case("limit_ratio", json!(-0.1) ; "ratio below zero")]
        #[test_case("holt_winters", json!({"range": "5m", "sf": 2, "tf": 0.5}) ; "smoothing factor")]
        fn out_of_range(name: &str, argument: Value) {
            assert!(matches!(
                FunctionCall::parse(name, &argument),
                Err(PromqlError::OutOfRange { .. })
            ));
        }

        #[test_case("topk", json!(2.5) ; "fractional k")]
        #[test_case("topk", json!("5") ; "string k")]
        #[test_case("abs", json!(1) ; "number toggle")]
        #[test_case("sum", json!("job") ; "string labels")]
        #[test_case("rate", json!(true) ; "boolean range")]
        #[test_case("clamp", json!([0, 1]) ; "array bounds")]
        #[test_case("rate", json!("500us") ; "sub millisecond range")]
        #[test_case("rate", json!("0s") ; "zero range")]
        #[test_case("label_join", json!({"dest_label": "d", "source_labels": []}) ; "empty sources")]
        fn wrong_shape(name: &str, argument: Value) {
            assert!(matches!(
                FunctionCall::parse(name, &argument),
                Err(PromqlError::InvalidArgument { .. })
            ));
        }

        #[test_case("predict_linear", json!({"t": 60}), "range" ; "predict linear range")]
        #[test_case("quantile_over_time", json!({"range": "5m"}), "quantile" ; "quantile over time quantile")]
        #[test_case("label_join", json!({"source_labels": ["a"]}), "dest_label" ; "label join destination")]
        #[test_case("label_replace", json!({"regex": "x"}), "dest_label" ; "label replace destination")]
        #[test_case("clamp", json!({"min": 1}), "max" ; "clamp max bound")]
        fn missing_field(name: &str, argument: Value, expected: &str) {
            match FunctionCall::parse(name, &argument) {
                Err(PromqlError::MissingField { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected missing field, got {other:?}"),
            }
        }

        #[test]
        fn bad_range_names_the_function() {
            let err = FunctionCall::parse("rate", &json!("bogus")).unwrap_err();
            assert!(matches!(&err, PromqlError::InvalidArgument { name, .. } if name == "rate"));
            assert!(err.to_string().contains("`rate`"), "unexpected error: {err}");
        }

        #[test]
        fn pipeline_keeps_declared_order() {
            let pipeline = FunctionCall::parse_pipeline(&json!([
                {"rate": "5m"},
                {"sum": ["job"]},
                {"abs": true}
            ]))
            .unwrap();
            let names: Vec<_> = pipeline.iter().map(|c| c.function.as_str()).collect();
            assert_eq!(names, ["rate", "sum", "abs"]);
        }

        #[test]
        fn pipeline_rejects_multi_key_entries() {
            let err = FunctionCall::parse_pipeline(&json!([{"rate": "5m", "abs": true}]));
            assert!(matches!(err, Err(PromqlError::InvalidArgument { .. })));
        }
    }
}
