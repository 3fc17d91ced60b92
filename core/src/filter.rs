//! Metadata filter compiler.
//!
//! A [`Filters`] value is an ordered list of `attribute → condition` terms joined
//! with AND. It compiles to two interchangeable forms:
//!
//! - [`Filters::to_sql`]: a parameterized `WHERE` fragment with positional
//!   placeholders (`$1`, `$2`, ...), for backends that filter natively
//! - [`Filters::to_predicate`]: an in-process [`Predicate`] over a JSON object,
//!   for backends that filter after fetching
//!
//! Both forms select the same rows for any candidate. The predicate follows SQL
//! comparison semantics: a missing or `null` attribute never matches, and a
//! `null` literal never matches either.
//!
//! Event attributes with a SQL type ([`AttributeKind`]) are compared as that
//! type on both paths. `timestamp` literals are parsed as RFC 3339 instants,
//! so `"2025-01-01T00:00:00Z"` and `"2025-01-01T02:00:00.000+02:00"` are the
//! same bound. `id` literals must be integral. A literal that does not coerce
//! never matches, just as the SQL backend binds it as `NULL`.
//!
//! # Parsing
//!
//! Filters are usually parsed from JSON at the API boundary:
//!
//! | JSON                  | Condition                     |
//! |-----------------------|-------------------------------|
//! | `"x"`, `1`, `true`    | `Eq(literal)`                 |
//! | `["a", "b"]`          | `OneOf([...])`                |
//! | `{"$eq": v}`          | `Eq(v)`                       |
//! | `{"$gt": v}`          | `Gt(v)`                       |
//! | `{"$lt": v}`          | `Lt(v)`                       |
//! | any other object      | `Eq(object)` (degraded match) |
//!
//! ```
//! use evlog_core::filter::{Condition, Filters};
//! use serde_json::json;
//!
//! let filters = Filters::from_json(&json!({
//!     "ipAddress": "10.0.0.1",
//!     "count": {"$gt": 5},
//!     "color": ["red", "blue"],
//! })).unwrap();
//!
//! let sql = filters.to_sql(1);
//! assert_eq!(
//!     sql.clause,
//!     r#""ipAddress" = $1 AND "count" > $2 AND "color" = ANY ($3)"#
//! );
//!
//! let predicate = filters.to_predicate();
//! assert!(predicate.matches(&json!({"ipAddress": "10.0.0.1", "count": 6, "color": "red"})));
//! assert!(!predicate.matches(&json!({"ipAddress": "10.0.0.1", "count": 5, "color": "red"})));
//! ```

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

/// Error returned when a filter document is not a JSON object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Filters must be a JSON object, got {0}")]
pub struct FilterError(String);

/// How an attribute's values compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeKind {
    /// Integral numbers (`id`).
    Integer,
    /// RFC 3339 instants (`timestamp`).
    Timestamp,
    /// Strings only (`processId`, `sessionId`, ...).
    Text,
    /// Any JSON value, compared like-for-like.
    Untyped,
}

impl AttributeKind {
    /// Kind of a filterable event attribute. Unknown names are untyped.
    #[must_use]
    pub fn of(attribute: &str) -> Self {
        match attribute {
            "id" => Self::Integer,
            "timestamp" => Self::Timestamp,
            "processId" | "connectionId" | "sessionId" | "ipAddress" | "aggregateRoot" => Self::Text,
            _ => Self::Untyped,
        }
    }

    fn compare(self, actual: &Value, literal: &Value) -> Option<Ordering> {
        match self {
            Self::Integer => Some(coerce_integer(actual)?.cmp(&coerce_integer(literal)?)),
            Self::Timestamp => Some(coerce_timestamp(actual)?.cmp(&coerce_timestamp(literal)?)),
            Self::Text => Some(actual.as_str()?.cmp(literal.as_str()?)),
            Self::Untyped => sql_compare(actual, literal),
        }
    }

    fn equals(self, actual: &Value, literal: &Value) -> bool {
        match self {
            Self::Untyped => sql_equals(actual, literal),
            _ => self.compare(actual, literal) == Some(Ordering::Equal),
        }
    }
}

/// Integral value of `value`, accepting floats without a fractional part.
#[must_use]
#[allow(
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]
pub fn coerce_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let float = value.as_f64()?;
    let in_range = float >= i64::MIN as f64 && float < i64::MAX as f64;
    (in_range && float.trunc() == float).then(|| float as i64)
}

/// Instant named by an RFC 3339 string, rounded to microseconds as stored.
#[must_use]
pub fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value.as_str()?).ok()?;
    Some(parsed.with_timezone(&Utc).round_subsecs(6))
}

/// A single comparison applied to one attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Attribute equals the literal.
    Eq(Value),
    /// Attribute is strictly greater than the literal.
    Gt(Value),
    /// Attribute is strictly less than the literal.
    Lt(Value),
    /// Attribute equals any of the literals.
    OneOf(Vec<Value>),
}

impl Condition {
    /// Parse one filter value.
    ///
    /// Never fails: shapes that are not a recognized single-key operator object
    /// fall back to equality against the whole value.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self::OneOf(items.clone()),
            Value::Object(map) if map.len() == 1 => {
                let (op, operand) = map.iter().next().map_or(("", value), |(k, v)| (k.as_str(), v));
                match op {
                    "$eq" => Self::from_operand(operand, Self::Eq),
                    "$gt" => Self::Gt(operand.clone()),
                    "$lt" => Self::Lt(operand.clone()),
                    _ => Self::Eq(value.clone()),
                }
            }
            _ => Self::Eq(value.clone()),
        }
    }

    // `{"$eq": [..]}` keeps equals-any semantics, like a bare array.
    fn from_operand(operand: &Value, scalar: fn(Value) -> Self) -> Self {
        match operand {
            Value::Array(items) => Self::OneOf(items.clone()),
            other => scalar(other.clone()),
        }
    }

    const fn sql_operator(&self) -> &'static str {
        match self {
            Self::Eq(_) | Self::OneOf(_) => "=",
            Self::Gt(_) => ">",
            Self::Lt(_) => "<",
        }
    }

    fn matches(&self, kind: AttributeKind, actual: Option<&Value>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match self {
            Self::Eq(expected) => kind.equals(actual, expected),
            Self::Gt(bound) => kind.compare(actual, bound) == Some(Ordering::Greater),
            Self::Lt(bound) => kind.compare(actual, bound) == Some(Ordering::Less),
            Self::OneOf(options) => options.iter().any(|o| kind.equals(actual, o)),
        }
    }
}

/// Ordered conjunction of attribute conditions.
///
/// Attribute order is preserved from construction (and from JSON input, which is
/// parsed with key order intact) so SQL placeholders are numbered in declaration
/// order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Filters {
    terms: Vec<(String, Condition)>,
}

impl Filters {
    /// An empty filter set, which matches everything.
    #[must_use]
    pub const fn new() -> Self {
        Self { terms: Vec::new() }
    }

    /// Parse a JSON object of `attribute → filter value`.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] when the document is not an object. Individual
    /// malformed values never fail; see [`Condition::from_json`].
    pub fn from_json(document: &Value) -> Result<Self, FilterError> {
        match document {
            Value::Object(map) => Ok(Self {
                terms: map
                    .iter()
                    .map(|(attribute, value)| (attribute.clone(), Condition::from_json(value)))
                    .collect(),
            }),
            Value::Null => Ok(Self::new()),
            other => Err(FilterError(type_name(other).to_string())),
        }
    }

    /// Append a term.
    #[must_use]
    pub fn with(mut self, attribute: impl Into<String>, condition: Condition) -> Self {
        self.terms.push((attribute.into(), condition));
        self
    }

    /// Append an equality term.
    #[must_use]
    pub fn eq(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(attribute, Condition::Eq(value.into()))
    }

    /// Append a greater-than term.
    #[must_use]
    pub fn gt(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(attribute, Condition::Gt(value.into()))
    }

    /// Append a less-than term.
    #[must_use]
    pub fn lt(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(attribute, Condition::Lt(value.into()))
    }

    /// Append an equals-any term.
    #[must_use]
    pub fn one_of<V: Into<Value>>(
        self,
        attribute: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.with(
            attribute,
            Condition::OneOf(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Append every term of `other` after the terms of `self`.
    #[must_use]
    pub fn and(mut self, other: Self) -> Self {
        self.terms.extend(other.terms);
        self
    }

    /// Rename every attribute (e.g. camelCase names to snake_case columns).
    #[must_use]
    pub fn map_attributes(self, mut rename: impl FnMut(&str) -> String) -> Self {
        Self {
            terms: self
                .terms
                .into_iter()
                .map(|(attribute, condition)| (rename(&attribute), condition))
                .collect(),
        }
    }

    /// Number of terms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// True when no terms are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Iterate over the terms in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.terms.iter().map(|(a, c)| (a.as_str(), c))
    }

    /// Render a parameterized SQL fragment.
    ///
    /// Placeholders start at `$first_placeholder`, so the fragment can be
    /// embedded after other bound parameters. An empty filter renders `TRUE`
    /// with no parameters. Equals-any terms bind one array parameter.
    #[must_use]
    pub fn to_sql(&self, first_placeholder: usize) -> SqlClause {
        if self.terms.is_empty() {
            return SqlClause {
                clause: "TRUE".to_string(),
                params: Vec::new(),
            };
        }

        let mut clause = String::new();
        let mut params = Vec::with_capacity(self.terms.len());

        for (index, (attribute, condition)) in self.terms.iter().enumerate() {
            if index > 0 {
                clause.push_str(" AND ");
            }
            let placeholder = first_placeholder + index;
            let column = quote_identifier(attribute);
            let operator = condition.sql_operator();
            // Writing to a String cannot fail.
            let _ = match condition {
                Condition::OneOf(_) => write!(clause, "{column} {operator} ANY (${placeholder})"),
                _ => write!(clause, "{column} {operator} ${placeholder}"),
            };

            let value = match condition {
                Condition::Eq(v) | Condition::Gt(v) | Condition::Lt(v) => SqlValue::Scalar(v.clone()),
                Condition::OneOf(vs) => SqlValue::Array(vs.clone()),
            };
            params.push(SqlParam {
                attribute: attribute.clone(),
                value,
            });
        }

        SqlClause { clause, params }
    }

    /// Compile an in-process predicate.
    ///
    /// The predicate snapshots the terms, so later changes to `self` do not
    /// affect it. It is cheap to clone and safe to share between tasks.
    #[must_use]
    pub fn to_predicate(&self) -> Predicate {
        Predicate {
            terms: self
                .terms
                .iter()
                .map(|(attribute, condition)| PredicateTerm {
                    kind: AttributeKind::of(attribute),
                    attribute: attribute.clone(),
                    condition: condition.clone(),
                })
                .collect(),
        }
    }
}

impl TryFrom<Value> for Filters {
    type Error = FilterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

impl From<Filters> for Value {
    fn from(filters: Filters) -> Self {
        let map = filters
            .terms
            .into_iter()
            .map(|(attribute, condition)| {
                let value = match condition {
                    Condition::Eq(v) => serde_json::json!({ "$eq": v }),
                    Condition::Gt(v) => serde_json::json!({ "$gt": v }),
                    Condition::Lt(v) => serde_json::json!({ "$lt": v }),
                    Condition::OneOf(vs) => Self::Array(vs),
                };
                (attribute, value)
            })
            .collect();
        Self::Object(map)
    }
}

/// Value bound to one SQL placeholder.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    /// A single literal.
    Scalar(Value),
    /// An array literal for `= ANY ($n)`.
    Array(Vec<Value>),
}

/// One bound parameter, tagged with the attribute it compares against so the
/// backend can pick the right SQL type.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlParam {
    /// Attribute (column) the parameter is compared to.
    pub attribute: String,
    /// The bound value.
    pub value: SqlValue,
}

/// A rendered `WHERE` fragment and its ordered parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlClause {
    /// SQL text with `$n` placeholders.
    pub clause: String,
    /// Parameters, in placeholder order.
    pub params: Vec<SqlParam>,
}

#[derive(Clone, Debug)]
struct PredicateTerm {
    attribute: String,
    kind: AttributeKind,
    condition: Condition,
}

/// In-process filter compiled from [`Filters`].
#[derive(Clone, Debug)]
pub struct Predicate {
    terms: Arc<[PredicateTerm]>,
}

impl Predicate {
    /// A predicate that accepts everything.
    #[must_use]
    pub fn always() -> Self {
        Filters::new().to_predicate()
    }

    /// Evaluate against a JSON object of attributes.
    ///
    /// Non-object candidates only match an empty filter.
    #[must_use]
    pub fn matches(&self, candidate: &Value) -> bool {
        self.terms.iter().all(|term| {
            term.condition
                .matches(term.kind, candidate.get(term.attribute.as_str()))
        })
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn sql_compare(actual: &Value, literal: &Value) -> Option<Ordering> {
    match (actual, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn sql_equals(actual: &Value, literal: &Value) -> bool {
    if actual.is_null() || literal.is_null() {
        return false;
    }
    match sql_compare(actual, literal) {
        Some(ordering) => ordering == Ordering::Equal,
        None => actual == literal,
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
