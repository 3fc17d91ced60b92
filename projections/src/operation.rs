//! Projection operations and the batches that carry them.
//!
//! A batch is the unit a resumable source delivers:
//!
//! ```json
//! {"cursor": 7, "operations": [["sadd", "online", "alice", "bob"], ["srem", "online", "carol"]]}
//! ```
//!
//! Each operation is `[opcode, target, args...]`. Operations must be
//! idempotent under redelivery, because a batch may be applied again after
//! a conflict forces a replay from the durable cursor.

use crate::error::{ProjectionError, Result};
use evlog_core::stream::Cursor;
use serde_json::{Value, json};
use std::fmt;

/// What an operation does to its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Add members to a set (`sadd`, alias `add`).
    SetAdd,
    /// Remove members from a set (`srem`, alias `remove`).
    SetRemove,
    /// Append values to a list (`rpush`, alias `push`).
    ///
    /// Not idempotent. A commit is never applied twice by the engine: the
    /// durable cursor is written in the same atomic commit, so a retry after
    /// an unknown outcome sees the cursor moved and replays from it. A
    /// source that delivers a batch at or below the durable cursor again
    /// does append twice.
    ListPush,
}

impl OpCode {
    /// Parse an opcode name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sadd" | "add" => Some(Self::SetAdd),
            "srem" | "remove" => Some(Self::SetRemove),
            "rpush" | "push" => Some(Self::ListPush),
            _ => None,
        }
    }

    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SetAdd => "sadd",
            Self::SetRemove => "srem",
            Self::ListPush => "rpush",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation on derived state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    /// What to do.
    pub op: OpCode,
    /// Name of the set or list it applies to.
    pub target: String,
    /// Members or values.
    pub args: Vec<String>,
}

impl Operation {
    /// Build an operation.
    pub fn new<I, S>(op: OpCode, target: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op,
            target: target.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `sadd target members...`
    pub fn set_add<I, S>(target: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(OpCode::SetAdd, target, members)
    }

    /// `srem target members...`
    pub fn set_remove<I, S>(target: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(OpCode::SetRemove, target, members)
    }

    /// Parse `[opcode, target, args...]`.
    ///
    /// Numeric and boolean arguments are kept as their JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::MalformedBatch`] for anything else.
    pub fn from_json(value: &Value) -> Result<Self> {
        let parts = value
            .as_array()
            .ok_or_else(|| malformed(format!("operation is not an array: {value}")))?;
        let (name, rest) = parts
            .split_first()
            .ok_or_else(|| malformed("empty operation".to_string()))?;
        let op = name
            .as_str()
            .and_then(OpCode::parse)
            .ok_or_else(|| malformed(format!("unknown opcode {name}")))?;
        let (target, args) = rest
            .split_first()
            .ok_or_else(|| malformed(format!("{op} without a target")))?;
        let target = target
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| malformed(format!("{op} target must be a non-empty string")))?;
        let args = args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(malformed(format!("{op} argument must be a scalar, got {other}"))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            op,
            target: target.to_string(),
            args,
        })
    }

    /// The `[opcode, target, args...]` form.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut parts = vec![json!(self.op.as_str()), json!(self.target)];
        parts.extend(self.args.iter().map(|arg| json!(arg)));
        Value::Array(parts)
    }
}

/// Operations up to a source position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Source position reached once this batch is applied.
    pub cursor: Cursor,
    /// Operations in arrival order.
    pub operations: Vec<Operation>,
}

impl Batch {
    /// Build a batch.
    #[must_use]
    pub const fn new(cursor: Cursor, operations: Vec<Operation>) -> Self {
        Self { cursor, operations }
    }

    /// Parse and validate a batch.
    ///
    /// The batch is rejected if `cursor` is missing or `operations` is not
    /// an array. Individual malformed operations are dropped with a warning
    /// and the rest of the batch is kept.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::MalformedBatch`] if the batch is rejected.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| malformed(format!("batch is not an object: {value}")))?;
        let cursor = object
            .get("cursor")
            .and_then(parse_cursor)
            .ok_or_else(|| malformed("batch cursor is missing or invalid".to_string()))?;
        let raw = object
            .get("operations")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("batch operations must be an array".to_string()))?;

        let operations = raw
            .iter()
            .filter_map(|op| match Operation::from_json(op) {
                Ok(op) => Some(op),
                Err(e) => {
                    tracing::warn!(cursor = %cursor, error = %e, "Dropping invalid projection operation");
                    None
                }
            })
            .collect();

        Ok(Self { cursor, operations })
    }

    /// The wire form accepted by [`Batch::from_json`].
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "cursor": self.cursor,
            "operations": self.operations.iter().map(Operation::to_json).collect::<Vec<_>>(),
        })
    }
}

fn parse_cursor(value: &Value) -> Option<Cursor> {
    match value {
        Value::Number(n) => n.as_u64().map(Cursor::new),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn malformed(reason: String) -> ProjectionError {
    ProjectionError::MalformedBatch(reason)
}
