//! Stream key and cursor types.
//!
//! A [`StreamKey`] names one append-only log. A [`Cursor`] is an opaque, totally
//! ordered resume position inside that log. The initial position (nothing read
//! yet) is represented as `Option::<Cursor>::None` everywhere in the API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamKey` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream key: {0}")]
pub struct ParseStreamKeyError(String);

/// Identifier of a logical append-only log.
///
/// Streams have no explicit lifecycle: a key exists as soon as the first event
/// is inserted under it.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings
/// - `From::from()` and `new()`: no validation (trusted input)
///
/// # Examples
///
/// ```
/// use evlog_core::stream::StreamKey;
///
/// let key = StreamKey::new("chat-room-7");
/// assert_eq!(key.as_str(), "chat-room-7");
///
/// let parsed: StreamKey = "presence".parse().unwrap();
/// assert_eq!(parsed, StreamKey::new("presence"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey(String);

impl StreamKey {
    /// Create a new `StreamKey`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamKey {
    type Err = ParseStreamKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamKeyError("Stream key cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resume position inside a stream.
///
/// The meaning of the number is backend-specific:
///
/// - PostgreSQL: the row id of the last event read (ids are globally monotonic)
/// - Redis: the number of list entries already consumed (a list-length offset)
///
/// Callers only rely on ordering: a cursor returned by a later read is never
/// smaller than the one passed in.
///
/// # Examples
///
/// ```
/// use evlog_core::stream::Cursor;
///
/// let c1 = Cursor::new(3);
/// let c2 = c1 + 2;
/// assert!(c2 > c1);
/// assert_eq!(c2.value(), 5);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(u64);

impl Cursor {
    /// Create a cursor from its raw position.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw position.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Raw position of an optional cursor, treating `None` as zero.
    ///
    /// Useful for backends whose positions start right after zero
    /// (row ids start at 1, list offsets at 0).
    #[must_use]
    pub fn offset_of(cursor: Option<Self>) -> u64 {
        cursor.map_or(0, Self::value)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Cursor {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cursor> for u64 {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

impl FromStr for Cursor {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

/// Advance a cursor by a number of positions.
impl std::ops::Add<u64> for Cursor {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}
