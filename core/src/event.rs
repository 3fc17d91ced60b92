//! Event records, metadata and read projections.
//!
//! Events are opaque JSON values plus a fixed set of metadata attributes. The
//! metadata is what [`Filters`](crate::filter::Filters) select on, so its JSON
//! shape (camelCase attribute names) is part of the contract: the in-process
//! predicate sees exactly the object produced by [`StoredEvent::attributes`].

use crate::stream::Cursor;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Identifier of the running process, recorded on every inserted event.
///
/// Generated once per process.
#[must_use]
pub fn process_id() -> &'static str {
    static PROCESS_ID: OnceLock<String> = OnceLock::new();
    PROCESS_ID.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

/// Caller-supplied metadata for an insert.
///
/// Timestamp and process id are filled in by the store.
///
/// # Example
///
/// ```
/// use evlog_core::event::InsertMetadata;
///
/// let meta = InsertMetadata::new()
///     .with_session_id("session-1")
///     .with_ip_address("10.0.0.1");
/// assert_eq!(meta.session_id.as_deref(), Some("session-1"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertMetadata {
    /// Authenticated principal (arbitrary JSON, e.g. decoded token claims).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Value>,
    /// Connection the event arrived on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Session the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Remote address of the writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Aggregate the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_root: Option<String>,
}

impl InsertMetadata {
    /// Empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the actor.
    #[must_use]
    pub fn with_actor(mut self, actor: Value) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Set the connection id.
    #[must_use]
    pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    /// Set the session id.
    #[must_use]
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the remote address.
    #[must_use]
    pub fn with_ip_address(mut self, address: impl Into<String>) -> Self {
        self.ip_address = Some(address.into());
        self
    }

    /// Set the aggregate root.
    #[must_use]
    pub fn with_aggregate_root(mut self, root: impl Into<String>) -> Self {
        self.aggregate_root = Some(root.into());
        self
    }

    /// Stamp with the write time and the writing process.
    #[must_use]
    pub fn stamp(self, timestamp: DateTime<Utc>, process_id: impl Into<String>) -> EventMetadata {
        EventMetadata {
            timestamp,
            actor: self.actor,
            process_id: process_id.into(),
            connection_id: self.connection_id,
            session_id: self.session_id,
            ip_address: self.ip_address,
            aggregate_root: self.aggregate_root,
        }
    }
}

/// Metadata recorded with every event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Write time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Authenticated principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Value>,
    /// Process that wrote the event.
    pub process_id: String,
    /// Connection the event arrived on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Session the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Remote address of the writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Aggregate the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_root: Option<String>,
}

/// A durably written event.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEvent {
    /// Position assigned at write time.
    pub cursor: Cursor,
    /// The opaque payload.
    pub value: Value,
    /// Write metadata.
    pub metadata: EventMetadata,
}

impl StoredEvent {
    /// Metadata as a filterable JSON object.
    ///
    /// Timestamps are rendered as fixed-width RFC 3339 strings so that string
    /// comparison orders them chronologically.
    #[must_use]
    pub fn attributes(&self) -> Value {
        let mut map = Map::new();
        #[allow(clippy::cast_possible_wrap)]
        map.insert("id".into(), Value::from(self.cursor.value() as i64));
        map.insert("timestamp".into(), Value::from(format_timestamp(self.metadata.timestamp)));
        map.insert("processId".into(), Value::from(self.metadata.process_id.clone()));
        insert_opt(&mut map, "actor", self.metadata.actor.clone());
        insert_opt(&mut map, "connectionId", self.metadata.connection_id.clone().map(Value::from));
        insert_opt(&mut map, "sessionId", self.metadata.session_id.clone().map(Value::from));
        insert_opt(&mut map, "ipAddress", self.metadata.ip_address.clone().map(Value::from));
        insert_opt(&mut map, "aggregateRoot", self.metadata.aggregate_root.clone().map(Value::from));
        Value::Object(map)
    }

    /// Project into the shape requested by a read.
    #[must_use]
    pub fn view(&self, include: &IncludeMetadata) -> EventView {
        let mut view = EventView::bare(self.value.clone());
        let fields = match include {
            IncludeMetadata::None => return view,
            IncludeMetadata::All => MetadataField::DEFAULT_SET,
            IncludeMetadata::Fields(fields) => fields.as_slice(),
        };

        let meta = &self.metadata;
        for field in fields {
            match field {
                MetadataField::Id => view.id = Some(self.cursor),
                MetadataField::Timestamp => view.timestamp = Some(meta.timestamp),
                MetadataField::ProcessId => view.process_id = Some(meta.process_id.clone()),
                MetadataField::SessionId => view.session_id.clone_from(&meta.session_id),
                MetadataField::ConnectionId => view.connection_id.clone_from(&meta.connection_id),
                MetadataField::IpAddress => view.ip_address.clone_from(&meta.ip_address),
                MetadataField::AggregateRoot => view.aggregate_root.clone_from(&meta.aggregate_root),
                MetadataField::Actor => view.actor = meta.actor.clone().map(strip_token_claims),
            }
        }
        view
    }
}

/// Metadata attributes that can be requested on reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetadataField {
    /// The event position.
    Id,
    /// Write time.
    Timestamp,
    /// Writing process.
    ProcessId,
    /// Session id.
    SessionId,
    /// Connection id.
    ConnectionId,
    /// Remote address.
    IpAddress,
    /// Aggregate root.
    AggregateRoot,
    /// Actor (token claims stripped of `iat`).
    Actor,
}

impl MetadataField {
    /// Fields returned by [`IncludeMetadata::All`].
    pub const DEFAULT_SET: &'static [Self] = &[
        Self::Id,
        Self::Timestamp,
        Self::ProcessId,
        Self::SessionId,
        Self::Actor,
        Self::AggregateRoot,
        Self::IpAddress,
    ];
}

/// Which metadata to return with each event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeMetadata {
    /// Values only.
    #[default]
    None,
    /// Value plus [`MetadataField::DEFAULT_SET`].
    All,
    /// Value plus exactly these fields.
    Fields(Vec<MetadataField>),
}

/// An event as returned by reads.
///
/// With [`IncludeMetadata::None`] only `value` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    /// The payload.
    pub value: Value,
    /// Event position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Cursor>,
    /// Write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Writing process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    /// Session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Connection id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Remote address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Aggregate root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_root: Option<String>,
    /// Actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Value>,
}

impl EventView {
    /// A view carrying only the payload.
    #[must_use]
    pub const fn bare(value: Value) -> Self {
        Self {
            value,
            id: None,
            timestamp: None,
            process_id: None,
            session_id: None,
            connection_id: None,
            ip_address: None,
            aggregate_root: None,
            actor: None,
        }
    }
}

/// Render a timestamp the way stored records and filter attributes carry it.
#[must_use]
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value);
    }
}

// Issued-at is per-token noise; readers compare actors across tokens.
fn strip_token_claims(actor: Value) -> Value {
    match actor {
        Value::Object(mut claims) => {
            claims.remove("iat");
            Value::Object(claims)
        }
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event() -> StoredEvent {
        let timestamp = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        StoredEvent {
            cursor: Cursor::new(4),
            value: json!({"text": "hi"}),
            metadata: InsertMetadata::new()
                .with_session_id("s1")
                .with_ip_address("10.0.0.1")
                .with_actor(json!({"sub": "u1", "iat": 1234}))
                .stamp(timestamp, process_id()),
        }
    }

    #[test]
    fn bare_view_has_only_value() {
        let view = event().view(&IncludeMetadata::None);
        assert_eq!(serde_json::to_value(view).unwrap(), json!({"value": {"text": "hi"}}));
    }

    #[test]
    fn all_metadata_uses_default_set() {
        let view = event().view(&IncludeMetadata::All);
        assert_eq!(view.id, Some(Cursor::new(4)));
        assert_eq!(view.process_id.as_deref(), Some(process_id()));
        assert_eq!(view.session_id.as_deref(), Some("s1"));
        assert!(view.connection_id.is_none());
        assert_eq!(view.actor, Some(json!({"sub": "u1"})));
    }

    #[test]
    fn field_subset_is_exact() {
        let view = event().view(&IncludeMetadata::Fields(vec![
            MetadataField::SessionId,
            MetadataField::Timestamp,
        ]));
        let json = serde_json::to_value(view).unwrap();
        assert!(json.get("sessionId").is_some());
        assert!(json.get("timestamp").is_some());
        assert!(json.get("processId").is_none());
        assert_eq!(json["value"], json!({"text": "hi"}));
    }

    #[test]
    fn attributes_use_camel_case_names() {
        let attributes = event().attributes();
        assert_eq!(attributes["ipAddress"], json!("10.0.0.1"));
        assert_eq!(attributes["id"], json!(4));
        assert_eq!(attributes["timestamp"], json!("2025-01-01T00:00:00.000000Z"));
        assert!(attributes.get("aggregateRoot").is_none());
    }

    #[test]
    fn process_id_is_stable() {
        assert_eq!(process_id(), process_id());
    }
}
