//! `PostgreSQL` event log.
//!
//! All streams share one `events` table; the row id is the cursor, so
//! cursors are globally monotonic and `id > cursor` resumes a read.

use crate::listener::PgNotifyTransport;
use crate::sql;
use chrono::{DateTime, Utc};
use evlog_core::event::{EventMetadata, InsertMetadata, StoredEvent};
use evlog_core::event_store::{EventLog, EventStoreError, LogConfig, Page, QueryOptions, observe};
use evlog_core::live::LiveStream;
use evlog_core::notifier::{Notifier, incoming_channel};
use evlog_core::stream::{Cursor, StreamKey};
use serde_json::Value;
use sqlx::Arguments;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

const SELECT_COLUMNS: &str = "id, data, timestamp, process_id, actor, connection_id, \
                              session_id, ip_address, aggregate_root";

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    data: Json<Value>,
    timestamp: DateTime<Utc>,
    process_id: String,
    actor: Option<Json<Value>>,
    connection_id: Option<String>,
    session_id: Option<String>,
    ip_address: Option<String>,
    aggregate_root: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Result<StoredEvent, EventStoreError> {
        let id = u64::try_from(self.id)
            .map_err(|_| EventStoreError::DatabaseError(format!("Negative event id {}", self.id)))?;
        Ok(StoredEvent {
            cursor: Cursor::new(id),
            value: self.data.0,
            metadata: EventMetadata {
                timestamp: self.timestamp,
                actor: self.actor.map(|actor| actor.0),
                process_id: self.process_id,
                connection_id: self.connection_id,
                session_id: self.session_id,
                ip_address: self.ip_address,
                aggregate_root: self.aggregate_root,
            },
        })
    }
}

pub(crate) struct Inner {
    pub(crate) pool: PgPool,
    notifier: Notifier,
    config: LogConfig,
}

/// Event log stored in `PostgreSQL`.
///
/// Cheap to clone; clones share the pool and the listener connection.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE events (
///     id BIGSERIAL PRIMARY KEY,
///     key TEXT NOT NULL,
///     data JSONB NOT NULL,
///     timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
///     process_id TEXT NOT NULL,
///     actor JSONB,
///     connection_id TEXT,
///     session_id TEXT,
///     ip_address TEXT,
///     aggregate_root TEXT
/// );
/// ```
///
/// Created by [`PostgresEventLog::migrate`].
///
/// # Notifications
///
/// Observers are woken by a `NOTIFY` sent after the insert transaction
/// commits, so a woken query always sees the new rows and a failed
/// notification never fails the insert. Keys longer than a `PostgreSQL`
/// channel name are notified on a digest, see [`crate::listener::channel_name`].
/// Writers that bypass this client must notify the same channel themselves.
///
/// # Example
///
/// ```no_run
/// use evlog_postgres::PostgresEventLog;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = PostgresEventLog::builder()
///     .database_url("postgres://localhost/evlog")
///     .max_connections(20)
///     .build()
///     .await?;
/// log.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresEventLog {
    pub(crate) inner: Arc<Inner>,
}

impl PostgresEventLog {
    /// Start building a log.
    #[must_use]
    pub fn builder() -> PostgresEventLogBuilder {
        PostgresEventLogBuilder::default()
    }

    /// Create a log over an existing pool with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Notifier`] if the listener connection
    /// cannot be opened.
    pub async fn from_pool(pool: PgPool) -> Result<Self, EventStoreError> {
        Self::with_config(pool, LogConfig::default()).await
    }

    /// Create a log over an existing pool.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Notifier`] if the listener connection
    /// cannot be opened.
    pub async fn with_config(pool: PgPool, config: LogConfig) -> Result<Self, EventStoreError> {
        let (incoming_tx, incoming_rx) = incoming_channel();
        let transport = PgNotifyTransport::connect(pool.clone(), incoming_tx).await?;
        let notifier = Notifier::with_capacity(transport, incoming_rx, config.channel_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                notifier,
                config,
            }),
        })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// The notifier carrying this log's stream wakes.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Create the `events` table and its indexes.
    ///
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        let statements = [
            r"
            CREATE TABLE IF NOT EXISTS events (
                id BIGSERIAL PRIMARY KEY,
                key TEXT NOT NULL,
                data JSONB NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
                process_id TEXT NOT NULL,
                actor JSONB,
                connection_id TEXT,
                session_id TEXT,
                ip_address TEXT,
                aggregate_root TEXT
            )
            ",
            "CREATE INDEX IF NOT EXISTS idx_events_key_id ON events (key, id)",
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp)",
            // Wakes are sent after commit; remove the old in-transaction trigger.
            "DROP TRIGGER IF EXISTS evlog_events_notify ON events",
            "DROP FUNCTION IF EXISTS evlog_notify_insert()",
        ];

        let mut tx = self
            .inner
            .pool
            .begin()
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to begin migration: {e}")))?;
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| EventStoreError::DatabaseError(format!("Migration failed: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to commit migration: {e}")))?;

        tracing::info!("Event log schema ready");
        Ok(())
    }

    async fn insert_rows(
        &self,
        key: &StreamKey,
        values: Vec<Value>,
        metadata: InsertMetadata,
    ) -> Result<Vec<Cursor>, EventStoreError> {
        let mut tx = self
            .inner
            .pool
            .begin()
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to begin transaction: {e}")))?;

        let mut cursors = Vec::with_capacity(values.len());
        for value in values {
            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO events (
                    key, data, process_id, actor, connection_id,
                    session_id, ip_address, aggregate_root
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
                ",
            )
            .bind(key.as_str())
            .bind(Json(value))
            .bind(&self.inner.config.process_id)
            .bind(metadata.actor.clone().map(Json))
            .bind(&metadata.connection_id)
            .bind(&metadata.session_id)
            .bind(&metadata.ip_address)
            .bind(&metadata.aggregate_root)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to insert event: {e}")))?;

            let id = u64::try_from(id)
                .map_err(|_| EventStoreError::DatabaseError(format!("Negative event id {id}")))?;
            cursors.push(Cursor::new(id));
        }

        tx.commit()
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to commit events: {e}")))?;
        Ok(cursors)
    }

    async fn select_page(&self, key: &StreamKey, options: &QueryOptions) -> Result<Page, EventStoreError> {
        let Some(filters) = sql::to_columns(&options.filters) else {
            return Ok(Page::from_events(&[], &options.include_metadata, options.after));
        };

        let rendered = filters.to_sql(3);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events WHERE key = $1 AND id > $2 AND ({}) ORDER BY id",
            rendered.clause
        );

        let mut args = PgArguments::default();
        bind(&mut args, key.as_str().to_string())?;
        bind(&mut args, cursor_param(options.after)?)?;
        sql::push_params(&mut args, &rendered.params)?;

        let rows: Vec<EventRow> = sqlx::query_as_with(&sql, args)
            .fetch_all(&self.inner.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to load events: {e}")))?;

        let events = rows
            .into_iter()
            .map(EventRow::into_event)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_events(&events, &options.include_metadata, options.after))
    }
}

pub(crate) fn bind<T>(args: &mut PgArguments, value: T) -> Result<(), EventStoreError>
where
    T: for<'q> sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Send + 'static,
{
    args.add(value)
        .map_err(|e| EventStoreError::DatabaseError(format!("Failed to bind parameter: {e}")))
}

fn cursor_param(cursor: Option<Cursor>) -> Result<i64, EventStoreError> {
    i64::try_from(Cursor::offset_of(cursor))
        .map_err(|_| EventStoreError::DatabaseError("Cursor out of range".to_string()))
}

impl EventLog for PostgresEventLog {
    fn insert_events(
        &self,
        key: StreamKey,
        values: Vec<Value>,
        metadata: InsertMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Cursor>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if values.is_empty() {
                return Ok(Vec::new());
            }
            let count = values.len();
            let cursors = self.insert_rows(&key, values, metadata).await?;

            tracing::debug!(key = %key, count, "Inserted events");
            metrics::counter!("evlog.events.inserted", "backend" => "postgres")
                .increment(count as u64);

            // The write is durable; waking observers must not hold up or fail it.
            let notifier = self.inner.notifier.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(key.as_str(), None).await {
                    tracing::warn!(key = %key, error = %e, "Failed to notify stream");
                    metrics::counter!("evlog.notify.failed", "backend" => "postgres").increment(1);
                }
            });

            Ok(cursors)
        })
    }

    fn query(
        &self,
        key: StreamKey,
        options: QueryOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Page, EventStoreError>> + Send + '_>> {
        Box::pin(async move { self.select_page(&key, &options).await })
    }

    fn observable(&self, key: StreamKey, options: QueryOptions) -> LiveStream<Page, EventStoreError> {
        observe(self, &self.inner.notifier, key, options, self.inner.config.live_buffer)
    }
}

/// Builder for [`PostgresEventLog`].
#[derive(Clone, Debug)]
pub struct PostgresEventLogBuilder {
    database_url: Option<String>,
    max_connections: u32,
    acquire_timeout: Duration,
    config: LogConfig,
}

impl Default for PostgresEventLogBuilder {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            config: LogConfig::default(),
        }
    }
}

impl PostgresEventLogBuilder {
    /// Connection string (required).
    #[must_use]
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Pool size (default 10).
    #[must_use]
    pub const fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// How long to wait for a pooled connection (default 30s).
    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Shared log settings.
    #[must_use]
    pub fn config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect and start the listener.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::DatabaseError`] if no URL was given or the pool cannot connect
    /// - [`EventStoreError::Notifier`] if the listener connection fails
    pub async fn build(self) -> Result<PostgresEventLog, EventStoreError> {
        let url = self
            .database_url
            .ok_or_else(|| EventStoreError::DatabaseError("database_url is required".to_string()))?;
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&url)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to connect: {e}")))?;
        PostgresEventLog::with_config(pool, self.config).await
    }
}
