//! Redis projection storage.
//!
//! - `projection:{target}`: a set (or list) per operation target
//! - `projection:{key}:cursor`: the durable cursor of projection `key`
//!
//! A transaction checks out a dedicated connection, `WATCH`es the cursor
//! key and reads it. The commit is one `MULTI`/`EXEC` holding every
//! operation plus the cursor `SET`; Redis aborts the `EXEC` (nil reply) if
//! the cursor key was written after the `WATCH`.

use crate::backend::{
    CommitOutcome, ProjectionBackend, ProjectionTransaction, cursor_key, state_key,
};
use crate::error::{ProjectionError, Result};
use crate::operation::{OpCode, Operation};
use evlog_core::stream::Cursor;
use evlog_redis::{DedicatedConnection, RedisConnections};
use futures::future::BoxFuture;
use redis::AsyncCommands;
use std::collections::BTreeSet;

/// Projection storage in Redis.
#[derive(Clone)]
pub struct RedisProjectionBackend {
    connections: RedisConnections,
}

impl RedisProjectionBackend {
    /// Create a backend over shared connections.
    #[must_use]
    pub const fn new(connections: RedisConnections) -> Self {
        Self { connections }
    }

    /// The connections used.
    #[must_use]
    pub const fn connections(&self) -> &RedisConnections {
        &self.connections
    }
}

fn storage_error(context: &str, e: &redis::RedisError) -> ProjectionError {
    ProjectionError::Storage(format!("{context}: {e}"))
}

fn parse_cursor(raw: Option<String>) -> Result<Option<Cursor>> {
    raw.map(|raw| {
        raw.parse()
            .map_err(|e| ProjectionError::Storage(format!("Invalid stored cursor {raw:?}: {e}")))
    })
    .transpose()
}

impl ProjectionBackend for RedisProjectionBackend {
    fn read_cursor<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Cursor>>> {
        Box::pin(async move {
            let mut conn = self.connections.global();
            let raw: Option<String> = conn
                .get(cursor_key(key))
                .await
                .map_err(|e| storage_error("Failed to read cursor", &e))?;
            parse_cursor(raw)
        })
    }

    fn begin<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Box<dyn ProjectionTransaction>>> {
        Box::pin(async move {
            let mut conn = self.connections.dedicated().await?;
            let cursor_key = cursor_key(key);

            let watched: redis::RedisResult<Option<String>> = async {
                let (): () = redis::cmd("WATCH")
                    .arg(&cursor_key)
                    .query_async(&mut *conn)
                    .await?;
                conn.get(&cursor_key).await
            }
            .await;

            let current = watched
                .map_err(|e| storage_error("Failed to watch cursor", &e))
                .and_then(parse_cursor);
            match current {
                Ok(current) => Ok(Box::new(RedisTransaction {
                    conn,
                    cursor_key,
                    current,
                }) as Box<dyn ProjectionTransaction>),
                Err(e) => {
                    // The connection may still hold the WATCH.
                    conn.discard();
                    Err(e)
                }
            }
        })
    }

    fn members<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<BTreeSet<String>>> {
        Box::pin(async move {
            let mut conn = self.connections.global();
            conn.smembers(state_key(target))
                .await
                .map_err(|e| storage_error("Failed to read members", &e))
        })
    }
}

struct RedisTransaction {
    conn: DedicatedConnection,
    cursor_key: String,
    current: Option<Cursor>,
}

impl ProjectionTransaction for RedisTransaction {
    fn current_cursor(&self) -> Option<Cursor> {
        self.current
    }

    fn commit(
        self: Box<Self>,
        operations: Vec<Operation>,
        cursor: Cursor,
    ) -> BoxFuture<'static, Result<CommitOutcome>> {
        Box::pin(async move {
            let Self {
                mut conn,
                cursor_key,
                ..
            } = *self;

            let mut pipe = redis::pipe();
            pipe.atomic();
            for operation in &operations {
                if operation.args.is_empty() {
                    continue;
                }
                let key = state_key(&operation.target);
                match operation.op {
                    OpCode::SetAdd => pipe.sadd(key, &operation.args).ignore(),
                    OpCode::SetRemove => pipe.srem(key, &operation.args).ignore(),
                    OpCode::ListPush => pipe.rpush(key, &operation.args).ignore(),
                };
            }
            pipe.set(&cursor_key, cursor.value()).ignore();

            // EXEC replies nil when the watched cursor changed.
            let result: redis::RedisResult<Option<()>> = pipe.query_async(&mut *conn).await;
            match result {
                Ok(Some(())) => Ok(CommitOutcome::Committed),
                Ok(None) => Ok(CommitOutcome::Conflict),
                Err(e) => {
                    conn.discard();
                    Err(storage_error("Failed to commit projection batch", &e))
                }
            }
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Self { mut conn, .. } = *self;
            let unwatched: redis::RedisResult<()> =
                redis::cmd("UNWATCH").query_async(&mut *conn).await;
            if let Err(e) = unwatched {
                tracing::warn!(error = %e, "UNWATCH failed, discarding connection");
                conn.discard();
            }
        })
    }
}
