//! `PostgreSQL` projection storage.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE projection_cursors (
//!     key TEXT PRIMARY KEY,
//!     cursor BIGINT NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE TABLE projection_sets (
//!     target TEXT NOT NULL,
//!     member TEXT NOT NULL,
//!     PRIMARY KEY (target, member)
//! );
//! CREATE TABLE projection_lists (
//!     id BIGSERIAL PRIMARY KEY,
//!     target TEXT NOT NULL,
//!     value TEXT NOT NULL
//! );
//! ```
//!
//! `PostgreSQL` has no `WATCH`, so the compare-and-swap is a conditional
//! write of the cursor row inside the same transaction as the operations:
//! `UPDATE ... WHERE cursor = expected` (or `INSERT ... ON CONFLICT DO
//! NOTHING` for a first commit). A concurrent committer holds the row lock
//! until it commits, after which the condition no longer matches and zero
//! rows are affected, which is reported as a conflict.
//!
//! Projections may live in a different database than the event log; see
//! [`PostgresProjectionBackend::new_with_separate_db`].

use crate::backend::{CommitOutcome, ProjectionBackend, ProjectionTransaction};
use crate::error::{ProjectionError, Result};
use crate::operation::{OpCode, Operation};
use evlog_core::stream::Cursor;
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::BTreeSet;

/// Projection storage in `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresProjectionBackend {
    pool: PgPool,
}

impl PostgresProjectionBackend {
    /// Create a backend over an existing pool (possibly the event log's).
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a backend on its own database.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if connection fails.
    pub async fn new_with_separate_db(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the projection tables. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r"
            CREATE TABLE IF NOT EXISTS projection_cursors (
                key TEXT PRIMARY KEY,
                cursor BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS projection_sets (
                target TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (target, member)
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS projection_lists (
                id BIGSERIAL PRIMARY KEY,
                target TEXT NOT NULL,
                value TEXT NOT NULL
            )
            ",
            "CREATE INDEX IF NOT EXISTS idx_projection_lists_target ON projection_lists (target, id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))?;
        }
        tracing::info!("Projection schema ready");
        Ok(())
    }

    /// Values of the list `target`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the read fails.
    pub async fn list(&self, target: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT value FROM projection_lists WHERE target = $1 ORDER BY id")
                .bind(target)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to read list: {e}")))?;
        Ok(rows.into_iter().map(|(value,)| value).collect())
    }
}

fn to_i64(cursor: Cursor) -> Result<i64> {
    i64::try_from(cursor.value())
        .map_err(|_| ProjectionError::Storage(format!("Cursor {cursor} does not fit in BIGINT")))
}

fn from_i64(raw: i64) -> Result<Cursor> {
    u64::try_from(raw)
        .map(Cursor::new)
        .map_err(|_| ProjectionError::Storage(format!("Negative stored cursor {raw}")))
}

impl ProjectionBackend for PostgresProjectionBackend {
    fn read_cursor<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Cursor>>> {
        Box::pin(async move {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT cursor FROM projection_cursors WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| ProjectionError::Storage(format!("Failed to read cursor: {e}")))?;
            row.map(|(raw,)| from_i64(raw)).transpose()
        })
    }

    fn begin<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Box<dyn ProjectionTransaction>>> {
        Box::pin(async move {
            let current = self.read_cursor(key).await?;
            Ok(Box::new(PostgresTransaction {
                pool: self.pool.clone(),
                key: key.to_string(),
                current,
            }) as Box<dyn ProjectionTransaction>)
        })
    }

    fn members<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<BTreeSet<String>>> {
        Box::pin(async move {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT member FROM projection_sets WHERE target = $1")
                    .bind(target)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| ProjectionError::Storage(format!("Failed to read members: {e}")))?;
            Ok(rows.into_iter().map(|(member,)| member).collect())
        })
    }
}

struct PostgresTransaction {
    pool: PgPool,
    key: String,
    current: Option<Cursor>,
}

impl PostgresTransaction {
    /// Move the cursor from `current` to `cursor`; false if someone else moved it first.
    async fn claim_cursor(&self, tx: &mut Transaction<'_, Postgres>, cursor: Cursor) -> Result<bool> {
        let next = to_i64(cursor)?;
        let result = match self.current {
            Some(expected) => {
                sqlx::query(
                    "UPDATE projection_cursors SET cursor = $3, updated_at = now() \
                     WHERE key = $1 AND cursor = $2",
                )
                .bind(&self.key)
                .bind(to_i64(expected)?)
                .bind(next)
                .execute(&mut **tx)
                .await
            }
            None => {
                sqlx::query(
                    "INSERT INTO projection_cursors (key, cursor) VALUES ($1, $2) \
                     ON CONFLICT (key) DO NOTHING",
                )
                .bind(&self.key)
                .bind(next)
                .execute(&mut **tx)
                .await
            }
        }
        .map_err(|e| ProjectionError::Storage(format!("Failed to update cursor: {e}")))?;

        Ok(result.rows_affected() == 1)
    }
}

async fn apply_operation(tx: &mut Transaction<'_, Postgres>, operation: &Operation) -> sqlx::Result<()> {
    match operation.op {
        OpCode::SetAdd => {
            sqlx::query(
                "INSERT INTO projection_sets (target, member) SELECT $1, unnest($2::text[]) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&operation.target)
            .bind(&operation.args)
            .execute(&mut **tx)
            .await?;
        }
        OpCode::SetRemove => {
            sqlx::query("DELETE FROM projection_sets WHERE target = $1 AND member = ANY($2)")
                .bind(&operation.target)
                .bind(&operation.args)
                .execute(&mut **tx)
                .await?;
        }
        OpCode::ListPush => {
            sqlx::query(
                "INSERT INTO projection_lists (target, value) \
                 SELECT $1, value FROM unnest($2::text[]) WITH ORDINALITY AS t(value, n) ORDER BY n",
            )
            .bind(&operation.target)
            .bind(&operation.args)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

impl ProjectionTransaction for PostgresTransaction {
    fn current_cursor(&self) -> Option<Cursor> {
        self.current
    }

    fn commit(
        self: Box<Self>,
        operations: Vec<Operation>,
        cursor: Cursor,
    ) -> BoxFuture<'static, Result<CommitOutcome>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to begin transaction: {e}")))?;

            if !self.claim_cursor(&mut tx, cursor).await? {
                tx.rollback()
                    .await
                    .map_err(|e| ProjectionError::Storage(format!("Failed to roll back: {e}")))?;
                return Ok(CommitOutcome::Conflict);
            }

            for operation in operations.iter().filter(|op| !op.args.is_empty()) {
                apply_operation(&mut tx, operation).await.map_err(|e| {
                    ProjectionError::Storage(format!("Failed to apply {}: {e}", operation.op))
                })?;
            }

            tx.commit()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to commit transaction: {e}")))?;
            Ok(CommitOutcome::Committed)
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
        // Nothing is held between begin and commit.
        Box::pin(async {})
    }
}
