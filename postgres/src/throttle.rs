//! Sliding-window rate limiting over stored events.
//!
//! The log doubles as the rate limiter's state: "at most N matching events
//! in the last W" is one `COUNT` over the table, and the retry delay is how
//! long until the oldest counted event leaves the window.

use crate::event_log::{PostgresEventLog, bind};
use crate::sql;
use chrono::{DateTime, Utc};
use evlog_core::event_store::EventStoreError;
use evlog_core::filter::Filters;
use sqlx::postgres::PgArguments;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors from [`PostgresEventLog::throttled`].
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// The limit is reached; retry after the given delay.
    #[error("Throttled, retry after {retry_after:?}")]
    Throttled {
        /// Time until the oldest counted event leaves the window.
        retry_after: Duration,
    },

    /// The count query failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl PostgresEventLog {
    /// Check a sliding-window limit.
    ///
    /// Counts events matching `filters` written within the last `window`.
    /// Returns `Some(delay)` once the count reaches `max_count`, where `delay`
    /// is the time until the oldest counted event leaves the window, and
    /// `None` while under the limit.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the count query fails.
    pub async fn should_throttle(
        &self,
        filters: &Filters,
        window: Duration,
        max_count: u64,
    ) -> Result<Option<Duration>, EventStoreError> {
        let Some(filters) = sql::to_columns(filters) else {
            return Ok(None);
        };
        let rendered = filters.to_sql(2);
        let statement = format!(
            "SELECT COUNT(*), MIN(timestamp), now() FROM events \
             WHERE timestamp > now() - make_interval(secs => $1) AND ({})",
            rendered.clause
        );

        let mut args = PgArguments::default();
        bind(&mut args, window.as_secs_f64())?;
        sql::push_params(&mut args, &rendered.params)?;

        let (count, oldest, now): (i64, Option<DateTime<Utc>>, DateTime<Utc>) =
            sqlx::query_as_with(&statement, args)
                .fetch_one(self.pool())
                .await
                .map_err(|e| EventStoreError::DatabaseError(format!("Failed to count events: {e}")))?;

        let count = u64::try_from(count).unwrap_or_default();
        if count < max_count {
            return Ok(None);
        }
        Ok(Some(retry_after(oldest, now, window)))
    }

    /// Run `action` unless the limit described by `filters`, `window` and
    /// `max_count` is reached.
    ///
    /// # Errors
    ///
    /// - [`ThrottleError::Throttled`] when over the limit (`action` is not run)
    /// - [`ThrottleError::Store`] if the count query fails
    pub async fn throttled<F, Fut, T>(
        &self,
        filters: &Filters,
        window: Duration,
        max_count: u64,
        action: F,
    ) -> Result<T, ThrottleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(retry_after) = self.should_throttle(filters, window, max_count).await? {
            tracing::debug!(?retry_after, max_count, "Throttled");
            return Err(ThrottleError::Throttled { retry_after });
        }
        Ok(action().await)
    }
}

fn retry_after(oldest: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> Duration {
    let Some(oldest) = oldest else {
        return Duration::ZERO;
    };
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let expires = oldest.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
    (expires - now).to_std().unwrap_or(Duration::ZERO)
}
