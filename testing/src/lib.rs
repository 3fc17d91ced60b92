//! # evlog testing
//!
//! In-memory backends and helpers for testing code built on evlog.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: an [`EventLog`](evlog_core::event_store::EventLog) with query
//!   counters, pausing and failure injection
//! - [`InMemoryBroker`] / [`InMemoryPubSub`]: a pub/sub transport with call counters,
//!   shareable between several notifiers to simulate several processes
//! - [`InMemoryProjectionBackend`]: a projection store with WATCH-style conflict
//!   detection, pool accounting and failure injection
//! - [`FixedClock`]: deterministic timestamps
//!
//! ## Example
//!
//! ```
//! use evlog_testing::{InMemoryEventLog, InMemoryProjectionBackend};
//! use evlog_projections::ProjectionEngine;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let log = InMemoryEventLog::new();
//! let engine = ProjectionEngine::new(InMemoryProjectionBackend::new(), log.notifier().clone());
//! # drop(engine);
//! # }
//! ```

use chrono::{DateTime, Utc};
use evlog_core::environment::Clock;

pub mod event_log;
pub mod projection_mocks;
pub mod pubsub;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use evlog_testing::mocks::FixedClock;
    /// use evlog_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
///
/// Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use event_log::InMemoryEventLog;
pub use mocks::{FixedClock, test_clock};
pub use projection_mocks::{FakeConnections, InMemoryProjectionBackend};
pub use pubsub::{InMemoryBroker, InMemoryPubSub, PubSubStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
