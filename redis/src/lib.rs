//! # evlog Redis backend
//!
//! Streams are Redis lists with a companion position counter; wakes travel
//! over `PUBLISH`/`SUBSCRIBE`. Filters run in-process after an `LRANGE`.
//!
//! The crate also owns the connection split every Redis user of evlog needs:
//! one shared multiplexed connection for plain commands, plus a pool of
//! dedicated connections for `WATCH` transactions (see [`connections`]).

pub mod connections;
pub mod event_log;
pub mod pubsub;

pub use connections::{DedicatedConnection, DedicatedConnections, RedisConnections};
pub use event_log::{RedisEventLog, RedisEventLogBuilder};
pub use pubsub::RedisPubSub;
