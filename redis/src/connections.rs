//! Global and pooled Redis connections.
//!
//! Plain commands (`RPUSH`, `LRANGE`, `PUBLISH`, `SMEMBERS`, ...) go through
//! one shared [`ConnectionManager`], which multiplexes and reconnects on its
//! own. `WATCH` state lives on a connection, so optimistic transactions must
//! never run on the shared one: they check out a dedicated connection from
//! the [`Pool`] instead. The two are different types, which keeps a `WATCH`
//! off the global connection at compile time.

use evlog_core::pool::{Manager, Pool, PoolConfig, PoolError, Pooled};
use futures::future::BoxFuture;
use redis::Client;
use redis::aio::{ConnectionManager, MultiplexedConnection};

/// Opens dedicated connections for the pool.
pub struct DedicatedConnections {
    client: Client,
}

impl Manager for DedicatedConnections {
    type Connection = MultiplexedConnection;

    fn create(&self) -> BoxFuture<'_, Result<MultiplexedConnection, PoolError>> {
        Box::pin(async move {
            let connection = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| PoolError::CreateFailed(e.to_string()))?;
            tracing::debug!("Opened dedicated Redis connection");
            Ok(connection)
        })
    }
}

/// A dedicated connection checked out of the pool.
pub type DedicatedConnection = Pooled<DedicatedConnections>;

/// Shared connection plus a pool of dedicated ones.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct RedisConnections {
    client: Client,
    global: ConnectionManager,
    pool: Pool<DedicatedConnections>,
}

impl RedisConnections {
    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns the Redis error if the URL is invalid or the shared connection
    /// cannot be established.
    pub async fn connect(redis_url: &str, pool_config: PoolConfig) -> Result<Self, redis::RedisError> {
        let client = Client::open(redis_url)?;
        Self::from_client(client, pool_config).await
    }

    /// Build from an existing client.
    ///
    /// # Errors
    ///
    /// Returns the Redis error if the shared connection cannot be established.
    pub async fn from_client(client: Client, pool_config: PoolConfig) -> Result<Self, redis::RedisError> {
        let global = ConnectionManager::new(client.clone()).await?;
        let pool = Pool::new(
            DedicatedConnections {
                client: client.clone(),
            },
            pool_config,
        );
        Ok(Self {
            client,
            global,
            pool,
        })
    }

    /// The shared connection, for commands that need no connection state.
    #[must_use]
    pub fn global(&self) -> ConnectionManager {
        self.global.clone()
    }

    /// Check out a dedicated connection (for `WATCH`/`MULTI`/`EXEC`).
    ///
    /// # Errors
    ///
    /// See [`Pool::acquire`].
    pub async fn dedicated(&self) -> Result<DedicatedConnection, PoolError> {
        self.pool.acquire().await
    }

    /// The dedicated connection pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<DedicatedConnections> {
        &self.pool
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }
}
