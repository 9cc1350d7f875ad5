//! Bounded Redis connection pool shared by the Redis bucket and task stores

use redis::aio::Connection;
use redis::Client;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::info;

use crate::error::{CoreError, CoreResult};

const DEFAULT_POOL_SIZE: usize = 20;
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 3000;
const DEFAULT_POOL_TIMEOUT_MS: u64 = 5000;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct RedisPoolConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Connection timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Pool timeout in milliseconds (waiting for available connection)
    pub pool_timeout_ms: u64,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_POOL_SIZE,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            pool_timeout_ms: DEFAULT_POOL_TIMEOUT_MS,
        }
    }
}

/// A connection checked out of the pool; the slot is released on drop
pub struct PooledConnection {
    conn: Connection,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Connection pool for Redis
///
/// Connections are opened lazily per checkout, so constructing a pool never
/// touches the network; an unreachable server surfaces as
/// [`CoreError::StoreUnavailable`] on first use.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    semaphore: Arc<Semaphore>,
    config: RedisPoolConfig,
}

impl RedisPool {
    /// Create a pool for `redis_url` with the default configuration
    pub fn new(redis_url: &str) -> CoreResult<Self> {
        Self::with_config(redis_url, RedisPoolConfig::default())
    }

    /// Create a pool with custom configuration
    pub fn with_config(redis_url: &str, config: RedisPoolConfig) -> CoreResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| CoreError::Configuration(format!("Invalid Redis URL '{}': {}", redis_url, e)))?;

        info!("Created Redis pool (max_connections={})", config.max_connections);

        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &RedisPoolConfig {
        &self.config
    }

    /// Free connection slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get a connection from the pool
    pub async fn get(&self) -> CoreResult<PooledConnection> {
        let permit = match time::timeout(
            Duration::from_millis(self.config.pool_timeout_ms),
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => {
                return Err(CoreError::StoreUnavailable(format!("Redis semaphore error: {}", e)))
            }
            Err(_) => {
                return Err(CoreError::StoreUnavailable(format!(
                    "Timed out waiting for Redis connection after {}ms",
                    self.config.pool_timeout_ms
                )))
            }
        };

        match time::timeout(
            Duration::from_millis(self.config.connection_timeout_ms),
            self.client.get_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(PooledConnection {
                conn,
                _permit: permit,
            }),
            Ok(Err(e)) => Err(CoreError::StoreUnavailable(format!("Redis connection error: {}", e))),
            Err(_) => Err(CoreError::StoreUnavailable(format!(
                "Timed out establishing Redis connection after {}ms",
                self.config.connection_timeout_ms
            ))),
        }
    }

    /// PING the server
    pub async fn ping(&self) -> CoreResult<bool> {
        let mut conn = self.get().await?;
        let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(pong == "PONG")
    }
}
