//! Redis-backed product cache.

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::info;

use super::ProductCache;
use crate::config::model::RedisConfig;
use crate::error::CacheError;

/// Product view cache in Redis.
#[derive(Clone)]
pub struct RedisProductCache {
    connection: redis::aio::ConnectionManager,
}

impl RedisProductCache {
    /// Connects with an auto-reconnecting connection manager.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let url = config.url();
        let connection_failed = |message: String| CacheError::ConnectionFailed {
            url: format!("redis://{}:{}/{}", config.host, config.port, config.db),
            message,
        };

        let client = redis::Client::open(url.as_str()).map_err(|e| connection_failed(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| connection_failed(e.to_string()))?;

        info!(host = %config.host, port = config.port, "Connected to Redis");
        Ok(Self { connection })
    }
}

#[async_trait]
impl ProductCache for RedisProductCache {
    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        // ConnectionManager is a cheap handle onto one multiplexed connection.
        let mut connection = self.connection.clone();
        connection
            .del::<_, ()>(key)
            .await
            .map_err(|e| CacheError::DeleteFailed {
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}
