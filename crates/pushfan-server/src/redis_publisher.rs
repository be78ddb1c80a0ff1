//! Redis-backed provider queues.
//!
//! Each provider queue is a Redis list. Envelopes are pushed as JSON with
//! `RPUSH`; provider workers pop from the other end.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, redis::AsyncCommands};
use pushfan_notifications::{NotificationError, QueuePublisher, WebPushEnvelope};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RedisConfig;

/// Creates the Redis pool and checks that a connection can be made.
pub async fn create_redis_pool(config: &RedisConfig) -> anyhow::Result<Pool> {
    info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = Some(Duration::from_millis(config.timeout_ms));
    let pool_config = redis_config.pool.get_or_insert_with(Default::default);
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    let pool = redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| anyhow::anyhow!("Failed to create Redis pool: {e}"))?;
    pool.get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Redis at {}: {e}", config.url))?;

    info!("Connected to Redis");
    Ok(pool)
}

pub struct RedisQueuePublisher {
    pool: Pool,
}

impl RedisQueuePublisher {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueuePublisher for RedisQueuePublisher {
    // The token is ignored: buffers flushed after cancellation still go out.
    async fn publish(
        &self,
        envelope: &WebPushEnvelope,
        queue_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), NotificationError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| NotificationError::Internal(format!("Envelope serialization: {e}")))?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| NotificationError::PublishFailed(format!("Redis pool: {e}")))?;

        let length: i64 = conn
            .rpush(queue_name, payload)
            .await
            .map_err(|e| NotificationError::PublishFailed(format!("RPUSH {queue_name}: {e}")))?;

        debug!(
            queue = %queue_name,
            push_contact_id = %envelope.push_contact_id,
            message_id = %envelope.message_id,
            queue_length = length,
            "Published web push envelope"
        );
        Ok(())
    }
}
