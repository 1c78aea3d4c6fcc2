//! Redis backend: `LPUSH`/`BRPOP` task list, `PUBLISH` events, `SET EX` flags.

use std::time::Duration;

use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use super::retry::{RetryPolicy, with_backoff};
use super::{QueueClient, Task, cancel_key, channel_name};
use crate::error::QueueError;
use crate::events::StreamEvent;

/// Queue client backed by Redis.
///
/// Blocking pops use their own connection so a long `BRPOP` never delays
/// publishes or flag checks.
#[derive(Clone)]
pub struct RedisQueue {
    pop_conn: ConnectionManager,
    conn: ConnectionManager,
    key: String,
}

impl RedisQueue {
    /// Connect, retrying with exponential back-off.
    pub async fn connect(
        url: &SecretString,
        key: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(url.expose_secret()).map_err(|e| {
            QueueError::ConnectFailed {
                attempts: 0,
                reason: e.to_string(),
            }
        })?;

        let open = || {
            let client = client.clone();
            async move {
                let mut conn = ConnectionManager::new(client).await?;
                let _pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
                Ok::<_, QueueError>(conn)
            }
        };

        let conn = with_backoff(policy, "connect", open)
            .await
            .map_err(|e| QueueError::ConnectFailed {
                attempts: policy.max_attempts,
                reason: e.to_string(),
            })?;
        let pop_conn = with_backoff(policy, "connect", open)
            .await
            .map_err(|e| QueueError::ConnectFailed {
                attempts: policy.max_attempts,
                reason: e.to_string(),
            })?;

        let key = key.into();
        info!(queue = %key, "Connected to Redis");
        Ok(Self {
            pop_conn,
            conn,
            key,
        })
    }

    /// Producer side: push a task onto the list.
    pub async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(&self.key, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueClient for RedisQueue {
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let mut conn = self.pop_conn.clone();
        let popped: Option<(String, String)> = ::redis::cmd("BRPOP")
            .arg(&self.key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        let Some((_key, payload)) = popped else {
            return Ok(None);
        };
        match Task::from_payload(&payload) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(error = %e, payload_len = payload.len(), "Dropping malformed task payload");
                Ok(None)
            }
        }
    }

    async fn publish(&self, session_id: &str, event: &StreamEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_string(event)?;
        let channel = channel_name(session_id);
        with_backoff(&RetryPolicy::PUBLISH, "publish", || {
            let mut conn = self.conn.clone();
            let channel = channel.clone();
            let payload = payload.clone();
            async move {
                let _receivers: i64 = conn.publish(channel, payload).await?;
                Ok(())
            }
        })
        .await
    }

    async fn is_cancelled(&self, session_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(cancel_key(session_id)).await?;
        Ok(exists)
    }

    async fn set_cancelled(&self, session_id: &str, ttl: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(cancel_key(session_id))
            .arg("1")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_cancelled(&self, session_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(cancel_key(session_id)).await?;
        Ok(())
    }
}
