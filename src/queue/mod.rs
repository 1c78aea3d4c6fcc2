//! Queue client: task intake, event fan-out and cancellation flags.
//!
//! Backends:
//! - `memory`: in-process broker (tests, embedding)
//! - `redis`: `BRPOP` task list, `PUBLISH` per-session channel, flag keys

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod retry;

pub use memory::MemoryQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;
pub use retry::{Backoff, RetryPolicy};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::events::StreamEvent;

/// Default lifetime of a cancellation flag.
pub const DEFAULT_CANCEL_TTL: Duration = Duration::from_secs(300);

/// One inbound request to produce an agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Absent means "start a new session".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    /// A task for a new session.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            message: message.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Bind the task to an existing session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Decode a queue payload.
    pub fn from_payload(payload: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Session id supplied by the producer, if usable.
    pub fn requested_session(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Pub/sub channel carrying a session's events.
pub fn channel_name(session_id: &str) -> String {
    format!("task:{session_id}")
}

/// Key holding a session's cancellation flag.
pub fn cancel_key(session_id: &str) -> String {
    format!("task:{session_id}:cancelled")
}

/// Broker operations the worker depends on.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Block up to `timeout` for the next task. `None` on timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError>;

    /// Publish an event to the session's channel. No subscriber is not an error.
    async fn publish(&self, session_id: &str, event: &StreamEvent) -> Result<(), QueueError>;

    /// Whether a cancellation flag is set for the session.
    async fn is_cancelled(&self, session_id: &str) -> Result<bool, QueueError>;

    /// Set the cancellation flag; it expires after `ttl`.
    async fn set_cancelled(&self, session_id: &str, ttl: Duration) -> Result<(), QueueError>;

    /// Remove the cancellation flag.
    async fn clear_cancelled(&self, session_id: &str) -> Result<(), QueueError>;
}
