//! In-process broker with the same semantics as the Redis backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock, broadcast};
use tokio::time::Instant;
use tracing::debug;

use super::{QueueClient, Task, channel_name};
use crate::error::QueueError;
use crate::events::StreamEvent;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// An event together with the channel it was published on.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub channel: String,
    pub event: StreamEvent,
}

/// In-memory task list plus per-session broadcast channels.
pub struct MemoryQueue {
    tasks: Mutex<VecDeque<Task>>,
    task_ready: Notify,
    channels: RwLock<HashMap<String, broadcast::Sender<StreamEvent>>>,
    all_tx: broadcast::Sender<Published>,
    cancelled: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryQueue {
    /// Create a new queue.
    pub fn new() -> Arc<Self> {
        let (all_tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            tasks: Mutex::new(VecDeque::new()),
            task_ready: Notify::new(),
            channels: RwLock::new(HashMap::new()),
            all_tx,
            cancelled: RwLock::new(HashMap::new()),
        })
    }

    /// Producer side: append a task.
    pub async fn enqueue(&self, task: Task) {
        self.tasks.lock().await.push_back(task);
        self.task_ready.notify_one();
    }

    /// Number of tasks waiting.
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    /// Subscribe to one session's channel.
    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<StreamEvent> {
        let channel = channel_name(session_id);
        if let Some(tx) = self.channels.read().await.get(&channel) {
            return tx.subscribe();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(DEFAULT_BROADCAST_CAPACITY).0)
            .subscribe()
    }

    /// Drop a session channel whose subscribers have all gone away.
    async fn prune_channel(&self, channel: &str) {
        let mut channels = self.channels.write().await;
        let idle = channels
            .get(channel)
            .is_some_and(|tx| tx.receiver_count() == 0);
        if idle {
            channels.remove(channel);
            debug!(channel, "Dropped channel with no subscribers");
        }
    }

    /// Subscribe to every channel (pattern subscription).
    pub fn subscribe_all(&self) -> broadcast::Receiver<Published> {
        self.all_tx.subscribe()
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.tasks.lock().await.pop_front() {
                return Ok(Some(task));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, self.task_ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn publish(&self, session_id: &str, event: &StreamEvent) -> Result<(), QueueError> {
        let channel = channel_name(session_id);
        // Ok if nobody is listening
        let abandoned = match self.channels.read().await.get(&channel) {
            Some(tx) => tx.send(event.clone()).is_err(),
            None => false,
        };
        if abandoned {
            self.prune_channel(&channel).await;
        }
        let _ = self.all_tx.send(Published {
            channel,
            event: event.clone(),
        });
        Ok(())
    }

    async fn is_cancelled(&self, session_id: &str) -> Result<bool, QueueError> {
        let expires_at = match self.cancelled.read().await.get(session_id) {
            None => return Ok(false),
            Some(expires_at) => *expires_at,
        };
        if expires_at > Utc::now() {
            return Ok(true);
        }
        debug!(session_id, "Cancellation flag expired");
        self.cancelled.write().await.remove(session_id);
        Ok(false)
    }

    async fn set_cancelled(&self, session_id: &str, ttl: Duration) -> Result<(), QueueError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.cancelled
            .write()
            .await
            .insert(session_id.to_string(), expires_at);
        Ok(())
    }

    async fn clear_cancelled(&self, session_id: &str) -> Result<(), QueueError> {
        self.cancelled.write().await.remove(session_id);
        Ok(())
    }
}
