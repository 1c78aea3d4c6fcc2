//! Per-session agent cache.
//!
//! Maps a session id to a live engine handle. Entries are created lazily on
//! the first task for a session and expire after the session TTL. The map
//! lock is only held for map operations; engine calls (create, release)
//! happen outside it.
//!
//! Eviction of a handle that is still in use by a task is advisory: the entry
//! is removed but the handle is not released. The task hands it back through
//! `checkin`, which reinstalls it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::{AgentFactory, AgentHandle};
use crate::error::EngineError;

struct CacheEntry {
    handle: Arc<dyn AgentHandle>,
    last_used_at: DateTime<Utc>,
    message_count: u64,
}

impl CacheEntry {
    fn new(handle: Arc<dyn AgentHandle>, now: DateTime<Utc>) -> Self {
        Self {
            handle,
            last_used_at: now,
            message_count: 0,
        }
    }

    /// Refresh `last_used_at`, keeping it strictly increasing.
    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used_at = if now > self.last_used_at {
            now
        } else {
            self.last_used_at + chrono::Duration::nanoseconds(1)
        };
    }
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub session_id: String,
    pub last_used_at: DateTime<Utc>,
    pub message_count: u64,
}

/// Session id → live agent handle.
pub struct AgentCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl AgentCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        })
    }

    /// Return the session's live handle, creating it on a miss.
    ///
    /// An expired entry is evicted before the factory runs. The factory is
    /// called at most once per call; a failure leaves no entry behind.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        factory: &dyn AgentFactory,
    ) -> Result<Arc<dyn AgentHandle>, EngineError> {
        let now = Utc::now();
        let stale = {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(session_id) {
                if !is_expired(entry.last_used_at, self.ttl, now) {
                    entry.touch(now);
                    entry.message_count += 1;
                    debug!(session_id, messages = entry.message_count, "Agent cache hit");
                    return Ok(entry.handle.clone());
                }
            }
            entries.remove(session_id)
        };

        if let Some(stale) = stale {
            info!(session_id, "Cached agent expired, recreating");
            release_unless_leased(session_id, stale.handle).await;
        }

        debug!(session_id, "Agent cache miss, creating agent");
        let handle = factory.create(session_id).await?;

        let mut entries = self.entries.lock().await;
        match entries.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                // Another task installed one while we were creating.
                let entry = occupied.get_mut();
                entry.touch(Utc::now());
                entry.message_count += 1;
                let existing = entry.handle.clone();
                drop(entries);
                handle.release().await;
                Ok(existing)
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(CacheEntry::new(handle.clone(), now));
                entry.message_count = 1;
                info!(session_id, "Agent cached");
                Ok(handle)
            }
        }
    }

    /// Hand a handle back after a task.
    ///
    /// Refreshes the entry if it still holds this handle, reinstalls it if the
    /// entry was evicted meanwhile, and releases it if a different handle has
    /// taken its place.
    pub async fn checkin(&self, session_id: &str, handle: Arc<dyn AgentHandle>) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        match entries.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if Arc::ptr_eq(&entry.handle, &handle) {
                    entry.touch(now);
                    return;
                }
                drop(entries);
                debug!(session_id, "Releasing superseded agent");
                release_unless_leased(session_id, handle).await;
            }
            Entry::Vacant(vacant) => {
                debug!(session_id, "Reinstalling agent evicted while in use");
                let entry = vacant.insert(CacheEntry::new(handle, now));
                entry.message_count = 1;
            }
        }
    }

    /// Remove the session's entry and release its handle.
    ///
    /// Returns whether an entry existed.
    pub async fn evict(&self, session_id: &str) -> bool {
        let removed = self.entries.lock().await.remove(session_id);
        match removed {
            Some(entry) => {
                release_unless_leased(session_id, entry.handle).await;
                info!(session_id, "Evicted cached agent");
                true
            }
            None => false,
        }
    }

    /// Sessions whose entry has been idle longer than `ttl` at `now`.
    pub async fn list_expired(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| is_expired(entry.last_used_at, ttl, now))
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        expired
    }

    /// Every cached session id, sorted.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.entries.lock().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn info(&self, session_id: &str) -> Option<EntryInfo> {
        self.entries
            .lock()
            .await
            .get(session_id)
            .map(|entry| EntryInfo {
                session_id: session_id.to_string(),
                last_used_at: entry.last_used_at,
                message_count: entry.message_count,
            })
    }

    /// Release every cached handle. Used when the worker stops.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, CacheEntry)> = self.entries.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Releasing cached agents");
        for (_, entry) in drained {
            entry.handle.release().await;
        }
    }
}

fn is_expired(last_used_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(last_used_at) > ttl
}

/// Release a handle nobody else holds. A handle still leased by a task is
/// left alone; the task checks it back in.
async fn release_unless_leased(session_id: &str, handle: Arc<dyn AgentHandle>) {
    if Arc::strong_count(&handle) > 1 {
        debug!(session_id, "Agent in use, deferring release");
        return;
    }
    handle.release().await;
}
