//! Session sweeper: periodic retention enforcement.
//!
//! Each run makes two passes over the on-disk session records:
//! 1. TTL pass: records idle longer than the TTL are deleted
//! 2. Max-count pass: the oldest surplus records are deleted
//!
//! Every deleted record also loses its cache entry, as does any cache entry
//! whose record is no longer on disk. Cache entries that are past the TTL on
//! their own are evicted too; their disk records are left alone since another
//! worker may still be using them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::AgentCache;
use crate::error::StoreError;
use crate::store::{SessionRecord, SessionStore};

/// Session ids selected for deletion by one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPlan {
    pub expired: Vec<String>,
    pub overflow: Vec<String>,
    /// Records kept after both passes.
    pub keep: Vec<String>,
}

/// Decide which records to delete.
///
/// Overflow victims are the oldest by `last_modified`, ties broken by
/// ascending session id.
pub fn plan_sweep(
    records: Vec<SessionRecord>,
    ttl: Duration,
    max_sessions: usize,
    now: DateTime<Utc>,
) -> SweepPlan {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);

    let (expired, mut live): (Vec<SessionRecord>, Vec<SessionRecord>) = records
        .into_iter()
        .partition(|r| now.signed_duration_since(r.last_modified) > ttl);

    let mut overflow = Vec::new();
    if live.len() > max_sessions {
        live.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        let surplus = live.len() - max_sessions;
        overflow = live.drain(..surplus).map(|r| r.session_id).collect();
    }

    SweepPlan {
        expired: expired.into_iter().map(|r| r.session_id).collect(),
        overflow,
        keep: live.into_iter().map(|r| r.session_id).collect(),
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records deleted for exceeding the TTL.
    pub expired: usize,
    /// Records deleted to enforce the maximum count.
    pub overflow: usize,
    /// Cache entries evicted (no record on disk, or idle past the TTL).
    pub cache_evicted: usize,
    /// Records left on disk.
    pub remaining: usize,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.expired == 0 && self.overflow == 0 && self.cache_evicted == 0
    }
}

/// Reconciles the session store and the agent cache against retention limits.
pub struct Sweeper {
    store: Arc<SessionStore>,
    cache: Arc<AgentCache>,
    ttl: Duration,
    max_sessions: usize,
}

impl Sweeper {
    pub fn new(
        store: Arc<SessionStore>,
        cache: Arc<AgentCache>,
        ttl: Duration,
        max_sessions: usize,
    ) -> Self {
        Self {
            store,
            cache,
            ttl,
            max_sessions,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let records = self.store.list().await?;
        let found = records.len();
        let plan = plan_sweep(records, self.ttl, self.max_sessions, now);
        let mut report = SweepReport::default();
        if found > 0 {
            debug!(found, "Starting session sweep");
        }

        let mut on_disk: HashSet<String> = plan.keep.into_iter().collect();

        for session_id in plan.expired {
            if self.delete(&session_id, "expired").await {
                report.expired += 1;
            } else {
                on_disk.insert(session_id);
            }
        }

        for session_id in plan.overflow {
            if self.delete(&session_id, "over limit").await {
                report.overflow += 1;
            } else {
                on_disk.insert(session_id);
            }
        }
        report.remaining = on_disk.len();

        for session_id in self.cache.session_ids().await {
            if !on_disk.contains(&session_id) && self.cache.evict(&session_id).await {
                debug!(session_id = %session_id, "Evicted agent with no session record");
                report.cache_evicted += 1;
            }
        }

        for session_id in self.cache.list_expired(self.ttl, now).await {
            if self.cache.evict(&session_id).await {
                report.cache_evicted += 1;
            }
        }

        Ok(report)
    }

    /// Delete one record. `false` if it is still on disk afterwards.
    async fn delete(&self, session_id: &str, reason: &str) -> bool {
        match self.store.remove(session_id).await {
            Ok(true) => {
                info!(session_id, reason, "Removed session");
                true
            }
            Ok(false) => {
                debug!(session_id, "Session already removed");
                true
            }
            Err(e) => {
                warn!(session_id, error = %e, "Failed to remove session");
                false
            }
        }
    }
}

/// Run the sweeper every `interval` until `shutdown` fires.
///
/// The first sweep runs immediately so records left over from a previous
/// process are reconciled at startup.
pub fn spawn_sweeper(
    sweeper: Arc<Sweeper>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Session sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match sweeper.run_once().await {
                Ok(report) if report.is_noop() => {
                    debug!(remaining = report.remaining, "Session sweep: nothing to do");
                }
                Ok(report) => {
                    info!(
                        expired = report.expired,
                        overflow = report.overflow,
                        cache_evicted = report.cache_evicted,
                        remaining = report.remaining,
                        "Session sweep complete"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Session sweep failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::cache::tests::CountingFactory;
    use crate::store::tests::make_session;

    const TTL: Duration = Duration::from_secs(2 * 3600);

    fn record(id: &str, age_secs: i64, now: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            last_modified: now - chrono::Duration::seconds(age_secs),
        }
    }

    fn sweeper(tmp: &TempDir, max_sessions: usize) -> (Sweeper, Arc<AgentCache>) {
        let cache = AgentCache::new(TTL);
        let store = Arc::new(SessionStore::new(tmp.path()));
        (Sweeper::new(store, cache.clone(), TTL, max_sessions), cache)
    }

    #[test]
    fn plan_separates_expired_from_live() {
        let now = Utc::now();
        let plan = plan_sweep(
            vec![record("old", 3 * 3600, now), record("new", 60, now)],
            TTL,
            200,
            now,
        );
        assert_eq!(plan.expired, vec!["old".to_string()]);
        assert!(plan.overflow.is_empty());
        assert_eq!(plan.keep, vec!["new".to_string()]);
    }

    #[test]
    fn plan_overflow_takes_oldest_with_id_tiebreak() {
        let now = Utc::now();
        let plan = plan_sweep(
            vec![
                record("c", 100, now),
                record("b", 100, now),
                record("a", 10, now),
                record("d", 5, now),
            ],
            TTL,
            2,
            now,
        );
        assert!(plan.expired.is_empty());
        assert_eq!(plan.overflow, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(plan.keep.len(), 2);
    }

    #[test]
    fn plan_overflow_counts_after_ttl_pass() {
        let now = Utc::now();
        let plan = plan_sweep(
            vec![record("x", 9000, now), record("y", 10, now), record("z", 20, now)],
            TTL,
            2,
            now,
        );
        assert_eq!(plan.expired, vec!["x".to_string()]);
        assert!(plan.overflow.is_empty());
    }

    #[tokio::test]
    async fn one_over_the_limit_removes_only_the_oldest() {
        let tmp = TempDir::new().unwrap();
        for i in 0..201u64 {
            make_session(tmp.path(), &format!("s{i:03}"), Duration::from_secs(i * 10));
        }
        let (sweeper, cache) = sweeper(&tmp, 200);
        let factory = CountingFactory::default();
        cache.get_or_create("s200", &factory).await.unwrap();
        cache.get_or_create("s000", &factory).await.unwrap();

        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.expired, 0);
        assert_eq!(report.overflow, 1);
        assert_eq!(report.cache_evicted, 1);
        assert_eq!(report.remaining, 200);
        assert!(!tmp.path().join("session_s200").exists());
        assert!(!cache.contains("s200").await);
        assert!(cache.contains("s000").await);
        assert_eq!(factory.total_releases(), 1);
    }

    #[tokio::test]
    async fn expired_records_lose_their_cache_entries() {
        let tmp = TempDir::new().unwrap();
        make_session(tmp.path(), "stale", TTL + Duration::from_secs(600));
        make_session(tmp.path(), "fresh", Duration::from_secs(60));
        let (sweeper, cache) = sweeper(&tmp, 200);
        let factory = CountingFactory::default();
        cache.get_or_create("stale", &factory).await.unwrap();
        cache.get_or_create("fresh", &factory).await.unwrap();

        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.remaining, 1);
        assert!(!cache.contains("stale").await);
        assert!(cache.contains("fresh").await);
    }

    #[tokio::test]
    async fn cached_sessions_without_a_record_are_evicted() {
        let tmp = TempDir::new().unwrap();
        make_session(tmp.path(), "kept", Duration::from_secs(60));
        let (sweeper, cache) = sweeper(&tmp, 200);
        let factory = CountingFactory::default();
        cache.get_or_create("kept", &factory).await.unwrap();
        cache.get_or_create("gone", &factory).await.unwrap();

        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.expired, 0);
        assert_eq!(report.cache_evicted, 1);
        assert_eq!(report.remaining, 1);
        assert!(cache.contains("kept").await);
        assert!(!cache.contains("gone").await);
        assert_eq!(factory.releases_of(1), 1);
    }

    #[tokio::test]
    async fn unusual_directory_names_count_toward_the_limit() {
        let tmp = TempDir::new().unwrap();
        make_session(tmp.path(), "a.b", Duration::from_secs(600));
        make_session(tmp.path(), "ok", Duration::from_secs(60));
        let (sweeper, _cache) = sweeper(&tmp, 1);

        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.overflow, 1);
        assert_eq!(report.remaining, 1);
        assert!(!tmp.path().join("session_a.b").exists());
        assert!(tmp.path().join("session_ok").exists());
    }

    #[tokio::test]
    async fn idle_cache_entries_are_evicted_without_touching_disk() {
        let tmp = TempDir::new().unwrap();
        let (sweeper, cache) = sweeper(&tmp, 200);
        let factory = CountingFactory::default();
        cache.get_or_create("elsewhere", &factory).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(3);
        let report = sweeper.run_at(later).await.unwrap();

        assert_eq!(report.cache_evicted, 1);
        assert_eq!(report.remaining, 0);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn missing_root_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let cache = AgentCache::new(TTL);
        let store = Arc::new(SessionStore::new(tmp.path().join("absent")));
        let sweeper = Sweeper::new(store, cache, TTL, 200);
        assert!(sweeper.run_once().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        make_session(tmp.path(), "stale", TTL + Duration::from_secs(600));
        let (sweeper, _cache) = sweeper(&tmp, 200);
        let shutdown = CancellationToken::new();

        let handle = spawn_sweeper(Arc::new(sweeper), Duration::from_secs(3600), shutdown.clone());
        // The first sweep runs right away.
        for _ in 0..100 {
            if !tmp.path().join("session_stale").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!tmp.path().join("session_stale").exists());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
