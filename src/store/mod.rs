//! On-disk session store.
//!
//! Layout under the sessions root:
//! - `session_<id>/`: one directory per session, written by the engine
//! - `session_<id>/session.json`: the engine's durable conversation record
//! - `session_<id>/metrics/<unix_millis>.json`: one summary per completed task
//!
//! The worker only lists, removes and annotates these directories; their
//! conversation content belongs to the engine.

pub mod metrics;

pub use metrics::SessionInfo;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Directory name prefix for session records.
pub const SESSION_DIR_PREFIX: &str = "session_";
/// Engine-owned session record file.
pub const SESSION_FILE: &str = "session.json";
/// Per-session metrics subdirectory.
pub const METRICS_DIR: &str = "metrics";

const MAX_SESSION_ID_LEN: usize = 128;

/// Whether `id` is safe to embed in a path and a channel name.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Whether `id` names exactly one entry directly under the sessions root.
fn is_dir_suffix(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\', '\0'])
}

/// A durable session as seen by the sweeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub last_modified: DateTime<Utc>,
}

/// Filesystem-backed session directories.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a session's record.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{SESSION_DIR_PREFIX}{session_id}"))
    }

    /// Create the sessions root if it does not exist.
    pub async fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        is_valid_session_id(session_id) && fs::metadata(self.session_dir(session_id)).await.is_ok()
    }

    /// Every session record under the root. A missing root means no sessions.
    pub async fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "Sessions directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(session_id) = name
                .to_str()
                .and_then(|n| n.strip_prefix(SESSION_DIR_PREFIX))
                .filter(|id| !id.is_empty())
            else {
                continue;
            };
            // Vanished between listing and stat: another worker removed it.
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            match last_modified(&entry.path()).await {
                Ok(last_modified) => records.push(SessionRecord {
                    session_id: session_id.to_string(),
                    last_modified,
                }),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }

    /// Delete a session directory. Returns `false` if it was already gone.
    ///
    /// Accepts any id `list` can report, including ones this worker would
    /// refuse to create, so stray directories can still be swept.
    pub async fn remove(&self, session_id: &str) -> Result<bool, StoreError> {
        if !is_dir_suffix(session_id) {
            return Err(StoreError::InvalidSessionId(session_id.to_string()));
        }
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => {
                debug!(session_id, "Removed session directory");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::RemoveFailed {
                session_id: session_id.to_string(),
                source,
            }),
        }
    }

    /// Write a metrics summary for one completed task.
    ///
    /// The `traces` field is dropped. Files are named by Unix milliseconds;
    /// a name collision moves to the next free millisecond.
    pub async fn save_metrics(&self, session_id: &str, summary: Value) -> Result<PathBuf, StoreError> {
        validate(session_id)?;
        let summary = metrics::strip_traces(summary);
        let body = serde_json::to_vec_pretty(&summary)?;

        let metrics_dir = self.session_dir(session_id).join(METRICS_DIR);
        fs::create_dir_all(&metrics_dir).await?;

        let mut millis = Utc::now().timestamp_millis();
        loop {
            let path = metrics_dir.join(format!("{millis}.json"));
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(&body).await?;
                    file.flush().await?;
                    debug!(session_id, path = %path.display(), "Saved metrics");
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => millis += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// All metrics summaries for a session, oldest first.
    ///
    /// Unreadable files are logged and skipped.
    pub async fn load_metrics(&self, session_id: &str) -> Result<Vec<Value>, StoreError> {
        validate(session_id)?;
        let metrics_dir = self.session_dir(session_id).join(METRICS_DIR);
        let mut dir = match fs::read_dir(&metrics_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<(i64, PathBuf)> = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let stamp = path
                .extension()
                .filter(|ext| *ext == "json")
                .and_then(|_| path.file_stem())
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<i64>().ok());
            if let Some(stamp) = stamp {
                files.push((stamp, path));
            }
        }
        files.sort();

        let mut metrics = Vec::with_capacity(files.len());
        for (_, path) in files {
            let parsed = fs::read(&path)
                .await
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(StoreError::from));
            match parsed {
                Ok(value) => metrics.push(value),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to load metrics file"),
            }
        }
        Ok(metrics)
    }

    /// Session record plus aggregated metrics. `None` if the session is absent.
    pub async fn session_info(&self, session_id: &str) -> Result<Option<SessionInfo>, StoreError> {
        validate(session_id)?;
        let dir = self.session_dir(session_id);
        if fs::metadata(&dir).await.is_err() {
            debug!(session_id, "Session not found");
            return Ok(None);
        }

        let session_data = match fs::read(dir.join(SESSION_FILE)).await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(session_id, error = %e, "Failed to parse session record");
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let metrics = self.load_metrics(session_id).await?;
        Ok(Some(SessionInfo::new(session_id, session_data, metrics)))
    }
}

fn validate(session_id: &str) -> Result<(), StoreError> {
    if is_valid_session_id(session_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}

/// Latest of the directory's and the session file's modification times.
async fn last_modified(dir: &Path) -> std::io::Result<DateTime<Utc>> {
    let dir_mtime = fs::metadata(dir).await?.modified()?;
    let file_mtime = match fs::metadata(dir.join(SESSION_FILE)).await {
        Ok(meta) => Some(meta.modified()?),
        Err(_) => None,
    };
    let newest: SystemTime = file_mtime.map_or(dir_mtime, |f| f.max(dir_mtime));
    Ok(DateTime::<Utc>::from(newest))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    /// Create `session_<id>/session.json` and set its age.
    pub(crate) fn make_session(root: &Path, session_id: &str, age: Duration) {
        let dir = root.join(format!("{SESSION_DIR_PREFIX}{session_id}"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SESSION_FILE), b"{}").unwrap();
        let when = SystemTime::now() - age;
        std::fs::File::options()
            .write(true)
            .open(dir.join(SESSION_FILE))
            .unwrap()
            .set_modified(when)
            .unwrap();
        std::fs::File::open(&dir).unwrap().set_modified(when).unwrap();
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_only_reports_session_directories() {
        let tmp = TempDir::new().unwrap();
        make_session(tmp.path(), "a", Duration::from_secs(60));
        make_session(tmp.path(), "b", Duration::from_secs(7200));
        std::fs::create_dir(tmp.path().join("unrelated")).unwrap();
        std::fs::write(tmp.path().join("session_file.txt"), b"x").unwrap();

        let store = SessionStore::new(tmp.path());
        let mut records = store.list().await.unwrap();
        records.sort_by(|x, y| x.session_id.cmp(&y.session_id));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].session_id, "a");
        assert!(records[0].last_modified > records[1].last_modified);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        make_session(tmp.path(), "a", Duration::ZERO);
        let store = SessionStore::new(tmp.path());

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert!(!store.exists("a").await);
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(matches!(
            store.remove("../etc").await,
            Err(StoreError::InvalidSessionId(_))
        ));
        assert!(is_valid_session_id("4f1c2a9e-7b1d-4d3e-9a55-0c1b2d3e4f50"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("a/b"));
    }

    #[tokio::test]
    async fn listed_directories_can_be_removed_even_with_foreign_ids() {
        let tmp = TempDir::new().unwrap();
        make_session(tmp.path(), "a.b", Duration::ZERO);
        let store = SessionStore::new(tmp.path());

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!is_valid_session_id(&records[0].session_id));

        assert!(store.remove(&records[0].session_id).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metrics_drop_traces_and_load_in_order() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        let first = store
            .save_metrics("s1", json!({"cycle_count": 1, "traces": [{"id": 1}]}))
            .await
            .unwrap();
        let second = store
            .save_metrics("s1", json!({"cycle_count": 2}))
            .await
            .unwrap();
        assert_ne!(first, second);

        let metrics = store.load_metrics("s1").await.unwrap();
        assert_eq!(metrics, vec![json!({"cycle_count": 1}), json!({"cycle_count": 2})]);
    }

    #[tokio::test]
    async fn unreadable_metrics_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        store.save_metrics("s1", json!({"ok": true})).await.unwrap();
        let metrics_dir = store.session_dir("s1").join(METRICS_DIR);
        std::fs::write(metrics_dir.join("1.json"), b"{broken").unwrap();
        std::fs::write(metrics_dir.join("notes.txt"), b"ignored").unwrap();

        let metrics = store.load_metrics("s1").await.unwrap();
        assert_eq!(metrics, vec![json!({"ok": true})]);
    }

    #[tokio::test]
    async fn session_info_aggregates_metrics() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let dir = store.session_dir("s1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(SESSION_FILE),
            json!({"created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-02T00:00:00Z"})
                .to_string(),
        )
        .unwrap();
        store
            .save_metrics(
                "s1",
                json!({"accumulated_usage": {"total_tokens": 50}, "accumulated_metrics": {"latencyMs": 500}}),
            )
            .await
            .unwrap();
        store
            .save_metrics(
                "s1",
                json!({"accumulated_usage": {"total_tokens": 30}, "accumulated_metrics": {"latencyMs": 300}}),
            )
            .await
            .unwrap();

        let info = store.session_info("s1").await.unwrap().unwrap();
        assert_eq!(info.created_at.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(info.metrics_count(), 2);
        assert_eq!(info.total_accumulated_usage["total_tokens"], 80.0);
        assert_eq!(info.total_accumulated_metrics["latencyMs"], 800.0);

        assert!(store.session_info("missing").await.unwrap().is_none());
    }
}
