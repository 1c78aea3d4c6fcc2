//! Configuration types.
//!
//! Every option is read from the environment. `from_lookup` takes the lookup
//! function explicitly so validation can be exercised without touching the
//! process environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Conversation window handed to the engine when a session is opened.
pub const CONTEXT_WINDOW_MESSAGES: usize = 40;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue broker URL (may carry credentials).
    pub queue_url: SecretString,
    /// List key tasks are popped from.
    pub queue_key: String,
    /// Hard bound on the streaming phase of one task.
    pub task_timeout: Duration,
    /// Tool backend endpoint passed to the engine.
    pub tool_backend_url: String,
    /// Orchestration engine endpoint.
    pub engine_url: String,
    /// Root directory holding `session_<id>` directories.
    pub sessions_dir: PathBuf,
    /// Session TTL. Governs both the disk records and the agent cache.
    pub session_ttl: Duration,
    /// Maximum number of sessions kept on disk.
    pub max_sessions: usize,
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Minimum spacing between cancellation checks (zero = every event).
    pub cancel_check_interval: Duration,
    /// How long one dequeue call blocks before returning to the loop.
    pub dequeue_timeout: Duration,
    /// Optional directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_url: SecretString::from("redis://localhost:6379/0".to_string()),
            queue_key: "agent:tasks".to_string(),
            task_timeout: Duration::from_secs(300), // 5 minutes
            tool_backend_url: "http://localhost:8000/mcp".to_string(),
            engine_url: "http://localhost:8100".to_string(),
            sessions_dir: PathBuf::from("sessions"),
            session_ttl: Duration::from_secs(2 * 3600), // 2 hours
            max_sessions: 200,
            sweep_interval: Duration::from_secs(30 * 60), // 30 minutes
            cancel_check_interval: Duration::ZERO,
            dequeue_timeout: Duration::from_secs(1),
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let queue_url = non_empty(&lookup, "REDIS_URL")?
            .map(SecretString::from)
            .unwrap_or(defaults.queue_url);
        let queue_key = non_empty(&lookup, "REDIS_TASK_QUEUE")?.unwrap_or(defaults.queue_key);

        let timeout_secs = parse_min(&lookup, "REDIS_TASK_TIMEOUT", 30)?.unwrap_or(300);
        let tool_backend_url =
            non_empty(&lookup, "MCP_SERVER_URL")?.unwrap_or(defaults.tool_backend_url);
        let engine_url = non_empty(&lookup, "ENGINE_URL")?.unwrap_or(defaults.engine_url);

        let sessions_dir = lookup("SESSIONS_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.sessions_dir);

        let ttl_hours = parse_min(&lookup, "SESSION_TTL_HOURS", 1)?.unwrap_or(2);
        let max_sessions = parse_min(&lookup, "SESSION_MAX_SESSIONS", 1)?.unwrap_or(200);
        let interval_minutes =
            parse_min(&lookup, "SESSION_CLEANUP_INTERVAL_MINUTES", 5)?.unwrap_or(30);
        let cancel_check_ms = parse_min(&lookup, "CANCEL_CHECK_INTERVAL_MS", 0)?.unwrap_or(0);

        let log_dir = lookup("LOG_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let log_level = lookup("LOG_LEVEL")
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.log_level);

        Ok(Self {
            queue_url,
            queue_key,
            task_timeout: Duration::from_secs(timeout_secs),
            tool_backend_url,
            engine_url,
            sessions_dir,
            session_ttl: Duration::from_secs(ttl_hours * 3600),
            max_sessions: max_sessions as usize,
            sweep_interval: Duration::from_secs(interval_minutes * 60),
            cancel_check_interval: Duration::from_millis(cancel_check_ms),
            dequeue_timeout: defaults.dequeue_timeout,
            log_dir,
            log_level,
        })
    }
}

/// Read a variable that, when present, must not be blank.
fn non_empty<F>(lookup: &F, key: &str) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Err(ConfigError::MissingRequired {
            key: key.to_string(),
            hint: "Unset it to use the default or give it a value.".to_string(),
        }),
        Some(v) => Ok(Some(v.trim().to_string())),
    }
}

/// Parse an integer variable with a lower bound.
fn parse_min<F>(lookup: &F, key: &str, min: u64) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected an integer, got {raw:?}"),
    })?;
    if value < min {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be at least {min}, got {value}"),
        });
    }
    Ok(Some(value))
}
