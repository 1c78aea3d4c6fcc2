//! Error types for the agent worker.

use std::time::Duration;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Queue / pub-sub broker errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to connect to queue after {attempts} attempts: {reason}")]
    ConnectFailed { attempts: u32, reason: String },

    #[error("Queue command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether a retry at the client boundary could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::CommandFailed { .. })
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        Self::CommandFailed {
            command: e.code().unwrap_or("io").to_string(),
            reason: e.to_string(),
        }
    }
}

/// Orchestration engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Agent initialization failed for session {session_id}: {reason}")]
    InitFailed { session_id: String, reason: String },

    #[error("Engine request failed: {0}")]
    RequestFailed(String),

    #[error("Engine stream failed: {0}")]
    StreamFailed(String),

    #[error("Malformed engine event: {0}")]
    MalformedEvent(String),

    #[error("Task timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
}

impl EngineError {
    /// Malformed events are skipped; every other error ends the task.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::MalformedEvent(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::RequestFailed(e.to_string())
    }
}

/// On-disk session store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Failed to remove session {session_id}: {source}")]
    RemoveFailed {
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
