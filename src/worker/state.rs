//! Task state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Dequeued; session id resolved.
    Received,
    /// Agent handle obtained from the cache.
    AgentResolved,
    /// Consuming the engine's event stream.
    Streaming,
    /// A `complete` event was published.
    Completed,
    /// An `error` event was published.
    Failed,
    /// Stopped by a cancellation flag.
    Cancelled,
    /// Hit the task timeout.
    TimedOut,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Received, AgentResolved) | (Received, Failed) |
            (AgentResolved, Streaming) | (AgentResolved, Failed) | (AgentResolved, TimedOut) |
            (Streaming, Completed) | (Streaming, Failed) |
            (Streaming, Cancelled) | (Streaming, TimedOut)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::AgentResolved => "agent_resolved",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Bookkeeping for one task from dequeue to its terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub session_id: String,
    pub state: TaskState,
    /// Events handed to the queue for this task.
    pub published: usize,
    /// Raw events that were malformed or out of place.
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: TaskState::Received,
            published: 0,
            skipped: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_state: TaskState) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }
        self.state = new_state;
        if new_state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Time from dequeue to the terminal state (or now).
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}
