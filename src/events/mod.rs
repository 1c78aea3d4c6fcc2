//! Streaming protocol: raw engine events in, normalized subscriber events out.
//!
//! - `raw`: closed tagged union of what the orchestration engine emits
//! - `translator`: per-task state machine turning raw events into `StreamEvent`s
//! - `format`: tool status messages, output truncation, error sanitization

pub mod format;
pub mod raw;
pub mod translator;

pub use raw::{ContentBlock, RawEvent, Role, ToolResultContent};
pub use translator::EventTranslator;

use serde::{Deserialize, Serialize};

/// Events published to a session's channel.
///
/// Subscribers receive these as JSON objects discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Announces the session id the rest of the task is bound to.
    Session { session_id: String },
    /// Incremental response text.
    Token { content: String },
    /// A tool invocation has started.
    Tool { name: String, message: String },
    /// Final answer plus the recorded workflow.
    Complete {
        response: String,
        workflow: Vec<WorkflowStep>,
        session_id: String,
    },
    /// Task failed, timed out or was cancelled.
    Error { message: String, session_id: String },
}

impl StreamEvent {
    /// Build an error event.
    pub fn error(message: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            session_id: session_id.into(),
        }
    }

    /// Whether this event ends the task's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Event type name (matches the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::Token { .. } => "token",
            Self::Tool { .. } => "tool",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Kind of a recorded workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Reasoning,
    Tool,
}

/// One reasoning or tool-use unit recorded while a task ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// 1-based position within the task.
    #[serde(rename = "step")]
    pub step_index: u32,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

impl WorkflowStep {
    /// A reasoning step.
    pub fn reasoning(step_index: u32, content: impl Into<String>) -> Self {
        Self {
            step_index,
            kind: StepKind::Reasoning,
            content: Some(content.into()),
            name: None,
            message: None,
            input: None,
            output: None,
            status: None,
            tool_use_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn session_event_wire_shape() {
        let event = StreamEvent::Session {
            session_id: "abc".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "session", "session_id": "abc"})
        );
    }

    #[test]
    fn complete_event_wire_shape() {
        let event = StreamEvent::Complete {
            response: "Done".into(),
            workflow: vec![WorkflowStep::reasoning(1, "thinking")],
            session_id: "s1".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "complete",
                "response": "Done",
                "workflow": [{"step": 1, "type": "reasoning", "content": "thinking"}],
                "session_id": "s1"
            })
        );
    }

    #[test]
    fn error_event_is_terminal() {
        let event = StreamEvent::error("boom", "s1");
        assert!(event.is_terminal());
        assert_eq!(event.kind(), "error");
        assert!(!StreamEvent::Token { content: "x".into() }.is_terminal());
    }

    #[test]
    fn tool_event_parses_from_json() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"tool","name":"query","message":"🔎 Querying database"}"#)
                .unwrap();
        assert_eq!(
            event,
            StreamEvent::Tool {
                name: "query".into(),
                message: "🔎 Querying database".into()
            }
        );
    }
}
