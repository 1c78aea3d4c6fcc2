//! Raw engine events → subscriber stream events.
//!
//! One translator lives for exactly one task. It tracks tool invocations
//! that have started but not yet returned, accumulates the workflow, and
//! closes once a terminal event has been produced.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::format::{MAX_OUTPUT_LENGTH, sanitize_error_message, tool_status_message, truncate_output};
use super::raw::{ContentBlock, RawEvent, Role, ToolResultContent, collect_text};
use super::{StepKind, StreamEvent, WorkflowStep};

/// A tool invocation awaiting its result.
#[derive(Debug, Clone)]
struct PendingTool {
    name: String,
    message: String,
    input: Value,
    started_at: DateTime<Utc>,
}

/// Per-task translation state.
pub struct EventTranslator {
    session_id: String,
    pending: HashMap<String, PendingTool>,
    workflow: Vec<WorkflowStep>,
    step_counter: u32,
    streamed_text: String,
    finished: bool,
    skipped: usize,
}

impl EventTranslator {
    /// Create a translator for one task of `session_id`.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            pending: HashMap::new(),
            workflow: Vec::new(),
            step_counter: 0,
            streamed_text: String::new(),
            finished: false,
            skipped: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Steps recorded so far (emptied once `complete` is produced).
    pub fn workflow(&self) -> &[WorkflowStep] {
        &self.workflow
    }

    /// Whether a terminal event has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of raw inputs skipped as out-of-order or duplicate.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Translate one raw event into zero or more stream events.
    pub fn translate(&mut self, event: RawEvent) -> Vec<StreamEvent> {
        if self.finished {
            debug!(session_id = %self.session_id, "Ignoring engine event after terminal event");
            return Vec::new();
        }

        match event {
            RawEvent::TextDelta { text } => {
                if text.is_empty() {
                    return Vec::new();
                }
                self.streamed_text.push_str(&text);
                vec![StreamEvent::Token { content: text }]
            }
            RawEvent::ToolUseStart {
                tool_use_id,
                name,
                input,
            } => self.record_tool(tool_use_id, name, input).into_iter().collect(),
            RawEvent::Message { role, content } => self.handle_message(role, content),
            RawEvent::Result { content } => vec![self.complete(collect_text(&content))],
            RawEvent::Failure { message } => {
                self.finished = true;
                self.discard_pending();
                vec![StreamEvent::error(
                    sanitize_error_message(&message),
                    self.session_id.clone(),
                )]
            }
        }
    }

    /// Close the translation when the engine stream ended without a result.
    ///
    /// Returns the synthesized `complete` event, or `None` if a terminal
    /// event was already produced.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        Some(self.complete(String::new()))
    }

    fn complete(&mut self, response: String) -> StreamEvent {
        self.finished = true;
        self.discard_pending();
        let response = if response.is_empty() {
            std::mem::take(&mut self.streamed_text)
        } else {
            response
        };
        StreamEvent::Complete {
            response,
            workflow: std::mem::take(&mut self.workflow),
            session_id: self.session_id.clone(),
        }
    }

    fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                session_id = %self.session_id,
                count = self.pending.len(),
                "Dropping unresolved tool invocations"
            );
            self.pending.clear();
        }
    }

    /// Track a tool start. Emits a status event the first time an id is seen.
    fn record_tool(&mut self, tool_use_id: String, name: String, input: Value) -> Option<StreamEvent> {
        if tool_use_id.is_empty() || name.is_empty() {
            warn!(session_id = %self.session_id, "Tool start without id or name, skipping");
            self.skipped += 1;
            return None;
        }

        if let Some(existing) = self.pending.get_mut(&tool_use_id) {
            if !input.is_null() {
                existing.input = input;
            }
            return None;
        }

        let message = tool_status_message(&name);
        self.pending.insert(
            tool_use_id,
            PendingTool {
                name: name.clone(),
                message: message.clone(),
                input,
                started_at: Utc::now(),
            },
        );
        Some(StreamEvent::Tool { name, message })
    }

    fn handle_message(&mut self, role: Role, content: Vec<ContentBlock>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for block in content {
            match (role, block) {
                (Role::Assistant, ContentBlock::Reasoning { text }) => {
                    if !text.trim().is_empty() {
                        self.step_counter += 1;
                        self.workflow
                            .push(WorkflowStep::reasoning(self.step_counter, text));
                    }
                }
                (
                    Role::Assistant,
                    ContentBlock::ToolUse {
                        tool_use_id,
                        name,
                        input,
                    },
                ) => events.extend(self.record_tool(tool_use_id, name, input)),
                (
                    Role::User,
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        status,
                    },
                ) => self.resolve_tool(tool_use_id, content, status),
                _ => {}
            }
        }
        events
    }

    fn resolve_tool(&mut self, tool_use_id: String, content: ToolResultContent, status: Option<String>) {
        let Some(tool) = self.pending.remove(&tool_use_id) else {
            warn!(
                session_id = %self.session_id,
                tool_use_id = %tool_use_id,
                "Tool result without matching tool start, skipping"
            );
            self.skipped += 1;
            return;
        };

        let elapsed_ms = (Utc::now() - tool.started_at).num_milliseconds();
        debug!(tool = %tool.name, elapsed_ms, "Tool finished");

        self.step_counter += 1;
        self.workflow.push(WorkflowStep {
            step_index: self.step_counter,
            kind: StepKind::Tool,
            content: None,
            name: Some(tool.name),
            message: Some(tool.message),
            input: Some(tool.input),
            output: Some(truncate_output(&content.text(), MAX_OUTPUT_LENGTH)),
            status: Some(status.unwrap_or_else(|| "success".to_string())),
            tool_use_id: Some(tool_use_id),
        });
    }
}
