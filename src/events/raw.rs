//! Raw events produced by the orchestration engine.
//!
//! The engine's stream is decoded into this closed set at the boundary.
//! Anything that does not decode becomes `EngineError::MalformedEvent`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// One event from the engine's stream for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RawEvent {
    /// Incremental model output.
    TextDelta { text: String },
    /// A tool invocation began (may repeat while input streams in).
    ToolUseStart {
        tool_use_id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// A complete conversation message.
    Message {
        role: Role,
        #[serde(default)]
        content: Vec<ContentBlock>,
    },
    /// Final result of the turn.
    Result {
        #[serde(default)]
        content: Vec<ContentBlock>,
    },
    /// The engine failed while producing the turn.
    Failure { message: String },
}

impl RawEvent {
    /// Decode one line of the engine's newline-delimited JSON stream.
    pub fn from_json_line(line: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(line).map_err(|e| {
            let preview = String::from_utf8_lossy(&line[..line.len().min(120)]).into_owned();
            EngineError::MalformedEvent(format!("{e} in {preview:?}"))
        })
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Assistant,
    User,
    #[serde(other)]
    Other,
}

/// A block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        status: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Content of a tool result: a plain string or a list of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Items(Vec<Value>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        Self::Items(Vec::new())
    }
}

impl ToolResultContent {
    /// Concatenated text of the result.
    ///
    /// Items without a `text` field contribute nothing; when no item has
    /// text, the raw JSON of the items is returned so the step still shows
    /// something.
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Items(items) => {
                let joined: String = items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(Value::as_str))
                    .collect();
                if joined.is_empty() && !items.is_empty() {
                    Value::Array(items.clone()).to_string()
                } else {
                    joined
                }
            }
        }
    }
}

/// Concatenated text blocks of a message.
pub fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_tool_use_start() {
        let event = RawEvent::from_json_line(
            br#"{"event":"tool_use_start","tool_use_id":"t1","name":"query","input":{"sql":"SELECT 1"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            RawEvent::ToolUseStart {
                tool_use_id: "t1".into(),
                name: "query".into(),
                input: json!({"sql": "SELECT 1"}),
            }
        );
    }

    #[test]
    fn unknown_event_is_malformed() {
        let err = RawEvent::from_json_line(br#"{"event":"telemetry","x":1}"#).unwrap_err();
        assert!(err.is_skippable());
    }

    #[test]
    fn garbage_line_is_malformed() {
        assert!(matches!(
            RawEvent::from_json_line(b"not json"),
            Err(EngineError::MalformedEvent(_))
        ));
    }

    #[test]
    fn unknown_block_type_decodes_as_unknown() {
        let event = RawEvent::from_json_line(
            br#"{"event":"message","role":"assistant","content":[{"type":"image","data":"..."}]}"#,
        )
        .unwrap();
        match event {
            RawEvent::Message { role, content } => {
                assert_eq!(role, Role::Assistant);
                assert_eq!(content, vec![ContentBlock::Unknown]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tool_result_text_from_items() {
        let content = ToolResultContent::Items(vec![
            json!({"text": "First part"}),
            json!({"text": " Second part"}),
        ]);
        assert_eq!(content.text(), "First part Second part");
    }

    #[test]
    fn tool_result_text_from_string() {
        assert_eq!(ToolResultContent::Text("direct".into()).text(), "direct");
    }

    #[test]
    fn tool_result_without_text_falls_back_to_json() {
        let content = ToolResultContent::Items(vec![json!({"rows": 3})]);
        assert_eq!(content.text(), r#"[{"rows":3}]"#);
        assert_eq!(ToolResultContent::default().text(), "");
    }

    #[test]
    fn collect_text_skips_other_blocks() {
        let blocks = vec![
            ContentBlock::Reasoning { text: "hmm".into() },
            ContentBlock::Text { text: "Hello".into() },
            ContentBlock::Text { text: " world".into() },
        ];
        assert_eq!(collect_text(&blocks), "Hello world");
    }
}
