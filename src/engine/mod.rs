//! Orchestration engine seam.
//!
//! The worker never talks to a model directly. It asks an `AgentFactory` for a
//! per-session `AgentHandle` and consumes the raw event stream the handle
//! produces for each message.
//!
//! - `http`: adapter for an engine exposed over HTTP with an NDJSON stream

pub mod http;

pub use http::{HttpAgent, HttpAgentFactory};

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::error::EngineError;
use crate::events::RawEvent;

/// Lazy, finite, non-restartable stream of raw events for one message.
///
/// Items that could not be decoded surface as `EngineError::MalformedEvent`
/// and may be skipped; any other error ends the stream.
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, EngineError>> + Send>>;

/// A live agent bound to one session.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Submit a user message and stream the engine's events.
    async fn stream(&self, message: &str) -> Result<RawEventStream, EngineError>;

    /// Metrics summary of the last completed invocation, if the engine has one.
    async fn metrics(&self) -> Option<Value>;

    /// Release engine-side resources. Called at most once per handle.
    async fn release(&self);
}

/// Builds agents for sessions.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Create (or reattach to) the agent for `session_id`.
    async fn create(&self, session_id: &str) -> Result<Arc<dyn AgentHandle>, EngineError>;
}
