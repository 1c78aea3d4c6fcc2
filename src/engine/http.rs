//! HTTP engine adapter.
//!
//! Endpoints, relative to the engine base URL:
//! - `POST /sessions` opens (or reattaches to) a session
//! - `POST /sessions/{id}/messages` streams newline-delimited JSON raw events
//! - `GET /sessions/{id}/metrics` returns the last invocation's summary
//! - `DELETE /sessions/{id}` releases the session's in-memory agent

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{AgentFactory, AgentHandle, RawEventStream};
use crate::config::CONTEXT_WINDOW_MESSAGES;
use crate::error::EngineError;
use crate::events::RawEvent;

/// Creates `HttpAgent`s against one engine.
pub struct HttpAgentFactory {
    client: reqwest::Client,
    base_url: String,
    tool_endpoint: String,
    window_size: usize,
}

impl HttpAgentFactory {
    pub fn new(base_url: impl Into<String>, tool_endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tool_endpoint: tool_endpoint.into(),
            window_size: CONTEXT_WINDOW_MESSAGES,
        }
    }
}

#[async_trait]
impl AgentFactory for HttpAgentFactory {
    async fn create(&self, session_id: &str) -> Result<Arc<dyn AgentHandle>, EngineError> {
        let init_failed = |reason: String| EngineError::InitFailed {
            session_id: session_id.to_string(),
            reason,
        };

        let body = serde_json::json!({
            "session_id": session_id,
            "tool_endpoint": self.tool_endpoint,
            "window_size": self.window_size,
        });
        let resp = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| init_failed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(init_failed(format!("{status}: {detail}")));
        }

        info!(session_id, "Opened engine session");
        Ok(Arc::new(HttpAgent {
            client: self.client.clone(),
            session_url: format!("{}/sessions/{session_id}", self.base_url),
            session_id: session_id.to_string(),
            released: AtomicBool::new(false),
        }))
    }
}

/// One engine session reached over HTTP.
pub struct HttpAgent {
    client: reqwest::Client,
    session_url: String,
    session_id: String,
    released: AtomicBool,
}

#[async_trait]
impl AgentHandle for HttpAgent {
    async fn stream(&self, message: &str) -> Result<RawEventStream, EngineError> {
        let resp = self
            .client
            .post(format!("{}/messages", self.session_url))
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(EngineError::RequestFailed(format!("{status}: {detail}")));
        }

        Ok(decode_ndjson(resp.bytes_stream()))
    }

    async fn metrics(&self) -> Option<Value> {
        let resp = match self
            .client
            .get(format!("{}/metrics", self.session_url))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(session_id = %self.session_id, status = %resp.status(), "No metrics available");
                return None;
            }
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "Metrics request failed");
                return None;
            }
        };
        resp.json::<Value>().await.ok()
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.client.delete(&self.session_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(session_id = %self.session_id, "Released engine session");
            }
            Ok(resp) => {
                warn!(session_id = %self.session_id, status = %resp.status(), "Engine refused session release");
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to release engine session");
            }
        }
    }
}

/// Splits a byte stream into lines and decodes each as a `RawEvent`.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<RawEvent, EngineError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = decode_line(&line) {
                out.push(event);
            }
        }
        out
    }

    /// Flush a trailing line that had no terminating newline.
    pub fn finish(&mut self) -> Option<Result<RawEvent, EngineError>> {
        let rest = std::mem::take(&mut self.buf);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<RawEvent, EngineError>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    Some(RawEvent::from_json_line(line))
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: NdjsonDecoder,
    ready: VecDeque<Result<RawEvent, EngineError>>,
    done: bool,
}

/// Turn a chunked body into a `RawEventStream`.
///
/// A transport error is yielded once as `StreamFailed` and ends the stream.
pub fn decode_ndjson<S, B, E>(body: S) -> RawEventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: NdjsonDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => st.ready.extend(st.decoder.push(chunk.as_ref())),
                Some(Err(e)) => {
                    st.done = true;
                    st.ready.push_back(Err(EngineError::StreamFailed(e.to_string())));
                }
                None => {
                    st.done = true;
                    st.ready.extend(st.decoder.finish());
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_splits_across_chunks() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(br#"{"event":"text_delta","#).is_empty());
        let events = decoder.push(b"\"text\":\"Hel\"}\n{\"event\":\"text_delta\",\"text\":\"lo\"}\n");
        assert_eq!(events.len(), 2);
        assert_eq!(
            *events[0].as_ref().unwrap(),
            RawEvent::TextDelta { text: "Hel".into() }
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_skips_blank_lines_and_handles_crlf() {
        let mut decoder = NdjsonDecoder::new();
        let events = decoder.push(b"\r\n\n{\"event\":\"failure\",\"message\":\"boom\"}\r\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(RawEvent::Failure { .. })));
    }

    #[test]
    fn decoder_flushes_unterminated_tail() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(br#"{"event":"result","content":[]}"#).is_empty());
        assert!(matches!(decoder.finish(), Some(Ok(RawEvent::Result { .. }))));
    }

    #[test]
    fn decoder_reports_malformed_lines() {
        let mut decoder = NdjsonDecoder::new();
        let events = decoder.push(b"not json\n");
        assert!(matches!(events[0], Err(EngineError::MalformedEvent(_))));
    }

    #[tokio::test]
    async fn stream_yields_events_then_transport_error() {
        let chunks: Vec<Result<&'static [u8], String>> = vec![
            Ok(b"{\"event\":\"text_delta\",\"text\":\"a\"}\n{\"event\":"),
            Ok(b"\"text_delta\",\"text\":\"b\"}\n"),
            Err("connection reset".to_string()),
            Ok(b"{\"event\":\"text_delta\",\"text\":\"never\"}\n"),
        ];
        let stream = decode_ndjson(futures::stream::iter(chunks));
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Ok(RawEvent::TextDelta { text }) if text == "a"));
        assert!(matches!(&items[1], Ok(RawEvent::TextDelta { text }) if text == "b"));
        assert!(matches!(&items[2], Err(EngineError::StreamFailed(_))));
    }

    #[tokio::test]
    async fn unreachable_engine_fails_initialization() {
        let factory = HttpAgentFactory::new("http://127.0.0.1:9/", "http://localhost:8000/mcp");
        let err = factory.create("s1").await.err().unwrap();
        assert!(matches!(err, EngineError::InitFailed { ref session_id, .. } if session_id == "s1"));
    }
}
