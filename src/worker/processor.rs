//! Per-task processing and the dequeue loop.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::AgentCache;
use crate::config::WorkerConfig;
use crate::engine::{AgentFactory, AgentHandle};
use crate::error::EngineError;
use crate::events::format::sanitize_error_message;
use crate::events::{EventTranslator, StreamEvent};
use crate::queue::{Backoff, QueueClient, Task};
use crate::store::{SessionStore, is_valid_session_id};
use crate::worker::state::{TaskRun, TaskState};

/// First delay after a failed dequeue.
const DEQUEUE_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
/// Cap on the dequeue back-off.
const DEQUEUE_BACKOFF_MAX: Duration = Duration::from_secs(30);

const CANCELLED_MESSAGE: &str = "Task cancelled";
const INIT_FAILED_MESSAGE: &str = "Failed to initialize agent. Please try again.";

/// Shared dependencies for task processing.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn QueueClient>,
    pub cache: Arc<AgentCache>,
    pub factory: Arc<dyn AgentFactory>,
    pub store: Arc<SessionStore>,
}

/// Timing knobs for the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Hard bound on agent resolution plus streaming.
    pub task_timeout: Duration,
    /// Minimum spacing between cancellation checks (zero = every event).
    pub cancel_check_interval: Duration,
    /// How long one dequeue call may block.
    pub dequeue_timeout: Duration,
}

impl From<&WorkerConfig> for ProcessorSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            task_timeout: config.task_timeout,
            cancel_check_interval: config.cancel_check_interval,
            dequeue_timeout: config.dequeue_timeout,
        }
    }
}

/// Consumes tasks and drives each through the engine.
pub struct TaskProcessor {
    deps: WorkerDeps,
    settings: ProcessorSettings,
}

impl TaskProcessor {
    pub fn new(deps: WorkerDeps, settings: ProcessorSettings) -> Self {
        Self { deps, settings }
    }

    /// Dequeue and process tasks until `shutdown` fires.
    ///
    /// A task already in progress when shutdown is requested runs to its
    /// terminal state first.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(DEQUEUE_BACKOFF_INITIAL, DEQUEUE_BACKOFF_MAX);
        info!("Task processor started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.deps.queue.dequeue(self.settings.dequeue_timeout) => next,
            };

            match next {
                Ok(Some(task)) => {
                    backoff.reset();
                    let run = self.process(task).await;
                    info!(
                        session_id = %run.session_id,
                        state = %run.state,
                        published = run.published,
                        skipped = run.skipped,
                        elapsed_ms = run.elapsed().as_millis() as u64,
                        "Task finished"
                    );
                }
                Ok(None) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(
                        error = %e,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Dequeue failed"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Task processor stopped");
    }

    /// Run one task to a terminal state.
    ///
    /// Every outcome is reported to subscribers as events; nothing is
    /// returned as an error.
    pub async fn process(&self, task: Task) -> TaskRun {
        let session_id = task
            .requested_session()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = tracing::info_span!("task", session = %session_id);
        self.process_in_session(task, session_id).instrument(span).await
    }

    async fn process_in_session(&self, task: Task, session_id: String) -> TaskRun {
        let mut run = TaskRun::new(session_id.clone());
        debug!(message_len = task.message.len(), enqueued_at = %task.enqueued_at, "Task received");

        self.publish(
            &mut run,
            StreamEvent::Session {
                session_id: session_id.clone(),
            },
        )
        .await;

        if !is_valid_session_id(&session_id) {
            warn!("Rejecting task with invalid session id");
            self.fail(&mut run, "Invalid session id").await;
            return run;
        }

        let handle = match self
            .deps
            .cache
            .get_or_create(&session_id, self.deps.factory.as_ref())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Agent initialization failed");
                self.fail(&mut run, INIT_FAILED_MESSAGE).await;
                return run;
            }
        };
        advance(&mut run, TaskState::AgentResolved);

        let timeout = self.settings.task_timeout;
        let streamed = tokio::time::timeout(
            timeout,
            self.stream_task(&mut run, handle.as_ref(), &task.message),
        )
        .await;

        if streamed.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "Task timed out");
            let message = EngineError::Timeout(timeout).to_string();
            self.publish(&mut run, StreamEvent::error(message, session_id.clone()))
                .await;
            advance(&mut run, TaskState::TimedOut);
        }

        if run.state == TaskState::Completed {
            self.save_metrics(&session_id, handle.as_ref()).await;
        }

        self.deps.cache.checkin(&session_id, handle).await;
        run
    }

    /// Consume the engine stream, publishing translated events as they come.
    async fn stream_task(&self, run: &mut TaskRun, handle: &dyn AgentHandle, message: &str) {
        let session_id = run.session_id.clone();
        let mut stream = match handle.stream(message).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Engine request failed");
                self.fail(run, &sanitize_error_message(&e.to_string())).await;
                return;
            }
        };
        advance(run, TaskState::Streaming);

        let mut translator = EventTranslator::new(session_id.clone());
        let mut last_cancel_check: Option<Instant> = None;

        while let Some(item) = stream.next().await {
            if self.cancellation_due(&mut last_cancel_check) && self.is_cancelled(&session_id).await {
                info!("Task cancelled by request");
                self.publish(run, StreamEvent::error(CANCELLED_MESSAGE, session_id.clone()))
                    .await;
                if let Err(e) = self.deps.queue.clear_cancelled(&session_id).await {
                    warn!(error = %e, "Failed to clear cancellation flag");
                }
                advance(run, TaskState::Cancelled);
                return;
            }

            let raw = match item {
                Ok(raw) => raw,
                Err(e) if e.is_skippable() => {
                    warn!(error = %e, "Skipping malformed engine event");
                    run.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Engine stream failed");
                    self.fail(run, &sanitize_error_message(&e.to_string())).await;
                    return;
                }
            };

            for event in translator.translate(raw) {
                self.publish_terminal_aware(run, event).await;
            }
            if translator.is_finished() {
                break;
            }
        }

        if let Some(event) = translator.finish() {
            self.publish_terminal_aware(run, event).await;
        }
        run.skipped += translator.skipped();
    }

    /// Publish, moving the run to its terminal state on `complete`/`error`.
    async fn publish_terminal_aware(&self, run: &mut TaskRun, event: StreamEvent) {
        let next = match &event {
            StreamEvent::Complete { .. } => Some(TaskState::Completed),
            StreamEvent::Error { .. } => Some(TaskState::Failed),
            _ => None,
        };
        self.publish(run, event).await;
        if let Some(next) = next {
            advance(run, next);
        }
    }

    async fn fail(&self, run: &mut TaskRun, message: &str) {
        let event = StreamEvent::error(message, run.session_id.clone());
        self.publish(run, event).await;
        advance(run, TaskState::Failed);
    }

    /// Publish an event. Failures are logged and the event dropped.
    async fn publish(&self, run: &mut TaskRun, event: StreamEvent) {
        run.published += 1;
        if let Err(e) = self.deps.queue.publish(&run.session_id, &event).await {
            warn!(event = event.kind(), error = %e, "Failed to publish event");
        }
    }

    fn cancellation_due(&self, last_check: &mut Option<Instant>) -> bool {
        let interval = self.settings.cancel_check_interval;
        if interval.is_zero() {
            return true;
        }
        let now = Instant::now();
        match last_check {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                *last_check = Some(now);
                true
            }
        }
    }

    async fn is_cancelled(&self, session_id: &str) -> bool {
        match self.deps.queue.is_cancelled(session_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(error = %e, "Cancellation check failed");
                false
            }
        }
    }

    async fn save_metrics(&self, session_id: &str, handle: &dyn AgentHandle) {
        let Some(summary) = handle.metrics().await else {
            return;
        };
        if let Err(e) = self.deps.store.save_metrics(session_id, summary).await {
            warn!(error = %e, "Failed to save metrics");
        }
    }
}

fn advance(run: &mut TaskRun, next: TaskState) {
    if let Err(e) = run.transition_to(next) {
        warn!(error = %e, "Unexpected task state transition");
    }
}
