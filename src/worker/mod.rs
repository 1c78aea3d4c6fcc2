//! Worker system: task consumption with a background session sweeper.
//!
//! Core components:
//! - `state`: Task state machine (Received → AgentResolved → Streaming → terminal)
//! - `processor`: Per-task pipeline and the dequeue loop

pub mod processor;
pub mod state;

pub use processor::{ProcessorSettings, TaskProcessor, WorkerDeps};
pub use state::{TaskRun, TaskState};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::AgentCache;
use crate::config::WorkerConfig;
use crate::engine::AgentFactory;
use crate::error::Result;
use crate::queue::QueueClient;
use crate::store::SessionStore;
use crate::sweeper::{Sweeper, spawn_sweeper};

/// Run a worker until `shutdown` fires.
///
/// Owns the agent cache: it is handed to the sweeper, and every cached
/// agent is released before returning.
pub async fn run_worker(
    config: &WorkerConfig,
    queue: Arc<dyn QueueClient>,
    factory: Arc<dyn AgentFactory>,
    shutdown: CancellationToken,
) -> Result<()> {
    let store = Arc::new(SessionStore::new(&config.sessions_dir));
    store.ensure_root().await?;

    let cache = AgentCache::new(config.session_ttl);

    let sweeper = Arc::new(Sweeper::new(
        store.clone(),
        cache.clone(),
        config.session_ttl,
        config.max_sessions,
    ));
    let sweeper_shutdown = shutdown.child_token();
    let sweeper_task = spawn_sweeper(sweeper, config.sweep_interval, sweeper_shutdown.clone());
    info!(
        interval_secs = config.sweep_interval.as_secs(),
        ttl_secs = config.session_ttl.as_secs(),
        max_sessions = config.max_sessions,
        "Session sweeper started"
    );

    let processor = TaskProcessor::new(
        WorkerDeps {
            queue,
            cache: cache.clone(),
            factory,
            store,
        },
        ProcessorSettings::from(config),
    );
    processor.run(shutdown).await;

    sweeper_shutdown.cancel();
    if let Err(e) = sweeper_task.await {
        warn!(error = %e, "Session sweeper task ended abnormally");
    }
    cache.shutdown().await;

    Ok(())
}
