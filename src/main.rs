use std::sync::Arc;

use agent_worker::config::WorkerConfig;
use agent_worker::engine::HttpAgentFactory;
use agent_worker::queue::{RedisQueue, RetryPolicy};
use agent_worker::worker::run_worker;
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("invalid configuration")?;

    // Flushes the file log on drop; keep it for the whole run.
    let _log_guard = init_tracing(&config);

    eprintln!("🛠  agent-worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Queue: {}", config.queue_key);
    eprintln!("   Engine: {}", config.engine_url);
    eprintln!("   Tools: {}", config.tool_backend_url);
    eprintln!("   Sessions: {}", config.sessions_dir.display());
    eprintln!(
        "   Task timeout: {}s, session TTL: {}h, max sessions: {}\n",
        config.task_timeout.as_secs(),
        config.session_ttl.as_secs() / 3600,
        config.max_sessions
    );

    let queue = RedisQueue::connect(&config.queue_url, config.queue_key.clone(), &RetryPolicy::CONNECT)
        .await
        .context("failed to connect to the task queue")?;
    let factory = HttpAgentFactory::new(config.engine_url.clone(), config.tool_backend_url.clone());

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    run_worker(&config, Arc::new(queue), Arc::new(factory), shutdown).await?;

    tracing::info!("Worker stopped");
    Ok(())
}

/// Console logging, plus a daily-rolling file when `LOG_DIR` is set.
fn init_tracing(config: &WorkerConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,redis=warn",
            config.log_level
        ))
    });

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-worker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received, finishing current task...");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
