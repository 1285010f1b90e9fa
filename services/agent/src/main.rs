// Agent service main entry point.
use agent::config::AgentConfig;
use agent::pipeline::{ingest, processor, replies, subscriber};
use agent::signal::ChangeSignal;
use anyhow::{Context, Result};
use rads_store::Store;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AgentConfig::load().context("load agent config")?;
    let store = Store::open(&config.database_file_path)
        .await
        .with_context(|| format!("open datastore: {}", config.database_file_path))?;
    tracing::info!(agent_id = %config.agent_id, "agent started");

    let cancel = CancellationToken::new();
    let signal = Arc::new(ChangeSignal::default());
    let (queue_tx, queue_rx) = mpsc::channel(subscriber::QUEUE_CAPACITY);

    let tasks = vec![
        tokio::spawn(subscriber::run(config.clone(), queue_tx, cancel.clone())),
        tokio::spawn(ingest::run(
            store.clone(),
            queue_rx,
            rads_wire::request_prefix(&config.agent_id),
            cancel.clone(),
        )),
        tokio::spawn(processor::run(
            store.clone(),
            Arc::clone(&signal),
            cancel.clone(),
        )),
        tokio::spawn(replies::run(store.clone(), config.clone(), cancel.clone())),
    ];

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "pipeline task join failed");
        }
    }
    store.close().await;
    tracing::info!("agent stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
