// Request processor: drain the unprocessed backlog in FIFO order, apply
// each mutation under one batch transaction, sweep orphans, commit, raise
// the change signal.
use chrono::Utc;
use sqlx::Acquire;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use rads_store::messages::update_message;
use rads_store::{Message, Store, StoreResult, apply, collect_garbage};
use rads_wire::Request;

use crate::signal::ChangeSignal;

const BATCH_LIMIT: i64 = 100;
const EMPTY_DELAY: Duration = Duration::from_secs(1);
const BATCH_PAUSE: Duration = Duration::from_millis(25);

pub async fn run(store: Store, signal: Arc<ChangeSignal>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            tracing::info!("request processor stopped");
            return;
        }

        let batch = match store.unprocessed_batch(BATCH_LIMIT).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(error = %err, "failed to fetch unprocessed messages");
                if pause(&cancel, EMPTY_DELAY).await {
                    return;
                }
                continue;
            }
        };
        if batch.is_empty() {
            if pause(&cancel, EMPTY_DELAY).await {
                return;
            }
            continue;
        }

        let size = batch.len();
        match process_batch(&store, batch).await {
            Ok(()) => {
                metrics::counter!("rads_processor_processed_total").increment(size as u64);
                tracing::debug!(size, "processed batch committed");
                signal.raise();
            }
            Err(err) => {
                // Nothing was committed; the same rows match the next fetch.
                tracing::warn!(error = %err, "failed to commit processed batch");
                if pause(&cancel, EMPTY_DELAY).await {
                    return;
                }
                continue;
            }
        }

        if pause(&cancel, BATCH_PAUSE).await {
            return;
        }
    }
}

/// Applies a fetched batch under a single write transaction.
///
/// Each message is marked processed whatever its handler outcome; handler
/// failure lands in `error_message` and never aborts the batch. The handler
/// itself runs inside a savepoint, so a handler that wrote before failing
/// leaves no partial rows behind. Batch-level store errors abort the whole
/// transaction and the rows stay unprocessed for the next pass.
pub async fn process_batch(store: &Store, batch: Vec<Message>) -> StoreResult<()> {
    let mut tx = store.begin().await?;

    for mut msg in batch {
        msg.processed = true;
        msg.processed_at = Some(Utc::now());
        msg.response_payload = "{}".to_string();
        msg.error_message.clear();
        msg.success = false;

        match Request::decode(&msg.event, msg.request_payload.as_bytes()) {
            Err(err) => {
                // Registry misses and rot in stored payloads are terminal
                // for the message, not the batch.
                msg.error_message = err.to_string();
            }
            Ok(request) => {
                let mut savepoint = tx.begin().await?;
                match apply(&mut savepoint, &request).await {
                    Ok(reply) => {
                        savepoint.commit().await?;
                        msg.success = true;
                        if let Some(value) = reply {
                            match serde_json::to_string(&value) {
                                Ok(payload) => msg.response_payload = payload,
                                Err(err) => {
                                    msg.success = false;
                                    msg.error_message = format!("serialize reply: {err}");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        savepoint.rollback().await?;
                        msg.error_message = err.to_string();
                    }
                }
            }
        }

        update_message(&mut tx, &msg).await?;
    }

    collect_garbage(&mut tx).await?;
    tx.commit().await?;
    Ok(())
}

// True when cancellation fired during the pause.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("request processor stopped");
            true
        }
        _ = tokio::time::sleep(delay) => false,
    }
}
