// Ingest worker: drain the queue, dedupe, persist, acknowledge.
use async_nats::jetstream::{AckKind, Message};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rads_store::{NewMessage, Store};
use rads_wire::Request;

const IDLE_DELAY: Duration = Duration::from_millis(25);
const BATCH_DELAY: Duration = Duration::from_millis(100);

/// What to do with one delivered message. Poison input is acked and
/// dropped: redelivering it cannot make it parse. Only local store trouble
/// naks for redelivery.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Persisted with `processed = false`; ack.
    Persisted,
    /// `(event, request_id)` already in the ledger; ack silently.
    Duplicate,
    /// Unusable input (bad subject, unknown event, bad payload); ack and log.
    Drop(String),
    /// Store lookup or insert failed; nak so the broker redelivers.
    Retry(String),
}

/// Decides the fate of a delivered message and persists it when valid.
/// Split from the ack plumbing so the poison policy is testable without a
/// broker connection.
pub async fn disposition(
    store: &Store,
    prefix: &str,
    subject: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> IngestOutcome {
    let Some(event) = rads_wire::event_from_subject(subject, prefix) else {
        return IngestOutcome::Drop(format!("subject {subject} outside the request namespace"));
    };

    let request = match Request::decode(event, payload) {
        Ok(request) => request,
        Err(err) => return IngestOutcome::Drop(err.to_string()),
    };
    let meta = request.meta();
    let Some(requested_at) = meta.requested_at else {
        // Unreachable: decode rejects an absent requested_at.
        return IngestOutcome::Drop("missing requested_at".to_string());
    };

    match store.is_message_recorded(event, &meta.request_id).await {
        Ok(true) => return IngestOutcome::Duplicate,
        Ok(false) => {}
        Err(err) => return IngestOutcome::Retry(err.to_string()),
    }

    let request_payload = match request.canonical_json() {
        Ok(payload) => payload,
        Err(err) => return IngestOutcome::Drop(format!("reserialize payload: {err}")),
    };

    let new = NewMessage {
        event: event.to_string(),
        request_id: meta.request_id.clone(),
        request_payload,
        requested_at,
        queued_at: now,
    };
    match store.insert_message(&new).await {
        Ok(()) => IngestOutcome::Persisted,
        Err(err) => IngestOutcome::Retry(err.to_string()),
    }
}

/// Batch-drains the queue and applies `disposition` to each message.
pub async fn run(
    store: Store,
    mut queue: mpsc::Receiver<Message>,
    prefix: String,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            tracing::info!("ingest worker stopped");
            return;
        }

        let batch = drain(&mut queue);
        if batch.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("ingest worker stopped");
                    return;
                }
                _ = tokio::time::sleep(IDLE_DELAY) => {}
            }
            continue;
        }

        for message in batch {
            let outcome = disposition(
                &store,
                &prefix,
                message.subject.as_str(),
                &message.payload,
                Utc::now(),
            )
            .await;
            settle(&message, outcome).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("ingest worker stopped");
                return;
            }
            _ = tokio::time::sleep(BATCH_DELAY) => {}
        }
    }
}

async fn settle(message: &Message, outcome: IngestOutcome) {
    match outcome {
        IngestOutcome::Persisted => {
            metrics::counter!("rads_ingest_persisted_total").increment(1);
            if let Err(err) = message.ack().await {
                tracing::warn!(error = %err, subject = %message.subject, "failed to ack message");
            }
        }
        IngestOutcome::Duplicate => {
            metrics::counter!("rads_ingest_duplicate_total").increment(1);
            if let Err(err) = message.ack().await {
                tracing::warn!(error = %err, subject = %message.subject, "failed to ack duplicate");
            }
        }
        IngestOutcome::Drop(reason) => {
            metrics::counter!("rads_ingest_dropped_total").increment(1);
            tracing::warn!(subject = %message.subject, %reason, "dropping message");
            if let Err(err) = message.ack().await {
                tracing::warn!(error = %err, subject = %message.subject, "failed to ack drop");
            }
        }
        IngestOutcome::Retry(reason) => {
            metrics::counter!("rads_ingest_retried_total").increment(1);
            tracing::warn!(subject = %message.subject, %reason, "store unavailable; requesting redelivery");
            if let Err(err) = message.ack_with(AckKind::Nak(None)).await {
                tracing::warn!(error = %err, subject = %message.subject, "failed to nak message");
            }
        }
    }
}

fn drain(queue: &mut mpsc::Receiver<Message>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(message) = queue.try_recv() {
        messages.push(message);
    }
    messages
}
