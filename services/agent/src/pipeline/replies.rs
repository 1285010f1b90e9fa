// Reply publisher: push response envelopes for processed rows, then mark
// them replied. Crash between publish and mark means the envelope is
// republished on restart; consumers dedupe on request_id.
use async_nats::jetstream;
use serde_json::value::RawValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use rads_store::{Message, Store};
use rads_wire::ReplyEnvelope;

use crate::config::AgentConfig;
use crate::pipeline::connect_jetstream;

const BATCH_LIMIT: i64 = 200;
const IDLE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub async fn run(store: Store, config: AgentConfig, cancel: CancellationToken) {
    let mut jetstream: Option<jetstream::Context> = None;

    loop {
        if cancel.is_cancelled() {
            tracing::info!("reply publisher stopped");
            return;
        }

        if jetstream.is_none() {
            match connect_jetstream(&config).await {
                Ok(context) => jetstream = Some(context),
                Err(err) => {
                    tracing::warn!(error = %err, "reply publisher cannot reach broker");
                    if pause(&cancel, RECONNECT_DELAY).await {
                        return;
                    }
                    continue;
                }
            }
        }
        let Some(context) = jetstream.as_ref() else {
            continue;
        };

        let pending = match store.unreplied_batch(BATCH_LIMIT).await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(error = %err, "failed to fetch unreplied messages");
                if pause(&cancel, IDLE_DELAY).await {
                    return;
                }
                continue;
            }
        };
        if pending.is_empty() {
            if pause(&cancel, IDLE_DELAY).await {
                return;
            }
            continue;
        }

        let mut published = Vec::with_capacity(pending.len());
        let mut failures = 0usize;
        for msg in &pending {
            let Some(envelope) = envelope_for(msg) else {
                tracing::warn!(id = msg.id, event = %msg.event, "skipping unpublishable reply row");
                continue;
            };
            let payload = match envelope.to_pretty_json() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(id = msg.id, error = %err, "failed to serialize reply");
                    continue;
                }
            };

            let subject = rads_wire::reply_subject(&config.agent_id, &msg.event);
            match publish(context, subject.clone(), payload).await {
                Ok(()) => published.push(msg.id),
                Err(err) => {
                    failures += 1;
                    tracing::warn!(error = %err, %subject, "failed to publish reply");
                }
            }
        }

        // Every publish failing looks like a dead connection, not a run of
        // poison rows; rebuild it before the next pass.
        if failures > 0 && published.is_empty() {
            jetstream = None;
        }

        if !published.is_empty() {
            metrics::counter!("rads_replies_published_total").increment(published.len() as u64);
            if let Err(err) = store.mark_replied(&published).await {
                // Re-publishing on the next pass is safe; consumers dedupe.
                tracing::warn!(error = %err, "failed to mark messages replied");
            }
        }
    }
}

/// Builds the outbound envelope for a processed row. `None` means the row
/// cannot be published (no processed_at, or a response payload that is not
/// JSON), which only happens if the ledger was tampered with.
pub fn envelope_for(msg: &Message) -> Option<ReplyEnvelope> {
    let processed_at = msg.processed_at?;
    let data = RawValue::from_string(msg.response_payload.clone()).ok()?;
    Some(ReplyEnvelope {
        request_id: msg.request_id.clone(),
        requested_at: msg.requested_at,
        success: msg.success,
        data,
        error_message: msg.error_message.clone(),
        processed_at,
        queued_at: msg.queued_at,
    })
}

async fn publish(
    context: &jetstream::Context,
    subject: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    let ack = context.publish(subject, payload.into()).await?;
    ack.await?;
    Ok(())
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("reply publisher stopped");
            true
        }
        _ = tokio::time::sleep(delay) => false,
    }
}
