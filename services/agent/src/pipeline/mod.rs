//! The four-stage at-least-once pipeline.
//!
//! Subscriber → bounded queue → ingest (persist + ack) → processor
//! (transactional mutate + sweep) → reply publisher. Stages communicate
//! only through the queue and the store, so each one survives and retries
//! its own failures without involving the others.
pub mod ingest;
pub mod processor;
pub mod replies;
pub mod subscriber;

use anyhow::{Context, Result};
use async_nats::jetstream;

use crate::config::AgentConfig;

// Shared connect path for the subscriber and the reply publisher. The agent
// id doubles as the client name so broker-side logs attribute traffic.
pub(crate) async fn connect_jetstream(config: &AgentConfig) -> Result<jetstream::Context> {
    let url = config.broker_url();
    let client = async_nats::ConnectOptions::new()
        .name(config.agent_id.clone())
        .event_callback(|event| async move {
            // Transport-level reconnects do not require resubscription; the
            // durable consumer state lives in the broker.
            tracing::info!(%event, "broker connection event");
        })
        .connect(url.as_str())
        .await
        .with_context(|| format!("connect to broker at {url}"))?;
    Ok(jetstream::new(client))
}
