// Durable subscription feeding the bounded in-memory queue.
use async_nats::jetstream::consumer;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::pipeline::connect_jetstream;

/// Capacity of the queue between delivery and ingest. Sending blocks when
/// full, which back-pressures the consumer instead of dropping requests.
pub const QUEUE_CAPACITY: usize = 1000;

const RETRY_DELAY: Duration = Duration::from_secs(5);
const ACK_WAIT: Duration = Duration::from_secs(60);

/// Maintains the durable subscription until shutdown. The broker may be
/// absent at startup; the agent must still come up, so connect and
/// subscribe failures retry forever.
pub async fn run(
    config: AgentConfig,
    queue: mpsc::Sender<async_nats::jetstream::Message>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            tracing::info!("subscriber stopped");
            return;
        }
        match subscribe_and_pump(&config, &queue, &cancel).await {
            Ok(()) => {
                tracing::info!("subscriber stopped");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "subscription lost; retrying");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("subscriber stopped");
                return;
            }
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

async fn subscribe_and_pump(
    config: &AgentConfig,
    queue: &mpsc::Sender<async_nats::jetstream::Message>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let jetstream = connect_jetstream(config).await?;

    let filter = rads_wire::request_filter(&config.agent_id);
    let durable = rads_wire::durable_name(&config.agent_id);
    let stream_name = jetstream
        .stream_by_subject(filter.clone())
        .await
        .with_context(|| format!("locate stream for {filter}"))?;
    let stream = jetstream
        .get_stream(&stream_name)
        .await
        .with_context(|| format!("locate stream for {filter}"))?;
    let consumer = stream
        .get_or_create_consumer(
            &durable,
            consumer::pull::Config {
                durable_name: Some(durable.clone()),
                filter_subject: filter.clone(),
                ack_policy: consumer::AckPolicy::Explicit,
                ack_wait: ACK_WAIT,
                deliver_policy: consumer::DeliverPolicy::All,
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("create durable consumer {durable}"))?;
    tracing::info!(subject = %filter, durable = %durable, "subscribed to request stream");

    let mut messages = consumer
        .messages()
        .await
        .with_context(|| "open consumer message stream")?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = messages.next() => match next {
                Some(Ok(message)) => {
                    metrics::counter!("rads_subscriber_delivered_total").increment(1);
                    // A closed queue means ingest is gone, which only
                    // happens on shutdown.
                    if queue.send(message).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Err(err)) => return Err(err).with_context(|| "consumer message stream"),
                None => anyhow::bail!("consumer message stream ended"),
            }
        }
    }
}
