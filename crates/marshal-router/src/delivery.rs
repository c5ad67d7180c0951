use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use marshal_core::event::WorkerEvent;

/// One matched rule, ready for delivery to its sink.
#[derive(Clone, Debug)]
pub struct RouteMatch {
    pub rule: String,
    pub sink: String,
    pub event: WorkerEvent,
}

/// Hands a matched event to a named sink. Chat adapters and webhooks live
/// behind this seam; the router itself never talks to the outside world.
#[async_trait]
pub trait SinkDelivery: Send + Sync {
    async fn deliver(&self, sink: &str, event: &WorkerEvent) -> anyhow::Result<()>;
}

/// Default delivery: structured log lines, one per match.
pub struct LogDelivery;

#[async_trait]
impl SinkDelivery for LogDelivery {
    async fn deliver(&self, sink: &str, event: &WorkerEvent) -> anyhow::Result<()> {
        tracing::info!(
            sink,
            kind = %event.kind,
            node_id = %event.node_id,
            session_id = event.session_id.as_ref().map(|s| s.as_str()),
            "event routed"
        );
        Ok(())
    }
}

/// Drain matches off the channel and deliver them one at a time. Delivery
/// failures are logged and skipped; they never stall ingestion upstream.
pub fn spawn_delivery(
    mut matches: mpsc::Receiver<RouteMatch>,
    delivery: Arc<dyn SinkDelivery>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = matches.recv() => {
                    let Some(found) = next else { break };
                    if let Err(err) = delivery.deliver(&found.sink, &found.event).await {
                        tracing::warn!(
                            sink = %found.sink,
                            rule = %found.rule,
                            error = %err,
                            "sink delivery failed"
                        );
                    }
                }
            }
        }
        tracing::debug!("delivery task stopped");
    })
}
