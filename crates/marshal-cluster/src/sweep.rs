use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;

/// Periodic heartbeat-expiry sweep. Runs until the token is cancelled.
pub fn spawn_sweeper(
    cluster: Arc<Cluster>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let swept = cluster.sweep(Utc::now());
                    if !swept.is_empty() {
                        tracing::warn!(count = swept.len(), "swept expired nodes offline");
                    }
                }
            }
        }
    })
}
