//! Background sweep for abandoned contexts and expired sample tombstones

use super::registry::ContextRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time;

/// Spawn the reaper loop.
///
/// Runs `reap_expired` every `interval` until a shutdown message arrives.
pub fn spawn_reaper_task(
    registry: Arc<ContextRegistry>,
    interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        reaper_loop(registry, interval, shutdown_rx).await;
    })
}

async fn reaper_loop(registry: Arc<ContextRegistry>, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = registry.reap_expired(Instant::now());
                if report.finalized > 0 || report.discarded > 0 {
                    tracing::info!(
                        finalized = report.finalized,
                        discarded = report.discarded,
                        "Reaped abandoned request contexts"
                    );
                }
                if report.tombstones_flushed > 0 {
                    tracing::debug!(flushed = report.tombstones_flushed, "Flushed sample tombstones");
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Reaper stopping");
                break;
            }
        }
    }
}
