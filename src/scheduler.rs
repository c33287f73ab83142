use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;

/// How often the compactor checks the WAL append count.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const MIN_ACTIVATION_INTERVAL: Duration = Duration::from_secs(1);

/// Daily sweep promoting due UPCOMING reservations into allocations.
/// The first sweep runs immediately so a restart catches up on missed days.
pub async fn run_activation_job(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    // A zero period makes `interval` panic.
    let mut interval = tokio::time::interval(every.max(MIN_ACTIVATION_INTERVAL));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let report = engine.activate_due_reservations(engine.today()).await;
                if !report.skipped.is_empty() {
                    tracing::debug!(skipped = report.skipped.len(), "activation sweep left reservations pending");
                }
            }
        }
    }
    info!("activation job stopped");
}

/// Compact the WAL whenever at least `threshold` events were appended since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    run_compactor_every(engine, threshold, COMPACT_CHECK_INTERVAL, cancel).await
}

async fn run_compactor_every(engine: Arc<Engine>, threshold: u64, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if engine.wal_appends_since_compact().await < threshold {
                    continue;
                }
                if let Err(e) = engine.compact_wal().await {
                    tracing::error!("WAL compaction failed: {e}");
                }
            }
        }
    }
    info!("compactor stopped");
}
