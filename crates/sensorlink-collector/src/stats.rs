use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info};

use sensorlink_transfer::ReceiverProgress;

/// Background task that periodically logs receiver counters.
///
/// Only logs at `info` when something changed since the last tick.
pub async fn run_stats_loop(progress: Arc<ReceiverProgress>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut last = 0u64;

    loop {
        interval.tick().await;
        if progress.is_cancelled() {
            break;
        }

        let datagrams = progress.datagrams.load(Ordering::Relaxed);
        let line = summary(&progress);
        if datagrams != last {
            info!("Stats: {}", line);
            last = datagrams;
        } else {
            debug!("Stats: {}", line);
        }
    }
}

fn summary(progress: &ReceiverProgress) -> String {
    format!(
        "datagrams={} bytes={} open_sessions={} files={} manifests={} quarantined={} faults={}",
        progress.datagrams.load(Ordering::Relaxed),
        progress.bytes.load(Ordering::Relaxed),
        progress.open_sessions.load(Ordering::Relaxed),
        progress.files_received.load(Ordering::Relaxed),
        progress.manifests_received.load(Ordering::Relaxed),
        progress.files_quarantined.load(Ordering::Relaxed),
        progress.faults.load(Ordering::Relaxed),
    )
}
