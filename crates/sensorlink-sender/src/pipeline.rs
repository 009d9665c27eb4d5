use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use sensorlink_transfer::{BatchReport, SenderConfig, UdpSink, prune_archive, run_batch};

/// One sender pipeline (one directory, one manifest) with an overlap guard.
pub struct Pipeline {
    config: SenderConfig,
    target: SocketAddr,
    running: AtomicBool,
}

/// Held while a batch runs; clears the running flag on drop.
pub struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Pipeline {
    pub fn new(config: SenderConfig, target: SocketAddr) -> Self {
        Self {
            config,
            target,
            running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Claim the pipeline. `None` while a batch is already running.
    pub fn try_start(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { running: &self.running })
    }

    /// Send one batch on a fresh socket. Blocking.
    fn send_batch(&self) -> anyhow::Result<BatchReport> {
        let sink = UdpSink::new(self.target)?;
        info!(
            "[{}] Sending batch from {} to {} (local {})",
            self.name(),
            self.config.source_dir.display(),
            self.target,
            sink.local_addr()?
        );
        Ok(run_batch(&self.config, &sink)?)
    }

    /// Run one batch on the blocking pool, unless one is already running.
    pub async fn run_once(self: Arc<Self>) -> Option<BatchReport> {
        let pipeline = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            let Some(_guard) = pipeline.try_start() else {
                info!("[{}] Batch already running, trigger skipped", pipeline.name());
                return None;
            };
            Some(pipeline.send_batch())
        })
        .await;

        match result {
            Ok(Some(Ok(report))) => {
                info!(
                    "[{}] Batch done: {} sent, {} failed, {} retired",
                    self.name(),
                    report.sent.len(),
                    report.failed.len(),
                    report.retired
                );
                Some(report)
            }
            Ok(Some(Err(e))) => {
                warn!("[{}] Batch failed: {:#}", self.name(), e);
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[{}] Batch task panicked: {}", self.name(), e);
                None
            }
        }
    }

    /// Fire-and-forget `run_once`.
    pub fn trigger(self: Arc<Self>) {
        tokio::spawn(async move {
            self.run_once().await;
        });
    }
}

/// Background task that prunes expired archive batches.
pub async fn run_prune_loop(dir: PathBuf, keep: Duration, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match prune_archive(&dir, keep, chrono::Utc::now()) {
            Ok(count) => {
                if count > 0 {
                    info!("Prune: removed {} archived batches", count);
                }
            }
            Err(e) => {
                warn!("Prune error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        let config = SenderConfig::new("json", "./REPORTS", &[".json"], "./HASH/hash_log.json");
        Pipeline::new(config, "127.0.0.1:50000".parse().unwrap())
    }

    #[test]
    fn overlapping_start_is_refused() {
        let pipeline = pipeline();
        let guard = pipeline.try_start();
        assert!(guard.is_some());
        assert!(pipeline.try_start().is_none());
        drop(guard);
        assert!(pipeline.try_start().is_some());
    }

    #[tokio::test]
    async fn batch_over_loopback_sends_and_retires() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("REPORTS");
        std::fs::create_dir_all(&reports).unwrap();
        std::fs::write(reports.join("a.json"), b"{}").unwrap();

        let collector = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut config = SenderConfig::new("json", &reports, &[".json"], dir.path().join("HASH/hash_log.json"))
            .without_delays();
        config.logger = Some(Arc::new(sensorlink_transfer::NullLogger));
        let pipeline = Arc::new(Pipeline::new(config, collector.local_addr().unwrap()));

        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.sent, vec!["a.json"]);
        assert!(!reports.join("a.json").exists());

        let mut buf = [0u8; 64];
        let (n, _) = collector.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"FILENAME:a.json");
    }
}
