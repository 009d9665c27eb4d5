mod config;
mod stats;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use sensorlink_transfer::{ReceiverConfig, ReceiverProgress, SiteRouter, run_receiver};

use crate::config::CollectorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensorlink_collector=debug,sensorlink_transfer=info".into()),
        )
        .init();

    let config = CollectorConfig::from_env()?;

    let router = match &config.site_map {
        Some(path) => SiteRouter::load(path)?,
        None => SiteRouter::empty(),
    };
    info!("Site map: {} sites", router.len());

    let mut receiver = ReceiverConfig::new(config.listen, &config.data_dir);
    receiver.router = Arc::new(router);
    receiver.policy = config.policy.clone();
    receiver.finalize_workers = config.finalize_workers;

    info!("SensorLink collector listening on udp://{}", config.listen);
    info!(
        "Sessions keyed by {:?}, on collision {:?}, idle timeout {:?}",
        config.policy.keying, config.policy.on_collision, config.policy.idle_timeout
    );

    let progress = Arc::new(ReceiverProgress::new());
    tokio::spawn(stats::run_stats_loop(progress.clone(), 60));

    let intake_progress = progress.clone();
    let intake = tokio::task::spawn_blocking(move || run_receiver(receiver, intake_progress));

    let stop_progress = progress.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop_progress.cancel();
    });

    match intake.await.context("intake thread panicked")? {
        Ok(addr) => info!("Collector on {} stopped", addr),
        Err(e) => {
            error!("Collector failed: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Cannot install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
