mod config;
mod pipeline;

use std::sync::Arc;

use tracing::info;

use crate::config::SenderSettings;
use crate::pipeline::Pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensorlink_sender=debug,sensorlink_transfer=info".into()),
        )
        .init();

    let settings = SenderSettings::from_env()?;
    info!("SensorLink sender targeting udp://{}", settings.target);
    info!("Retention: {:?}", settings.retention);

    let json = Arc::new(Pipeline::new(settings.json_pipeline(), settings.target));
    let pcap = Arc::new(Pipeline::new(settings.pcap_pipeline(), settings.target));

    if let sensorlink_transfer::Retention::Archive { dir, keep } = &settings.retention {
        tokio::spawn(pipeline::run_prune_loop(dir.clone(), *keep, 3600));
    }

    if settings.run_on_start {
        json.clone().trigger();
        pcap.clone().trigger();
    }

    run_triggers(json, pcap).await
}

/// SIGUSR1 starts the JSON pipeline, SIGUSR2 the PCAP pipeline. Runs until
/// Ctrl+C or SIGTERM.
#[cfg(unix)]
async fn run_triggers(json: Arc<Pipeline>, pcap: Arc<Pipeline>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    info!("Waiting for triggers: SIGUSR1 = json, SIGUSR2 = pcap");

    loop {
        tokio::select! {
            _ = usr1.recv() => json.clone().trigger(),
            _ = usr2.recv() => pcap.clone().trigger(),
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
        }
    }
    Ok(())
}

/// Without user signals each pipeline runs once.
#[cfg(not(unix))]
async fn run_triggers(json: Arc<Pipeline>, pcap: Arc<Pipeline>) -> anyhow::Result<()> {
    json.run_once().await;
    pcap.run_once().await;
    Ok(())
}
