use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

use sensorlink_transfer::{CollisionPolicy, PeerKeying, SessionPolicy};

/// Collector settings, read from `SENSORLINK_*` environment variables.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub site_map: Option<PathBuf>,
    pub policy: SessionPolicy,
    pub finalize_workers: usize,
}

impl CollectorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let listen: SocketAddr = var("SENSORLINK_LISTEN", "0.0.0.0:50000")
            .parse()
            .context("SENSORLINK_LISTEN must be ip:port")?;
        let data_dir: PathBuf = var("SENSORLINK_DATA_DIR", ".").into();
        let site_map = lookup("SENSORLINK_SITE_MAP")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let keying = match var("SENSORLINK_PEER_KEYING", "address").as_str() {
            "address" => PeerKeying::Address,
            "ip" => PeerKeying::Ip,
            other => bail!("SENSORLINK_PEER_KEYING must be 'address' or 'ip', got {:?}", other),
        };
        let on_collision = match var("SENSORLINK_ON_COLLISION", "replace").as_str() {
            "replace" => CollisionPolicy::Replace,
            "reject" => CollisionPolicy::Reject,
            other => bail!("SENSORLINK_ON_COLLISION must be 'replace' or 'reject', got {:?}", other),
        };
        let idle_secs: u64 = var("SENSORLINK_IDLE_TIMEOUT_SECS", "300")
            .parse()
            .context("SENSORLINK_IDLE_TIMEOUT_SECS must be a number")?;
        let max_mb: usize = var("SENSORLINK_MAX_SESSION_MB", "1024")
            .parse()
            .context("SENSORLINK_MAX_SESSION_MB must be a number")?;
        let finalize_workers: usize = var("SENSORLINK_FINALIZE_WORKERS", "4")
            .parse()
            .context("SENSORLINK_FINALIZE_WORKERS must be a number")?;

        Ok(Self {
            listen,
            data_dir,
            site_map,
            policy: SessionPolicy {
                keying,
                on_collision,
                max_session_bytes: max_mb.saturating_mul(1024 * 1024),
                // 0 disables the sweep
                idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            },
            finalize_workers: finalize_workers.max(1),
        })
    }
}
