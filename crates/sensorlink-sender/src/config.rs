use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

use sensorlink_transfer::{CHUNK_SIZE, MAX_DATAGRAM, Retention, SenderConfig};

/// Sender settings, read from `SENSORLINK_*` environment variables.
#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub target: SocketAddr,
    pub json_dir: PathBuf,
    pub json_manifest: PathBuf,
    pub pcap_dir: PathBuf,
    pub pcap_manifest: PathBuf,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub retention: Retention,
    pub run_on_start: bool,
}

impl SenderSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let Some(target) = lookup("SENSORLINK_TARGET").filter(|v| !v.is_empty()) else {
            bail!("SENSORLINK_TARGET is required (collector ip:port)");
        };
        let target: SocketAddr = target.parse().context("SENSORLINK_TARGET must be ip:port")?;

        let chunk_size: usize = var("SENSORLINK_CHUNK_SIZE", &CHUNK_SIZE.to_string())
            .parse()
            .context("SENSORLINK_CHUNK_SIZE must be a number")?;
        if chunk_size == 0 || chunk_size > MAX_DATAGRAM {
            bail!("SENSORLINK_CHUNK_SIZE must be between 1 and {}", MAX_DATAGRAM);
        }
        let chunk_delay_ms: u64 = var("SENSORLINK_CHUNK_DELAY_MS", "1")
            .parse()
            .context("SENSORLINK_CHUNK_DELAY_MS must be a number")?;

        let retention_hours: u64 = var("SENSORLINK_RETENTION_HOURS", "0")
            .parse()
            .context("SENSORLINK_RETENTION_HOURS must be a number")?;
        let retention = match lookup("SENSORLINK_ARCHIVE_DIR").filter(|v| !v.is_empty()) {
            Some(dir) => Retention::Archive {
                dir: dir.into(),
                keep: Duration::from_secs(retention_hours * 3600),
            },
            None => Retention::Delete,
        };

        let run_on_start = matches!(
            var("SENSORLINK_RUN_ON_START", "false").to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        );

        Ok(Self {
            target,
            json_dir: var("SENSORLINK_JSON_DIR", "./REPORTS").into(),
            json_manifest: var("SENSORLINK_JSON_MANIFEST", "./HASH/hash_log.json").into(),
            pcap_dir: var("SENSORLINK_PCAP_DIR", "./PCAP").into(),
            pcap_manifest: var("SENSORLINK_PCAP_MANIFEST", "./HASH/pcap_hash_log.json").into(),
            chunk_size,
            chunk_delay: Duration::from_millis(chunk_delay_ms),
            retention,
            run_on_start,
        })
    }

    /// Pipeline for IDS reports.
    pub fn json_pipeline(&self) -> SenderConfig {
        self.pipeline("json", self.json_dir.clone(), &[".json"], self.json_manifest.clone())
    }

    /// Pipeline for packet captures.
    pub fn pcap_pipeline(&self) -> SenderConfig {
        self.pipeline("pcap", self.pcap_dir.clone(), &[".pcap"], self.pcap_manifest.clone())
    }

    fn pipeline(&self, name: &str, dir: PathBuf, extensions: &[&str], manifest: PathBuf) -> SenderConfig {
        let mut config = SenderConfig::new(name, dir, extensions, manifest);
        config.chunk_size = self.chunk_size;
        config.chunk_delay = self.chunk_delay;
        config.retention = self.retention.clone();
        config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> anyhow::Result<SenderSettings> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SenderSettings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn target_is_required() {
        assert!(settings(&[]).is_err());
        assert!(settings(&[("SENSORLINK_TARGET", "collector")]).is_err());
    }

    #[test]
    fn defaults_match_sensor_layout() {
        let settings = settings(&[("SENSORLINK_TARGET", "10.0.0.5:50000")]).unwrap();
        assert_eq!(settings.chunk_size, 1024);
        assert_eq!(settings.chunk_delay, Duration::from_millis(1));
        assert_eq!(settings.retention, Retention::Delete);
        assert!(!settings.run_on_start);

        let json = settings.json_pipeline();
        assert_eq!(json.source_dir, PathBuf::from("./REPORTS"));
        assert_eq!(json.extensions, vec![".json"]);
        assert_eq!(json.manifest_path, PathBuf::from("./HASH/hash_log.json"));

        let pcap = settings.pcap_pipeline();
        assert_eq!(pcap.extensions, vec![".pcap"]);
        assert_eq!(pcap.manifest_path, PathBuf::from("./HASH/pcap_hash_log.json"));
    }

    #[test]
    fn archive_dir_enables_archive_retention() {
        let settings = settings(&[
            ("SENSORLINK_TARGET", "10.0.0.5:50000"),
            ("SENSORLINK_ARCHIVE_DIR", "/var/lib/sensorlink/sent"),
            ("SENSORLINK_RETENTION_HOURS", "48"),
            ("SENSORLINK_RUN_ON_START", "TRUE"),
        ])
        .unwrap();
        assert_eq!(
            settings.retention,
            Retention::Archive {
                dir: "/var/lib/sensorlink/sent".into(),
                keep: Duration::from_secs(48 * 3600),
            }
        );
        assert!(settings.run_on_start);
        assert_eq!(settings.pcap_pipeline().retention, settings.retention);
    }

    #[test]
    fn rejects_oversized_chunks() {
        assert!(settings(&[("SENSORLINK_TARGET", "10.0.0.5:50000"), ("SENSORLINK_CHUNK_SIZE", "70000")]).is_err());
    }
}
