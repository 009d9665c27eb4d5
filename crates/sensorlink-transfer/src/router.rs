/// Site/destination routing: a static table from a sender's IP to a
/// human-readable label and an optional destination sub-folder.
///
/// The table is loaded from a JSON file:
///
/// ```text
/// [
///   { "address": "10.1.0.5", "label": "Site FM1", "folder": "FM1" },
///   { "address": "10.2.0.5", "label": "Site FM2" }
/// ]
/// ```
///
/// Unmapped peers are normal: they log under their address and their files
/// stay only in the received directory.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, TransferError};

/// One known sensor site.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Site {
    pub address: IpAddr,
    pub label: String,
    #[serde(default)]
    pub folder: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct SiteRouter {
    sites: HashMap<IpAddr, Site>,
}

impl SiteRouter {
    /// Router with no sites; every peer is unmapped.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_sites(sites: impl IntoIterator<Item = Site>) -> Self {
        Self {
            sites: sites.into_iter().map(|s| (s.address, s)).collect(),
        }
    }

    /// Load the table from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| TransferError::SiteMap {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let sites: Vec<Site> = serde_json::from_str(&text).map_err(|e| TransferError::SiteMap {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self::from_sites(sites))
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Label for log lines; the address itself when unmapped.
    pub fn label(&self, ip: IpAddr) -> String {
        match self.sites.get(&ip) {
            Some(site) => site.label.clone(),
            None => ip.to_string(),
        }
    }

    /// Destination sub-folder for files from `ip`, if the site has one.
    pub fn destination(&self, ip: IpAddr) -> Option<&Path> {
        self.sites.get(&ip)?.folder.as_deref()
    }

    /// Short filesystem-safe tag used to prefix manifest file names: the
    /// site folder's last component, or the address.
    pub fn site_tag(&self, ip: IpAddr) -> String {
        let tag = self
            .destination(ip)
            .and_then(|folder| folder.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| ip.to_string());
        tag.replace(':', "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn router() -> SiteRouter {
        SiteRouter::from_sites([
            Site { address: ip("1.1.1.1"), label: "Site FM1".into(), folder: Some("FM1".into()) },
            Site { address: ip("2.2.2.2"), label: "Site FM2".into(), folder: None },
        ])
    }

    #[test]
    fn mapped_and_unmapped_peers() {
        let router = router();
        assert_eq!(router.label(ip("1.1.1.1")), "Site FM1");
        assert_eq!(router.destination(ip("1.1.1.1")), Some(Path::new("FM1")));
        assert_eq!(router.destination(ip("2.2.2.2")), None);
        assert_eq!(router.label(ip("9.9.9.9")), "9.9.9.9");
        assert_eq!(router.destination(ip("9.9.9.9")), None);
    }

    #[test]
    fn site_tags() {
        let router = router();
        assert_eq!(router.site_tag(ip("1.1.1.1")), "FM1");
        assert_eq!(router.site_tag(ip("2.2.2.2")), "2.2.2.2");
        assert_eq!(router.site_tag(ip("::1")), "__1");
    }

    #[test]
    fn loads_json_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.json");
        std::fs::write(
            &path,
            r#"[{"address":"10.0.0.1","label":"Site FM3","folder":"FM3"},{"address":"10.0.0.2","label":"Lab"}]"#,
        )
        .unwrap();
        let router = SiteRouter::load(&path).unwrap();
        assert_eq!(router.len(), 2);
        assert_eq!(router.label(ip("10.0.0.2")), "Lab");
        assert_eq!(router.destination(ip("10.0.0.1")), Some(Path::new("FM3")));
    }

    #[test]
    fn malformed_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.json");
        std::fs::write(&path, r#"[{"address":"not-an-ip","label":"x"}]"#).unwrap();
        assert!(matches!(SiteRouter::load(&path), Err(TransferError::SiteMap { .. })));
    }
}
