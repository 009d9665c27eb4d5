/// Manifest ("hash log"): the ordered `{filename, hash}` list a sender
/// transmits after a batch so the collector can check what it received.
///
/// Wire and disk format is a JSON array:
///
/// ```text
/// [
///   { "filename": "a.json", "hash": "<64 hex chars>" },
///   ...
/// ]
/// ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

/// One file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub hash: String,
}

/// Ordered manifest for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Write the manifest to `path`, creating its parent directory.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransferError::io(format!("cannot create {}", parent.display()), e)
            })?;
        }
        std::fs::write(path, self.to_json()?)
            .map_err(|e| TransferError::io(format!("cannot write manifest {}", path.display()), e))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransferError::io(format!("cannot read manifest {}", path.display()), e))?;
        Self::from_json(&text)
    }
}
