use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, TransferError};

/// On-disk layout of the collector.
///
/// ```text
/// {root}/received/   finalized files, flat
/// {root}/hashlog/    finalized manifests
/// {root}/corrupted/  files that failed verification
/// {root}/<site>/     per-site copies (relative site folders resolve here)
/// ```
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    received: PathBuf,
    hashlog: PathBuf,
    corrupted: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            received: root.join("received"),
            hashlog: root.join("hashlog"),
            corrupted: root.join("corrupted"),
            root,
        }
    }

    /// Create the fixed directories.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.received, &self.hashlog, &self.corrupted] {
            std::fs::create_dir_all(dir)
                .map_err(|e| TransferError::io(format!("cannot create {}", dir.display()), e))?;
        }
        info!("Collector storage root: {}", self.root.display());
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn received_dir(&self) -> &Path {
        &self.received
    }

    pub fn hashlog_dir(&self) -> &Path {
        &self.hashlog
    }

    pub fn corrupted_dir(&self) -> &Path {
        &self.corrupted
    }

    /// Path of a received file. `name` must already be validated.
    pub fn received_path(&self, name: &str) -> PathBuf {
        self.received.join(name)
    }

    pub fn quarantine_path(&self, name: &str) -> PathBuf {
        self.corrupted.join(name)
    }

    /// Resolve a site folder; relative folders live under the root.
    pub fn site_dir(&self, folder: &Path) -> PathBuf {
        if folder.is_absolute() {
            folder.to_path_buf()
        } else {
            self.root.join(folder)
        }
    }
}

/// Move a file, falling back to copy and remove when a rename cannot cross
/// filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) if from.exists() => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}
