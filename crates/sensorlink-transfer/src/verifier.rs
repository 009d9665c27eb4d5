/// Post-transfer integrity verification.
///
/// Runs once per finalized manifest: every entry is looked up in the received
/// directory and its SHA-256 recomputed. Mismatches are moved to the
/// quarantine directory. Files still in flight when the manifest lands are
/// reported missing; there is no retry.

use std::path::Path;

use crate::error::Result;
use crate::hasher::hash_file;
use crate::logging::{SiteLog, TransferEvent};
use crate::manifest::Manifest;
use crate::protocol::validate_name;
use crate::storage::{Storage, move_file};

/// Per-entry results of one verification pass, in manifest order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub passed: Vec<String>,
    pub missing: Vec<String>,
    pub corrupted: Vec<String>,
    /// Entries whose name is not a plain file name; never looked up.
    pub invalid: Vec<String>,
}

impl VerificationReport {
    /// True when every entry passed.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupted.is_empty() && self.invalid.is_empty()
    }
}

/// Check every manifest entry against the received directory.
pub fn verify_manifest(manifest: &Manifest, storage: &Storage, log: &SiteLog) -> VerificationReport {
    let mut report = VerificationReport::default();

    for entry in &manifest.entries {
        let name = match validate_name(&entry.filename) {
            Ok(name) => name,
            Err(e) => {
                log.emit(TransferEvent::InvalidName {
                    name: entry.filename.clone(),
                    reason: e.to_string(),
                });
                report.invalid.push(entry.filename.clone());
                continue;
            }
        };

        let path = storage.received_path(name);
        if !path.is_file() {
            log.emit(TransferEvent::MissingFile { name: name.to_string() });
            report.missing.push(name.to_string());
            continue;
        }

        let actual = match hash_file(&path) {
            Ok(digest) => digest,
            Err(e) => {
                // Unreadable counts as missing; there is nothing to quarantine.
                tracing::debug!("Cannot hash {}: {}", path.display(), e);
                log.emit(TransferEvent::MissingFile { name: name.to_string() });
                report.missing.push(name.to_string());
                continue;
            }
        };

        if actual.eq_ignore_ascii_case(&entry.hash) {
            log.emit(TransferEvent::IntegrityPassed { name: name.to_string() });
            report.passed.push(name.to_string());
            continue;
        }

        log.emit(TransferEvent::IntegrityFault {
            name: name.to_string(),
            expected: entry.hash.clone(),
            actual,
        });
        if let Err(e) = move_file(&path, &storage.quarantine_path(name)) {
            log.emit(TransferEvent::QuarantineFault {
                name: name.to_string(),
                message: e.to_string(),
            });
        }
        report.corrupted.push(name.to_string());
    }

    log.emit(TransferEvent::VerificationComplete {
        passed: report.passed.len(),
        missing: report.missing.len(),
        corrupted: report.corrupted.len(),
    });
    report
}

/// Load a manifest file and verify it. A manifest that is not a JSON entry
/// list aborts the pass with a manifest-decode fault.
pub fn verify_manifest_file(path: &Path, storage: &Storage, log: &SiteLog) -> Result<VerificationReport> {
    let manifest = Manifest::read_from(path).inspect_err(|e| {
        log.emit(TransferEvent::ManifestDecodeFault { message: e.to_string() });
    })?;
    Ok(verify_manifest(&manifest, storage, log))
}
