/// Transfer logging trait for structured event reporting.
///
/// Sender, session manager, finalizer and verifier all report through a
/// `TransferLogger`, so faults can be counted and asserted in tests as well
/// as written to `tracing`.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    /// Site label of the peer, or its address when unmapped.
    pub site: String,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Collector: intake loop bound and running
    IntakeStarted { bind_addr: String },
    /// Collector: a file or manifest session opened
    SessionOpened { kind: &'static str, name: Option<String> },
    /// Collector: payload appended to an open session
    ChunkAppended { bytes: usize, buffered: usize },
    /// Collector: sender announced the end of its file list
    AllFilesSent,
    /// Collector: file session flushed to the received directory
    FileReceived { name: String, bytes: usize },
    /// Collector: received file copied into the site folder
    CopiedToSite { name: String, folder: String },
    /// Collector: manifest session flushed to the hashlog directory
    ManifestReceived { path: String, bytes: usize },
    /// Verifier: file digest matches the manifest
    IntegrityPassed { name: String },
    /// Verifier: pass finished
    VerificationComplete { passed: usize, missing: usize, corrupted: usize },
    /// Sender: one file run completed
    FileSent { name: String, bytes: u64, chunks: u64 },
    /// Sender: manifest run completed
    ManifestSent { entries: usize, bytes: usize },
    /// Sender: source file deleted or archived after sending
    SourceRetired { name: String, archived: bool },
    /// Sender: whole batch finished
    BatchComplete { sent: usize, failed: usize },

    // Faults. All are recovered locally.
    /// Control-looking datagram that failed to decode
    DecodeFault { reason: String },
    /// Payload with no open session
    OrphanPayload { bytes: usize },
    /// EOF with no open session
    OrphanEof,
    /// Declared file name refused
    InvalidName { name: String, reason: String },
    /// Open session displaced by a new opening message
    SessionReplaced { discarded_bytes: usize },
    /// Opening message refused because a session is already open
    SessionRejected { open_kind: &'static str },
    /// Session grew past the configured limit and was discarded
    SessionOverflow { buffered: usize, limit: usize },
    /// Session discarded by the idle sweep
    StaleSession { idle_secs: u64, discarded_bytes: usize },
    /// Disk failure while flushing a finished session
    WriteFault { name: String, message: String },
    /// Copy into the site folder failed; file stays in received
    SiteCopyFault { name: String, message: String },
    /// Finished manifest was not UTF-8 JSON
    ManifestDecodeFault { message: String },
    /// Manifest names a file that is not in the received directory
    MissingFile { name: String },
    /// Digest mismatch; file quarantined
    IntegrityFault { name: String, expected: String, actual: String },
    /// Quarantine move failed; file left in place
    QuarantineFault { name: String, message: String },
    /// Sender: a file run failed; the batch continues
    SendFault { name: String, message: String },
}

impl TransferEvent {
    /// Whether this event reports a fault rather than progress.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Self::DecodeFault { .. }
                | Self::OrphanPayload { .. }
                | Self::OrphanEof
                | Self::InvalidName { .. }
                | Self::SessionReplaced { .. }
                | Self::SessionRejected { .. }
                | Self::SessionOverflow { .. }
                | Self::StaleSession { .. }
                | Self::WriteFault { .. }
                | Self::SiteCopyFault { .. }
                | Self::ManifestDecodeFault { .. }
                | Self::MissingFile { .. }
                | Self::IntegrityFault { .. }
                | Self::QuarantineFault { .. }
                | Self::SendFault { .. }
        )
    }
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntakeStarted { bind_addr } => write!(f, "intake_started bind={}", bind_addr),
            Self::SessionOpened { kind, name } => match name {
                Some(name) => write!(f, "session_opened kind={} name={}", kind, name),
                None => write!(f, "session_opened kind={}", kind),
            },
            Self::ChunkAppended { bytes, buffered } => {
                write!(f, "chunk_appended bytes={} buffered={}", bytes, buffered)
            }
            Self::AllFilesSent => write!(f, "all_files_sent"),
            Self::FileReceived { name, bytes } => {
                write!(f, "file_received name={} bytes={}", name, bytes)
            }
            Self::CopiedToSite { name, folder } => {
                write!(f, "copied_to_site name={} folder={}", name, folder)
            }
            Self::ManifestReceived { path, bytes } => {
                write!(f, "manifest_received path={} bytes={}", path, bytes)
            }
            Self::IntegrityPassed { name } => write!(f, "integrity_passed name={}", name),
            Self::VerificationComplete { passed, missing, corrupted } => write!(
                f,
                "verification_complete passed={} missing={} corrupted={}",
                passed, missing, corrupted
            ),
            Self::FileSent { name, bytes, chunks } => {
                write!(f, "file_sent name={} bytes={} chunks={}", name, bytes, chunks)
            }
            Self::ManifestSent { entries, bytes } => {
                write!(f, "manifest_sent entries={} bytes={}", entries, bytes)
            }
            Self::SourceRetired { name, archived } => {
                write!(f, "source_retired name={} archived={}", name, archived)
            }
            Self::BatchComplete { sent, failed } => {
                write!(f, "batch_complete sent={} failed={}", sent, failed)
            }
            Self::DecodeFault { reason } => write!(f, "decode_fault: {}", reason),
            Self::OrphanPayload { bytes } => {
                write!(f, "orphan_payload bytes={} (no active session, dropped)", bytes)
            }
            Self::OrphanEof => write!(f, "orphan_eof (no active session)"),
            Self::InvalidName { name, reason } => {
                write!(f, "invalid_name name={:?}: {}", name, reason)
            }
            Self::SessionReplaced { discarded_bytes } => {
                write!(f, "session_replaced discarded_bytes={}", discarded_bytes)
            }
            Self::SessionRejected { open_kind } => {
                write!(f, "session_rejected open_kind={}", open_kind)
            }
            Self::SessionOverflow { buffered, limit } => {
                write!(f, "session_overflow buffered={} limit={}", buffered, limit)
            }
            Self::StaleSession { idle_secs, discarded_bytes } => write!(
                f,
                "stale_session idle_secs={} discarded_bytes={}",
                idle_secs, discarded_bytes
            ),
            Self::WriteFault { name, message } => {
                write!(f, "write_fault name={}: {}", name, message)
            }
            Self::SiteCopyFault { name, message } => {
                write!(f, "site_copy_fault name={}: {}", name, message)
            }
            Self::ManifestDecodeFault { message } => {
                write!(f, "manifest_decode_fault: {}", message)
            }
            Self::MissingFile { name } => write!(f, "missing_file name={}", name),
            Self::IntegrityFault { name, expected, actual } => write!(
                f,
                "integrity_fault name={} expected={} actual={}",
                name, expected, actual
            ),
            Self::QuarantineFault { name, message } => {
                write!(f, "quarantine_fault name={}: {}", name, message)
            }
            Self::SendFault { name, message } => {
                write!(f, "send_fault name={}: {}", name, message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations write to tracing, record
/// entries for inspection, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // warn for faults, info for lifecycle, debug for per-chunk spam
        match &entry.event {
            event if event.is_fault() => {
                tracing::warn!(component = entry.component, site = %entry.site, "{}", event);
            }
            TransferEvent::ChunkAppended { .. } | TransferEvent::IntegrityPassed { .. } => {
                tracing::debug!(component = entry.component, site = %entry.site, "{}", entry.event);
            }
            event => {
                tracing::info!(component = entry.component, site = %entry.site, "{}", event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// A logger bound to one component and one site, so call sites only supply
/// the event.
#[derive(Clone)]
pub struct SiteLog {
    logger: Arc<dyn TransferLogger>,
    component: &'static str,
    site: String,
}

impl SiteLog {
    pub fn new(logger: Arc<dyn TransferLogger>, component: &'static str, site: impl Into<String>) -> Self {
        Self {
            logger,
            component,
            site: site.into(),
        }
    }

    pub fn emit(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: self.component,
            site: self.site.clone(),
            event,
        });
    }

    pub fn site(&self) -> &str {
        &self.site
    }
}

/// Resolve an optional configured logger, defaulting to tracing output.
pub fn or_tracing(logger: Option<Arc<dyn TransferLogger>>) -> Arc<dyn TransferLogger> {
    logger.unwrap_or_else(|| Arc::new(TracingLogger))
}

/// Logger that keeps every entry in memory.
#[derive(Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<TransferLog>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events logged so far.
    pub fn events(&self) -> Vec<TransferEvent> {
        self.entries
            .lock()
            .map(|entries| entries.iter().map(|e| e.event.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&TransferEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(*e)).count()
    }
}

impl TransferLogger for MemoryLogger {
    fn log(&self, entry: TransferLog) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}
