/// SensorLink transfer: unacknowledged UDP bulk file transfer from sensor
/// sites to a central collector.
///
/// - Sender: snapshot a directory, stage a SHA-256 manifest, stream each
///   file as `FILENAME:` / chunks / `EOF`, then the manifest
/// - Collector: one single-threaded intake loop feeding a sans-IO session
///   table, with finalization on a sharded worker pool
/// - Verifier: recompute digests from the manifest, quarantine mismatches
/// - Router: copy finalized files into per-site folders keyed by source IP

pub mod error;
pub mod finalize;
pub mod hasher;
pub mod logging;
pub mod manifest;
pub mod protocol;
pub mod receiver;
pub mod router;
pub mod sender;
pub mod session;
pub mod storage;
pub mod verifier;

// Re-export key types for convenience.
pub use error::{NameError, ProtocolError, Result, TransferError};
pub use logging::{
    MemoryLogger, NullLogger, SiteLog, TracingLogger, TransferEvent, TransferLog, TransferLogger,
};
pub use manifest::{Manifest, ManifestEntry};
pub use protocol::{
    ALL_FILES_SENT, CHUNK_SIZE, Datagram, EOF, FILENAME_PREFIX, HASH_LOG_START, MAX_DATAGRAM, classify,
    encode_filename, validate_name,
};
pub use receiver::{Collector, ReceiverConfig, ReceiverProgress, run_receiver};
pub use router::{Site, SiteRouter};
pub use sender::{
    BatchReport, DatagramSink, Retention, SenderConfig, UdpSink, prune_archive, run_batch,
};
pub use session::{CollisionPolicy, Outcome, PeerKey, PeerKeying, SessionPolicy, SessionTable};
pub use storage::Storage;
pub use verifier::{VerificationReport, verify_manifest, verify_manifest_file};
