/// Finalization of closed sessions, off the intake thread.
///
/// ```text
/// [Intake] --shard(host)--> [Worker 0] flush file / manifest, verify
///                      \--> [Worker 1] ...
///                       \-> [Worker N-1]
/// ```
///
/// Each worker owns a bounded queue. Jobs are sharded by sender IP, not by
/// session key: a sensor sends each file and its manifest from a fresh source
/// port, so only the host ties them together. A manifest is therefore
/// verified after every earlier file from that host has been flushed. A full
/// queue blocks the intake thread.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, bounded};

use crate::error::{Result, TransferError};
use crate::logging::{SiteLog, TransferEvent, TransferLogger};
use crate::router::SiteRouter;
use crate::session::{FinishedSession, SessionKind};
use crate::storage::Storage;
use crate::verifier::{VerificationReport, verify_manifest_file};

/// What a finalize job produced.
#[derive(Debug)]
pub enum Finalized {
    File { path: PathBuf, site_copy: Option<PathBuf> },
    Manifest { path: PathBuf, report: VerificationReport },
    /// Flush failed; the session's data is lost.
    Failed,
}

/// Flushes finished sessions to storage.
pub struct Finalizer {
    storage: Storage,
    router: Arc<SiteRouter>,
    logger: Arc<dyn TransferLogger>,
}

impl Finalizer {
    pub fn new(storage: Storage, router: Arc<SiteRouter>, logger: Arc<dyn TransferLogger>) -> Self {
        Self {
            storage,
            router,
            logger,
        }
    }

    pub fn finalize(&self, session: FinishedSession) -> Finalized {
        let ip = session.peer.ip();
        let log = SiteLog::new(self.logger.clone(), "finalizer", self.router.label(ip));
        tracing::debug!(
            "Finalizing {} session from {} ({} bytes, open {:?})",
            session.kind.label(),
            session.peer,
            session.data.len(),
            session.started_at.elapsed()
        );

        match session.kind {
            SessionKind::File { name } => self.finalize_file(&log, ip, name, session.data),
            SessionKind::Manifest => self.finalize_manifest(&log, ip, session.data),
        }
    }

    fn finalize_file(&self, log: &SiteLog, ip: IpAddr, name: String, data: Vec<u8>) -> Finalized {
        let path = self.storage.received_path(&name);
        if let Err(e) = std::fs::write(&path, &data) {
            log.emit(TransferEvent::WriteFault { name, message: e.to_string() });
            return Finalized::Failed;
        }
        log.emit(TransferEvent::FileReceived { name: name.clone(), bytes: data.len() });

        let Some(folder) = self.router.destination(ip) else {
            return Finalized::File { path, site_copy: None };
        };
        let site_dir = self.storage.site_dir(folder);
        let dest = site_dir.join(&name);
        let copied = std::fs::create_dir_all(&site_dir).and_then(|_| std::fs::copy(&path, &dest));
        match copied {
            Ok(_) => {
                log.emit(TransferEvent::CopiedToSite {
                    name,
                    folder: site_dir.display().to_string(),
                });
                Finalized::File { path, site_copy: Some(dest) }
            }
            Err(e) => {
                log.emit(TransferEvent::SiteCopyFault { name, message: e.to_string() });
                Finalized::File { path, site_copy: None }
            }
        }
    }

    fn finalize_manifest(&self, log: &SiteLog, ip: IpAddr, data: Vec<u8>) -> Finalized {
        let text = match String::from_utf8(data) {
            Ok(text) => text,
            Err(e) => {
                log.emit(TransferEvent::ManifestDecodeFault { message: e.to_string() });
                return Finalized::Failed;
            }
        };

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let file_name = format!("{}_received_hash_log_{}.json", self.router.site_tag(ip), timestamp);
        let path = self.storage.hashlog_dir().join(&file_name);
        if let Err(e) = std::fs::write(&path, &text) {
            log.emit(TransferEvent::WriteFault { name: file_name, message: e.to_string() });
            return Finalized::Failed;
        }
        log.emit(TransferEvent::ManifestReceived {
            path: path.display().to_string(),
            bytes: text.len(),
        });

        // The stored copy is kept even when it does not decode.
        let log = SiteLog::new(self.logger.clone(), "verifier", log.site());
        match verify_manifest_file(&path, &self.storage, &log) {
            Ok(report) => Finalized::Manifest { path, report },
            Err(_) => Finalized::Failed,
        }
    }
}

/// Bounded, sharded pool of finalize workers.
pub struct FinalizePool {
    shards: Vec<Sender<FinishedSession>>,
    handles: Vec<JoinHandle<()>>,
}

impl FinalizePool {
    /// Start `workers` threads, each with a queue of `queue_depth` jobs.
    pub fn start(finalizer: Arc<Finalizer>, workers: usize, queue_depth: usize) -> Result<Self> {
        let workers = workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for idx in 0..workers {
            let (tx, rx) = bounded::<FinishedSession>(queue_depth.max(1));
            let finalizer = finalizer.clone();
            let handle = std::thread::Builder::new()
                .name(format!("finalize-{}", idx))
                .spawn(move || {
                    for session in rx {
                        finalizer.finalize(session);
                    }
                })
                .map_err(|e| TransferError::io("cannot spawn finalize worker", e))?;
            shards.push(tx);
            handles.push(handle);
        }

        Ok(Self { shards, handles })
    }

    pub fn workers(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, host: IpAddr) -> usize {
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queue a finished session. Blocks while the sender host's shard is full.
    pub fn submit(&self, session: FinishedSession) -> Result<()> {
        let shard = self.shard(session.peer.ip());
        self.shards[shard]
            .send(session)
            .map_err(|_| TransferError::WorkerPanicked(shard))
    }

    /// Close the queues and wait for workers to drain them.
    pub fn shutdown(self) -> Result<()> {
        drop(self.shards);
        let mut result = Ok(());
        for (idx, handle) in self.handles.into_iter().enumerate() {
            if handle.join().is_err() {
                result = Err(TransferError::WorkerPanicked(idx));
            }
        }
        result
    }
}
