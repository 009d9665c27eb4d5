/// Sensor-side batch sender.
///
/// ```text
/// snapshot dir --> hash all --> stage manifest
///      |
///      +--> per file:  FILENAME:<name>, chunks..., EOF
///      +--> ALL_FILES_SENT
///      +--> manifest:  HASH_LOG_START, chunks..., EOF
///      +--> retire sent files (delete or archive)
/// ```
///
/// Strictly sequential. Each datagram is followed by a fixed sleep as a
/// crude rate limit; nothing is acknowledged or retransmitted.

use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Result, TransferError};
use crate::hasher::hash_file;
use crate::logging::{SiteLog, TransferEvent, TransferLogger, or_tracing};
use crate::manifest::{Manifest, ManifestEntry};
use crate::protocol::{self, ALL_FILES_SENT, CHUNK_SIZE, EOF, HASH_LOG_START};
use crate::storage::move_file;

/// OS send buffer size (4 MB).
const UDP_SEND_BUFFER: usize = 4 * 1024 * 1024;

/// Name format of per-batch archive directories.
const ARCHIVE_BATCH_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Where datagrams go. `UdpSink` in production; tests capture the sequence.
pub trait DatagramSink {
    fn send(&self, datagram: &[u8]) -> io::Result<()>;
}

/// Sends every datagram to one target over a dedicated UDP socket.
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    /// Bind an ephemeral local port for sending to `target`.
    pub fn new(target: SocketAddr) -> io::Result<Self> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(false)?;
        let any: IpAddr = if target.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let any = SocketAddr::new(any, 0);
        socket.bind(&any.into())?;
        if let Err(e) = socket.set_send_buffer_size(UDP_SEND_BUFFER) {
            tracing::debug!("Cannot raise UDP send buffer: {}", e);
        }
        Ok(Self {
            socket: socket.into(),
            target,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSink for UdpSink {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        // Retry on ENOBUFS / WSAENOBUFS: the send buffer is full, back off briefly.
        let mut retries = 0;
        loop {
            match self.socket.send_to(datagram, self.target) {
                Ok(_) => return Ok(()),
                Err(ref e)
                    if retries < 50
                        && (e.kind() == io::ErrorKind::WouldBlock
                            || e.raw_os_error() == Some(10055) // WSAENOBUFS
                            || e.raw_os_error() == Some(105)) => // ENOBUFS (Linux)
                {
                    retries += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// What happens to source files after a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retention {
    /// Delete right away.
    Delete,
    /// Move into a per-batch directory under `dir`; `prune_archive` removes
    /// batches older than `keep`.
    Archive { dir: PathBuf, keep: Duration },
}

/// Configuration for one sender pipeline (one directory, one extension class).
pub struct SenderConfig {
    /// Pipeline name used in log lines, e.g. "json".
    pub name: String,
    pub source_dir: PathBuf,
    /// Suffixes a file name must end with, e.g. ".json".
    pub extensions: Vec<String>,
    /// Local staging path of the manifest.
    pub manifest_path: PathBuf,
    pub chunk_size: usize,
    /// Sleep after every payload chunk.
    pub chunk_delay: Duration,
    /// Sleep after `FILENAME:` before the first chunk.
    pub open_delay: Duration,
    /// Sleep after `HASH_LOG_START` before the first manifest chunk.
    pub manifest_open_delay: Duration,
    /// Sleep between `ALL_FILES_SENT` and the manifest run.
    pub manifest_delay: Duration,
    pub retention: Retention,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl SenderConfig {
    pub fn new(
        name: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        extensions: &[&str],
        manifest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source_dir: source_dir.into(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            manifest_path: manifest_path.into(),
            chunk_size: CHUNK_SIZE,
            chunk_delay: Duration::from_millis(1),
            open_delay: Duration::from_millis(1),
            manifest_open_delay: Duration::from_millis(10),
            manifest_delay: Duration::from_millis(100),
            retention: Retention::Delete,
            logger: None,
        }
    }

    /// Zero all delays. For loopback and tests.
    pub fn without_delays(mut self) -> Self {
        self.chunk_delay = Duration::ZERO;
        self.open_delay = Duration::ZERO;
        self.manifest_open_delay = Duration::ZERO;
        self.manifest_delay = Duration::ZERO;
        self
    }
}

/// Result of one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Names whose file run completed, in send order.
    pub sent: Vec<String>,
    /// Names whose hashing or file run failed; left in place.
    pub failed: Vec<String>,
    pub manifest: Manifest,
    pub manifest_sent: bool,
    /// Sent files deleted or archived.
    pub retired: usize,
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

/// Snapshot the regular files in `dir` whose names end with one of
/// `extensions`, sorted by name. Names that are not valid UTF-8 are listed
/// too; [`run_batch`] reports them as send faults.
pub fn list_pending(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| TransferError::io(format!("cannot list {}", dir.display()), e))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TransferError::io(format!("cannot list {}", dir.display()), e))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_file && extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Fill `buf` from `reader`, stopping early only at end of input.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Stream `reader` as payload chunks of `chunk_size`. Returns (bytes, chunks).
fn send_chunks(
    sink: &dyn DatagramSink,
    reader: &mut impl Read,
    chunk_size: usize,
    chunk_delay: Duration,
) -> io::Result<(u64, u64)> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut bytes = 0u64;
    let mut chunks = 0u64;
    loop {
        let n = read_chunk(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        sink.send(&buf[..n])?;
        bytes += n as u64;
        chunks += 1;
        pause(chunk_delay);
    }
    Ok((bytes, chunks))
}

/// One file run: `FILENAME:<basename>`, chunks, `EOF`.
pub fn send_file(sink: &dyn DatagramSink, path: &Path, config: &SenderConfig) -> Result<(u64, u64)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::io(
            format!("{} has no UTF-8 file name", path.display()),
            io::Error::from(io::ErrorKind::InvalidInput),
        ))?;
    let mut file = File::open(path)
        .map_err(|e| TransferError::io(format!("cannot open {}", path.display()), e))?;

    let send_err = |e: io::Error| TransferError::io(format!("sending {}", name), e);
    sink.send(&protocol::encode_filename(name)).map_err(send_err)?;
    pause(config.open_delay);
    let sent = send_chunks(sink, &mut file, config.chunk_size, config.chunk_delay).map_err(send_err)?;
    sink.send(EOF).map_err(send_err)?;
    Ok(sent)
}

/// Manifest run: `HASH_LOG_START`, staged manifest bytes, `EOF`.
pub fn send_manifest(sink: &dyn DatagramSink, path: &Path, config: &SenderConfig) -> Result<usize> {
    let data = std::fs::read(path)
        .map_err(|e| TransferError::io(format!("cannot read manifest {}", path.display()), e))?;

    let send_err = |e: io::Error| TransferError::io("sending manifest", e);
    sink.send(HASH_LOG_START).map_err(send_err)?;
    pause(config.manifest_open_delay);
    for chunk in protocol::chunks(&data, config.chunk_size) {
        sink.send(chunk).map_err(send_err)?;
        pause(config.chunk_delay);
    }
    sink.send(EOF).map_err(send_err)?;
    Ok(data.len())
}

/// Delete or archive one sent file. Returns true when archived.
fn retire(path: &Path, retention: &Retention, batch: &str) -> io::Result<bool> {
    match retention {
        Retention::Delete => std::fs::remove_file(path).map(|_| false),
        Retention::Archive { dir, .. } => {
            let name = path.file_name().ok_or(io::ErrorKind::InvalidInput)?;
            move_file(path, &dir.join(batch).join(name)).map(|_| true)
        }
    }
}

/// Run one batch over `sink`.
///
/// A file that fails to hash or send is skipped and kept; the rest of the
/// batch continues. Only staging the manifest or listing the directory can
/// fail the batch as a whole.
pub fn run_batch(config: &SenderConfig, sink: &dyn DatagramSink) -> Result<BatchReport> {
    let log = SiteLog::new(or_tracing(config.logger.clone()), "sender", config.name.clone());
    let mut report = BatchReport::default();

    let pending = list_pending(&config.source_dir, &config.extensions)?;
    if pending.is_empty() {
        tracing::info!("No {} files to send in {}", config.name, config.source_dir.display());
        return Ok(report);
    }

    // Hash first: the manifest describes the snapshot as it was before sending.
    let mut to_send = Vec::with_capacity(pending.len());
    for path in pending {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            let lossy = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            log.emit(TransferEvent::SendFault {
                name: lossy.clone(),
                message: "file name is not valid UTF-8".into(),
            });
            report.failed.push(lossy);
            continue;
        };
        match hash_file(&path) {
            Ok(hash) => {
                report.manifest.entries.push(ManifestEntry { filename, hash });
                to_send.push(path);
            }
            Err(e) => {
                log.emit(TransferEvent::SendFault { name: filename.clone(), message: e.to_string() });
                report.failed.push(filename);
            }
        }
    }
    report.manifest.write_to(&config.manifest_path)?;

    let mut sent_paths = Vec::with_capacity(to_send.len());
    for path in to_send {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match send_file(sink, &path, config) {
            Ok((bytes, chunks)) => {
                log.emit(TransferEvent::FileSent { name: name.clone(), bytes, chunks });
                report.sent.push(name);
                sent_paths.push(path);
            }
            Err(e) => {
                log.emit(TransferEvent::SendFault { name: name.clone(), message: e.to_string() });
                report.failed.push(name);
            }
        }
    }

    match sink.send(ALL_FILES_SENT) {
        Ok(()) => tracing::debug!("Sent ALL_FILES_SENT for {}", config.name),
        Err(e) => log.emit(TransferEvent::SendFault {
            name: "ALL_FILES_SENT".into(),
            message: e.to_string(),
        }),
    }
    pause(config.manifest_delay);

    match send_manifest(sink, &config.manifest_path, config) {
        Ok(bytes) => {
            log.emit(TransferEvent::ManifestSent { entries: report.manifest.len(), bytes });
            report.manifest_sent = true;
        }
        Err(e) => log.emit(TransferEvent::SendFault {
            name: config.manifest_path.display().to_string(),
            message: e.to_string(),
        }),
    }

    // No acknowledgment exists; a sent file is retired whether or not it arrived.
    let batch = Utc::now().format(ARCHIVE_BATCH_FORMAT).to_string();
    for path in sent_paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match retire(&path, &config.retention, &batch) {
            Ok(archived) => {
                log.emit(TransferEvent::SourceRetired { name, archived });
                report.retired += 1;
            }
            Err(e) => tracing::warn!("Cannot retire {}: {}", path.display(), e),
        }
    }

    log.emit(TransferEvent::BatchComplete {
        sent: report.sent.len(),
        failed: report.failed.len(),
    });
    Ok(report)
}

/// Remove archive batch directories older than `keep`. Returns how many
/// batches were removed. Entries that are not batch directories are left
/// alone.
pub fn prune_archive(dir: &Path, keep: Duration, now: DateTime<Utc>) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(TransferError::io(format!("cannot list {}", dir.display()), e)),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(created) = name
            .to_str()
            .and_then(|n| NaiveDateTime::parse_from_str(n, ARCHIVE_BATCH_FORMAT).ok())
            .map(|t| t.and_utc())
        else {
            continue;
        };
        let expired = (now - created).to_std().map(|age| age >= keep).unwrap_or(false);
        if expired && entry.path().is_dir() {
            std::fs::remove_dir_all(entry.path()).map_err(|e| {
                TransferError::io(format!("cannot prune {}", entry.path().display()), e)
            })?;
            removed += 1;
        }
    }
    Ok(removed)
}
