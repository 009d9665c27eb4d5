/// Collector receive pipeline.
///
/// ```text
/// [Intake thread] ---------------------> [Finalize pool]
/// recv_from() on one UDP socket           write received/<name>
/// classify + session table (owned)        copy to site folder
/// idle sweep every sweep_interval         write hashlog/, verify
/// ```
///
/// The intake thread is the only writer of the session table, so datagrams
/// from one peer are appended strictly in socket delivery order.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{Result, TransferError};
use crate::finalize::{FinalizePool, Finalizer};
use crate::logging::{SiteLog, TransferEvent, TransferLog, TransferLogger, or_tracing};
use crate::protocol::{MAX_DATAGRAM, UDP_RECV_BUFFER};
use crate::router::SiteRouter;
use crate::session::{Outcome, SessionPolicy, SessionTable};
use crate::storage::Storage;

/// Receiver state constants.
pub const STATE_IDLE: u8 = 0;
pub const STATE_RECEIVING: u8 = 2;
pub const STATE_STOPPED: u8 = 3;
pub const STATE_ERROR: u8 = 4;

/// Receiver counters, readable from other threads while the loop runs.
pub struct ReceiverProgress {
    pub datagrams: AtomicU64,
    pub bytes: AtomicU64,
    pub open_sessions: AtomicU64,
    pub files_received: AtomicU64,
    pub manifests_received: AtomicU64,
    pub files_quarantined: AtomicU64,
    pub faults: AtomicU64,
    pub state: AtomicU8,
    pub cancelled: AtomicU8,
}

impl ReceiverProgress {
    pub fn new() -> Self {
        Self {
            datagrams: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            open_sessions: AtomicU64::new(0),
            files_received: AtomicU64::new(0),
            manifests_received: AtomicU64::new(0),
            files_quarantined: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            state: AtomicU8::new(STATE_IDLE),
            cancelled: AtomicU8::new(0),
        }
    }

    /// Ask the intake loop to stop after its current receive.
    pub fn cancel(&self) {
        self.cancelled.store(1, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed) != 0
    }
}

impl Default for ReceiverProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards to another logger and keeps the progress counters in step.
struct ProgressLogger {
    inner: Arc<dyn TransferLogger>,
    progress: Arc<ReceiverProgress>,
}

impl TransferLogger for ProgressLogger {
    fn log(&self, entry: TransferLog) {
        let counter = match &entry.event {
            TransferEvent::FileReceived { .. } => Some(&self.progress.files_received),
            TransferEvent::ManifestReceived { .. } => Some(&self.progress.manifests_received),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if let TransferEvent::IntegrityFault { .. } = entry.event {
            self.progress.files_quarantined.fetch_add(1, Ordering::Relaxed);
        }
        if entry.event.is_fault() {
            self.progress.faults.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.log(entry);
    }
}

/// Configuration for the receiver.
pub struct ReceiverConfig {
    pub bind_addr: SocketAddr,
    /// Root of the received/hashlog/corrupted layout.
    pub storage_root: PathBuf,
    pub router: Arc<SiteRouter>,
    pub policy: SessionPolicy,
    pub finalize_workers: usize,
    /// Queue depth per finalize worker.
    pub finalize_queue: usize,
    pub sweep_interval: Duration,
    pub logger: Option<Arc<dyn TransferLogger>>,
    /// Optional pre-bound UDP socket. If provided, the receiver uses it
    /// instead of binding `bind_addr`, so the caller knows the port up front.
    pub pre_bound_socket: Option<UdpSocket>,
}

impl ReceiverConfig {
    pub fn new(bind_addr: SocketAddr, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            storage_root: storage_root.into(),
            router: Arc::new(SiteRouter::empty()),
            policy: SessionPolicy::default(),
            finalize_workers: 4,
            finalize_queue: 64,
            sweep_interval: Duration::from_secs(10),
            logger: None,
            pre_bound_socket: None,
        }
    }
}

/// Session table plus finalize pool: everything the intake loop does with a
/// datagram, without the socket.
pub struct Collector {
    table: SessionTable,
    pool: FinalizePool,
    router: Arc<SiteRouter>,
    logger: Arc<dyn TransferLogger>,
    progress: Arc<ReceiverProgress>,
}

impl Collector {
    pub fn new(config: &ReceiverConfig, progress: Arc<ReceiverProgress>) -> Result<Self> {
        let storage = Storage::new(&config.storage_root);
        storage.prepare()?;

        let logger: Arc<dyn TransferLogger> = Arc::new(ProgressLogger {
            inner: or_tracing(config.logger.clone()),
            progress: progress.clone(),
        });
        let finalizer = Finalizer::new(storage, config.router.clone(), logger.clone());
        let pool = FinalizePool::start(
            Arc::new(finalizer),
            config.finalize_workers,
            config.finalize_queue,
        )?;

        Ok(Self {
            table: SessionTable::new(config.policy.clone()),
            pool,
            router: config.router.clone(),
            logger,
            progress,
        })
    }

    fn site_log(&self, peer: SocketAddr) -> SiteLog {
        SiteLog::new(self.logger.clone(), "session", self.router.label(peer.ip()))
    }

    /// Process one datagram from `peer`.
    pub fn handle_datagram(&mut self, peer: SocketAddr, data: &[u8], now: Instant) {
        let outcome = self.table.handle(peer, data, now);

        let log = self.site_log(peer);
        for event in outcome.events() {
            log.emit(event);
        }

        if let Outcome::Finished(session) = outcome {
            if let Err(e) = self.pool.submit(session) {
                log.emit(TransferEvent::WriteFault {
                    name: "<finalize queue>".into(),
                    message: e.to_string(),
                });
            }
        }
        self.progress
            .open_sessions
            .store(self.table.len() as u64, Ordering::Relaxed);
    }

    /// Discard sessions idle past the policy timeout.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired = self.table.sweep_idle(now);
        for session in &expired {
            let log = SiteLog::new(self.logger.clone(), "sweeper", self.router.label(session.key.ip()));
            log.emit(session.event());
        }
        self.progress
            .open_sessions
            .store(self.table.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn open_sessions(&self) -> usize {
        self.table.len()
    }

    /// Stop accepting work and wait for queued finalize jobs. Sessions still
    /// open are dropped.
    pub fn shutdown(self) -> Result<()> {
        if !self.table.is_empty() {
            warn!("Dropping {} unfinished sessions at shutdown", self.table.len());
        }
        self.pool.shutdown()
    }
}

/// Run the receiver. Blocks until `progress.cancel()` is called, then drains
/// the finalize pool. Returns the bound address.
///
/// Failing to bind is the only fatal error; every per-datagram fault is
/// logged and the loop continues.
pub fn run_receiver(mut config: ReceiverConfig, progress: Arc<ReceiverProgress>) -> Result<SocketAddr> {
    let socket = match config.pre_bound_socket.take() {
        Some(s) => {
            s.set_nonblocking(false)
                .map_err(|e| TransferError::io("socket config", e))?;
            s.set_read_timeout(Some(Duration::from_millis(100)))
                .map_err(|e| TransferError::io("socket timeout", e))?;
            s
        }
        None => create_recv_socket(config.bind_addr).map_err(|e| TransferError::Bind {
            addr: config.bind_addr.to_string(),
            source: e,
        })?,
    };
    let bound_addr = socket
        .local_addr()
        .map_err(|e| TransferError::io("cannot get bound addr", e))?;

    let mut collector = Collector::new(&config, progress.clone())?;
    progress.state.store(STATE_RECEIVING, Ordering::Relaxed);
    SiteLog::new(collector.logger.clone(), "receiver", bound_addr.to_string()).emit(
        TransferEvent::IntakeStarted {
            bind_addr: bound_addr.to_string(),
        },
    );

    let mut recv_buf = vec![0u8; MAX_DATAGRAM];
    let mut last_sweep = Instant::now();

    while !progress.is_cancelled() {
        match socket.recv_from(&mut recv_buf) {
            Ok((len, src)) => {
                progress.datagrams.fetch_add(1, Ordering::Relaxed);
                progress.bytes.fetch_add(len as u64, Ordering::Relaxed);
                collector.handle_datagram(src, &recv_buf[..len], Instant::now());
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                // Timeout on recv: fall through to the sweep and cancellation check.
                // Note: Windows returns TimedOut, Unix returns WouldBlock
            }
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                // ICMP port unreachable from an earlier send; harmless on UDP.
            }
            Err(e) => {
                warn!("UDP recv error: {}", e);
            }
        }

        if last_sweep.elapsed() >= config.sweep_interval {
            last_sweep = Instant::now();
            collector.sweep(last_sweep);
        }
    }

    info!("Receiver on {} stopping", bound_addr);
    let result = collector.shutdown();
    progress.state.store(
        if result.is_ok() { STATE_STOPPED } else { STATE_ERROR },
        Ordering::Relaxed,
    );
    result.map(|_| bound_addr)
}

/// Create a UDP socket bound to the given address with a large recv buffer.
fn create_recv_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    if let Err(e) = socket.set_recv_buffer_size(UDP_RECV_BUFFER) {
        warn!("Cannot raise UDP recv buffer: {}", e);
    }
    // Recv timeout so the loop can check cancellation and sweep periodically
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}
