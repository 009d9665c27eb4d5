//! Per-sender session table.
//!
//! The table is Sans-IO: [`SessionTable::handle`] classifies one datagram,
//! moves the peer's session through its state machine and returns an
//! [`Outcome`]. Flushing finished sessions to disk is the finalizer's job, so
//! the table can be driven from a socket loop or directly from tests.
//!
//! ```text
//!            FILENAME:<name>             payload (append)
//!   Absent ------------------> Open/File ----+
//!     ^  \    HASH_LOG_START                 |
//!     |   +------------------> Open/Manifest-+
//!     |                          |  EOF
//!     +--------------------------+  (buffer moved into FinishedSession)
//! ```
//!
//! A refused open (collision under `Reject`, or an unsafe name) leaves the
//! peer refusing: its payload is dropped as orphaned and the next `EOF` ends
//! the refused transfer without closing any kept session. The next opening
//! token clears the state.
//!
//! The table has a single owner (the intake loop). Payload is appended in
//! arrival order; there are no sequence numbers.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::{NameError, ProtocolError};
use crate::logging::TransferEvent;
use crate::protocol::{self, Datagram};

/// How a sender address maps to a session-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKeying {
    /// Full `ip:port`. Pipelines on separate sockets never share a session.
    Address,
    /// IP only. Every socket on a host shares one session.
    Ip,
}

/// What to do with a session-opening message while a session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Discard the open session and start the new one, reporting the loss.
    Replace,
    /// Keep the open session and refuse the new one.
    Reject,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub keying: PeerKeying,
    pub on_collision: CollisionPolicy,
    /// Sessions buffering more than this are discarded.
    pub max_session_bytes: usize,
    /// Sessions idle longer than this are swept. `None` disables the sweep.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            keying: PeerKeying::Address,
            on_collision: CollisionPolicy::Replace,
            max_session_bytes: 1024 * 1024 * 1024,
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Session-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Address(SocketAddr),
    Ip(IpAddr),
}

impl PeerKey {
    pub fn ip(&self) -> IpAddr {
        match self {
            Self::Address(addr) => addr.ip(),
            Self::Ip(ip) => *ip,
        }
    }
}

impl PeerKeying {
    pub fn key(self, peer: SocketAddr) -> PeerKey {
        match self {
            Self::Address => PeerKey::Address(peer),
            Self::Ip => PeerKey::Ip(peer.ip()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    File { name: String },
    Manifest,
}

impl SessionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::Manifest => "manifest",
        }
    }

    fn name(&self) -> Option<String> {
        match self {
            Self::File { name } => Some(name.clone()),
            Self::Manifest => None,
        }
    }
}

/// One in-progress transfer.
#[derive(Debug)]
struct Session {
    kind: SessionKind,
    buffer: Vec<u8>,
    started_at: Instant,
    last_activity: Instant,
}

/// A session closed by `EOF`. Owns its buffer; nothing else references it.
#[derive(Debug)]
pub struct FinishedSession {
    pub peer: SocketAddr,
    pub kind: SessionKind,
    pub data: Vec<u8>,
    pub started_at: Instant,
}

/// A session removed by the idle sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSession {
    pub key: PeerKey,
    pub kind: SessionKind,
    pub idle: Duration,
    pub discarded_bytes: usize,
}

impl ExpiredSession {
    pub fn event(&self) -> TransferEvent {
        TransferEvent::StaleSession {
            idle_secs: self.idle.as_secs(),
            discarded_bytes: self.discarded_bytes,
        }
    }
}

/// Result of handling one datagram.
#[derive(Debug)]
pub enum Outcome {
    Opened { kind: SessionKind },
    Replaced { kind: SessionKind, discarded_bytes: usize },
    Rejected { open_kind: &'static str },
    /// Refused name. Under `Replace` an open session is still discarded,
    /// so the refused file's payload cannot land in the previous file.
    InvalidName { name: String, error: NameError, discarded_bytes: Option<usize> },
    Appended { bytes: usize, buffered: usize },
    Overflow { buffered: usize, limit: usize },
    Finished(FinishedSession),
    OrphanPayload { bytes: usize },
    OrphanEof,
    AllFilesSent,
    DecodeFault(ProtocolError),
}

impl Outcome {
    /// Events to log for this outcome. A finished session is reported by
    /// the finalizer once it has been flushed.
    pub fn events(&self) -> Vec<TransferEvent> {
        let opened = |kind: &SessionKind| TransferEvent::SessionOpened {
            kind: kind.label(),
            name: kind.name(),
        };
        match self {
            Self::Opened { kind } => vec![opened(kind)],
            Self::Replaced { kind, discarded_bytes } => vec![
                TransferEvent::SessionReplaced { discarded_bytes: *discarded_bytes },
                opened(kind),
            ],
            Self::Rejected { open_kind } => {
                vec![TransferEvent::SessionRejected { open_kind: *open_kind }]
            }
            Self::InvalidName { name, error, discarded_bytes } => {
                let mut events = Vec::with_capacity(2);
                if let Some(discarded_bytes) = discarded_bytes {
                    events.push(TransferEvent::SessionReplaced { discarded_bytes: *discarded_bytes });
                }
                events.push(TransferEvent::InvalidName {
                    name: name.clone(),
                    reason: error.to_string(),
                });
                events
            }
            Self::Appended { bytes, buffered } => vec![TransferEvent::ChunkAppended {
                bytes: *bytes,
                buffered: *buffered,
            }],
            Self::Overflow { buffered, limit } => vec![TransferEvent::SessionOverflow {
                buffered: *buffered,
                limit: *limit,
            }],
            Self::Finished(_) => Vec::new(),
            Self::OrphanPayload { bytes } => vec![TransferEvent::OrphanPayload { bytes: *bytes }],
            Self::OrphanEof => vec![TransferEvent::OrphanEof],
            Self::AllFilesSent => vec![TransferEvent::AllFilesSent],
            Self::DecodeFault(e) => vec![TransferEvent::DecodeFault { reason: e.to_string() }],
        }
    }
}

/// All open sessions, at most one per peer key.
pub struct SessionTable {
    policy: SessionPolicy,
    sessions: HashMap<PeerKey, Session>,
    /// Peers whose last open was refused, with the time of their last datagram.
    refusing: HashMap<PeerKey, Instant>,
}

impl SessionTable {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            sessions: HashMap::new(),
            refusing: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn key(&self, peer: SocketAddr) -> PeerKey {
        self.policy.keying.key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Kind of the session open for `peer`, if any.
    pub fn open_kind(&self, peer: SocketAddr) -> Option<&SessionKind> {
        self.sessions.get(&self.key(peer)).map(|s| &s.kind)
    }

    /// True while `peer`'s datagrams belong to a refused transfer.
    pub fn is_refusing(&self, peer: SocketAddr) -> bool {
        self.refusing.contains_key(&self.key(peer))
    }

    /// Bytes buffered for `peer`'s open session.
    pub fn buffered(&self, peer: SocketAddr) -> Option<usize> {
        self.sessions.get(&self.key(peer)).map(|s| s.buffer.len())
    }

    /// Handle one datagram from `peer`.
    pub fn handle(&mut self, peer: SocketAddr, data: &[u8], now: Instant) -> Outcome {
        let datagram = match protocol::classify(data) {
            Ok(d) => d,
            Err(e) => return Outcome::DecodeFault(e),
        };
        let key = self.key(peer);

        match datagram {
            Datagram::OpenFile { name } => {
                self.refusing.remove(&key);
                match protocol::validate_name(name) {
                    Ok(name) => self.open(key, SessionKind::File { name: name.to_string() }, now),
                    Err(error) => {
                        let discarded_bytes = match self.policy.on_collision {
                            CollisionPolicy::Replace => self.sessions.remove(&key).map(|s| s.buffer.len()),
                            CollisionPolicy::Reject => None,
                        };
                        self.refusing.insert(key, now);
                        Outcome::InvalidName {
                            name: name.to_string(),
                            error,
                            discarded_bytes,
                        }
                    }
                }
            }
            Datagram::OpenManifest => {
                self.refusing.remove(&key);
                self.open(key, SessionKind::Manifest, now)
            }
            Datagram::AllFilesSent => Outcome::AllFilesSent,
            Datagram::Eof if self.refusing.remove(&key).is_some() => Outcome::OrphanEof,
            Datagram::Payload(bytes) if self.refusing.contains_key(&key) => {
                self.refusing.insert(key, now);
                Outcome::OrphanPayload { bytes: bytes.len() }
            }
            Datagram::Eof => match self.sessions.remove(&key) {
                Some(session) => Outcome::Finished(FinishedSession {
                    peer,
                    kind: session.kind,
                    data: session.buffer,
                    started_at: session.started_at,
                }),
                None => Outcome::OrphanEof,
            },
            Datagram::Payload(bytes) => self.append(key, bytes, now),
        }
    }

    fn open(&mut self, key: PeerKey, kind: SessionKind, now: Instant) -> Outcome {
        let session = Session {
            kind: kind.clone(),
            buffer: Vec::new(),
            started_at: now,
            last_activity: now,
        };

        if let Some(open) = self.sessions.get(&key) {
            if self.policy.on_collision == CollisionPolicy::Reject {
                self.refusing.insert(key, now);
                return Outcome::Rejected { open_kind: open.kind.label() };
            }
        }

        match self.sessions.insert(key, session) {
            Some(previous) => Outcome::Replaced {
                kind,
                discarded_bytes: previous.buffer.len(),
            },
            None => Outcome::Opened { kind },
        }
    }

    fn append(&mut self, key: PeerKey, bytes: &[u8], now: Instant) -> Outcome {
        let limit = self.policy.max_session_bytes;
        let Some(session) = self.sessions.get_mut(&key) else {
            return Outcome::OrphanPayload { bytes: bytes.len() };
        };

        let buffered = session.buffer.len() + bytes.len();
        if buffered > limit {
            self.sessions.remove(&key);
            return Outcome::Overflow { buffered, limit };
        }

        session.buffer.extend_from_slice(bytes);
        session.last_activity = now;
        Outcome::Appended {
            bytes: bytes.len(),
            buffered,
        }
    }

    /// Remove sessions idle longer than the policy's timeout.
    pub fn sweep_idle(&mut self, now: Instant) -> Vec<ExpiredSession> {
        let Some(timeout) = self.policy.idle_timeout else {
            return Vec::new();
        };
        self.refusing
            .retain(|_, last| now.saturating_duration_since(*last) < timeout);

        let stale: Vec<PeerKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= timeout)
            .map(|(key, _)| *key)
            .collect();

        stale
            .into_iter()
            .filter_map(|key| {
                let session = self.sessions.remove(&key)?;
                Some(ExpiredSession {
                    key,
                    idle: now.saturating_duration_since(session.last_activity),
                    discarded_bytes: session.buffer.len(),
                    kind: session.kind,
                })
            })
            .collect()
    }
}
