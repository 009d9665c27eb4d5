//! Error types for the transfer library.
//!
//! Faults that the collector recovers from locally (orphan payload, integrity
//! mismatch, ...) are not errors: they are reported as
//! [`TransferEvent`](crate::logging::TransferEvent)s. The types here cover the
//! failures a caller has to act on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Datagram classification failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A `FILENAME:` datagram whose name is not valid UTF-8
    #[error("control message is not valid UTF-8")]
    InvalidUtf8,
}

/// Reasons a declared file name is refused before a session opens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("file name is empty")]
    Empty,

    #[error("file name {0:?} is a relative directory reference")]
    DotSegment(String),

    #[error("file name {0:?} contains a path separator")]
    Separator(String),

    #[error("file name contains a NUL byte")]
    Nul,
}

/// Errors returned by the library's fallible operations.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Filesystem or socket failure, with what was being attempted
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The receive socket could not be bound; fatal for the collector
    #[error("cannot bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A manifest could not be encoded or decoded
    #[error("manifest is not a valid JSON entry list: {0}")]
    Manifest(#[from] serde_json::Error),

    /// The site table file is unreadable or malformed
    #[error("site map {path}: {message}")]
    SiteMap { path: PathBuf, message: String },

    /// A finalize worker panicked while the pool was shutting down
    #[error("finalize worker {0} panicked")]
    WorkerPanicked(usize),
}

impl TransferError {
    /// Wrap an I/O error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
