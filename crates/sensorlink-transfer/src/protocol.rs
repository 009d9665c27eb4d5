/// Datagram format for the sensor-to-collector channel.
///
/// There is no header. Every datagram is either one of four control tokens
/// or a raw payload chunk:
///
/// ```text
/// FILENAME:<name>   open a file session, <name> is UTF-8
/// HASH_LOG_START    open a manifest session
/// ALL_FILES_SENT    informational, no session effect
/// EOF               finalize the open session
/// <anything else>   payload, appended to the open session
/// ```
///
/// Tokens are matched against the raw bytes before anything is decoded, so
/// binary payload never goes through UTF-8 decoding. A payload chunk that is
/// byte-for-byte equal to a token is read as that token.

use crate::error::{NameError, ProtocolError};

/// Prefix of the file-session opening message.
pub const FILENAME_PREFIX: &[u8] = b"FILENAME:";

/// Opens a manifest session.
pub const HASH_LOG_START: &[u8] = b"HASH_LOG_START";

/// Sent once after the last file of a batch.
pub const ALL_FILES_SENT: &[u8] = b"ALL_FILES_SENT";

/// Closes and finalizes the open session.
pub const EOF: &[u8] = b"EOF";

/// Sender chunk size in bytes.
pub const CHUNK_SIZE: usize = 1024;

/// Largest UDP payload over IPv4 (65535 - 20 IP - 8 UDP).
pub const MAX_DATAGRAM: usize = 65_507;

/// OS receive buffer size (8 MB).
pub const UDP_RECV_BUFFER: usize = 8 * 1024 * 1024;

/// One classified datagram, borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram<'a> {
    OpenFile { name: &'a str },
    OpenManifest,
    AllFilesSent,
    Eof,
    Payload(&'a [u8]),
}

/// Classify a raw datagram. Fails only when a `FILENAME:` message carries a
/// name that is not valid UTF-8.
pub fn classify(data: &[u8]) -> Result<Datagram<'_>, ProtocolError> {
    if let Some(rest) = data.strip_prefix(FILENAME_PREFIX) {
        let name = std::str::from_utf8(rest).map_err(|_| ProtocolError::InvalidUtf8)?;
        return Ok(Datagram::OpenFile { name });
    }
    let datagram = if data == HASH_LOG_START {
        Datagram::OpenManifest
    } else if data == ALL_FILES_SENT {
        Datagram::AllFilesSent
    } else if data == EOF {
        Datagram::Eof
    } else {
        Datagram::Payload(data)
    };
    Ok(datagram)
}

/// Build the `FILENAME:<name>` control message.
pub fn encode_filename(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FILENAME_PREFIX.len() + name.len());
    buf.extend_from_slice(FILENAME_PREFIX);
    buf.extend_from_slice(name.as_bytes());
    buf
}

/// Split `data` into payload chunks of at most `size` bytes; only the last
/// may be short.
pub fn chunks(data: &[u8], size: usize) -> std::slice::Chunks<'_, u8> {
    data.chunks(size.max(1))
}

/// Check that a declared name is a single plain path component, so that
/// joining it onto a storage directory can never leave that directory.
pub fn validate_name(name: &str) -> Result<&str, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.contains('\0') {
        return Err(NameError::Nul);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(NameError::Separator(name.to_string()));
    }
    if name == "." || name == ".." {
        return Err(NameError::DotSegment(name.to_string()));
    }
    // Drive prefixes such as "C:" are absolute on Windows.
    if name.len() >= 2 && name.as_bytes()[1] == b':' && name.as_bytes()[0].is_ascii_alphabetic() {
        return Err(NameError::Separator(name.to_string()));
    }
    Ok(name)
}
