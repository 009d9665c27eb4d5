/// SHA-256 digests of whole files, hex-encoded. Shared by the sender (manifest
/// generation) and the collector (verification).

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Result, TransferError};

/// Read buffer for hashing (64 KB).
const HASH_READ_BUF: usize = 64 * 1024;

/// Compute the lowercase hex SHA-256 of the file at `path`.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| TransferError::io(format!("cannot open {} for hashing", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_READ_BUF];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| TransferError::io(format!("read error hashing {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
