//! On-disk copy of the local replica.
//!
//! A session saves its full document state (a yrs v1 update) when it
//! leaves and loads it before the next join, so a room can be reopened
//! without a relay. The file is one bincode-encoded [`ReplicaFile`] whose
//! state is LZ4 compressed and checksummed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("replica encoding error: {0}")]
    Encode(String),
    #[error("replica decoding error: {0}")]
    Decode(String),
    #[error("replica decompression error: {0}")]
    Decompress(String),
    #[error("replica format {0} is not supported")]
    UnsupportedFormat(u32),
    #[error("replica belongs to room {found}, expected {expected}")]
    RoomMismatch { expected: String, found: String },
    #[error("replica checksum mismatch")]
    Checksum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplicaFile {
    format: u32,
    room_id: String,
    saved_at_ms: u64,
    checksum: u32,
    compressed: Vec<u8>,
}

/// What a successful save wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStats {
    pub raw_bytes: usize,
    pub file_bytes: usize,
}

pub struct ReplicaCache {
    path: PathBuf,
    room_id: String,
}

impl ReplicaCache {
    pub fn new(path: impl Into<PathBuf>, room_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            room_id: room_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read the saved state. `Ok(None)` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<Vec<u8>>, ReplicaError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (file, _): (ReplicaFile, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| ReplicaError::Decode(e.to_string()))?;

        if file.format != FORMAT_VERSION {
            return Err(ReplicaError::UnsupportedFormat(file.format));
        }
        if file.room_id != self.room_id {
            return Err(ReplicaError::RoomMismatch {
                expected: self.room_id.clone(),
                found: file.room_id,
            });
        }
        if checksum(&file.compressed) != file.checksum {
            return Err(ReplicaError::Checksum);
        }
        let state = lz4_flex::decompress_size_prepended(&file.compressed)
            .map_err(|e| ReplicaError::Decompress(e.to_string()))?;
        log::debug!(
            "Loaded replica for room {} ({} bytes, saved at {} ms)",
            self.room_id,
            state.len(),
            file.saved_at_ms
        );
        Ok(Some(state))
    }

    /// Write `state` atomically: a temp file next to the target, then rename.
    pub fn save(&self, state: &[u8]) -> Result<ReplicaStats, ReplicaError> {
        let compressed = lz4_flex::compress_prepend_size(state);
        let file = ReplicaFile {
            format: FORMAT_VERSION,
            room_id: self.room_id.clone(),
            saved_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis() as u64),
            checksum: checksum(&compressed),
            compressed,
        };
        let bytes = bincode::serde::encode_to_vec(&file, bincode::config::standard())
            .map_err(|e| ReplicaError::Encode(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;

        log::debug!("Saved replica for room {} to {}", self.room_id, self.path.display());
        Ok(ReplicaStats {
            raw_bytes: state.len(),
            file_bytes: bytes.len(),
        })
    }

    /// Remove the saved state. Returns whether a file was there.
    pub fn clear(&self) -> Result<bool, ReplicaError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// FNV-1a over the compressed bytes.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
