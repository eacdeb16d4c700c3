//! # Snapshot Format
//!
//! Binary encoding of a [`GraphSnapshot`].
//!
//! Format: Header (5 bytes) + postcard-serialized snapshot.
//! - 4 bytes: Magic ("SFMG")
//! - 1 byte: Version
//!
//! ## Validation
//!
//! Size bounds and the header are checked before the payload is
//! deserialized, so corrupted or hostile input fails without large
//! allocations.

use crate::graph::GraphSnapshot;
use crate::primitives::{FORMAT_VERSION, HEADER_LEN, MAGIC_BYTES, MAX_SNAPSHOT_SIZE};
use crate::SfmError;

// =============================================================================
// HEADER
// =============================================================================

/// The header that precedes every snapshot payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl SnapshotHeader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *MAGIC_BYTES,
            version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), SfmError> {
        if &self.magic != MAGIC_BYTES {
            return Err(SfmError::Serialization("invalid magic bytes".to_string()));
        }
        if self.version != FORMAT_VERSION {
            return Err(SfmError::Serialization(format!(
                "unsupported snapshot version {} (expected {FORMAT_VERSION})",
                self.version
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SfmError> {
        let Some(header) = bytes.get(..HEADER_LEN) else {
            return Err(SfmError::Serialization("header too short".to_string()));
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[..4]);
        Ok(Self {
            magic,
            version: header[4],
        })
    }
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Encode a snapshot (header + payload).
///
/// Snapshots produced by `Graph::snapshot` are canonical, so equal graphs
/// encode to equal bytes.
pub fn snapshot_to_bytes(snapshot: &GraphSnapshot) -> Result<Vec<u8>, SfmError> {
    let payload =
        postcard::to_stdvec(snapshot).map_err(|e| SfmError::Serialization(e.to_string()))?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&SnapshotHeader::new().to_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a snapshot, validating size and header first.
pub fn snapshot_from_bytes(bytes: &[u8]) -> Result<GraphSnapshot, SfmError> {
    if bytes.len() > MAX_SNAPSHOT_SIZE {
        return Err(SfmError::Serialization(format!(
            "snapshot of {} bytes exceeds the {MAX_SNAPSHOT_SIZE} byte limit",
            bytes.len()
        )));
    }
    SnapshotHeader::from_bytes(bytes)?.validate()?;
    postcard::from_bytes(&bytes[HEADER_LEN..])
        .map_err(|e| SfmError::Serialization(format!("failed to decode snapshot: {e}")))
}

/// BLAKE3 of `bytes`, as 64 lowercase hex characters.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

// =============================================================================
// TESTS
// =============================================================================
