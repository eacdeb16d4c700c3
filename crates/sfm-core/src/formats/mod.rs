//! # Formats
//!
//! Byte-level encodings of persisted data. Pure transformations, no I/O.

mod snapshot;

pub use snapshot::{SnapshotHeader, checksum, snapshot_from_bytes, snapshot_to_bytes};
