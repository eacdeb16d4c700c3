//! # Engine Primitives
//!
//! Compile-time constants shared across the engine. Runtime-tunable values
//! live in [`crate::config`]; the values here are either format-defining or
//! hard safety bounds.

/// Magic bytes for the snapshot blob header.
///
/// - Snapshot blob = Magic Bytes ("SFMG") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"SFMG";

/// Current snapshot format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

/// Length of the snapshot header in bytes.
pub const HEADER_LEN: usize = 5;

/// Maximum traversal depth for graph queries.
///
/// - All queries must be computationally bounded.
/// - This prevents runaway traversals in large graphs.
pub const MAX_TRAVERSAL_DEPTH: usize = 100;

/// Maximum number of label-propagation sweeps before the partition is
/// accepted as-is.
pub const MAX_LABEL_PROPAGATION_ROUNDS: usize = 64;

/// Maximum number of flow paths reported by a single trace.
pub const MAX_FLOW_PATHS: usize = 10_000;

/// Maximum accepted snapshot size; checked before deserializing.
pub const MAX_SNAPSHOT_SIZE: usize = 500 * 1024 * 1024; // 500 MB

/// Number of nodes evicted per batch before usage is re-evaluated.
pub const EVICTION_BATCH_SIZE: usize = 64;

// =============================================================================
// STORAGE LAYOUT
// =============================================================================

/// Prefix under which versioned snapshots are stored.
pub const GRAPHS_PREFIX: &str = "graphs";

/// Prefix under which backups are stored.
pub const BACKUPS_PREFIX: &str = "backups";

/// Extension of snapshot data blobs.
pub const DATA_EXTENSION: &str = "data";

/// Prefix under which memory managers spill evicted node records.
pub const SPILL_PREFIX: &str = "evicted";

/// Extension of metadata sidecars.
pub const META_EXTENSION: &str = "meta";

/// Extension of backup blobs.
pub const BACKUP_EXTENSION: &str = "backup";
