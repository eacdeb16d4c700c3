//! # Storage Backends
//!
//! A flat key-value store addressed by `/`-separated relative paths, used by
//! the persistence manager. The physical medium is swappable:
//!
//! - [`FsBackend`]: files under a root directory, written temp-then-rename.
//! - [`RedbBackend`]: one redb table, each write its own transaction.
//! - [`MemoryBackend`]: a map, for tests and ephemeral engines.

mod fs;
mod memory;
mod redb_backend;

pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use redb_backend::RedbBackend;

use crate::SfmError;

/// Key-value storage used for snapshots, metadata and backups.
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Replace the value at `path`. Readers see either the old or the new
    /// bytes, never a mix.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SfmError>;

    /// `None` when nothing is stored at `path`.
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SfmError>;

    fn exists(&self, path: &str) -> Result<bool, SfmError>;

    /// Every stored path starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, SfmError>;

    /// Returns whether anything was removed.
    fn delete(&self, path: &str) -> Result<bool, SfmError>;
}

/// Reject empty, absolute and parent-relative paths.
pub(crate) fn validate_path(path: &str) -> Result<(), SfmError> {
    let invalid = |reason: &str| SfmError::InvalidValue {
        field: "path",
        reason: format!("{path:?}: {reason}"),
    };
    if path.is_empty() {
        return Err(invalid("empty"));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(invalid("must be relative and '/'-separated"));
    }
    if path
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(invalid("contains an empty, '.' or '..' component"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path("graphs/g1/v00000001.data").is_ok());
        for bad in ["", "/abs", "a//b", "../up", "a/./b", "win\\path"] {
            assert!(validate_path(bad).is_err(), "{bad} should be rejected");
        }
    }

    /// Shared behavioural checks run against every backend.
    pub(crate) fn exercise(backend: &dyn StorageBackend) {
        assert_eq!(backend.read("graphs/a/x.data").expect("read"), None);
        backend.write("graphs/a/x.data", b"one").expect("write");
        backend.write("graphs/a/y.meta", b"two").expect("write");
        backend.write("graphs/b/x.data", b"three").expect("write");
        backend.write("backups/z.backup", b"four").expect("write");
        backend.write("graphs/a/x.data", b"uno").expect("overwrite");

        assert_eq!(
            backend.read("graphs/a/x.data").expect("read"),
            Some(b"uno".to_vec())
        );
        assert!(backend.exists("graphs/b/x.data").expect("exists"));
        assert_eq!(
            backend.list("graphs/a/").expect("list"),
            vec!["graphs/a/x.data".to_string(), "graphs/a/y.meta".to_string()]
        );
        assert_eq!(backend.list("graphs/").expect("list").len(), 3);

        assert!(backend.delete("graphs/a/x.data").expect("delete"));
        assert!(!backend.delete("graphs/a/x.data").expect("delete again"));
        assert!(!backend.exists("graphs/a/x.data").expect("exists"));
        assert!(backend.write("../escape", b"x").is_err());
    }
}
