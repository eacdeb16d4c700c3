use super::{StorageBackend, validate_path};
use crate::SfmError;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::path::Path;

/// Table for stored blobs: path -> bytes
const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

fn storage_err(e: impl std::fmt::Display) -> SfmError {
    SfmError::Storage(e.to_string())
}

/// Single-file embedded storage; every write is one ACID transaction.
pub struct RedbBackend {
    db: Database,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend").finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SfmError> {
        let db = Database::create(path.as_ref()).map_err(storage_err)?;
        {
            let write_txn = db.begin_write().map_err(storage_err)?;
            let _ = write_txn.open_table(BLOBS).map_err(storage_err)?;
            write_txn.commit().map_err(storage_err)?;
        }
        Ok(Self { db })
    }
}

impl StorageBackend for RedbBackend {
    fn name(&self) -> &str {
        "redb"
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SfmError> {
        validate_path(path)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(BLOBS).map_err(storage_err)?;
            table.insert(path, bytes).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SfmError> {
        validate_path(path)?;
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(BLOBS).map_err(storage_err)?;
        Ok(table
            .get(path)
            .map_err(storage_err)?
            .map(|v| v.value().to_vec()))
    }

    fn exists(&self, path: &str) -> Result<bool, SfmError> {
        validate_path(path)?;
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(BLOBS).map_err(storage_err)?;
        Ok(table.get(path).map_err(storage_err)?.is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SfmError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(BLOBS).map_err(storage_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (key, _) = entry.map_err(storage_err)?;
            let key = key.value();
            if key.starts_with(prefix) {
                out.push(key.to_string());
            }
        }
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<bool, SfmError> {
        validate_path(path)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let removed = {
            let mut table = write_txn.open_table(BLOBS).map_err(storage_err)?;
            table.remove(path).map_err(storage_err)?.is_some()
        };
        write_txn.commit().map_err(storage_err)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn behaves_like_a_backend() {
        let dir = tempdir().expect("temp dir");
        let backend = RedbBackend::open(dir.path().join("store.redb")).expect("open");
        crate::storage::tests::exercise(&backend);
    }
}
