use super::{StorageBackend, validate_path};
use crate::SfmError;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Volatile in-process storage.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SfmError> {
        validate_path(path)?;
        self.blobs.write().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SfmError> {
        validate_path(path)?;
        Ok(self.blobs.read().get(path).cloned())
    }

    fn exists(&self, path: &str) -> Result<bool, SfmError> {
        validate_path(path)?;
        Ok(self.blobs.read().contains_key(path))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SfmError> {
        Ok(self
            .blobs
            .read()
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, path: &str) -> Result<bool, SfmError> {
        validate_path(path)?;
        Ok(self.blobs.write().remove(path).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn behaves_like_a_backend() {
        crate::storage::tests::exercise(&MemoryBackend::new());
    }
}
