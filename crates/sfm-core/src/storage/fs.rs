use super::{StorageBackend, validate_path};
use crate::SfmError;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const TEMP_MARKER: &str = ".tmp-";

fn io_err(path: &Path, e: std::io::Error) -> SfmError {
    SfmError::Storage(format!("{}: {e}", path.display()))
}

/// Files under a root directory.
///
/// Writes go to a uniquely named temporary sibling which is synced and then
/// renamed over the target, so an interrupted write never leaves a partial
/// file at the target path.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Use `root` as the storage directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SfmError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SfmError> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, part| acc.join(part)))
    }

    fn collect(&self, dir: &Path, relative: &str, out: &mut Vec<String>) -> Result<(), SfmError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(TEMP_MARKER) {
                continue;
            }
            let key = if relative.is_empty() {
                name
            } else {
                format!("{relative}/{name}")
            };
            let file_type = entry.file_type().map_err(|e| io_err(&entry.path(), e))?;
            if file_type.is_dir() {
                self.collect(&entry.path(), &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl StorageBackend for FsBackend {
    fn name(&self) -> &str {
        "fs"
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SfmError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut temp_name = target.as_os_str().to_owned();
        temp_name.push(format!("{TEMP_MARKER}{}", Uuid::new_v4().simple()));
        let temp = PathBuf::from(temp_name);

        let written = (|| {
            let mut file = fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(io_err(&target, e));
        }
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SfmError> {
        let target = self.resolve(path)?;
        match fs::read(&target) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&target, e)),
        }
    }

    fn exists(&self, path: &str) -> Result<bool, SfmError> {
        Ok(self.resolve(path)?.is_file())
    }

    /// Walks only the directory named by the prefix up to its last `/`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, SfmError> {
        let base = prefix.rfind('/').map_or("", |i| &prefix[..i]);
        let dir = if base.is_empty() {
            self.root.clone()
        } else {
            self.resolve(base)?
        };
        let mut out = Vec::new();
        if dir.is_dir() {
            self.collect(&dir, base, &mut out)?;
        }
        out.retain(|key| key.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<bool, SfmError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&target, e)),
        }
    }
}
