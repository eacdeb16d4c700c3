//! # Persistence Manager
//!
//! Versioned, checksummed snapshots of a graph on a [`StorageBackend`].
//!
//! ## Layout
//!
//! ```text
//! graphs/<graph_id>/v00000001.data   header + postcard snapshot
//! graphs/<graph_id>/v00000001.meta   JSON SnapshotMetadata
//! backups/<name>.backup              postcard BackupRecord
//! ```
//!
//! The data blob is written first and the metadata sidecar second. A version
//! exists once its sidecar exists, so a failed save never replaces or
//! corrupts an earlier version. The checksum is BLAKE3 over the whole data
//! blob and is stored only in the sidecar, so integrity can be checked
//! without deserializing.

use crate::config::PersistenceConfig;
use crate::formats::{checksum, snapshot_from_bytes, snapshot_to_bytes};
use crate::graph::{Graph, GraphSnapshot};
use crate::primitives::{
    BACKUP_EXTENSION, BACKUPS_PREFIX, DATA_EXTENSION, FORMAT_VERSION, GRAPHS_PREFIX,
    META_EXTENSION,
};
use crate::rules::{AcceptAll, RuleChecker};
use crate::storage::{FsBackend, MemoryBackend, StorageBackend};
use crate::{Node, NodeId, SfmError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// RECORDS
// =============================================================================

/// Sidecar describing one saved version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub graph_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// BLAKE3 hex of the data blob.
    pub checksum: String,
    pub node_count: usize,
    pub relationship_count: usize,
    pub size_bytes: usize,
    pub format_version: u8,
}

/// A snapshot copied out of the version chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupRecord {
    name: String,
    created_at: DateTime<Utc>,
    source: SnapshotMetadata,
    data: Vec<u8>,
}

/// Summary of a stored backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub source: SnapshotMetadata,
}

/// Totals reported by [`PersistenceManager::storage_statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStats {
    pub graphs: usize,
    pub versions: usize,
    pub backups: usize,
    /// Snapshot data bytes across every version.
    pub snapshot_bytes: usize,
}

/// Explicit retry parameters for [`PersistenceManager::save_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }
}

// =============================================================================
// PATHS
// =============================================================================

/// Graph ids and backup names: `[A-Za-z0-9_.-]+`, not starting with `.`.
fn validate_name(field: &'static str, name: &str) -> Result<(), SfmError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SfmError::InvalidValue {
            field,
            reason: format!("{name:?} must match [A-Za-z0-9_.-]+"),
        })
    }
}

fn graph_dir(graph_id: &str) -> String {
    format!("{GRAPHS_PREFIX}/{graph_id}/")
}

fn version_path(graph_id: &str, version: u64, extension: &str) -> String {
    format!("{GRAPHS_PREFIX}/{graph_id}/v{version:08}.{extension}")
}

fn backup_path(name: &str) -> String {
    format!("{BACKUPS_PREFIX}/{name}.{BACKUP_EXTENSION}")
}

/// `graphs/<id>/v00000007.meta` -> `(id, 7)`.
fn parse_meta_path(path: &str) -> Option<(&str, u64)> {
    let rest = path.strip_prefix(GRAPHS_PREFIX)?.strip_prefix('/')?;
    let (graph_id, file) = rest.split_once('/')?;
    let stem = file.strip_suffix(META_EXTENSION)?.strip_suffix('.')?;
    let version = stem.strip_prefix('v')?.parse().ok()?;
    Some((graph_id, version))
}

// =============================================================================
// MANAGER
// =============================================================================

/// Saves and loads graph snapshots.
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    config: PersistenceConfig,
    /// Serializes version allocation within this process.
    commit_lock: Mutex<()>,
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistenceManager {
    pub fn new(backend: Arc<dyn StorageBackend>, config: PersistenceConfig) -> Self {
        Self {
            backend,
            config,
            commit_lock: Mutex::new(()),
        }
    }

    /// Filesystem storage rooted at `config.storage_path`.
    pub fn open(config: PersistenceConfig) -> Result<Self, SfmError> {
        let backend = FsBackend::open(&config.storage_path)?;
        Ok(Self::new(Arc::new(backend), config))
    }

    /// Volatile storage.
    #[must_use]
    pub fn in_memory(config: PersistenceConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // -------------------------------------------------------------------------
    // Save
    // -------------------------------------------------------------------------

    /// Save `graph` as the next version of `graph_id`.
    ///
    /// Fails with `NotResident` if any node is evicted.
    pub fn save(&self, graph_id: &str, graph: &Graph) -> Result<SnapshotMetadata, SfmError> {
        let snapshot = graph.snapshot()?;
        self.save_snapshot(graph_id, &snapshot)
    }

    /// Save an already captured snapshot as the next version of `graph_id`.
    pub fn save_snapshot(
        &self,
        graph_id: &str,
        snapshot: &GraphSnapshot,
    ) -> Result<SnapshotMetadata, SfmError> {
        validate_name("graph_id", graph_id)?;
        let data = snapshot_to_bytes(snapshot)?;
        self.commit(
            graph_id,
            &data,
            snapshot.node_count(),
            snapshot.relationship_count(),
        )
    }

    fn commit(
        &self,
        graph_id: &str,
        data: &[u8],
        node_count: usize,
        relationship_count: usize,
    ) -> Result<SnapshotMetadata, SfmError> {
        let _guard = self.commit_lock.lock();
        let version = self.latest_version(graph_id)?.map_or(1, |v| v + 1);
        let metadata = SnapshotMetadata {
            graph_id: graph_id.to_string(),
            version,
            created_at: Utc::now(),
            checksum: checksum(data),
            node_count,
            relationship_count,
            size_bytes: data.len(),
            format_version: FORMAT_VERSION,
        };
        let sidecar = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| SfmError::Serialization(e.to_string()))?;

        let data_path = version_path(graph_id, version, DATA_EXTENSION);
        self.backend.write(&data_path, data)?;
        if let Err(err) = self
            .backend
            .write(&version_path(graph_id, version, META_EXTENSION), &sidecar)
        {
            if let Err(cleanup) = self.backend.delete(&data_path) {
                warn!(path = %data_path, error = %cleanup, "orphaned snapshot data");
            }
            return Err(err);
        }

        info!(
            graph_id,
            version,
            nodes = node_count,
            relationships = relationship_count,
            bytes = data.len(),
            "snapshot saved"
        );
        Ok(metadata)
    }

    /// `save`, retrying storage failures with exponential backoff.
    ///
    /// Only `Storage` errors are retried; anything else fails immediately.
    pub fn save_with_retry(
        &self,
        graph_id: &str,
        graph: &Graph,
        policy: &RetryPolicy,
    ) -> Result<SnapshotMetadata, SfmError> {
        let snapshot = graph.snapshot()?;
        let attempts = policy.attempts.max(1);
        let mut backoff = policy.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.save_snapshot(graph_id, &snapshot) {
                Err(SfmError::Storage(reason)) if attempt < attempts => {
                    warn!(graph_id, attempt, %reason, "snapshot save failed, retrying");
                    std::thread::sleep(backoff);
                    backoff = backoff.mul_f64(policy.multiplier.max(1.0));
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Load
    // -------------------------------------------------------------------------

    /// Load a version (latest when `None`) into a graph that accepts every
    /// relationship.
    pub fn load(&self, graph_id: &str, version: Option<u64>) -> Result<Graph, SfmError> {
        self.load_with_rules(graph_id, version, Arc::new(AcceptAll))
    }

    /// Load a version, re-validating relationships with `rules`.
    pub fn load_with_rules(
        &self,
        graph_id: &str,
        version: Option<u64>,
        rules: Arc<dyn RuleChecker>,
    ) -> Result<Graph, SfmError> {
        let (metadata, snapshot) = self.load_snapshot(graph_id, version)?;
        let graph = Graph::from_snapshot(snapshot, rules)?;
        info!(
            graph_id,
            version = metadata.version,
            nodes = metadata.node_count,
            "snapshot loaded"
        );
        Ok(graph)
    }

    /// Read, verify and decode a version without building a live graph.
    pub fn load_snapshot(
        &self,
        graph_id: &str,
        version: Option<u64>,
    ) -> Result<(SnapshotMetadata, GraphSnapshot), SfmError> {
        let metadata = self.get_metadata(graph_id, version)?;
        let data = self.read_data(&metadata)?;
        if self.config.verify_on_load {
            Self::check_integrity(&metadata, &data)?;
        }
        let snapshot = snapshot_from_bytes(&data).map_err(|e| SfmError::Integrity {
            graph_id: metadata.graph_id.clone(),
            version: metadata.version,
            detail: e.to_string(),
        })?;
        Ok((metadata, snapshot))
    }

    fn read_data(&self, metadata: &SnapshotMetadata) -> Result<Vec<u8>, SfmError> {
        self.backend
            .read(&version_path(
                &metadata.graph_id,
                metadata.version,
                DATA_EXTENSION,
            ))?
            .ok_or_else(|| SfmError::Integrity {
                graph_id: metadata.graph_id.clone(),
                version: metadata.version,
                detail: "data blob missing".to_string(),
            })
    }

    fn check_integrity(metadata: &SnapshotMetadata, data: &[u8]) -> Result<(), SfmError> {
        let actual = checksum(data);
        if actual != metadata.checksum {
            return Err(SfmError::Integrity {
                graph_id: metadata.graph_id.clone(),
                version: metadata.version,
                detail: format!("checksum {actual} does not match {}", metadata.checksum),
            });
        }
        Ok(())
    }

    /// Checksum-only verification. `Ok(false)` on mismatch or missing data.
    pub fn verify(&self, graph_id: &str, version: Option<u64>) -> Result<bool, SfmError> {
        let metadata = self.get_metadata(graph_id, version)?;
        match self.read_data(&metadata) {
            Ok(data) => Ok(Self::check_integrity(&metadata, &data).is_ok()),
            Err(SfmError::Integrity { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// A loader serving nodes from a saved version, for lazy loading.
    pub fn node_loader(
        &self,
        graph_id: &str,
        version: Option<u64>,
    ) -> Result<impl Fn(NodeId) -> Option<Node> + Send + Sync + 'static, SfmError> {
        let (_, snapshot) = self.load_snapshot(graph_id, version)?;
        let nodes: HashMap<NodeId, Node> = snapshot
            .nodes
            .into_values()
            .flatten()
            .map(|node| (node.id(), node))
            .collect();
        Ok(move |id: NodeId| nodes.get(&id).cloned())
    }

    // -------------------------------------------------------------------------
    // Enumeration
    // -------------------------------------------------------------------------

    /// Committed versions of `graph_id`, ascending.
    pub fn list_versions(&self, graph_id: &str) -> Result<Vec<u64>, SfmError> {
        validate_name("graph_id", graph_id)?;
        let mut versions: Vec<u64> = self
            .backend
            .list(&graph_dir(graph_id))?
            .iter()
            .filter_map(|path| parse_meta_path(path))
            .filter(|(id, _)| *id == graph_id)
            .map(|(_, v)| v)
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn latest_version(&self, graph_id: &str) -> Result<Option<u64>, SfmError> {
        Ok(self.list_versions(graph_id)?.last().copied())
    }

    /// Graph ids with at least one committed version, sorted.
    pub fn list_graphs(&self) -> Result<Vec<String>, SfmError> {
        let ids: BTreeSet<String> = self
            .backend
            .list(&format!("{GRAPHS_PREFIX}/"))?
            .iter()
            .filter_map(|path| parse_meta_path(path))
            .map(|(id, _)| id.to_string())
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Metadata of a version (latest when `None`) without reading its data.
    pub fn get_metadata(
        &self,
        graph_id: &str,
        version: Option<u64>,
    ) -> Result<SnapshotMetadata, SfmError> {
        let not_found = || SfmError::SnapshotNotFound {
            graph_id: graph_id.to_string(),
            version,
        };
        let version = match version {
            Some(v) => v,
            None => self.latest_version(graph_id)?.ok_or_else(not_found)?,
        };
        validate_name("graph_id", graph_id)?;
        let raw = self
            .backend
            .read(&version_path(graph_id, version, META_EXTENSION))?
            .ok_or_else(not_found)?;
        serde_json::from_slice(&raw).map_err(|e| SfmError::Integrity {
            graph_id: graph_id.to_string(),
            version,
            detail: format!("unreadable metadata: {e}"),
        })
    }

    /// Remove every version of `graph_id`. Returns the versions removed.
    pub fn delete_graph(&self, graph_id: &str) -> Result<usize, SfmError> {
        let versions = self.list_versions(graph_id)?;
        if versions.is_empty() {
            return Err(SfmError::SnapshotNotFound {
                graph_id: graph_id.to_string(),
                version: None,
            });
        }
        for version in &versions {
            self.delete_version(graph_id, *version)?;
        }
        // Data blobs left by failed saves.
        for path in self.backend.list(&graph_dir(graph_id))? {
            self.backend.delete(&path)?;
        }
        info!(graph_id, versions = versions.len(), "graph deleted");
        Ok(versions.len())
    }

    fn delete_version(&self, graph_id: &str, version: u64) -> Result<(), SfmError> {
        // Sidecar first: the version disappears atomically.
        self.backend
            .delete(&version_path(graph_id, version, META_EXTENSION))?;
        self.backend
            .delete(&version_path(graph_id, version, DATA_EXTENSION))?;
        Ok(())
    }

    pub fn storage_statistics(&self) -> Result<StorageStats, SfmError> {
        let mut stats = StorageStats::default();
        for graph_id in self.list_graphs()? {
            stats.graphs += 1;
            for version in self.list_versions(&graph_id)? {
                stats.versions += 1;
                stats.snapshot_bytes += self.get_metadata(&graph_id, Some(version))?.size_bytes;
            }
        }
        stats.backups = self.backend.list(&format!("{BACKUPS_PREFIX}/"))?.len();
        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Keep the newest `keep` versions (config default when `None`).
    /// Returns the number removed.
    pub fn cleanup_old_versions(&self, graph_id: &str, keep: Option<usize>) -> Result<usize, SfmError> {
        let keep = keep.unwrap_or(self.config.max_versions);
        if keep == 0 {
            return Err(SfmError::InvalidValue {
                field: "keep",
                reason: "must keep at least one version".to_string(),
            });
        }
        let versions = self.list_versions(graph_id)?;
        let excess = versions.len().saturating_sub(keep);
        for version in &versions[..excess] {
            self.delete_version(graph_id, *version)?;
        }
        if excess > 0 {
            info!(graph_id, removed = excess, kept = keep, "old versions removed");
        }
        Ok(excess)
    }

    // -------------------------------------------------------------------------
    // Backups
    // -------------------------------------------------------------------------

    /// Copy a version (latest when `None`) to `backups/<name>.backup`.
    /// Returns the backup path.
    pub fn create_backup(
        &self,
        graph_id: &str,
        version: Option<u64>,
        name: &str,
    ) -> Result<String, SfmError> {
        validate_name("backup name", name)?;
        let metadata = self.get_metadata(graph_id, version)?;
        let data = self.read_data(&metadata)?;
        Self::check_integrity(&metadata, &data)?;

        let record = BackupRecord {
            name: name.to_string(),
            created_at: Utc::now(),
            source: metadata,
            data,
        };
        let bytes =
            postcard::to_stdvec(&record).map_err(|e| SfmError::Serialization(e.to_string()))?;
        let path = backup_path(name);
        self.backend.write(&path, &bytes)?;
        info!(graph_id, version = record.source.version, path = %path, "backup created");
        Ok(path)
    }

    fn read_backup(&self, path: &str) -> Result<BackupRecord, SfmError> {
        let bytes = self
            .backend
            .read(path)?
            .ok_or_else(|| SfmError::BackupNotFound(path.to_string()))?;
        postcard::from_bytes(&bytes)
            .map_err(|e| SfmError::Serialization(format!("unreadable backup {path}: {e}")))
    }

    /// Restore a backup as the next version of `graph_id` (the source id
    /// when `None`).
    pub fn restore_from_backup(
        &self,
        path: &str,
        graph_id: Option<&str>,
    ) -> Result<SnapshotMetadata, SfmError> {
        let record = self.read_backup(path)?;
        Self::check_integrity(&record.source, &record.data)?;
        let target = graph_id.unwrap_or(&record.source.graph_id);
        validate_name("graph_id", target)?;
        // Decode before committing so a bad payload never becomes a version.
        snapshot_from_bytes(&record.data)?;
        let metadata = self.commit(
            target,
            &record.data,
            record.source.node_count,
            record.source.relationship_count,
        )?;
        info!(path, graph_id = target, version = metadata.version, "backup restored");
        Ok(metadata)
    }

    /// Every stored backup, oldest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, SfmError> {
        let mut backups = Vec::new();
        for path in self.backend.list(&format!("{BACKUPS_PREFIX}/"))? {
            match self.read_backup(&path) {
                Ok(record) => backups.push(BackupInfo {
                    name: record.name,
                    path,
                    created_at: record.created_at,
                    source: record.source,
                }),
                Err(err) => warn!(path = %path, error = %err, "skipping unreadable backup"),
            }
        }
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(backups)
    }

    /// Delete backups created more than `max_age` ago. Returns the number
    /// removed.
    pub fn cleanup_old_backups(&self, max_age: Duration) -> Result<usize, SfmError> {
        let max_age = chrono::Duration::from_std(max_age).map_err(|e| SfmError::InvalidValue {
            field: "max_age",
            reason: e.to_string(),
        })?;
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;
        for backup in self.list_backups()? {
            if backup.created_at <= cutoff && self.backend.delete(&backup.path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "old backups removed");
        }
        Ok(removed)
    }
}

// =============================================================================
// TESTS
// =============================================================================
