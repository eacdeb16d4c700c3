//! Slower shared cache tier persisted in a redb database.
//!
//! Entries are postcard-encoded [`CacheEntry`] values. Several processes can
//! point at the same file; tag invalidation scans the table.
//!
//! The table is bounded by entry count. A write that pushes it past the
//! bound sweeps it down to 90% of the bound: expired and undecodable entries
//! go first, then the oldest by creation time.

use super::{CacheEntry, CacheTag, CacheTier};
use crate::SfmError;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Table for cache entries: canonical key -> postcard(CacheEntry)
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("cache_entries");

fn storage_err(e: impl std::fmt::Display) -> SfmError {
    SfmError::Storage(e.to_string())
}

/// redb-backed cache tier.
pub struct RedbTier {
    db: Database,
    max_entries: usize,
    evictions: AtomicU64,
}

impl std::fmt::Debug for RedbTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbTier")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl RedbTier {
    /// Open or create the tier database at `path`, holding at most
    /// `max_entries` entries.
    pub fn open(path: impl AsRef<Path>, max_entries: usize) -> Result<Self, SfmError> {
        if max_entries == 0 {
            return Err(SfmError::InvalidValue {
                field: "cache.shared_tier_max_entries",
                reason: "must be at least 1".to_string(),
            });
        }
        let db = Database::create(path.as_ref()).map_err(storage_err)?;
        {
            let write_txn = db.begin_write().map_err(storage_err)?;
            let _ = write_txn.open_table(ENTRIES).map_err(storage_err)?;
            write_txn.commit().map_err(storage_err)?;
        }
        Ok(Self {
            db,
            max_entries,
            evictions: AtomicU64::new(0),
        })
    }

    /// Size the table is swept down to once it exceeds the bound.
    fn sweep_target(&self) -> usize {
        (self.max_entries - self.max_entries / 10).max(1)
    }
}

impl CacheTier for RedbTier {
    fn name(&self) -> &str {
        "redb"
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, SfmError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(ENTRIES).map_err(storage_err)?;
        let Some(raw) = table.get(key).map_err(storage_err)? else {
            return Ok(None);
        };
        postcard::from_bytes(raw.value())
            .map(Some)
            .map_err(|e| SfmError::Serialization(e.to_string()))
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), SfmError> {
        let bytes =
            postcard::to_stdvec(&entry).map_err(|e| SfmError::Serialization(e.to_string()))?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let swept = {
            let mut table = write_txn.open_table(ENTRIES).map_err(storage_err)?;
            table.insert(key, bytes.as_slice()).map_err(storage_err)?;
            let len = table.len().map_err(storage_err)? as usize;
            if len > self.max_entries {
                let now = Utc::now();
                // (keep-able, created_at, key); doomed entries sort first.
                let mut ranked = Vec::with_capacity(len);
                for item in table.iter().map_err(storage_err)? {
                    let (stored, value) = item.map_err(storage_err)?;
                    let stored = stored.value().to_string();
                    if stored == key {
                        continue;
                    }
                    let rank = match postcard::from_bytes::<CacheEntry>(value.value()) {
                        Ok(entry) => (!entry.is_expired(now), Some(entry.created_at)),
                        Err(_) => (false, None),
                    };
                    ranked.push((rank, stored));
                }
                ranked.sort();
                let excess = len - self.sweep_target();
                let mut swept = 0;
                for ((keep, _), stored) in &ranked {
                    if swept >= excess && *keep {
                        break;
                    }
                    table.remove(stored.as_str()).map_err(storage_err)?;
                    swept += 1;
                }
                swept
            } else {
                0
            }
        };
        write_txn.commit().map_err(storage_err)?;
        self.evictions.fetch_add(swept as u64, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, SfmError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let removed = {
            let mut table = write_txn.open_table(ENTRIES).map_err(storage_err)?;
            table.remove(key).map_err(storage_err)?.is_some()
        };
        write_txn.commit().map_err(storage_err)?;
        Ok(removed)
    }

    fn invalidate_tags(&self, tags: &BTreeSet<CacheTag>) -> Result<Vec<String>, SfmError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let removed = {
            let mut table = write_txn.open_table(ENTRIES).map_err(storage_err)?;
            let mut doomed = Vec::new();
            for item in table.iter().map_err(storage_err)? {
                let (key, value) = item.map_err(storage_err)?;
                // Undecodable entries are dropped along with the matches.
                let matches = postcard::from_bytes::<CacheEntry>(value.value())
                    .map(|entry| entry.has_any_tag(tags))
                    .unwrap_or(true);
                if matches {
                    doomed.push(key.value().to_string());
                }
            }
            for key in &doomed {
                table.remove(key.as_str()).map_err(storage_err)?;
            }
            doomed
        };
        write_txn.commit().map_err(storage_err)?;
        Ok(removed)
    }

    fn clear(&self) -> Result<(), SfmError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        write_txn.delete_table(ENTRIES).map_err(storage_err)?;
        {
            let _ = write_txn.open_table(ENTRIES).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)
    }

    fn len(&self) -> usize {
        let count = || -> Result<u64, SfmError> {
            let read_txn = self.db.begin_read().map_err(storage_err)?;
            let table = read_txn.open_table(ENTRIES).map_err(storage_err)?;
            table.len().map_err(storage_err)
        };
        count().map_or(0, |n| n as usize)
    }

    fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;
    use tempfile::tempdir;

    #[test]
    fn entries_survive_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("cache.redb");
        {
            let tier = RedbTier::open(&path, 10).expect("open");
            tier.set("k", CacheEntry::new(vec![1, 2, 3], None, BTreeSet::new()))
                .expect("set");
        }
        let tier = RedbTier::open(&path, 10).expect("reopen");
        let entry = tier.get("k").expect("get").expect("present");
        assert_eq!(entry.value, vec![1, 2, 3]);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn invalidate_by_tag() {
        let temp = tempdir().expect("temp dir");
        let tier = RedbTier::open(temp.path().join("cache.redb"), 10).expect("open");
        let tag = CacheTag::Node(NodeId::from_u128(3));
        tier.set("tagged", CacheEntry::new(vec![1], None, [tag].into_iter().collect()))
            .expect("set");
        tier.set("other", CacheEntry::new(vec![2], None, BTreeSet::new()))
            .expect("set");

        let removed = tier
            .invalidate_tags(&[tag].into_iter().collect())
            .expect("invalidate");
        assert_eq!(removed, vec!["tagged".to_string()]);
        assert!(tier.get("other").expect("get").is_some());

        tier.clear().expect("clear");
        assert!(tier.is_empty());
        assert!(!tier.remove("other").expect("remove"));
    }

    #[test]
    fn bound_sweeps_expired_then_oldest() {
        let temp = tempdir().expect("temp dir");
        let tier = RedbTier::open(temp.path().join("cache.redb"), 10).expect("open");
        assert!(RedbTier::open(temp.path().join("zero.redb"), 0).is_err());

        tier.set(
            "expired",
            CacheEntry::new(vec![0], Some(std::time::Duration::ZERO), BTreeSet::new()),
        )
        .expect("set");
        for i in 0..10 {
            let mut entry = CacheEntry::new(vec![i], None, BTreeSet::new());
            entry.created_at = entry.created_at - chrono::Duration::seconds(100 - i64::from(i));
            tier.set(&format!("k{i}"), entry).expect("set");
        }

        // 11 entries > 10: swept down to 9, the expired entry first, then k0.
        assert_eq!(tier.len(), 9);
        assert_eq!(tier.evictions(), 2);
        assert!(tier.get("expired").expect("get").is_none());
        assert!(tier.get("k0").expect("get").is_none());
        assert!(tier.get("k1").expect("get").is_some());
        assert!(tier.get("k9").expect("get").is_some());
    }
}
