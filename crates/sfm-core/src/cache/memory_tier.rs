//! In-process cache tier: an LRU bounded by entry count and by bytes, with a
//! tag index for bulk invalidation.

use super::{CacheEntry, CacheTag, CacheTier};
use crate::SfmError;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;

struct Inner {
    entries: LruCache<String, CacheEntry>,
    tag_index: HashMap<CacheTag, HashSet<String>>,
    bytes: usize,
    evictions: u64,
}

impl Inner {
    fn untrack(&mut self, key: &str, entry: &CacheEntry) {
        self.bytes -= entry.size_bytes(key);
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn take(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.untrack(key, &entry);
        Some(entry)
    }
}

/// Fast, process-local tier.
pub struct MemoryTier {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

impl MemoryTier {
    pub fn new(max_entries: usize, max_bytes: usize) -> Result<Self, SfmError> {
        let capacity = NonZeroUsize::new(max_entries).ok_or(SfmError::InvalidValue {
            field: "cache.max_entries",
            reason: "must be at least 1".to_string(),
        })?;
        Ok(Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                tag_index: HashMap::new(),
                bytes: 0,
                evictions: 0,
            }),
            max_bytes,
        })
    }

    /// Bytes currently accounted to stored entries.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }
}

impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, SfmError> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), SfmError> {
        let size = entry.size_bytes(key);
        let mut inner = self.inner.lock();
        inner.take(key);
        if size > self.max_bytes {
            // Would evict everything including itself.
            return Ok(());
        }

        for tag in &entry.tags {
            inner
                .tag_index
                .entry(*tag)
                .or_default()
                .insert(key.to_string());
        }
        inner.bytes += size;
        if let Some((old_key, old_entry)) = inner.entries.push(key.to_string(), entry) {
            inner.untrack(&old_key, &old_entry);
            inner.evictions += 1;
        }
        while inner.bytes > self.max_bytes {
            let Some((old_key, old_entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.untrack(&old_key, &old_entry);
            inner.evictions += 1;
        }
        Ok(())
    }

    /// Does not refresh the entry's recency.
    fn contains(&self, key: &str) -> Result<bool, SfmError> {
        Ok(self.inner.lock().entries.contains(key))
    }

    fn remove(&self, key: &str) -> Result<bool, SfmError> {
        Ok(self.inner.lock().take(key).is_some())
    }

    fn invalidate_tags(&self, tags: &BTreeSet<CacheTag>) -> Result<Vec<String>, SfmError> {
        let mut inner = self.inner.lock();
        let keys: BTreeSet<String> = tags
            .iter()
            .filter_map(|tag| inner.tag_index.get(tag))
            .flat_map(|keys| keys.iter().cloned())
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if inner.take(&key).is_some() {
                removed.push(key);
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), SfmError> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.tag_index.clear();
        inner.bytes = 0;
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }
}
