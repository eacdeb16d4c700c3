//! # Cache Layer
//!
//! Memoizes expensive read-only query results and keeps them coherent with
//! graph mutation.
//!
//! - Entries are keyed by [`CacheKey`] (operation, canonical arguments and a
//!   graph-state fingerprint) and carry a TTL plus a tag set.
//! - [`TieredCache`] reads tiers in priority order; a hit in a lower tier is
//!   promoted into every higher tier before it is returned.
//! - [`CacheInvalidator`] is a graph observer that invalidates every entry
//!   whose tags intersect the tags of a changed entity.
//! - A failing tier degrades to a miss. Correctness never depends on the
//!   cache being available.

mod invalidation;
mod memory_tier;
mod redb_tier;

pub use invalidation::{CacheInvalidator, event_tags};
pub use memory_tier::MemoryTier;
pub use redb_tier::RedbTier;

use crate::config::CacheConfig;
use crate::{NodeId, NodeKind, RelationshipId, RelationshipKind, SfmError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// KEYS, TAGS AND ENTRIES
// =============================================================================

/// Identifies a cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub operation: String,
    /// Canonical argument encoding, in a fixed order per operation.
    pub args: Vec<String>,
    /// Graph-state fingerprint the result was computed against.
    pub fingerprint: Option<String>,
}

impl CacheKey {
    pub fn new(operation: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            operation: operation.into(),
            args,
            fingerprint: None,
        }
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl fmt::Display) -> Self {
        self.fingerprint = Some(fingerprint.to_string());
        self
    }

    /// Flat string form used by every tier.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut out = format!("{}:{}", self.operation, self.args.join("|"));
        if let Some(fp) = &self.fingerprint {
            out.push('@');
            out.push_str(fp);
        }
        out
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Label used for bulk invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheTag {
    Node(NodeId),
    Relationship(RelationshipId),
    NodeKind(NodeKind),
    RelationshipKind(RelationshipKind),
    /// Aggregate results that depend on the whole graph.
    Global,
}

/// A stored value with its invalidation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub tags: BTreeSet<CacheTag>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(value: Vec<u8>, ttl: Option<Duration>, tags: BTreeSet<CacheTag>) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| created_at.checked_add_signed(ttl));
        Self {
            value,
            tags,
            created_at,
            expires_at,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Approximate footprint used by byte-bounded tiers.
    #[must_use]
    pub fn size_bytes(&self, key: &str) -> usize {
        key.len() + self.value.len() + self.tags.len() * std::mem::size_of::<CacheTag>()
    }

    #[must_use]
    pub fn has_any_tag(&self, tags: &BTreeSet<CacheTag>) -> bool {
        !self.tags.is_disjoint(tags)
    }
}

// =============================================================================
// CACHE TIER TRAIT
// =============================================================================

/// One storage level of a tiered cache.
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &str;
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, SfmError>;
    /// Membership check that does not count as a use of the entry.
    fn contains(&self, key: &str) -> Result<bool, SfmError> {
        Ok(self.get(key)?.is_some())
    }
    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), SfmError>;
    fn remove(&self, key: &str) -> Result<bool, SfmError>;
    /// Remove every entry carrying any of `tags`; returns the removed keys.
    fn invalidate_tags(&self, tags: &BTreeSet<CacheTag>) -> Result<Vec<String>, SfmError>;
    fn clear(&self) -> Result<(), SfmError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Entries dropped by the tier's own capacity bound.
    fn evictions(&self) -> u64 {
        0
    }
}

// =============================================================================
// TIERED CACHE
// =============================================================================

/// Counters exposed by [`TieredCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    promotions: u64,
    invalidations: u64,
    /// Hits per stored key; pruned whenever a tier reports new evictions.
    per_key: HashMap<String, u64>,
    /// Tier eviction total when `per_key` was last pruned.
    seen_evictions: u64,
}

/// Cache over an ordered list of tiers, fastest first.
pub struct TieredCache {
    tiers: Vec<Arc<dyn CacheTier>>,
    default_ttl: Option<Duration>,
    counters: Mutex<Counters>,
}

impl fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCache")
            .field(
                "tiers",
                &self.tiers.iter().map(|t| t.name().to_string()).collect::<Vec<_>>(),
            )
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl TieredCache {
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>, default_ttl: Option<Duration>) -> Self {
        Self {
            tiers,
            default_ttl,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Single in-process tier sized from `config`.
    pub fn in_memory(config: &CacheConfig) -> Result<Self, SfmError> {
        let tier: Arc<dyn CacheTier> =
            Arc::new(MemoryTier::new(config.max_entries, config.max_bytes)?);
        Ok(Self::new(
            vec![tier],
            Some(Duration::from_secs(config.default_ttl_secs)),
        ))
    }

    /// In-process tier, plus the redb shared tier when a path is configured.
    pub fn from_config(config: &CacheConfig) -> Result<Self, SfmError> {
        let mut cache = Self::in_memory(config)?;
        if let Some(path) = &config.shared_tier_path {
            cache
                .tiers
                .push(Arc::new(RedbTier::open(path, config.shared_tier_max_entries)?));
        }
        Ok(cache)
    }

    #[must_use]
    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.name().to_string()).collect()
    }

    #[must_use]
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// True when any tier holds `canonical`. A failing tier reads as absent.
    fn holds(&self, canonical: &str) -> bool {
        self.tiers
            .iter()
            .any(|tier| tier.contains(canonical).unwrap_or(false))
    }

    fn tier_evictions(&self) -> u64 {
        self.tiers.iter().map(|t| t.evictions()).sum()
    }

    /// Look up a raw value. Absent, expired and failing-tier all read as miss.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let canonical = key.canonical();
        let now = Utc::now();
        for (level, tier) in self.tiers.iter().enumerate() {
            let entry = match tier.get(&canonical) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    warn!(tier = tier.name(), key = %canonical, error = %err, "cache tier read failed");
                    continue;
                }
            };
            if entry.is_expired(now) {
                if let Err(err) = tier.remove(&canonical) {
                    warn!(tier = tier.name(), error = %err, "failed to drop expired entry");
                }
                continue;
            }

            for upper in &self.tiers[..level] {
                if let Err(err) = upper.set(&canonical, entry.clone()) {
                    warn!(tier = upper.name(), error = %err, "cache promotion failed");
                }
            }

            let mut counters = self.counters.lock();
            counters.hits += 1;
            if level > 0 {
                counters.promotions += 1;
            }
            *counters.per_key.entry(canonical).or_default() += 1;
            return Some(entry.value);
        }
        let mut counters = self.counters.lock();
        counters.misses += 1;
        counters.per_key.remove(&canonical);
        None
    }

    /// Look up and decode a postcard-encoded value.
    ///
    /// A value that fails to decode is dropped and reported as a miss.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let bytes = self.get(key)?;
        match postcard::from_bytes(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "dropping undecodable cache entry");
                self.invalidate(key);
                None
            }
        }
    }

    /// Store a raw value in every tier. `ttl == None` uses the default TTL.
    pub fn set(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: BTreeSet<CacheTag>,
    ) {
        let canonical = key.canonical();
        let entry = CacheEntry::new(value, ttl.or(self.default_ttl), tags);
        for tier in &self.tiers {
            if let Err(err) = tier.set(&canonical, entry.clone()) {
                warn!(tier = tier.name(), key = %canonical, error = %err, "cache tier write failed");
            }
        }
        let evictions = self.tier_evictions();
        let mut counters = self.counters.lock();
        counters.per_key.remove(&canonical);
        if evictions != counters.seen_evictions {
            counters.seen_evictions = evictions;
            counters.per_key.retain(|key, _| self.holds(key));
        }
    }

    /// Encode with postcard and store.
    pub fn set_typed<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
        tags: BTreeSet<CacheTag>,
    ) {
        match postcard::to_stdvec(value) {
            Ok(bytes) => self.set(key, bytes, ttl, tags),
            Err(err) => warn!(key = %key, error = %err, "cache value not encodable"),
        }
    }

    /// Remove one key from every tier.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let canonical = key.canonical();
        let mut removed = false;
        for tier in &self.tiers {
            match tier.remove(&canonical) {
                Ok(hit) => removed |= hit,
                Err(err) => warn!(tier = tier.name(), error = %err, "cache tier remove failed"),
            }
        }
        let mut counters = self.counters.lock();
        counters.per_key.remove(&canonical);
        if removed {
            counters.invalidations += 1;
        }
        removed
    }

    /// Remove every entry carrying any of `tags`. Returns distinct keys removed.
    pub fn invalidate_tags(&self, tags: &BTreeSet<CacheTag>) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let mut removed = BTreeSet::new();
        for tier in &self.tiers {
            match tier.invalidate_tags(tags) {
                Ok(keys) => removed.extend(keys),
                Err(err) => warn!(tier = tier.name(), error = %err, "tag invalidation failed"),
            }
        }
        let mut counters = self.counters.lock();
        for key in &removed {
            counters.per_key.remove(key);
        }
        counters.invalidations += removed.len() as u64;
        if !removed.is_empty() {
            debug!(count = removed.len(), "cache entries invalidated");
        }
        removed.len()
    }

    /// Drop everything from every tier.
    pub fn clear(&self) {
        for tier in &self.tiers {
            if let Err(err) = tier.clear() {
                warn!(tier = tier.name(), error = %err, "cache clear failed");
            }
        }
        self.counters.lock().per_key.clear();
    }

    /// Hits served for `key` since it was last stored or invalidated.
    ///
    /// Zero once no tier holds the entry any more.
    #[must_use]
    pub fn hit_count(&self, key: &CacheKey) -> u64 {
        let canonical = key.canonical();
        let mut counters = self.counters.lock();
        let Some(&hits) = counters.per_key.get(&canonical) else {
            return 0;
        };
        if self.holds(&canonical) {
            hits
        } else {
            counters.per_key.remove(&canonical);
            0
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let counters = self.counters.lock();
        CacheStats {
            hits: counters.hits,
            misses: counters.misses,
            promotions: counters.promotions,
            invalidations: counters.invalidations,
            evictions: self.tier_evictions(),
            entries: self.tiers.first().map_or(0, |t| t.len()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
