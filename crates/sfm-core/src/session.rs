//! # Engine
//!
//! One handle bundling a shared graph with its memory manager, query cache,
//! query engine and persistence manager, all built from one [`SfmConfig`].
//!
//! ## Backends
//!
//! - `Engine::in_memory`: in-process cache tier and volatile snapshot storage
//! - `Engine::open`: in-process plus redb cache tiers, snapshots on the
//!   filesystem under `persistence.storage_path`
//!
//! The memory manager spills evicted node records into the snapshot backend
//! under `evicted/`, so eviction never loses unsaved changes.
//!
//! There is no global state. Engines sharing a storage path share only
//! stored bytes: spill records are namespaced per engine and cache keys
//! carry the graph instance.

use crate::cache::{CacheInvalidator, TieredCache};
use crate::config::SfmConfig;
use crate::graph::Graph;
use crate::memory::MemoryManager;
use crate::observer::ObserverId;
use crate::persistence::{PersistenceManager, SnapshotMetadata};
use crate::query::QueryEngine;
use crate::rules::{AcceptAll, RuleChecker};
use crate::shared::SharedGraph;
use crate::storage::StorageBackend;
use crate::SfmError;
use std::sync::Arc;
use tracing::info;

/// File name of the redb cache tier when none is configured.
const DEFAULT_CACHE_FILE: &str = "query_cache.redb";

/// Graph engine context.
pub struct Engine {
    config: SfmConfig,
    graph: SharedGraph,
    rules: Arc<dyn RuleChecker>,
    memory: MemoryManager,
    cache: Option<Arc<TieredCache>>,
    invalidator: Option<ObserverId>,
    query: QueryEngine,
    persistence: PersistenceManager,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("graph", &self.graph)
            .field("memory", &self.memory)
            .field("cache", &self.cache)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Volatile engine: nothing touches the filesystem.
    pub fn in_memory(config: SfmConfig) -> Result<Self, SfmError> {
        config.validate()?;
        let cache = if config.cache.enabled {
            Some(TieredCache::in_memory(&config.cache)?)
        } else {
            None
        };
        let persistence = PersistenceManager::in_memory(config.persistence.clone());
        Self::assemble(config, cache, persistence)
    }

    /// Disk-backed engine rooted at `config.persistence.storage_path`.
    pub fn open(config: SfmConfig) -> Result<Self, SfmError> {
        config.validate()?;
        let persistence = PersistenceManager::open(config.persistence.clone())?;
        let cache = if config.cache.enabled {
            let mut cache_config = config.cache.clone();
            if cache_config.shared_tier_path.is_none() {
                cache_config.shared_tier_path =
                    Some(config.persistence.storage_path.join(DEFAULT_CACHE_FILE));
            }
            Some(TieredCache::from_config(&cache_config)?)
        } else {
            None
        };
        Self::assemble(config, cache, persistence)
    }

    /// Engine over a caller-supplied snapshot backend with an in-process
    /// cache.
    pub fn with_backend(
        config: SfmConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, SfmError> {
        config.validate()?;
        let cache = if config.cache.enabled {
            Some(TieredCache::in_memory(&config.cache)?)
        } else {
            None
        };
        let persistence = PersistenceManager::new(backend, config.persistence.clone());
        Self::assemble(config, cache, persistence)
    }

    fn assemble(
        config: SfmConfig,
        cache: Option<TieredCache>,
        persistence: PersistenceManager,
    ) -> Result<Self, SfmError> {
        let graph = SharedGraph::default();
        let cache = cache.map(Arc::new);
        let invalidator = cache.as_ref().map(|cache| {
            graph
                .write()
                .add_observer(Arc::new(CacheInvalidator::new(Arc::clone(cache))))
        });
        let memory = MemoryManager::attach_with_spill(
            graph.clone(),
            config.memory.clone(),
            Arc::clone(persistence.backend()),
        )?;
        let query = QueryEngine::new(graph.clone(), cache.clone(), config.query.clone());
        info!(
            storage = persistence.backend().name(),
            cache_tiers = ?cache.as_ref().map(|c| c.tier_names()),
            "engine ready"
        );
        Ok(Self {
            config,
            graph,
            rules: Arc::new(AcceptAll),
            memory,
            cache,
            invalidator,
            query,
            persistence,
        })
    }

    /// Install a domain rule checker for the live graph and future restores.
    #[must_use]
    pub fn with_rules(mut self, rules: Arc<dyn RuleChecker>) -> Self {
        self.graph.write().set_rules(Arc::clone(&rules));
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &SfmConfig {
        &self.config
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// `None` when caching is disabled.
    pub fn cache(&self) -> Option<&Arc<TieredCache>> {
        self.cache.as_ref()
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    /// Save the live graph as the next version of `graph_id`.
    ///
    /// The snapshot is taken under the read lock. Fails with `NotResident`
    /// while nodes are evicted; see [`MemoryManager::rehydrate_all`].
    pub fn save(&self, graph_id: &str) -> Result<SnapshotMetadata, SfmError> {
        let snapshot = self.graph.read().snapshot()?;
        self.persistence.save_snapshot(graph_id, &snapshot)
    }

    /// Replace the live graph with a saved version (latest when `None`).
    ///
    /// The loaded graph is fully validated before the swap, so a failed
    /// restore leaves the live graph untouched. Cached results are dropped
    /// and memory tracking is rebuilt.
    pub fn restore(
        &self,
        graph_id: &str,
        version: Option<u64>,
    ) -> Result<SnapshotMetadata, SfmError> {
        let (metadata, snapshot) = self.persistence.load_snapshot(graph_id, version)?;
        let loaded = Graph::from_snapshot(snapshot, Arc::clone(&self.rules))?;
        self.graph.write().replace_contents(loaded);
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.memory.resync()?;
        self.memory.check()?;
        info!(graph_id, version = metadata.version, "graph restored");
        Ok(metadata)
    }

    /// Serve nodes from a saved version when they are read but not resident.
    ///
    /// Evicted nodes are still reloaded from the spill store first; the
    /// saved version only supplies nodes the live graph never held.
    pub fn enable_lazy_loading(
        &self,
        graph_id: &str,
        version: Option<u64>,
    ) -> Result<(), SfmError> {
        let loader = self.persistence.node_loader(graph_id, version)?;
        self.memory.set_loader(loader);
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(id) = self.invalidator.take() {
            self.graph.write().remove_observer(id);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
