//! # Memory Manager
//!
//! Bounds the resident working set of a [`SharedGraph`] without losing data:
//! evicted nodes stay part of the logical graph and can be reloaded.
//!
//! ## Reloading
//!
//! A non-resident node is looked up in two places, in order:
//!
//! 1. The spill store, when one is attached. Every eviction writes the
//!    node's current record there before dropping it, so a reload returns
//!    exactly the pre-eviction value, including changes made after the
//!    last save.
//! 2. The [`NodeLoader`], when one is registered.
//!
//! Without a spill store the loader is the only source, and a node evicted
//! with no loader registered cannot be read back.
//!
//! ## Accounting
//!
//! - Each resident node has an [`AccessRecord`]: access count, last access
//!   (a logical clock tick) and an estimated byte size.
//! - Sizes come from a pluggable [`SizeEstimator`]; the default is a
//!   structural heuristic, not a byte-exact measurement.
//! - Tracking is kept current by an observer registered on the graph.
//!
//! ## Eviction
//!
//! Exceeding the limit never fails a graph mutation. It is detected by
//! `check` (or `force_cleanup`), which evicts policy-ordered candidates down
//! to the low-water mark. Only when eviction cannot get usage under the hard
//! limit (pinned nodes) does an operation fail with `Capacity`.
//!
//! ## Locking
//!
//! Graph lock first, tracking lock second. The tracking lock is never held
//! while calling a loader or taking the graph lock.
//!
//! Loaders and spill stores are called while the graph write lock is held.
//! A [`NodeLoader`] must not touch the [`SharedGraph`] it serves; doing so
//! deadlocks.

use crate::config::MemoryConfig;
use crate::graph::Graph;
use crate::observer::{GraphEvent, GraphObserver, ObserverError, ObserverId};
use crate::primitives::{EVICTION_BATCH_SIZE, SPILL_PREFIX};
use crate::shared::SharedGraph;
use crate::storage::StorageBackend;
use crate::{Node, NodeId, SfmError};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// PLUGGABLE STRATEGIES
// =============================================================================

/// Estimates the in-memory footprint of a node.
pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, node: &Node) -> usize;
}

impl<F> SizeEstimator for F
where
    F: Fn(&Node) -> usize + Send + Sync,
{
    fn estimate(&self, node: &Node) -> usize {
        self(node)
    }
}

/// Default estimator: inline size plus owned strings and metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralEstimator;

impl SizeEstimator for StructuralEstimator {
    fn estimate(&self, node: &Node) -> usize {
        node.estimated_size()
    }
}

/// Reconstructs a node that is not resident.
///
/// Called with the graph write lock held: an implementation must not read
/// or mutate the [`SharedGraph`] the manager is attached to.
pub trait NodeLoader: Send + Sync {
    fn load(&self, id: NodeId) -> Option<Node>;
}

impl<F> NodeLoader for F
where
    F: Fn(NodeId) -> Option<Node> + Send + Sync,
{
    fn load(&self, id: NodeId) -> Option<Node> {
        self(id)
    }
}

/// Per-node tracking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    pub access_count: u64,
    /// Logical clock tick at which the node became resident.
    pub admitted: u64,
    /// Logical clock tick of the most recent access.
    pub last_access: u64,
    pub size_bytes: usize,
}

/// Orders eviction candidates.
///
/// Receives the records of every evictable (resident, unpinned) node and
/// returns identities in the order they should be evicted.
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn candidates(&self, records: &[(NodeId, AccessRecord)]) -> Vec<NodeId>;
}

/// Least recently used first; ties broken by lowest access count, then id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn candidates(&self, records: &[(NodeId, AccessRecord)]) -> Vec<NodeId> {
        let mut sorted = records.to_vec();
        sorted.sort_by_key(|(id, r)| (r.last_access, r.access_count, *id));
        sorted.into_iter().map(|(id, _)| id).collect()
    }
}

/// Least frequently used first; ties broken by oldest access, then id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuPolicy;

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn candidates(&self, records: &[(NodeId, AccessRecord)]) -> Vec<NodeId> {
        let mut sorted = records.to_vec();
        sorted.sort_by_key(|(id, r)| (r.access_count, r.last_access, *id));
        sorted.into_iter().map(|(id, _)| id).collect()
    }
}

/// Largest estimated size first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFirstPolicy;

impl EvictionPolicy for LargestFirstPolicy {
    fn name(&self) -> &'static str {
        "largest_first"
    }

    fn candidates(&self, records: &[(NodeId, AccessRecord)]) -> Vec<NodeId> {
        let mut sorted = records.to_vec();
        sorted.sort_by_key(|(id, r)| (Reverse(r.size_bytes), r.last_access, *id));
        sorted.into_iter().map(|(id, _)| id).collect()
    }
}

/// Earliest admitted first: nodes that have been resident longest go first.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestFirstPolicy;

impl EvictionPolicy for OldestFirstPolicy {
    fn name(&self) -> &'static str {
        "oldest_first"
    }

    fn candidates(&self, records: &[(NodeId, AccessRecord)]) -> Vec<NodeId> {
        let mut sorted = records.to_vec();
        sorted.sort_by_key(|(id, r)| (r.admitted, *id));
        sorted.into_iter().map(|(id, _)| id).collect()
    }
}

// =============================================================================
// SPILL STORE
// =============================================================================

/// Write-back copies of evicted node records, namespaced per manager.
struct SpillStore {
    backend: Arc<dyn StorageBackend>,
    dir: String,
}

impl SpillStore {
    fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            dir: format!("{SPILL_PREFIX}/{}", Uuid::new_v4().simple()),
        }
    }

    fn path(&self, id: NodeId) -> String {
        format!("{}/{id}", self.dir)
    }

    fn put(&self, node: &Node) -> Result<(), SfmError> {
        let bytes =
            postcard::to_stdvec(node).map_err(|e| SfmError::Serialization(e.to_string()))?;
        self.backend.write(&self.path(node.id()), &bytes)
    }

    fn get(&self, id: NodeId) -> Result<Option<Node>, SfmError> {
        let Some(bytes) = self.backend.read(&self.path(id))? else {
            return Ok(None);
        };
        postcard::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| SfmError::Serialization(format!("spilled node {id}: {e}")))
    }

    fn discard(&self, id: NodeId) {
        if let Err(err) = self.backend.delete(&self.path(id)) {
            warn!(node = %id, error = %err, "failed to discard spilled node");
        }
    }

    /// Remove every record written by this manager.
    fn purge(&self) -> Result<(), SfmError> {
        for path in self.backend.list(&format!("{}/", self.dir))? {
            self.backend.delete(&path)?;
        }
        Ok(())
    }
}

// =============================================================================
// TRACKING STATE
// =============================================================================

/// Graph-wide usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub resident_nodes: usize,
    pub non_resident_nodes: usize,
    pub estimated_bytes: usize,
    pub limit_bytes: usize,
    pub low_water_bytes: usize,
    pub pinned_nodes: usize,
    pub eviction_count: u64,
}

struct Tracking {
    records: HashMap<NodeId, AccessRecord>,
    pinned: HashSet<NodeId>,
    clock: u64,
    total_bytes: usize,
    eviction_count: u64,
    config: MemoryConfig,
    estimator: Arc<dyn SizeEstimator>,
    policy: Arc<dyn EvictionPolicy>,
    loader: Option<Arc<dyn NodeLoader>>,
}

impl Tracking {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, node: &Node) {
        let size = self.estimator.estimate(node);
        let tick = self.tick();
        let previous = self.records.insert(
            node.id(),
            AccessRecord {
                access_count: 1,
                admitted: tick,
                last_access: tick,
                size_bytes: size,
            },
        );
        if let Some(previous) = previous {
            self.total_bytes -= previous.size_bytes;
        }
        self.total_bytes += size;
    }

    fn resize(&mut self, node: &Node) {
        let size = self.estimator.estimate(node);
        if let Some(record) = self.records.get_mut(&node.id()) {
            self.total_bytes = self.total_bytes - record.size_bytes + size;
            record.size_bytes = size;
        }
    }

    fn remove(&mut self, id: NodeId) -> Option<AccessRecord> {
        let record = self.records.remove(&id)?;
        self.total_bytes -= record.size_bytes;
        Some(record)
    }

    fn touch(&mut self, id: NodeId) -> bool {
        let tick = self.tick();
        match self.records.get_mut(&id) {
            Some(record) => {
                record.access_count += 1;
                record.last_access = tick;
                true
            }
            None => false,
        }
    }

    fn pinned_bytes(&self) -> usize {
        self.pinned
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| r.size_bytes)
            .sum()
    }

    fn evictable(&self) -> Vec<(NodeId, AccessRecord)> {
        self.records
            .iter()
            .filter(|(id, _)| !self.pinned.contains(id))
            .map(|(id, r)| (*id, *r))
            .collect()
    }
}

/// Keeps tracking in step with graph mutations.
struct TrackingObserver {
    state: Arc<Mutex<Tracking>>,
    spill: Option<Arc<SpillStore>>,
}

impl GraphObserver for TrackingObserver {
    fn on_event(&self, event: &GraphEvent) -> Result<(), ObserverError> {
        match event {
            GraphEvent::NodeAdded(node) => self.state.lock().insert(node),
            GraphEvent::NodeUpdated { current, .. } => self.state.lock().resize(current),
            GraphEvent::NodeRemoved { id, node, .. } => {
                {
                    let mut state = self.state.lock();
                    state.remove(*id);
                    state.pinned.remove(id);
                }
                if let (None, Some(spill)) = (node, &self.spill) {
                    spill.discard(*id);
                }
            }
            GraphEvent::RelationshipAdded(_) | GraphEvent::RelationshipRemoved(_) => {}
        }
        Ok(())
    }
}

// =============================================================================
// MEMORY MANAGER
// =============================================================================

/// Memory manager attached to one shared graph.
pub struct MemoryManager {
    graph: SharedGraph,
    state: Arc<Mutex<Tracking>>,
    spill: Option<Arc<SpillStore>>,
    observer: ObserverId,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Attach to `graph`, seeding records for every resident node.
    ///
    /// Evicted nodes can only be reloaded through a registered loader.
    pub fn attach(graph: SharedGraph, config: MemoryConfig) -> Result<Self, SfmError> {
        Self::build(graph, config, None)
    }

    /// Attach with a spill store on `backend`: every evicted record is
    /// written there first, so eviction never loses a node.
    pub fn attach_with_spill(
        graph: SharedGraph,
        config: MemoryConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, SfmError> {
        Self::build(graph, config, Some(Arc::new(SpillStore::new(backend))))
    }

    fn build(
        graph: SharedGraph,
        config: MemoryConfig,
        spill: Option<Arc<SpillStore>>,
    ) -> Result<Self, SfmError> {
        if !(config.low_water_ratio > 0.0 && config.low_water_ratio <= 1.0) {
            return Err(SfmError::InvalidValue {
                field: "low_water_ratio",
                reason: format!("{} is outside (0, 1]", config.low_water_ratio),
            });
        }
        let state = Arc::new(Mutex::new(Tracking {
            records: HashMap::new(),
            pinned: HashSet::new(),
            clock: 0,
            total_bytes: 0,
            eviction_count: 0,
            config,
            estimator: Arc::new(StructuralEstimator),
            policy: Arc::new(LruPolicy),
            loader: None,
        }));

        let observer = {
            let mut guard = graph.write();
            Self::seed(&guard, &state);
            guard.add_observer(Arc::new(TrackingObserver {
                state: Arc::clone(&state),
                spill: spill.clone(),
            }))
        };
        Ok(Self {
            graph,
            state,
            spill,
            observer,
        })
    }

    fn seed(graph: &Graph, state: &Mutex<Tracking>) {
        let mut ids: Vec<_> = graph.nodes().map(Node::id).collect();
        ids.sort_unstable();
        let mut state = state.lock();
        state.records.clear();
        state.total_bytes = 0;
        for id in ids {
            if let Ok(node) = graph.get_node(id) {
                state.insert(node);
            }
        }
        let Tracking {
            pinned, records, ..
        } = &mut *state;
        pinned.retain(|id| records.contains_key(id));
    }

    /// Rebuild tracking from the graph's current resident set.
    ///
    /// Needed after the graph contents are replaced wholesale. Spilled
    /// records of nodes that are no longer evicted are discarded.
    pub fn resync(&self) -> Result<(), SfmError> {
        let guard = self.graph.read();
        Self::seed(&guard, &self.state);
        if let Some(spill) = &self.spill {
            if guard.non_resident_count() == 0 {
                spill.purge()?;
            }
        }
        Ok(())
    }

    /// True when evicted records are written back before being dropped.
    #[must_use]
    pub fn has_spill_store(&self) -> bool {
        self.spill.is_some()
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    pub fn set_policy(&self, policy: impl EvictionPolicy + 'static) {
        self.state.lock().policy = Arc::new(policy);
    }

    /// Replace the size estimator and re-estimate every tracked node.
    pub fn set_size_estimator(&self, estimator: impl SizeEstimator + 'static) {
        let guard = self.graph.read();
        let mut state = self.state.lock();
        state.estimator = Arc::new(estimator);
        let ids: Vec<_> = state.records.keys().copied().collect();
        for id in ids {
            if let Ok(node) = guard.get_node(id) {
                state.resize(node);
            }
        }
    }

    pub fn set_loader(&self, loader: impl NodeLoader + 'static) {
        self.state.lock().loader = Some(Arc::new(loader));
    }

    pub fn clear_loader(&self) {
        self.state.lock().loader = None;
    }

    /// Set the hard limit, then evict if usage exceeds it.
    ///
    /// Fails with `Capacity` (and keeps the old limit) when pinned nodes alone
    /// exceed `bytes`. Returns the number of nodes evicted.
    pub fn set_memory_limit(&self, bytes: usize) -> Result<usize, SfmError> {
        {
            let mut state = self.state.lock();
            let pinned = state.pinned_bytes();
            if pinned > bytes {
                return Err(SfmError::Capacity {
                    limit: bytes,
                    required: pinned,
                });
            }
            state.config.limit_bytes = bytes;
        }
        info!(limit_bytes = bytes, "memory limit updated");
        self.check()
    }

    // -------------------------------------------------------------------------
    // Access
    // -------------------------------------------------------------------------

    /// Fetch a node, reloading it if it is not resident.
    ///
    /// A reloaded node counts as a fresh access. Fails with `NodeNotFound`
    /// when neither the spill store nor the loader can supply it.
    pub fn get_node(&self, id: NodeId) -> Result<Node, SfmError> {
        {
            let guard = self.graph.read();
            if let Ok(node) = guard.get_node(id) {
                let node = node.clone();
                self.state.lock().touch(id);
                return Ok(node);
            }
        }

        let mut guard = self.graph.write();
        if let Ok(node) = guard.get_node(id) {
            let node = node.clone();
            self.state.lock().touch(id);
            return Ok(node);
        }

        let Some(node) = self.recall(id, guard.contains_node(id))? else {
            return Err(SfmError::NodeNotFound { id, op: "get_node" });
        };

        if guard.contains_node(id) {
            guard.reinstate_node(node.clone())?;
            self.state.lock().insert(&node);
            if let Some(spill) = &self.spill {
                spill.discard(id);
            }
        } else {
            // The tracking observer records the insertion.
            guard.add_node(node.clone())?;
        }
        debug!(node = %id, "lazily loaded node");
        Ok(node)
    }

    /// Find the record of a node that is not resident: spill store first
    /// (only for nodes the graph knows as evicted), then the loader.
    fn recall(&self, id: NodeId, evicted: bool) -> Result<Option<Node>, SfmError> {
        if evicted {
            if let Some(node) = self.spill.as_ref().map(|s| s.get(id)).transpose()?.flatten() {
                return Ok(Some(node));
            }
        }
        let Some(loader) = self.state.lock().loader.clone() else {
            return Ok(None);
        };
        match loader.load(id) {
            Some(node) if node.id() != id => Err(SfmError::InvalidValue {
                field: "id",
                reason: format!("loader returned node {} for {id}", node.id()),
            }),
            loaded => Ok(loaded),
        }
    }

    /// Write the node's record to the spill store (if any), then evict it.
    fn spill_and_evict(&self, graph: &mut Graph, id: NodeId) -> Result<(), SfmError> {
        if let Some(spill) = &self.spill {
            spill.put(graph.get_node(id)?)?;
        }
        graph.evict_node(id)?;
        let mut state = self.state.lock();
        state.remove(id);
        state.eviction_count += 1;
        Ok(())
    }

    /// Count an access to a resident node. Returns false if untracked.
    pub fn record_access(&self, id: NodeId) -> bool {
        self.state.lock().touch(id)
    }

    #[must_use]
    pub fn access_record(&self, id: NodeId) -> Option<AccessRecord> {
        self.state.lock().records.get(&id).copied()
    }

    /// Exclude a resident node from eviction.
    pub fn pin(&self, id: NodeId) -> Result<(), SfmError> {
        let mut state = self.state.lock();
        if !state.records.contains_key(&id) {
            return Err(SfmError::NodeNotFound { id, op: "pin" });
        }
        state.pinned.insert(id);
        Ok(())
    }

    pub fn unpin(&self, id: NodeId) -> bool {
        self.state.lock().pinned.remove(&id)
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    /// Evict one node. Pinned nodes are refused.
    ///
    /// A failed spill write leaves the node resident.
    pub fn evict(&self, id: NodeId) -> Result<(), SfmError> {
        let mut guard = self.graph.write();
        if self.state.lock().pinned.contains(&id) {
            return Err(SfmError::InvalidValue {
                field: "id",
                reason: format!("node {id} is pinned"),
            });
        }
        self.spill_and_evict(&mut guard, id)
    }

    /// Evict down to the low-water mark if usage exceeds the hard limit.
    ///
    /// Returns the number of nodes evicted (zero when under the limit).
    pub fn check(&self) -> Result<usize, SfmError> {
        let mut guard = self.graph.write();
        let (usage, limit) = {
            let state = self.state.lock();
            (state.total_bytes, state.config.limit_bytes)
        };
        if usage <= limit {
            return Ok(0);
        }
        self.cleanup_locked(&mut guard)
    }

    /// Evict down to the low-water mark regardless of current usage.
    pub fn force_cleanup(&self) -> Result<usize, SfmError> {
        let mut guard = self.graph.write();
        self.cleanup_locked(&mut guard)
    }

    fn cleanup_locked(&self, graph: &mut Graph) -> Result<usize, SfmError> {
        let (candidates, target, policy) = {
            let state = self.state.lock();
            let policy = Arc::clone(&state.policy);
            (
                policy.candidates(&state.evictable()),
                state.config.low_water_bytes(),
                policy.name(),
            )
        };

        let mut evicted = 0;
        for batch in candidates.chunks(EVICTION_BATCH_SIZE) {
            for id in batch {
                if self.state.lock().total_bytes <= target {
                    break;
                }
                match self.spill_and_evict(graph, *id) {
                    Ok(()) => evicted += 1,
                    Err(err) => warn!(node = %id, error = %err, "eviction skipped"),
                }
            }
            if self.state.lock().total_bytes <= target {
                break;
            }
        }

        let state = self.state.lock();
        if evicted > 0 {
            info!(
                evicted,
                policy,
                estimated_bytes = state.total_bytes,
                "memory cleanup"
            );
        }
        if state.total_bytes > state.config.limit_bytes {
            return Err(SfmError::Capacity {
                limit: state.config.limit_bytes,
                required: state.total_bytes,
            });
        }
        Ok(evicted)
    }

    /// Reload every non-resident node from the spill store or the loader.
    ///
    /// All nodes are loaded before any is reinstated, so a missing node
    /// leaves the graph unchanged. Returns the number reinstated.
    pub fn rehydrate_all(&self) -> Result<usize, SfmError> {
        let mut guard = self.graph.write();
        self.rehydrate_locked(&mut guard)
    }

    fn rehydrate_locked(&self, graph: &mut Graph) -> Result<usize, SfmError> {
        let missing = graph.non_resident_ids();
        if missing.is_empty() {
            return Ok(0);
        }
        let mut loaded = Vec::with_capacity(missing.len());
        for id in &missing {
            match self.recall(*id, true)? {
                Some(node) => loaded.push(node),
                None => {
                    return Err(SfmError::NodeNotFound {
                        id: *id,
                        op: "rehydrate_all",
                    });
                }
            }
        }
        for node in &loaded {
            graph.reinstate_node(node.clone())?;
            self.state.lock().insert(node);
        }
        if let Some(spill) = &self.spill {
            spill.purge()?;
        }
        info!(count = loaded.len(), "rehydrated evicted nodes");
        Ok(loaded.len())
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let non_resident = self.graph.read().non_resident_count();
        let state = self.state.lock();
        MemoryStats {
            resident_nodes: state.records.len(),
            non_resident_nodes: non_resident,
            estimated_bytes: state.total_bytes,
            limit_bytes: state.config.limit_bytes,
            low_water_bytes: state.config.low_water_bytes(),
            pinned_nodes: state.pinned.len(),
            eviction_count: state.eviction_count,
        }
    }
}

impl Drop for MemoryManager {
    /// Spilled records live only as long as the manager, so they are
    /// brought back into the graph before it is detached.
    fn drop(&mut self) {
        let mut guard = self.graph.write();
        if self.spill.is_some() {
            if let Err(err) = self.rehydrate_locked(&mut guard) {
                warn!(error = %err, "spilled nodes could not be reinstated on detach");
            }
        }
        guard.remove_observer(self.observer);
    }
}

// =============================================================================
// TESTS
// =============================================================================
