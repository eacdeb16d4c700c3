//! # sfm-core
//!
//! Embedded graph engine for Social Fabric Matrix (SFM) models.
//!
//! A typed property graph of socio-economic entities (actors, institutions,
//! policies, resources, flows, ...) connected by typed, weighted
//! relationships, with:
//! - one identity namespace across every node kind, and referential
//!   integrity enforced on every mutation
//! - pluggable domain rules consulted on relationship insertion
//! - a bounded working set with reversible eviction and lazy reloading
//! - a tiered query-result cache kept coherent through graph observers
//! - analytic queries (paths, centrality, communities, flow tracing)
//! - versioned, checksummed snapshots with backup and restore
//!
//! ## Architectural Constraints
//!
//! - Pure Rust library: no async, no network dependencies
//! - One [`SharedGraph`] per engine; mutations are serialized by its write
//!   lock, queries and snapshots share its read lock
//! - Deterministic output: ties are always broken by identity order
//! - The library logs through `tracing` and never installs a subscriber

// =============================================================================
// MODULES
// =============================================================================

pub mod cache;
pub mod config;
pub mod formats;
pub mod graph;
pub mod memory;
pub mod observer;
pub mod persistence;
pub mod primitives;
pub mod query;
pub mod registry;
pub mod rules;
pub mod session;
pub mod shared;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Actor, AttrValue, BeliefSystem, DataQuality, Endpoint, Flow, FlowNature, FlowType,
    GovernanceStructure, Indicator, Institution, InstitutionLayer, Metadata, Node, NodeBase,
    NodeId, NodeKind, Policy, Process, Relationship, RelationshipId, RelationshipKind, Resource,
    ResourceType, SfmError, TechnologySystem,
};

// =============================================================================
// RE-EXPORTS: Graph Engine
// =============================================================================

pub use graph::{Direction, Graph, GraphFingerprint, GraphSnapshot, Neighbors};
pub use observer::{GraphEvent, GraphObserver, ObserverError, ObserverId};
pub use registry::{KindIter, TypeRegistry};
pub use rules::{AcceptAll, RuleChecker, RuleTable, RuleVerdict};
pub use shared::SharedGraph;

// =============================================================================
// RE-EXPORTS: Memory, Cache and Query
// =============================================================================

pub use cache::{CacheInvalidator, CacheKey, CacheStats, CacheTag, CacheTier, TieredCache};
pub use memory::{
    AccessRecord, EvictionPolicy, LargestFirstPolicy, LfuPolicy, LruPolicy, MemoryManager,
    MemoryStats, NodeLoader, OldestFirstPolicy, SizeEstimator, StructuralEstimator,
};
pub use query::{
    CentralityMeasure, CommunityAlgorithm, FlowPath, FlowTrace, PathMode, QueryEngine, QueryType,
};

// =============================================================================
// RE-EXPORTS: Persistence (from formats, storage and persistence modules)
// =============================================================================

pub use formats::{SnapshotHeader, checksum, snapshot_from_bytes, snapshot_to_bytes};
pub use persistence::{
    BackupInfo, PersistenceManager, RetryPolicy, SnapshotMetadata, StorageStats,
};
pub use storage::{FsBackend, MemoryBackend, RedbBackend, StorageBackend};

// =============================================================================
// RE-EXPORTS: Configuration and Engine
// =============================================================================

pub use config::{CacheConfig, MemoryConfig, PersistenceConfig, QueryConfig, SfmConfig};
pub use session::Engine;
