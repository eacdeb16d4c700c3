//! # Core Type Definitions
//!
//! This module contains the entity model shared by every subsystem:
//! - Identifiers (`NodeId`, `RelationshipId`)
//! - Free-form metadata values (`AttrValue`, `Metadata`)
//! - Node records (`Node`, `NodeKind`, one struct per kind)
//! - Relationship records (`Relationship`, `RelationshipKind`)
//! - Error types (`SfmError`)
//!
//! ## Identity Guarantees
//!
//! - Node identities live in ONE namespace across all kinds.
//! - Identifiers implement `Ord`; identity order is the tie-break
//!   everywhere a deterministic ordering is required.

mod node;
mod relationship;

pub use node::{
    Actor, BeliefSystem, DataQuality, Flow, FlowNature, FlowType, GovernanceStructure, Indicator,
    Institution, InstitutionLayer, Node, NodeBase, NodeKind, Policy, Process, Resource,
    ResourceType, TechnologySystem,
};
pub use relationship::{Relationship, RelationshipKind};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identity of a node. Unique across every node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an identity from a fixed 128-bit value (tests, imports).
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipId(pub Uuid);

impl RelationshipId {
    /// Generate a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an identity from a fixed 128-bit value (tests, imports).
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for RelationshipId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// METADATA VALUES
// =============================================================================

/// A free-form metadata value.
///
/// Closed set of variants so that metadata survives every codec the engine
/// uses (postcard snapshots, JSON sidecars).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum AttrValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<AttrValue>),
}

impl AttrValue {
    /// Rough heap footprint, used by size estimation.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::List(items) => {
                items.len() * std::mem::size_of::<AttrValue>()
                    + items.iter().map(AttrValue::heap_size).sum::<usize>()
            }
            _ => 0,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Metadata mapping shared by nodes and relationships.
pub type Metadata = BTreeMap<String, AttrValue>;

/// Check that a confidence-like scalar is a finite number in [0, 1].
pub(crate) fn check_unit_interval(field: &'static str, value: f64) -> Result<(), SfmError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SfmError::InvalidValue {
            field,
            reason: format!("{value} is outside [0, 1]"),
        })
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Which end of a relationship an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Source,
    Target,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// Errors that can occur in the SFM engine.
///
/// - Invariant violations are always surfaced, never auto-corrected
/// - Every variant carries the identities and kinds needed to build an
///   actionable message without consulting logs
/// - The engine never panics; all errors are recoverable
#[derive(Debug, Error)]
pub enum SfmError {
    /// The requested node is not resident and could not be loaded.
    #[error("node {id} not found ({op})")]
    NodeNotFound { id: NodeId, op: &'static str },

    /// The requested relationship does not exist.
    #[error("relationship {id} not found ({op})")]
    RelationshipNotFound {
        id: RelationshipId,
        op: &'static str,
    },

    /// No snapshot exists for the graph id (and version, when given).
    #[error("snapshot not found: graph '{graph_id}' version {version:?}")]
    SnapshotNotFound {
        graph_id: String,
        version: Option<u64>,
    },

    /// The backup path does not exist.
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    /// A node with this identity is already registered (in any kind).
    #[error("duplicate identity {id}: already registered as {existing}")]
    DuplicateIdentity { id: NodeId, existing: NodeKind },

    /// A relationship with this identity is already stored.
    #[error("duplicate relationship identity {0}")]
    DuplicateRelationship(RelationshipId),

    /// A relationship endpoint does not resolve to a node.
    #[error("relationship {relationship} references missing {endpoint} node {missing}")]
    DanglingReference {
        relationship: RelationshipId,
        missing: NodeId,
        endpoint: Endpoint,
    },

    /// The domain rule checker rejected the (kind, source, target) triple.
    #[error("{kind} is not allowed from {source_kind} to {target_kind}: {reason}")]
    IncompatibleRelationship {
        kind: RelationshipKind,
        source_kind: NodeKind,
        target_kind: NodeKind,
        reason: String,
    },

    /// A non-cascading removal was blocked by incident relationships.
    #[error("node {id} is still referenced by {incident} relationship(s)")]
    NodeInUse { id: NodeId, incident: usize },

    /// Stored data failed verification.
    #[error("integrity check failed for graph '{graph_id}' version {version}: {detail}")]
    Integrity {
        graph_id: String,
        version: u64,
        detail: String,
    },

    /// The memory ceiling cannot be met even after eviction.
    #[error("memory limit of {limit} bytes cannot be satisfied ({required} bytes required)")]
    Capacity { limit: usize, required: usize },

    /// A field value violates its documented domain.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// The operation needs every node resident in memory.
    #[error("{count} node(s) are evicted; reload them first")]
    NotResident { count: usize },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SfmError {
    /// True for every "identity or version absent" variant.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound { .. }
                | Self::RelationshipNotFound { .. }
                | Self::SnapshotNotFound { .. }
                | Self::BackupNotFound(_)
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_order_by_value() {
        let a = NodeId::from_u128(1);
        let b = NodeId::from_u128(2);
        assert!(a < b);
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn unit_interval_rejects_out_of_range() {
        assert!(check_unit_interval("certainty", 0.0).is_ok());
        assert!(check_unit_interval("certainty", 1.0).is_ok());
        assert!(check_unit_interval("certainty", 1.5).is_err());
        assert!(check_unit_interval("certainty", f64::NAN).is_err());
    }

    #[test]
    fn not_found_classification() {
        let err = SfmError::NodeNotFound {
            id: NodeId::from_u128(7),
            op: "get_node",
        };
        assert!(err.is_not_found());
        assert!(!SfmError::NodeInUse {
            id: NodeId::from_u128(7),
            incident: 1
        }
        .is_not_found());
    }

    #[test]
    fn attr_value_heap_size_counts_text() {
        let value = AttrValue::List(vec![AttrValue::from("abcd"), AttrValue::Int(3)]);
        assert!(value.heap_size() >= 4);
    }
}
