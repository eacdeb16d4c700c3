//! # Type Registry
//!
//! One homogeneous, identity-keyed collection per node kind, plus a global
//! identity -> kind index so cross-kind lookup never scans every collection.
//!
//! Identities share ONE namespace across all kinds.

use crate::{Node, NodeId, NodeKind, SfmError};
use std::collections::HashMap;

/// Owns every resident node instance, partitioned by kind.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    collections: HashMap<NodeKind, HashMap<NodeId, Node>>,
    index: HashMap<NodeId, NodeKind>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    ///
    /// Fails with `DuplicateIdentity` if the identity is present in any kind.
    pub fn register(&mut self, node: Node) -> Result<(), SfmError> {
        let id = node.id();
        if let Some(existing) = self.index.get(&id) {
            return Err(SfmError::DuplicateIdentity {
                id,
                existing: *existing,
            });
        }
        let kind = node.kind();
        self.index.insert(id, kind);
        self.collections.entry(kind).or_default().insert(id, node);
        Ok(())
    }

    /// Look up a node in any kind.
    pub fn get(&self, id: NodeId) -> Result<&Node, SfmError> {
        self.index
            .get(&id)
            .and_then(|kind| self.collections.get(kind))
            .and_then(|collection| collection.get(&id))
            .ok_or(SfmError::NodeNotFound { id, op: "get" })
    }

    /// Replace a registered node in place. Identity and kind must match.
    pub(crate) fn replace(&mut self, node: Node) -> Result<Node, SfmError> {
        let id = node.id();
        let kind = *self
            .index
            .get(&id)
            .ok_or(SfmError::NodeNotFound { id, op: "replace" })?;
        if kind != node.kind() {
            return Err(SfmError::InvalidValue {
                field: "kind",
                reason: format!("node {id} is a {kind}, not a {}", node.kind()),
            });
        }
        self.collections
            .get_mut(&kind)
            .and_then(|collection| collection.insert(id, node))
            .ok_or(SfmError::NodeNotFound { id, op: "replace" })
    }

    /// Kind of a registered node, without touching the collections.
    #[must_use]
    pub fn kind_of(&self, id: NodeId) -> Option<NodeKind> {
        self.index.get(&id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    /// All nodes of one kind.
    ///
    /// The returned iterator is a snapshot taken at call time: it is finite,
    /// cloning it restarts the walk, and later mutation does not affect it.
    pub fn get_by_kind(&self, kind: NodeKind) -> KindIter {
        let nodes = self
            .collections
            .get(&kind)
            .map(|collection| collection.values().cloned().collect())
            .unwrap_or_default();
        KindIter {
            nodes,
            position: 0,
        }
    }

    /// Remove a node from its collection and the global index.
    pub fn remove(&mut self, id: NodeId) -> Result<Node, SfmError> {
        let kind = self
            .index
            .remove(&id)
            .ok_or(SfmError::NodeNotFound { id, op: "remove" })?;
        self.collections
            .get_mut(&kind)
            .and_then(|collection| collection.remove(&id))
            .ok_or(SfmError::NodeNotFound { id, op: "remove" })
    }

    /// Iterate every node in every kind (no ordering guarantee).
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.collections.values().flat_map(HashMap::values)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of nodes per kind. Kinds with no nodes are omitted.
    #[must_use]
    pub fn counts_by_kind(&self) -> Vec<(NodeKind, usize)> {
        let mut counts: Vec<_> = self
            .collections
            .iter()
            .filter(|(_, collection)| !collection.is_empty())
            .map(|(kind, collection)| (*kind, collection.len()))
            .collect();
        counts.sort_unstable();
        counts
    }

    pub fn clear(&mut self) {
        self.collections.clear();
        self.index.clear();
    }
}

/// Restartable, point-in-time view over the nodes of one kind.
#[derive(Debug, Clone)]
pub struct KindIter {
    nodes: Vec<Node>,
    position: usize,
}

impl Iterator for KindIter {
    type Item = Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.nodes.get(self.position).cloned();
        if node.is_some() {
            self.position += 1;
        }
        node
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.nodes.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for KindIter {}

// =============================================================================
// TESTS
// =============================================================================
