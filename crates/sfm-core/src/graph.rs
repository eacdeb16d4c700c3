//! # Graph Engine
//!
//! The authoritative in-memory representation of a Social Fabric Matrix.
//!
//! `Graph` composes the [`TypeRegistry`] with a relationship store and a
//! forward/reverse adjacency index, consults the [`RuleChecker`] on every
//! relationship insertion, and notifies observers after each mutation.
//!
//! ## Invariants
//!
//! - Every relationship's endpoints exist in the node set (resident or not).
//! - Every public operation either fully succeeds or leaves the graph
//!   unchanged.
//! - `previous_version_id` links never form a cycle.
//!
//! ## Residency
//!
//! A node can be evicted from memory. It keeps its identity, kind and
//! adjacency ("non-resident"), so relationships stay valid and the identity
//! stays reserved. Only its record is dropped until it is reinstated.

use crate::observer::{GraphEvent, GraphObserver, ObserverId, ObserverList};
use crate::registry::{KindIter, TypeRegistry};
use crate::rules::{AcceptAll, RuleChecker, RuleVerdict};
use crate::{Endpoint, Node, NodeId, NodeKind, Relationship, RelationshipId, RelationshipKind, SfmError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, btree_set};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Graph-state fingerprint: instance identity plus revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphFingerprint {
    pub instance: Uuid,
    pub revision: u64,
}

impl fmt::Display for GraphFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.instance.simple(), self.revision)
    }
}

// =============================================================================
// ADJACENCY
// =============================================================================

/// Which incident relationships a neighbourhood query follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
    Both,
}

impl Direction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Outgoing => "out",
            Self::Incoming => "in",
            Self::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Adjacency {
    outgoing: BTreeSet<RelationshipId>,
    incoming: BTreeSet<RelationshipId>,
}

impl Adjacency {
    fn incident(&self) -> BTreeSet<RelationshipId> {
        self.outgoing.union(&self.incoming).copied().collect()
    }
}

// =============================================================================
// SNAPSHOT FORM
// =============================================================================

/// Point-in-time copy of a graph's node and relationship sets.
///
/// The adjacency index is derived and is not part of the snapshot. Nodes are
/// grouped by kind and every list is sorted by identity, so two snapshots of
/// equal graphs serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<NodeKind, Vec<Node>>,
    pub relationships: Vec<Relationship>,
}

impl GraphSnapshot {
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Find a node record by identity.
    #[must_use]
    pub fn find_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes
            .values()
            .find_map(|nodes| nodes.binary_search_by_key(&id, Node::id).ok().map(|i| &nodes[i]))
    }

    /// Sort every list by identity.
    pub fn canonicalize(&mut self) {
        for nodes in self.nodes.values_mut() {
            nodes.sort_by_key(Node::id);
        }
        self.nodes.retain(|_, nodes| !nodes.is_empty());
        self.relationships.sort_by_key(|r| r.id);
    }
}

// =============================================================================
// GRAPH IMPLEMENTATION
// =============================================================================

/// The main Graph structure.
pub struct Graph {
    registry: TypeRegistry,
    relationships: HashMap<RelationshipId, Relationship>,
    adjacency: HashMap<NodeId, Adjacency>,
    /// Evicted nodes: identity -> kind.
    non_resident: HashMap<NodeId, NodeKind>,
    rules: Arc<dyn RuleChecker>,
    observers: ObserverList,
    /// Identifies this graph's contents across processes; renewed whenever
    /// the contents are replaced wholesale.
    instance: Uuid,
    revision: u64,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.node_count())
            .field("non_resident", &self.non_resident.len())
            .field("relationships", &self.relationships.len())
            .field("observers", &self.observers.len())
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Create an empty graph with no domain rules.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rules(Arc::new(AcceptAll))
    }

    /// Create an empty graph that consults `rules` on relationship insertion.
    #[must_use]
    pub fn with_rules(rules: Arc<dyn RuleChecker>) -> Self {
        Self {
            registry: TypeRegistry::new(),
            relationships: HashMap::new(),
            adjacency: HashMap::new(),
            non_resident: HashMap::new(),
            rules,
            observers: ObserverList::default(),
            instance: Uuid::new_v4(),
            revision: 0,
        }
    }

    /// Replace the rule checker. Existing relationships are not re-checked.
    pub fn set_rules(&mut self, rules: Arc<dyn RuleChecker>) {
        self.rules = rules;
    }

    /// Monotonic mutation counter, used as the graph-state fingerprint.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Revision qualified by the graph instance.
    ///
    /// Two graphs never share a fingerprint, even at equal revisions, so
    /// results keyed by it can live in a store shared between engines.
    #[must_use]
    pub fn fingerprint(&self) -> GraphFingerprint {
        GraphFingerprint {
            instance: self.instance,
            revision: self.revision,
        }
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    pub fn add_observer(&mut self, observer: Arc<dyn GraphObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    /// Returns false if the id was not registered.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    fn commit(&mut self, event: GraphEvent) {
        self.revision += 1;
        debug!(event = event.name(), revision = self.revision, "graph mutated");
        self.observers.notify(&event);
    }

    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    /// Add a node.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, SfmError> {
        node.validate()?;
        let id = node.id();
        if let Some(existing) = self.node_kind(id) {
            return Err(SfmError::DuplicateIdentity { id, existing });
        }
        self.check_version_chain(id, node.base().previous_version_id)?;

        self.registry.register(node.clone())?;
        self.adjacency.insert(id, Adjacency::default());
        self.commit(GraphEvent::NodeAdded(node));
        Ok(id)
    }

    /// Replace a resident node's fields in place.
    ///
    /// Identity and kind must match the stored node. `modified_at` is bumped.
    pub fn update_node(&mut self, mut node: Node) -> Result<(), SfmError> {
        node.validate()?;
        let id = node.id();
        if self.non_resident.contains_key(&id) {
            return Err(SfmError::NodeNotFound {
                id,
                op: "update_node",
            });
        }
        self.check_version_chain(id, node.base().previous_version_id)?;

        node.base_mut().modified_at = Utc::now();
        let previous = self.registry.replace(node.clone()).map_err(|e| match e {
            SfmError::NodeNotFound { id, .. } => SfmError::NodeNotFound {
                id,
                op: "update_node",
            },
            other => other,
        })?;
        self.commit(GraphEvent::NodeUpdated {
            previous,
            current: node,
        });
        Ok(())
    }

    /// Reject a `previous_version_id` that would make the chain revisit `id`.
    fn check_version_chain(&self, id: NodeId, previous: Option<NodeId>) -> Result<(), SfmError> {
        let mut visited = HashSet::new();
        let mut cursor = previous;
        while let Some(current) = cursor {
            if current == id {
                return Err(SfmError::InvalidValue {
                    field: "previous_version_id",
                    reason: format!("linking node {id} would create a version cycle"),
                });
            }
            if !visited.insert(current) {
                break;
            }
            cursor = self
                .registry
                .get(current)
                .ok()
                .and_then(|n| n.base().previous_version_id);
        }
        Ok(())
    }

    /// Remove a node.
    ///
    /// With `cascade == false`, a node that still has incident relationships
    /// is left untouched and `NodeInUse` is returned. With `cascade == true`,
    /// every incident relationship is removed first, each with its own
    /// notification.
    pub fn remove_node(&mut self, id: NodeId, cascade: bool) -> Result<(), SfmError> {
        let kind = self.node_kind(id).ok_or(SfmError::NodeNotFound {
            id,
            op: "remove_node",
        })?;
        let incident = self
            .adjacency
            .get(&id)
            .map(Adjacency::incident)
            .unwrap_or_default();

        if !cascade && !incident.is_empty() {
            return Err(SfmError::NodeInUse {
                id,
                incident: incident.len(),
            });
        }

        for rel_id in incident {
            self.remove_relationship(rel_id)?;
        }

        let node = if self.non_resident.remove(&id).is_some() {
            None
        } else {
            Some(self.registry.remove(id)?)
        };
        self.adjacency.remove(&id);
        self.commit(GraphEvent::NodeRemoved { id, kind, node });
        Ok(())
    }

    /// Look up a resident node.
    pub fn get_node(&self, id: NodeId) -> Result<&Node, SfmError> {
        self.registry
            .get(id)
            .map_err(|_| SfmError::NodeNotFound { id, op: "get_node" })
    }

    /// True if the identity belongs to the graph (resident or not).
    #[must_use]
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.adjacency.contains_key(&id)
    }

    #[must_use]
    pub fn is_resident(&self, id: NodeId) -> bool {
        self.registry.contains(id)
    }

    /// Kind of a node, resident or not.
    #[must_use]
    pub fn node_kind(&self, id: NodeId) -> Option<NodeKind> {
        self.registry
            .kind_of(id)
            .or_else(|| self.non_resident.get(&id).copied())
    }

    /// Every resident node (no ordering guarantee).
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.registry.iter()
    }

    /// Snapshot iterator over resident nodes of one kind.
    pub fn nodes_of_kind(&self, kind: NodeKind) -> KindIter {
        self.registry.get_by_kind(kind)
    }

    /// Every node identity (resident or not), sorted.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.adjacency.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Node count including non-resident nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.registry.len()
    }

    /// Logical node count per kind (resident and non-resident), sorted by kind.
    #[must_use]
    pub fn counts_by_kind(&self) -> Vec<(NodeKind, usize)> {
        let mut counts: BTreeMap<NodeKind, usize> =
            self.registry.counts_by_kind().into_iter().collect();
        for kind in self.non_resident.values() {
            *counts.entry(*kind).or_default() += 1;
        }
        counts.into_iter().collect()
    }

    /// Follow `previous_version_id` links backwards from `id`.
    ///
    /// The chain starts with `id` and stops at the first predecessor that is
    /// not part of the graph. A non-resident predecessor ends the chain.
    pub fn version_chain(&self, id: NodeId) -> Result<Vec<NodeId>, SfmError> {
        if !self.contains_node(id) {
            return Err(SfmError::NodeNotFound {
                id,
                op: "version_chain",
            });
        }
        let mut chain = vec![id];
        let mut cursor = self
            .registry
            .get(id)
            .ok()
            .and_then(|n| n.base().previous_version_id);
        while let Some(previous) = cursor {
            if !self.contains_node(previous) || chain.contains(&previous) {
                break;
            }
            chain.push(previous);
            cursor = self
                .registry
                .get(previous)
                .ok()
                .and_then(|n| n.base().previous_version_id);
        }
        Ok(chain)
    }

    // -------------------------------------------------------------------------
    // Relationships
    // -------------------------------------------------------------------------

    /// Add a relationship after referential and domain-rule checks.
    pub fn add_relationship(&mut self, rel: Relationship) -> Result<RelationshipId, SfmError> {
        rel.validate()?;
        if self.relationships.contains_key(&rel.id) {
            return Err(SfmError::DuplicateRelationship(rel.id));
        }
        let source_kind = self.node_kind(rel.source_id).ok_or(SfmError::DanglingReference {
            relationship: rel.id,
            missing: rel.source_id,
            endpoint: Endpoint::Source,
        })?;
        let target_kind = self.node_kind(rel.target_id).ok_or(SfmError::DanglingReference {
            relationship: rel.id,
            missing: rel.target_id,
            endpoint: Endpoint::Target,
        })?;
        if let RuleVerdict::Reject(reason) = self.rules.check(rel.kind, source_kind, target_kind) {
            return Err(SfmError::IncompatibleRelationship {
                kind: rel.kind,
                source_kind,
                target_kind,
                reason,
            });
        }

        let id = rel.id;
        self.adjacency
            .entry(rel.source_id)
            .or_default()
            .outgoing
            .insert(id);
        self.adjacency
            .entry(rel.target_id)
            .or_default()
            .incoming
            .insert(id);
        self.relationships.insert(id, rel.clone());
        self.commit(GraphEvent::RelationshipAdded(rel));
        Ok(id)
    }

    /// Remove a relationship from storage and both adjacency indexes.
    pub fn remove_relationship(&mut self, id: RelationshipId) -> Result<Relationship, SfmError> {
        let rel = self
            .relationships
            .remove(&id)
            .ok_or(SfmError::RelationshipNotFound {
                id,
                op: "remove_relationship",
            })?;
        if let Some(adj) = self.adjacency.get_mut(&rel.source_id) {
            adj.outgoing.remove(&id);
        }
        if let Some(adj) = self.adjacency.get_mut(&rel.target_id) {
            adj.incoming.remove(&id);
        }
        self.commit(GraphEvent::RelationshipRemoved(rel.clone()));
        Ok(rel)
    }

    pub fn get_relationship(&self, id: RelationshipId) -> Result<&Relationship, SfmError> {
        self.relationships
            .get(&id)
            .ok_or(SfmError::RelationshipNotFound {
                id,
                op: "get_relationship",
            })
    }

    /// Every relationship (no ordering guarantee).
    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Relationships from `source` to `target`, sorted by identity.
    #[must_use]
    pub fn relationships_between(&self, source: NodeId, target: NodeId) -> Vec<&Relationship> {
        self.outgoing_relationships(source)
            .filter(|rel| rel.target_id == target)
            .collect()
    }

    /// Relationships touching `id` in either direction, sorted by identity.
    pub fn incident_relationships(&self, id: NodeId) -> Result<Vec<&Relationship>, SfmError> {
        let adj = self.adjacency.get(&id).ok_or(SfmError::NodeNotFound {
            id,
            op: "incident_relationships",
        })?;
        Ok(adj
            .incident()
            .into_iter()
            .filter_map(|rid| self.relationships.get(&rid))
            .collect())
    }

    /// Outgoing relationships of `id`, in identity order. Empty if unknown.
    pub fn outgoing_relationships(&self, id: NodeId) -> impl Iterator<Item = &Relationship> + '_ {
        self.adjacency
            .get(&id)
            .into_iter()
            .flat_map(|adj| adj.outgoing.iter())
            .filter_map(|rid| self.relationships.get(rid))
    }

    /// Incoming relationships of `id`, in identity order. Empty if unknown.
    pub fn incoming_relationships(&self, id: NodeId) -> impl Iterator<Item = &Relationship> + '_ {
        self.adjacency
            .get(&id)
            .into_iter()
            .flat_map(|adj| adj.incoming.iter())
            .filter_map(|rid| self.relationships.get(rid))
    }

    /// Adjacent node identities.
    ///
    /// The sequence is lazy, finite and deduplicated. Calling `neighbors`
    /// again (or cloning an unstarted iterator) restarts it.
    pub fn neighbors(
        &self,
        id: NodeId,
        direction: Direction,
        kinds: Option<&[RelationshipKind]>,
    ) -> Result<Neighbors<'_>, SfmError> {
        let adj = self.adjacency.get(&id).ok_or(SfmError::NodeNotFound {
            id,
            op: "neighbors",
        })?;
        let outgoing = matches!(direction, Direction::Outgoing | Direction::Both)
            .then(|| adj.outgoing.iter());
        let incoming = matches!(direction, Direction::Incoming | Direction::Both)
            .then(|| adj.incoming.iter());
        Ok(Neighbors {
            relationships: &self.relationships,
            node: id,
            outgoing,
            incoming,
            kinds: kinds.map(|k| k.iter().copied().collect()),
            seen: HashSet::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Residency
    // -------------------------------------------------------------------------

    /// Drop a node's record from memory, keeping identity and adjacency.
    ///
    /// Emits no observer event: the logical graph is unchanged.
    pub fn evict_node(&mut self, id: NodeId) -> Result<Node, SfmError> {
        let node = self
            .registry
            .remove(id)
            .map_err(|_| SfmError::NodeNotFound {
                id,
                op: "evict_node",
            })?;
        self.non_resident.insert(id, node.kind());
        Ok(node)
    }

    /// Make a non-resident node resident again.
    pub fn reinstate_node(&mut self, node: Node) -> Result<(), SfmError> {
        let id = node.id();
        let kind = *self.non_resident.get(&id).ok_or(SfmError::NodeNotFound {
            id,
            op: "reinstate_node",
        })?;
        if kind != node.kind() {
            return Err(SfmError::InvalidValue {
                field: "kind",
                reason: format!("node {id} was evicted as {kind}, got {}", node.kind()),
            });
        }
        node.validate()?;
        self.registry.register(node)?;
        self.non_resident.remove(&id);
        Ok(())
    }

    /// Identities of evicted nodes, sorted.
    #[must_use]
    pub fn non_resident_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.non_resident.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn non_resident_count(&self) -> usize {
        self.non_resident.len()
    }

    /// Number of evicted nodes of one kind.
    #[must_use]
    pub fn non_resident_of_kind(&self, kind: NodeKind) -> usize {
        self.non_resident.values().filter(|k| **k == kind).count()
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Canonical copy of the node and relationship sets.
    ///
    /// Fails with `NotResident` if any node is evicted.
    pub fn snapshot(&self) -> Result<GraphSnapshot, SfmError> {
        if !self.non_resident.is_empty() {
            return Err(SfmError::NotResident {
                count: self.non_resident.len(),
            });
        }
        let mut snapshot = GraphSnapshot::default();
        for node in self.registry.iter() {
            snapshot
                .nodes
                .entry(node.kind())
                .or_default()
                .push(node.clone());
        }
        snapshot.relationships = self.relationships.values().cloned().collect();
        snapshot.canonicalize();
        Ok(snapshot)
    }

    /// Build a live graph from a snapshot.
    ///
    /// Nodes are inserted first, then relationships (so every relationship
    /// passes the same referential and rule checks as a live insertion). On
    /// failure nothing is returned.
    pub fn from_snapshot(
        snapshot: GraphSnapshot,
        rules: Arc<dyn RuleChecker>,
    ) -> Result<Self, SfmError> {
        let mut graph = Self::with_rules(rules);
        for node in snapshot.nodes.into_values().flatten() {
            graph.add_node(node)?;
        }
        for rel in snapshot.relationships {
            graph.add_relationship(rel)?;
        }
        Ok(graph)
    }

    /// Swap in the contents of `other`, keeping this graph's observers and
    /// rule checker.
    ///
    /// No per-entity events are emitted; the revision moves past both graphs
    /// and the instance is renewed, so fingerprint-keyed caches cannot match
    /// the old contents.
    pub fn replace_contents(&mut self, other: Graph) {
        self.revision = self.revision.max(other.revision) + 1;
        self.instance = Uuid::new_v4();
        self.registry = other.registry;
        self.relationships = other.relationships;
        self.adjacency = other.adjacency;
        self.non_resident = other.non_resident;
        debug!(revision = self.revision, "graph contents replaced");
    }
}

// =============================================================================
// NEIGHBOR ITERATOR
// =============================================================================

/// Lazy, deduplicated walk over a node's neighbours.
#[derive(Clone)]
pub struct Neighbors<'a> {
    relationships: &'a HashMap<RelationshipId, Relationship>,
    node: NodeId,
    outgoing: Option<btree_set::Iter<'a, RelationshipId>>,
    incoming: Option<btree_set::Iter<'a, RelationshipId>>,
    kinds: Option<BTreeSet<RelationshipKind>>,
    seen: HashSet<NodeId>,
}

impl Neighbors<'_> {
    fn accepts(&self, rel: &Relationship) -> bool {
        self.kinds.as_ref().is_none_or(|k| k.contains(&rel.kind))
    }
}

impl Iterator for Neighbors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        loop {
            let rid = match self.outgoing.as_mut().and_then(Iterator::next) {
                Some(rid) => rid,
                None => self.incoming.as_mut().and_then(Iterator::next)?,
            };
            let Some(rel) = self.relationships.get(rid) else {
                continue;
            };
            if !self.accepts(rel) {
                continue;
            }
            let Some(other) = rel.other_end(self.node) else {
                continue;
            };
            if self.seen.insert(other) {
                return Some(other);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ObserverError;
    use crate::rules::RuleTable;
    use crate::{FlowNature, FlowType};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl GraphObserver for Recorder {
        fn on_event(&self, event: &GraphEvent) -> Result<(), ObserverError> {
            self.0.lock().push(event.name());
            Ok(())
        }
    }

    fn two_nodes(graph: &mut Graph) -> (NodeId, NodeId) {
        let a = graph.add_node(Node::actor("A")).expect("add A");
        let b = graph.add_node(Node::institution("B")).expect("add B");
        (a, b)
    }

    #[test]
    fn add_relationship_updates_adjacency() {
        let mut graph = Graph::new();
        let (a, b) = two_nodes(&mut graph);
        let rid = graph
            .add_relationship(Relationship::new(a, b, RelationshipKind::Governs))
            .expect("add rel");

        assert_eq!(graph.outgoing_relationships(a).count(), 1);
        assert_eq!(graph.incoming_relationships(b).count(), 1);
        assert_eq!(graph.get_relationship(rid).expect("get").source_id, a);
    }

    #[test]
    fn dangling_reference_leaves_graph_unchanged() {
        let mut graph = Graph::new();
        let (a, _) = two_nodes(&mut graph);
        let revision = graph.revision();
        let missing = NodeId::new();
        let err = graph.add_relationship(Relationship::new(a, missing, RelationshipKind::Funds));
        assert!(matches!(
            err,
            Err(SfmError::DanglingReference {
                endpoint: Endpoint::Target,
                ..
            })
        ));
        assert_eq!(graph.relationship_count(), 0);
        assert_eq!(graph.revision(), revision);
    }

    #[test]
    fn rule_rejection_carries_reason() {
        let mut graph = Graph::with_rules(Arc::new(RuleTable::sfm_defaults()));
        let flow = graph
            .add_node(Node::flow("f", FlowNature::Input, FlowType::Material))
            .expect("add");
        let actor = graph.add_node(Node::actor("a")).expect("add");
        let err = graph
            .add_relationship(Relationship::new(flow, actor, RelationshipKind::Governs))
            .expect_err("must reject");
        match err {
            SfmError::IncompatibleRelationship {
                source_kind,
                target_kind,
                reason,
                ..
            } => {
                assert_eq!(source_kind, NodeKind::Flow);
                assert_eq!(target_kind, NodeKind::Actor);
                assert!(reason.contains("Flow->Actor"));
            }
            other => unreachable!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn non_cascading_remove_refuses() {
        let mut graph = Graph::new();
        let (a, b) = two_nodes(&mut graph);
        graph
            .add_relationship(Relationship::new(a, b, RelationshipKind::Governs))
            .expect("add rel");
        let before = graph.snapshot().expect("snapshot");

        let err = graph.remove_node(a, false);
        assert!(matches!(err, Err(SfmError::NodeInUse { incident: 1, .. })));
        assert_eq!(graph.snapshot().expect("snapshot"), before);
    }

    #[test]
    fn cascading_remove_emits_per_relationship_events() {
        let mut graph = Graph::new();
        let recorder = Arc::new(Recorder::default());
        graph.add_observer(recorder.clone());
        let (a, b) = two_nodes(&mut graph);
        graph
            .add_relationship(Relationship::new(a, b, RelationshipKind::Governs))
            .expect("add");
        graph
            .add_relationship(Relationship::new(b, a, RelationshipKind::Funds))
            .expect("add");

        graph.remove_node(a, true).expect("cascade");
        assert_eq!(graph.relationship_count(), 0);
        assert!(!graph.contains_node(a));
        let events = recorder.0.lock().clone();
        assert_eq!(
            &events[4..],
            &["relationship_removed", "relationship_removed", "node_removed"]
        );
    }

    #[test]
    fn self_loop_counts_once() {
        let mut graph = Graph::new();
        let a = graph.add_node(Node::actor("a")).expect("add");
        graph
            .add_relationship(Relationship::new(a, a, RelationshipKind::Influences))
            .expect("add");
        assert!(matches!(
            graph.remove_node(a, false),
            Err(SfmError::NodeInUse { incident: 1, .. })
        ));
        graph.remove_node(a, true).expect("cascade");
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn neighbors_respect_direction_and_filter() {
        let mut graph = Graph::new();
        let (a, b) = two_nodes(&mut graph);
        let c = graph.add_node(Node::policy("c")).expect("add");
        graph
            .add_relationship(Relationship::new(a, b, RelationshipKind::Governs))
            .expect("add");
        graph
            .add_relationship(Relationship::new(a, b, RelationshipKind::Funds))
            .expect("add");
        graph
            .add_relationship(Relationship::new(c, a, RelationshipKind::Affects))
            .expect("add");

        let out: Vec<_> = graph.neighbors(a, Direction::Outgoing, None).expect("n").collect();
        assert_eq!(out, vec![b]);
        let inc: Vec<_> = graph.neighbors(a, Direction::Incoming, None).expect("n").collect();
        assert_eq!(inc, vec![c]);
        let both = graph.neighbors(a, Direction::Both, None).expect("n");
        assert_eq!(both.clone().count(), 2);
        assert_eq!(both.count(), 2);
        let filtered: Vec<_> = graph
            .neighbors(a, Direction::Both, Some(&[RelationshipKind::Affects]))
            .expect("n")
            .collect();
        assert_eq!(filtered, vec![c]);
    }

    #[test]
    fn version_chain_rejects_cycles() {
        let mut graph = Graph::new();
        let v1 = graph.add_node(Node::policy("v1")).expect("add");
        let v2 = graph
            .add_node(Node::policy("v2").with_previous_version(v1))
            .expect("add");
        assert_eq!(graph.version_chain(v2).expect("chain"), vec![v2, v1]);

        let mut looped = graph.get_node(v1).expect("get").clone();
        looped.base_mut().previous_version_id = Some(v2);
        assert!(matches!(
            graph.update_node(looped),
            Err(SfmError::InvalidValue { .. })
        ));
    }

    #[test]
    fn update_node_emits_previous_and_current() {
        let mut graph = Graph::new();
        let id = graph.add_node(Node::actor("old")).expect("add");
        let before = graph.get_node(id).expect("get").base().modified_at;
        graph
            .update_node(Node::actor("new").with_id(id))
            .expect("update");
        let node = graph.get_node(id).expect("get");
        assert_eq!(node.label(), "new");
        assert!(node.base().modified_at >= before);
    }

    #[test]
    fn eviction_keeps_identity_reserved() {
        let mut graph = Graph::new();
        let (a, b) = two_nodes(&mut graph);
        graph
            .add_relationship(Relationship::new(a, b, RelationshipKind::Governs))
            .expect("add");
        let revision = graph.revision();
        let evicted = graph.evict_node(a).expect("evict");

        assert_eq!(graph.revision(), revision);
        assert!(graph.contains_node(a));
        assert!(graph.get_node(a).is_err());
        assert!(matches!(
            graph.add_node(Node::policy("clash").with_id(a)),
            Err(SfmError::DuplicateIdentity { .. })
        ));
        assert!(matches!(
            graph.snapshot(),
            Err(SfmError::NotResident { count: 1 })
        ));
        assert_eq!(graph.neighbors(b, Direction::Incoming, None).expect("n").count(), 1);

        graph.reinstate_node(evicted.clone()).expect("reinstate");
        assert_eq!(graph.get_node(a).expect("get"), &evicted);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut graph = Graph::new();
        let (a, b) = two_nodes(&mut graph);
        graph
            .add_relationship(Relationship::new(a, b, RelationshipKind::Governs).with_weight(2.5))
            .expect("add");
        let snapshot = graph.snapshot().expect("snapshot");
        let rebuilt = Graph::from_snapshot(snapshot.clone(), Arc::new(AcceptAll)).expect("rebuild");
        assert_eq!(rebuilt.snapshot().expect("snapshot"), snapshot);
        assert_eq!(rebuilt.counts_by_kind().len(), 2);
    }

    #[test]
    fn fingerprint_is_unique_per_graph_instance() {
        let mut first = Graph::new();
        let mut second = Graph::new();
        two_nodes(&mut first);
        two_nodes(&mut second);
        assert_eq!(first.revision(), second.revision());
        assert_ne!(first.fingerprint(), second.fingerprint());

        let before = first.fingerprint();
        first.replace_contents(Graph::new());
        assert_ne!(first.fingerprint().instance, before.instance);
        assert!(first.fingerprint().revision > before.revision);
        assert_eq!(first.non_resident_of_kind(NodeKind::Actor), 0);
    }
}
