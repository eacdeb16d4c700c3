//! # Shared Graph Handle
//!
//! The concurrency unit of the engine: one [`Graph`] behind a reader/writer
//! lock. Mutations (graph and memory-manager) take the write lock; queries and
//! snapshots take the read lock, so a save never observes a half-applied
//! mutation.
//!
//! Lock order: graph lock first, then any cache or tracking lock. Code that
//! holds a cache or tracking lock never takes the graph lock.

use crate::graph::Graph;
use crate::{Node, NodeId, Relationship, RelationshipId, SfmError};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Cloneable handle to a graph shared between threads.
#[derive(Debug, Clone, Default)]
pub struct SharedGraph {
    inner: Arc<RwLock<Graph>>,
}

impl SharedGraph {
    #[must_use]
    pub fn new(graph: Graph) -> Self {
        Self {
            inner: Arc::new(RwLock::new(graph)),
        }
    }

    /// Shared access for queries and snapshots.
    pub fn read(&self) -> RwLockReadGuard<'_, Graph> {
        self.inner.read()
    }

    /// Exclusive access for mutation.
    pub fn write(&self) -> RwLockWriteGuard<'_, Graph> {
        self.inner.write()
    }

    pub fn add_node(&self, node: Node) -> Result<NodeId, SfmError> {
        self.write().add_node(node)
    }

    pub fn remove_node(&self, id: NodeId, cascade: bool) -> Result<(), SfmError> {
        self.write().remove_node(id, cascade)
    }

    pub fn update_node(&self, node: Node) -> Result<(), SfmError> {
        self.write().update_node(node)
    }

    pub fn add_relationship(&self, rel: Relationship) -> Result<RelationshipId, SfmError> {
        self.write().add_relationship(rel)
    }

    pub fn remove_relationship(&self, id: RelationshipId) -> Result<Relationship, SfmError> {
        self.write().remove_relationship(id)
    }

    /// Clone of a resident node.
    pub fn node(&self, id: NodeId) -> Result<Node, SfmError> {
        self.read().get_node(id).cloned()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.read().node_count()
    }

    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.read().relationship_count()
    }

    /// True when both handles point at the same graph.
    #[must_use]
    pub fn same_graph(&self, other: &SharedGraph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn handles_share_state() {
        let shared = SharedGraph::default();
        let clone = shared.clone();
        let id = clone.add_node(Node::actor("a")).expect("add");
        assert!(shared.same_graph(&clone));
        assert_eq!(shared.node(id).expect("node").label(), "a");
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let shared = SharedGraph::default();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        shared.add_node(Node::actor(format!("n{i}"))).expect("add");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(shared.node_count(), 400);
    }
}
