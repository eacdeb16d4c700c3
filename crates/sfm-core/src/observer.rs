//! # Graph Observers
//!
//! Change notifications emitted by [`crate::Graph`] after a mutation has
//! been applied.
//!
//! ## Delivery Contract
//!
//! - Observers run synchronously, in registration order, while the graph is
//!   still exclusively borrowed. They must not call back into the graph.
//! - An observer that returns an error or panics is logged and skipped. The
//!   mutation that triggered the event is never rolled back.

use crate::{Node, NodeId, NodeKind, Relationship};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// A change that has already been applied to the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    NodeAdded(Node),
    NodeUpdated { previous: Node, current: Node },
    /// `node` is `None` when the removed node was not resident.
    NodeRemoved {
        id: NodeId,
        kind: NodeKind,
        node: Option<Node>,
    },
    RelationshipAdded(Relationship),
    RelationshipRemoved(Relationship),
}

impl GraphEvent {
    /// Short event name, for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeAdded(_) => "node_added",
            Self::NodeUpdated { .. } => "node_updated",
            Self::NodeRemoved { .. } => "node_removed",
            Self::RelationshipAdded(_) => "relationship_added",
            Self::RelationshipRemoved(_) => "relationship_removed",
        }
    }
}

/// Failure reported by an observer. Logged, never propagated.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receives graph change notifications.
pub trait GraphObserver: Send + Sync {
    fn on_event(&self, event: &GraphEvent) -> Result<(), ObserverError>;
}

/// Handle returned by `add_observer`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

/// Ordered list of registered observers.
#[derive(Default, Clone)]
pub(crate) struct ObserverList {
    next_id: u64,
    entries: Vec<(ObserverId, Arc<dyn GraphObserver>)>,
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl ObserverList {
    pub(crate) fn add(&mut self, observer: Arc<dyn GraphObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Deliver `event` to every observer with log-and-continue semantics.
    pub(crate) fn notify(&self, event: &GraphEvent) {
        for (id, observer) in &self.entries {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(observer = ?id, event = event.name(), error = %err, "observer failed");
                }
                Err(_) => {
                    warn!(observer = ?id, event = event.name(), "observer panicked");
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<&'static str>>);

    impl GraphObserver for Recorder {
        fn on_event(&self, event: &GraphEvent) -> Result<(), ObserverError> {
            self.0.lock().push(event.name());
            Ok(())
        }
    }

    struct Failing;

    impl GraphObserver for Failing {
        fn on_event(&self, _event: &GraphEvent) -> Result<(), ObserverError> {
            Err(ObserverError::new("boom"))
        }
    }

    struct Panicking;

    impl GraphObserver for Panicking {
        fn on_event(&self, _event: &GraphEvent) -> Result<(), ObserverError> {
            panic!("observer bug");
        }
    }

    #[test]
    fn failures_do_not_stop_delivery() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut list = ObserverList::default();
        list.add(Arc::new(Failing));
        list.add(Arc::new(Panicking));
        list.add(recorder.clone());

        list.notify(&GraphEvent::NodeAdded(Node::actor("a")));
        assert_eq!(*recorder.0.lock(), vec!["node_added"]);
    }

    #[test]
    fn remove_by_id() {
        let mut list = ObserverList::default();
        let first = list.add(Arc::new(Failing));
        let _second = list.add(Arc::new(Failing));
        assert!(list.remove(first));
        assert!(!list.remove(first));
        assert_eq!(list.len(), 1);
    }
}
