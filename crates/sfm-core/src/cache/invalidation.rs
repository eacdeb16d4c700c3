//! Observer that keeps a [`TieredCache`] coherent with graph mutation.

use super::{CacheTag, TieredCache};
use crate::observer::{GraphEvent, GraphObserver, ObserverError};
use crate::{Node, Relationship};
use std::collections::BTreeSet;
use std::sync::Arc;

fn node_tags(node: &Node, tags: &mut BTreeSet<CacheTag>) {
    tags.insert(CacheTag::Node(node.id()));
    tags.insert(CacheTag::NodeKind(node.kind()));
}

fn relationship_tags(rel: &Relationship, tags: &mut BTreeSet<CacheTag>) {
    tags.insert(CacheTag::Relationship(rel.id));
    tags.insert(CacheTag::RelationshipKind(rel.kind));
    tags.insert(CacheTag::Node(rel.source_id));
    tags.insert(CacheTag::Node(rel.target_id));
}

/// Tags touched by `event`: the entity's identity, the endpoint nodes of a
/// relationship, the affected kinds, and always [`CacheTag::Global`].
#[must_use]
pub fn event_tags(event: &GraphEvent) -> BTreeSet<CacheTag> {
    let mut tags = BTreeSet::from([CacheTag::Global]);
    match event {
        GraphEvent::NodeAdded(node) => node_tags(node, &mut tags),
        GraphEvent::NodeUpdated { previous, current } => {
            node_tags(previous, &mut tags);
            node_tags(current, &mut tags);
        }
        GraphEvent::NodeRemoved { id, kind, .. } => {
            tags.insert(CacheTag::Node(*id));
            tags.insert(CacheTag::NodeKind(*kind));
        }
        GraphEvent::RelationshipAdded(rel) | GraphEvent::RelationshipRemoved(rel) => {
            relationship_tags(rel, &mut tags);
        }
    }
    tags
}

/// Graph observer that invalidates cache entries tagged with anything an
/// event touches.
#[derive(Debug, Clone)]
pub struct CacheInvalidator {
    cache: Arc<TieredCache>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self { cache }
    }
}

impl GraphObserver for CacheInvalidator {
    fn on_event(&self, event: &GraphEvent) -> Result<(), ObserverError> {
        self.cache.invalidate_tags(&event_tags(event));
        Ok(())
    }
}
