//! # Validation Tier Tests (T0-T5)
//!
//! If ANY tier fails, the engine is INVALID.
//!
//! ## Tiers
//! - T0: Referential Integrity
//! - T1: Identity Uniqueness
//! - T2: Cascade Consistency
//! - T3: Cache Coherence
//! - T4: Round-Trip Persistence
//! - T5: Eviction Reversibility

use sfm_core::{
    CacheInvalidator, Direction, Engine, FlowNature, FlowType, Graph, MemoryConfig,
    MemoryManager, Node, NodeId, NodeKind, PersistenceConfig, PersistenceManager, QueryConfig,
    QueryEngine, QueryType, Relationship, RelationshipKind, SfmConfig, SfmError, SharedGraph,
    TieredCache,
};
use std::sync::Arc;

fn id(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

// =============================================================================
// SCENARIO
// =============================================================================

/// Governs, dangling reference, refused and cascading removal, then a save
/// and load of the result.
#[test]
fn governance_scenario() {
    let mut graph = Graph::new();
    let a = graph.add_node(Node::actor("A")).expect("A");
    let b = graph.add_node(Node::institution("B")).expect("B");

    let governs = graph
        .add_relationship(Relationship::new(a, b, RelationshipKind::Governs))
        .expect("A governs B");

    let err = graph
        .add_relationship(Relationship::new(b, NodeId::new(), RelationshipKind::Governs))
        .expect_err("nonexistent target");
    assert!(matches!(err, SfmError::DanglingReference { .. }));

    let err = graph.remove_node(a, false).expect_err("still referenced");
    assert!(matches!(err, SfmError::NodeInUse { incident: 1, .. }));

    graph.remove_node(a, true).expect("cascade");
    assert!(graph.get_relationship(governs).is_err());
    assert_eq!(graph.relationship_count(), 0);

    let persistence = PersistenceManager::in_memory(PersistenceConfig::default());
    persistence.save("scenario", &graph).expect("save");
    let loaded = persistence.load("scenario", None).expect("load");
    assert_eq!(loaded.relationship_count(), 0);
    assert_eq!(loaded.node_ids(), vec![b]);
    assert_eq!(loaded.node_kind(b), Some(NodeKind::Institution));
}

// =============================================================================
// TIER T0: REFERENTIAL INTEGRITY
// =============================================================================

mod t0_referential_integrity {
    use super::*;

    /// T0.1: Unknown source endpoint is rejected without changing the graph.
    #[test]
    fn unknown_source_rejected() {
        let mut graph = Graph::new();
        let b = graph.add_node(Node::institution("B")).expect("B");
        let before = graph.snapshot().expect("before");
        let revision = graph.revision();

        let err = graph
            .add_relationship(Relationship::new(id(404), b, RelationshipKind::Funds))
            .expect_err("dangling");
        assert!(matches!(
            err,
            SfmError::DanglingReference { missing, .. } if missing == id(404)
        ));
        assert_eq!(graph.snapshot().expect("after"), before);
        assert_eq!(graph.revision(), revision);
    }

    /// T0.2: Every stored relationship resolves both endpoints.
    #[test]
    fn relationships_resolve_endpoints() {
        let mut graph = Graph::new();
        for i in 1..=5 {
            graph
                .add_node(Node::actor(format!("a{i}")).with_id(id(i)))
                .expect("add");
        }
        for i in 1..5 {
            graph
                .add_relationship(Relationship::new(id(i), id(i + 1), RelationshipKind::Trades))
                .expect("rel");
        }
        graph.remove_node(id(3), true).expect("cascade");
        for rel in graph.relationships() {
            assert!(graph.contains_node(rel.source_id));
            assert!(graph.contains_node(rel.target_id));
        }
        assert_eq!(graph.relationship_count(), 2);
    }
}

// =============================================================================
// TIER T1: IDENTITY UNIQUENESS
// =============================================================================

mod t1_identity_uniqueness {
    use super::*;

    /// T1.1: The same identity is rejected across kinds.
    #[test]
    fn duplicate_identity_across_kinds() {
        let mut graph = Graph::new();
        graph
            .add_node(Node::actor("first").with_id(id(1)))
            .expect("first");
        let err = graph
            .add_node(Node::policy("second").with_id(id(1)))
            .expect_err("duplicate");
        assert!(matches!(
            err,
            SfmError::DuplicateIdentity { existing: NodeKind::Actor, .. }
        ));
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.nodes_of_kind(NodeKind::Policy).count(), 0);
    }

    /// T1.2: An evicted node still reserves its identity.
    #[test]
    fn evicted_identity_stays_reserved() {
        let mut graph = Graph::new();
        graph.add_node(Node::actor("a").with_id(id(1))).expect("add");
        graph.evict_node(id(1)).expect("evict");
        assert!(matches!(
            graph.add_node(Node::actor("b").with_id(id(1))),
            Err(SfmError::DuplicateIdentity { .. })
        ));
    }
}

// =============================================================================
// TIER T2: CASCADE CONSISTENCY
// =============================================================================

mod t2_cascade_consistency {
    use super::*;

    fn hub() -> Graph {
        let mut graph = Graph::new();
        graph.add_node(Node::institution("hub").with_id(id(1))).expect("hub");
        for i in 2..=4 {
            graph
                .add_node(Node::actor(format!("a{i}")).with_id(id(i)))
                .expect("spoke");
            graph
                .add_relationship(Relationship::new(id(i), id(1), RelationshipKind::ParticipatesIn))
                .expect("in");
            graph
                .add_relationship(Relationship::new(id(1), id(i), RelationshipKind::Serves))
                .expect("out");
        }
        graph
    }

    /// T2.1: Refused removal leaves the graph unchanged.
    #[test]
    fn refused_removal_is_a_no_op() {
        let mut graph = hub();
        let before = graph.snapshot().expect("before");
        let err = graph.remove_node(id(1), false).expect_err("in use");
        assert!(matches!(err, SfmError::NodeInUse { incident: 6, .. }));
        assert_eq!(graph.snapshot().expect("after"), before);
    }

    /// T2.2: Cascading removal leaves nothing referencing the node.
    #[test]
    fn cascade_removes_every_incident_relationship() {
        let mut graph = hub();
        graph.remove_node(id(1), true).expect("cascade");
        assert!(
            graph
                .relationships()
                .all(|r| r.source_id != id(1) && r.target_id != id(1))
        );
        assert_eq!(graph.relationship_count(), 0);
        assert_eq!(graph.node_count(), 3);
        assert!(graph.neighbors(id(2), Direction::Both, None).expect("a2").next().is_none());
    }
}

// =============================================================================
// TIER T3: CACHE COHERENCE
// =============================================================================

mod t3_cache_coherence {
    use super::*;

    /// T3.1: A mutation at X forces recomputation of a result depending on X
    /// and resets the hit count of the cached key.
    #[test]
    fn mutation_invalidates_dependent_result() {
        let cache = Arc::new(TieredCache::in_memory(&SfmConfig::default().cache).expect("cache"));
        let graph = SharedGraph::default();
        graph
            .write()
            .add_observer(Arc::new(CacheInvalidator::new(Arc::clone(&cache))));
        let engine = QueryEngine::new(graph.clone(), Some(Arc::clone(&cache)), QueryConfig::default());

        graph.add_node(Node::actor("x").with_id(id(1))).expect("x");
        graph.add_node(Node::actor("y").with_id(id(2))).expect("y");

        let query = QueryType::Neighbors {
            node: id(1),
            direction: Direction::Outgoing,
            kinds: None,
        };
        let key = engine.cache_key(&query);
        assert!(engine.neighbors(id(1), Direction::Outgoing, None).expect("miss").is_empty());
        assert!(engine.neighbors(id(1), Direction::Outgoing, None).expect("hit").is_empty());
        assert_eq!(cache.hit_count(&key), 1);

        graph
            .add_relationship(Relationship::new(id(1), id(2), RelationshipKind::Supplies))
            .expect("mutate X");
        assert_eq!(cache.hit_count(&key), 0);
        assert_eq!(
            engine.neighbors(id(1), Direction::Outgoing, None).expect("recomputed"),
            vec![id(2)]
        );
    }

    /// T3.2: Whole-graph results are invalidated by unrelated mutations.
    #[test]
    fn global_results_follow_every_mutation() {
        let engine = Engine::in_memory(SfmConfig::default()).expect("engine");
        let graph = engine.graph();
        graph.add_node(Node::actor("a").with_id(id(1))).expect("a");
        graph.add_node(Node::actor("b").with_id(id(2))).expect("b");
        assert!((engine.query().density().expect("empty") - 0.0).abs() < f64::EPSILON);

        graph
            .add_relationship(Relationship::new(id(1), id(2), RelationshipKind::Trades))
            .expect("rel");
        assert!((engine.query().density().expect("one edge") - 0.5).abs() < 1e-9);
    }

    /// T3.3: Engines reopening one storage path share the redb tier but never
    /// each other's results, even at equal revisions.
    #[test]
    fn engines_sharing_a_storage_path_keep_results_apart() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = SfmConfig::default();
        config.persistence.storage_path = dir.path().to_path_buf();

        let revision = {
            let engine = Engine::open(config.clone()).expect("first engine");
            let graph = engine.graph();
            let grain = graph
                .add_node(Node::flow("grain", FlowNature::Output, FlowType::Material))
                .expect("flow");
            let mill = graph.add_node(Node::actor("mill")).expect("actor");
            graph
                .add_relationship(Relationship::new(grain, mill, RelationshipKind::Supplies))
                .expect("supplies");
            assert_eq!(engine.query().trace_flows(None, None).expect("trace").paths.len(), 1);
            graph.read().revision()
        };

        let engine = Engine::open(config).expect("second engine");
        for i in 0..3 {
            engine.graph().add_node(Node::actor(format!("a{i}"))).expect("actor");
        }
        assert_eq!(engine.graph().read().revision(), revision);
        assert!(engine.query().trace_flows(None, None).expect("trace").paths.is_empty());
    }
}

// =============================================================================
// TIER T4: ROUND-TRIP PERSISTENCE
// =============================================================================

mod t4_round_trip {
    use super::*;
    use sfm_core::ResourceType;

    /// T4.1: Loading a saved graph reproduces identities and field values.
    #[test]
    fn every_kind_round_trips() {
        let mut graph = Graph::new();
        let actor = graph
            .add_node(Node::actor("Farmers").with_certainty(0.7).with_metadata("region", "north"))
            .expect("actor");
        let water = graph
            .add_node(Node::resource("Water", ResourceType::Natural))
            .expect("resource");
        let grain = graph
            .add_node(Node::flow("Grain", FlowNature::Output, FlowType::Material))
            .expect("flow");
        graph.add_node(Node::indicator("Yield")).expect("indicator");
        graph.add_node(Node::belief_system("Stewardship")).expect("belief");
        graph
            .add_relationship(
                Relationship::new(actor, water, RelationshipKind::Uses)
                    .with_weight(3.5)
                    .with_time("2024"),
            )
            .expect("uses");
        graph
            .add_relationship(Relationship::new(actor, grain, RelationshipKind::Produces))
            .expect("produces");

        let persistence = PersistenceManager::in_memory(PersistenceConfig::default());
        let meta = persistence.save("farm", &graph).expect("save");
        assert_eq!(meta.node_count, 5);
        assert_eq!(meta.relationship_count, 2);

        let loaded = persistence.load("farm", Some(meta.version)).expect("load");
        assert_eq!(loaded.snapshot().expect("loaded"), graph.snapshot().expect("original"));
    }

    /// T4.2: Saving refuses a graph with evicted nodes.
    #[test]
    fn save_requires_resident_nodes() {
        let mut graph = Graph::new();
        graph.add_node(Node::actor("a").with_id(id(1))).expect("add");
        graph.evict_node(id(1)).expect("evict");
        let persistence = PersistenceManager::in_memory(PersistenceConfig::default());
        assert!(matches!(
            persistence.save("g", &graph),
            Err(SfmError::NotResident { count: 1 })
        ));
        assert!(persistence.list_graphs().expect("graphs").is_empty());
    }
}

// =============================================================================
// TIER T5: EVICTION REVERSIBILITY
// =============================================================================

mod t5_eviction_reversibility {
    use super::*;
    use sfm_core::FlowTrace;

    /// T5.1: Evict then reload through the loader returns the same node.
    #[test]
    fn evicted_node_reloads_equal() {
        let graph = SharedGraph::default();
        let memory = MemoryManager::attach(graph.clone(), MemoryConfig::default()).expect("attach");
        let original = Node::actor("x").with_id(id(1)).with_metadata("size", 3_i64);
        graph.add_node(original.clone()).expect("add");

        let stored = original.clone();
        memory.set_loader(move |wanted: NodeId| (wanted == stored.id()).then(|| stored.clone()));
        memory.evict(id(1)).expect("evict");
        assert!(!graph.read().is_resident(id(1)));

        assert_eq!(memory.get_node(id(1)).expect("reload"), original);
        assert!(graph.read().is_resident(id(1)));
    }

    /// T5.2: Without a loader the lookup fails with NodeNotFound.
    #[test]
    fn missing_loader_is_not_found() {
        let graph = SharedGraph::default();
        let memory = MemoryManager::attach(graph.clone(), MemoryConfig::default()).expect("attach");
        graph.add_node(Node::actor("x").with_id(id(1))).expect("add");
        memory.evict(id(1)).expect("evict");

        let err = memory.get_node(id(1)).expect_err("no loader");
        assert!(matches!(err, SfmError::NodeNotFound { .. }));
        // Identity, kind and adjacency survive.
        assert_eq!(graph.read().node_kind(id(1)), Some(NodeKind::Actor));
    }

    /// T5.3: Nodes added or changed after the last save reload with their
    /// latest value, and the graph stays saveable.
    #[test]
    fn unsaved_changes_survive_eviction() {
        let engine = Engine::in_memory(SfmConfig::default()).expect("engine");
        let graph = engine.graph();
        graph.add_node(Node::actor("A").with_id(id(1))).expect("A");
        engine.save("g").expect("save");
        engine.enable_lazy_loading("g", None).expect("loader");

        graph.add_node(Node::actor("B").with_id(id(2))).expect("B");
        engine.memory().evict(id(2)).expect("evict B");
        assert_eq!(engine.memory().get_node(id(2)).expect("B").label(), "B");

        graph
            .update_node(Node::actor("A-updated").with_id(id(1)))
            .expect("update A");
        engine.memory().evict(id(1)).expect("evict A");
        assert_eq!(engine.memory().get_node(id(1)).expect("A").label(), "A-updated");

        engine.memory().evict(id(2)).expect("evict B again");
        assert_eq!(engine.memory().rehydrate_all().expect("rehydrate"), 1);
        assert_eq!(engine.save("g").expect("save").node_count, 2);
    }

    fn flow_graph(config: SfmConfig) -> Engine {
        let engine = Engine::in_memory(config).expect("engine");
        let mut grain = Node::flow("grain", FlowNature::Output, FlowType::Material).with_id(id(1));
        if let Node::Flow(flow) = &mut grain {
            flow.quantity = Some(100.0);
            flow.loss_factor = Some(0.5);
        }
        engine.graph().add_node(grain).expect("flow");
        engine
            .graph()
            .add_node(Node::actor("market").with_id(id(2)))
            .expect("actor");
        engine
            .graph()
            .add_relationship(Relationship::new(id(1), id(2), RelationshipKind::Supplies))
            .expect("supplies");
        engine
    }

    fn delivered(trace: &FlowTrace) -> Option<f64> {
        trace.paths.first().and_then(|p| p.delivered)
    }

    /// T5.4: Flow tracing never reads an evicted Flow node as empty; it fails
    /// until the node is reloaded, with or without a cached result.
    #[test]
    fn flow_trace_requires_resident_flows() {
        for cache_enabled in [false, true] {
            let mut config = SfmConfig::default();
            config.cache.enabled = cache_enabled;
            let engine = flow_graph(config);
            let before = engine.query().trace_flows(None, None).expect("before");
            assert_eq!(delivered(&before), Some(50.0));

            engine.memory().evict(id(1)).expect("evict");
            for sources in [None, Some(&[id(1)][..])] {
                let err = engine.query().trace_flows(None, sources).expect_err("evicted");
                assert!(matches!(err, SfmError::NotResident { count: 1 }));
            }

            engine.memory().get_node(id(1)).expect("reload");
            let after = engine.query().trace_flows(None, None).expect("after");
            assert_eq!(after, before);
        }
    }

    /// T5.5: Structural queries keep answering over evicted nodes.
    #[test]
    fn structural_queries_span_evicted_nodes() {
        let engine = flow_graph(SfmConfig::default());
        engine.memory().evict(id(2)).expect("evict actor");
        assert_eq!(
            engine
                .query()
                .neighbors(id(1), Direction::Outgoing, None)
                .expect("neighbors"),
            vec![id(2)]
        );
        assert_eq!(engine.query().connected_components().expect("components").len(), 1);
        assert_eq!(delivered(&engine.query().trace_flows(None, None).expect("trace")), Some(50.0));
    }
}
