//! # Query Engine
//!
//! Read-only analytics over a [`SharedGraph`]: neighbourhoods, shortest
//! paths, centrality, components, communities, flow tracing and density.
//!
//! Every operation follows the same explicit sequence under one read lock:
//! build the [`CacheKey`] from the query and the graph fingerprint, look it up,
//! compute on a miss, store with the query's tag set.
//!
//! ## Invalidation
//!
//! | Query              | Tags                                       | Precision |
//! |--------------------|--------------------------------------------|-----------|
//! | `neighbors`        | `Node(id)`                                 | precise   |
//! | `trace_flows`      | `NodeKind(Flow)` + each traced kind         | by kind   |
//! | everything else    | `Global`                                   | coarse    |

mod algorithms;

use crate::cache::{CacheKey, CacheTag, TieredCache};
use crate::config::QueryConfig;
use crate::graph::Direction;
use crate::shared::SharedGraph;
use crate::{Graph, NodeId, NodeKind, RelationshipKind, SfmError};
use algorithms::View;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Relationship kinds followed by `trace_flows` when none are given.
pub const DEFAULT_FLOW_KINDS: [RelationshipKind; 8] = [
    RelationshipKind::Produces,
    RelationshipKind::Uses,
    RelationshipKind::ExchangesWith,
    RelationshipKind::Transfers,
    RelationshipKind::Trades,
    RelationshipKind::Supplies,
    RelationshipKind::Distributes,
    RelationshipKind::Consumes,
];

// =============================================================================
// QUERY DESCRIPTORS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentralityMeasure {
    Degree,
    InDegree,
    OutDegree,
    Betweenness,
    Closeness,
}

impl CentralityMeasure {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Degree => "degree",
            Self::InDegree => "in_degree",
            Self::OutDegree => "out_degree",
            Self::Betweenness => "betweenness",
            Self::Closeness => "closeness",
        }
    }
}

/// Cost model for `shortest_path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathMode {
    /// Fewest relationships.
    #[default]
    Hops,
    /// Lowest sum of `1 / weight`.
    Weighted,
}

impl PathMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hops => "hops",
            Self::Weighted => "weighted",
        }
    }
}

/// Partitioning algorithm for `communities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommunityAlgorithm {
    #[default]
    LabelPropagation,
    WeakComponents,
}

impl CommunityAlgorithm {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LabelPropagation => "label_propagation",
            Self::WeakComponents => "weak_components",
        }
    }
}

/// A fully-specified query. Determines the cache key and tag set.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryType {
    Neighbors {
        node: NodeId,
        direction: Direction,
        kinds: Option<Vec<RelationshipKind>>,
    },
    ShortestPath {
        source: NodeId,
        target: NodeId,
        kinds: Option<Vec<RelationshipKind>>,
        mode: PathMode,
    },
    Centrality {
        kind: Option<NodeKind>,
        measure: CentralityMeasure,
    },
    Components,
    Communities(CommunityAlgorithm),
    TraceFlows {
        kinds: Option<Vec<RelationshipKind>>,
        sources: Option<Vec<NodeId>>,
    },
    Density,
}

fn canonical_kinds(kinds: Option<&[RelationshipKind]>) -> String {
    match kinds {
        None => "*".to_string(),
        Some(kinds) => kinds
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn canonical_ids(ids: Option<&[NodeId]>) -> String {
    match ids {
        None => "*".to_string(),
        Some(ids) => ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
    }
}

impl QueryType {
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Neighbors { .. } => "neighbors",
            Self::ShortestPath { .. } => "shortest_path",
            Self::Centrality { .. } => "centrality",
            Self::Components => "components",
            Self::Communities(_) => "communities",
            Self::TraceFlows { .. } => "trace_flows",
            Self::Density => "density",
        }
    }

    /// Arguments in a fixed order; filter sets are sorted and deduplicated.
    #[must_use]
    pub fn canonical_args(&self) -> Vec<String> {
        match self {
            Self::Neighbors {
                node,
                direction,
                kinds,
            } => vec![
                node.to_string(),
                direction.as_str().to_string(),
                canonical_kinds(kinds.as_deref()),
            ],
            Self::ShortestPath {
                source,
                target,
                kinds,
                mode,
            } => vec![
                source.to_string(),
                target.to_string(),
                canonical_kinds(kinds.as_deref()),
                mode.as_str().to_string(),
            ],
            Self::Centrality { kind, measure } => vec![
                kind.map_or_else(|| "*".to_string(), |k| k.as_str().to_string()),
                measure.as_str().to_string(),
            ],
            Self::Components | Self::Density => Vec::new(),
            Self::Communities(algorithm) => vec![algorithm.as_str().to_string()],
            Self::TraceFlows { kinds, sources } => vec![
                canonical_kinds(Some(effective_flow_kinds(kinds.as_deref()))),
                canonical_ids(sources.as_deref()),
            ],
        }
    }

    /// Tags attached to this query's cached result.
    #[must_use]
    pub fn tags(&self) -> BTreeSet<CacheTag> {
        match self {
            Self::Neighbors { node, .. } => BTreeSet::from([CacheTag::Node(*node)]),
            Self::TraceFlows { kinds, .. } => {
                let mut tags = BTreeSet::from([CacheTag::NodeKind(NodeKind::Flow)]);
                tags.extend(
                    effective_flow_kinds(kinds.as_deref())
                        .iter()
                        .map(|k| CacheTag::RelationshipKind(*k)),
                );
                tags
            }
            _ => BTreeSet::from([CacheTag::Global]),
        }
    }
}

fn effective_flow_kinds(kinds: Option<&[RelationshipKind]>) -> &[RelationshipKind] {
    kinds.unwrap_or(&DEFAULT_FLOW_KINDS)
}

// =============================================================================
// RESULTS
// =============================================================================

/// One traced route of quantity movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPath {
    pub nodes: Vec<NodeId>,
    /// Quantity of the originating Flow node, when it has one.
    pub initial_quantity: Option<f64>,
    /// `1 - product(1 - loss_factor)` over Flow nodes on the path.
    pub cumulative_loss: f64,
    /// `initial_quantity * (1 - cumulative_loss)`.
    pub delivered: Option<f64>,
}

/// Output of `trace_flows`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowTrace {
    pub paths: Vec<FlowPath>,
    /// Delivered quantity summed per path terminal.
    pub volumes: BTreeMap<NodeId, f64>,
    /// Path collection stopped at the configured bound.
    pub truncated: bool,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Read-only analytics with optional result caching.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    graph: SharedGraph,
    cache: Option<Arc<TieredCache>>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(graph: SharedGraph, cache: Option<Arc<TieredCache>>, config: QueryConfig) -> Self {
        Self {
            graph,
            cache,
            config,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    #[must_use]
    pub fn cache(&self) -> Option<&Arc<TieredCache>> {
        self.cache.as_ref()
    }

    /// Key under which `query` is cached against the current graph state.
    #[must_use]
    pub fn cache_key(&self, query: &QueryType) -> CacheKey {
        let graph = self.graph.read();
        key_for(&graph, query)
    }

    fn cached<T, F>(&self, graph: &Graph, query: &QueryType, compute: F) -> Result<T, SfmError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&Graph) -> Result<T, SfmError>,
    {
        let Some(cache) = &self.cache else {
            return compute(graph);
        };
        let key = key_for(graph, query);
        if let Some(hit) = cache.get_typed(&key) {
            debug!(key = %key, "query cache hit");
            return Ok(hit);
        }
        let value = compute(graph)?;
        let ttl = self.config.result_ttl_secs.map(Duration::from_secs);
        cache.set_typed(&key, &value, ttl, query.tags());
        Ok(value)
    }

    /// Adjacent node identities, sorted.
    pub fn neighbors(
        &self,
        node: NodeId,
        direction: Direction,
        kinds: Option<&[RelationshipKind]>,
    ) -> Result<Vec<NodeId>, SfmError> {
        let query = QueryType::Neighbors {
            node,
            direction,
            kinds: kinds.map(<[_]>::to_vec),
        };
        let graph = self.graph.read();
        self.cached(&graph, &query, |g| {
            let mut ids: Vec<NodeId> = g.neighbors(node, direction, kinds)?.collect();
            ids.sort_unstable();
            Ok(ids)
        })
    }

    /// Path from `source` to `target` over outgoing relationships.
    ///
    /// `Ok(None)` when unreachable; `NodeNotFound` when an endpoint is
    /// unknown.
    pub fn shortest_path(
        &self,
        source: NodeId,
        target: NodeId,
        kinds: Option<&[RelationshipKind]>,
        mode: PathMode,
    ) -> Result<Option<Vec<NodeId>>, SfmError> {
        let query = QueryType::ShortestPath {
            source,
            target,
            kinds: kinds.map(<[_]>::to_vec),
            mode,
        };
        let graph = self.graph.read();
        for id in [source, target] {
            if !graph.contains_node(id) {
                return Err(SfmError::NodeNotFound {
                    id,
                    op: "shortest_path",
                });
            }
        }
        self.cached(&graph, &query, |g| {
            let view = View::build(g, None, kinds);
            let (Some(s), Some(t)) = (view.index_of(source), view.index_of(target)) else {
                return Ok(None);
            };
            let path = match mode {
                PathMode::Hops => algorithms::bfs_path(&view, s, t),
                PathMode::Weighted => algorithms::dijkstra_path(&view, s, t).map(|(p, _)| p),
            };
            Ok(path.map(|p| p.into_iter().map(|i| view.id(i)).collect()))
        })
    }

    /// Scores for every node of `kind` (all nodes when `None`), computed on
    /// the induced subgraph. Sorted by score descending, then identity.
    pub fn centrality(
        &self,
        kind: Option<NodeKind>,
        measure: CentralityMeasure,
    ) -> Result<Vec<(NodeId, f64)>, SfmError> {
        let query = QueryType::Centrality { kind, measure };
        let graph = self.graph.read();
        self.cached(&graph, &query, |g| {
            let view = View::build(g, kind, None);
            let scores = match measure {
                CentralityMeasure::Degree => algorithms::degree(&view),
                CentralityMeasure::InDegree => algorithms::in_degree(&view),
                CentralityMeasure::OutDegree => algorithms::out_degree(&view),
                CentralityMeasure::Betweenness => algorithms::betweenness(&view),
                CentralityMeasure::Closeness => algorithms::closeness(&view),
            };
            let mut ranked: Vec<(NodeId, f64)> = scores
                .into_iter()
                .enumerate()
                .map(|(i, score)| (view.id(i), score))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            Ok(ranked)
        })
    }

    /// Weakly connected components, largest first.
    pub fn connected_components(&self) -> Result<Vec<Vec<NodeId>>, SfmError> {
        let graph = self.graph.read();
        self.cached(&graph, &QueryType::Components, |g| {
            let view = View::build(g, None, None);
            Ok(resolve_groups(&view, algorithms::weak_components(&view)))
        })
    }

    /// Disjoint communities; `None` uses the configured algorithm.
    pub fn communities(
        &self,
        algorithm: Option<CommunityAlgorithm>,
    ) -> Result<Vec<Vec<NodeId>>, SfmError> {
        let algorithm = algorithm.unwrap_or(self.config.community_algorithm);
        let graph = self.graph.read();
        self.cached(&graph, &QueryType::Communities(algorithm), |g| {
            let view = View::build(g, None, None);
            let groups = match algorithm {
                CommunityAlgorithm::LabelPropagation => algorithms::label_propagation(&view),
                CommunityAlgorithm::WeakComponents => algorithms::weak_components(&view),
            };
            Ok(resolve_groups(&view, groups))
        })
    }

    /// Trace quantity movement from Flow nodes along flow-carrying
    /// relationships.
    ///
    /// `kinds` defaults to [`DEFAULT_FLOW_KINDS`]; `sources` defaults to every
    /// Flow node.
    ///
    /// Quantities and loss factors live in the node records, so the trace
    /// fails with `NotResident` while any Flow node is evicted. Reload them
    /// through the [`MemoryManager`](crate::MemoryManager) first.
    pub fn trace_flows(
        &self,
        kinds: Option<&[RelationshipKind]>,
        sources: Option<&[NodeId]>,
    ) -> Result<FlowTrace, SfmError> {
        let query = QueryType::TraceFlows {
            kinds: kinds.map(<[_]>::to_vec),
            sources: sources.map(<[_]>::to_vec),
        };
        let graph = self.graph.read();
        if let Some(sources) = sources {
            if let Some(&id) = sources.iter().find(|id| !graph.contains_node(**id)) {
                return Err(SfmError::NodeNotFound {
                    id,
                    op: "trace_flows",
                });
            }
        }
        let evicted = graph.non_resident_of_kind(NodeKind::Flow);
        if evicted > 0 {
            return Err(SfmError::NotResident { count: evicted });
        }
        self.cached(&graph, &query, |g| Ok(trace(g, kinds, sources)))
    }

    /// Directed multigraph density: `m / (n (n - 1))`.
    pub fn density(&self) -> Result<f64, SfmError> {
        let graph = self.graph.read();
        self.cached(&graph, &QueryType::Density, |g| {
            let view = View::build(g, None, None);
            let n = view.len();
            if n <= 1 {
                return Ok(0.0);
            }
            Ok(view.edge_count() as f64 / (n * (n - 1)) as f64)
        })
    }
}

fn key_for(graph: &Graph, query: &QueryType) -> CacheKey {
    CacheKey::new(query.operation(), query.canonical_args()).with_fingerprint(graph.fingerprint())
}

fn resolve_groups(view: &View, groups: Vec<Vec<usize>>) -> Vec<Vec<NodeId>> {
    groups
        .into_iter()
        .map(|g| g.into_iter().map(|i| view.id(i)).collect())
        .collect()
}

fn trace(graph: &Graph, kinds: Option<&[RelationshipKind]>, sources: Option<&[NodeId]>) -> FlowTrace {
    let view = View::build(graph, None, Some(effective_flow_kinds(kinds)));
    let source_ids: BTreeSet<NodeId> = match sources {
        Some(ids) => ids.iter().copied().collect(),
        None => graph.nodes_of_kind(NodeKind::Flow).map(|n| n.id()).collect(),
    };
    let starts: Vec<usize> = source_ids
        .iter()
        .filter_map(|id| view.index_of(*id))
        .collect();

    let retention = |index: usize| -> f64 {
        graph
            .get_node(view.id(index))
            .ok()
            .and_then(|node| node.as_flow())
            .and_then(|flow| flow.loss_factor)
            .map_or(1.0, |lf| 1.0 - lf)
    };

    let found = algorithms::simple_paths(&view, &starts);
    let mut result = FlowTrace {
        truncated: found.truncated,
        ..FlowTrace::default()
    };
    for path in found.paths {
        let kept: f64 = path.iter().map(|&i| retention(i)).product();
        let initial_quantity = path.first().and_then(|&i| {
            graph
                .get_node(view.id(i))
                .ok()
                .and_then(|node| node.as_flow())
                .and_then(|flow| flow.quantity)
        });
        let delivered = initial_quantity.map(|q| q * kept);
        let nodes: Vec<NodeId> = path.into_iter().map(|i| view.id(i)).collect();
        if let (Some(amount), Some(&end)) = (delivered, nodes.last()) {
            *result.volumes.entry(end).or_default() += amount;
        }
        result.paths.push(FlowPath {
            nodes,
            initial_quantity,
            cumulative_loss: 1.0 - kept,
            delivered,
        });
    }
    result
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheInvalidator, CacheTier, MemoryTier};
    use crate::{FlowNature, FlowType, Node, Relationship};

    fn id(n: u128) -> NodeId {
        NodeId::from_u128(n)
    }

    fn engine_with_cache() -> (QueryEngine, Arc<TieredCache>) {
        let tier: Arc<dyn CacheTier> = Arc::new(MemoryTier::new(100, 1 << 20).expect("tier"));
        let cache = Arc::new(TieredCache::new(vec![tier], None));
        let graph = SharedGraph::default();
        graph
            .write()
            .add_observer(Arc::new(CacheInvalidator::new(cache.clone())));
        let engine = QueryEngine::new(graph, Some(cache.clone()), QueryConfig::default());
        (engine, cache)
    }

    fn chain(graph: &SharedGraph, n: u128) {
        for i in 1..=n {
            graph
                .add_node(Node::actor(format!("a{i}")).with_id(id(i)))
                .expect("add");
        }
        for i in 1..n {
            graph
                .add_relationship(Relationship::new(
                    id(i),
                    id(i + 1),
                    RelationshipKind::CollaboratesWith,
                ))
                .expect("rel");
        }
    }

    #[test]
    fn canonical_args_sort_filters() {
        let a = QueryType::ShortestPath {
            source: id(1),
            target: id(2),
            kinds: Some(vec![RelationshipKind::Funds, RelationshipKind::Governs]),
            mode: PathMode::Hops,
        };
        let b = QueryType::ShortestPath {
            source: id(1),
            target: id(2),
            kinds: Some(vec![
                RelationshipKind::Governs,
                RelationshipKind::Funds,
                RelationshipKind::Governs,
            ]),
            mode: PathMode::Hops,
        };
        assert_eq!(a.canonical_args(), b.canonical_args());
        assert_eq!(a.tags(), BTreeSet::from([CacheTag::Global]));
    }

    #[test]
    fn shortest_path_reports_no_path_and_unknown_nodes() {
        let (engine, _) = engine_with_cache();
        chain(engine.graph(), 3);
        let path = engine
            .shortest_path(id(1), id(3), None, PathMode::Hops)
            .expect("query");
        assert_eq!(path, Some(vec![id(1), id(2), id(3)]));
        assert_eq!(
            engine
                .shortest_path(id(3), id(1), None, PathMode::Hops)
                .expect("query"),
            None
        );
        let err = engine
            .shortest_path(id(1), id(99), None, PathMode::Weighted)
            .expect_err("unknown target");
        assert!(err.is_not_found());
    }

    #[test]
    fn repeated_query_hits_cache() {
        let (engine, cache) = engine_with_cache();
        chain(engine.graph(), 4);
        let first = engine
            .centrality(None, CentralityMeasure::Betweenness)
            .expect("first");
        let second = engine
            .centrality(None, CentralityMeasure::Betweenness)
            .expect("second");
        assert_eq!(first, second);
        let key = engine.cache_key(&QueryType::Centrality {
            kind: None,
            measure: CentralityMeasure::Betweenness,
        });
        assert_eq!(cache.hit_count(&key), 1);
        // Interior nodes first, then by identity.
        assert_eq!(first[0].0, id(2));
        assert_eq!(first[1].0, id(3));
    }

    #[test]
    fn mutation_recomputes_neighbors() {
        let (engine, cache) = engine_with_cache();
        chain(engine.graph(), 3);
        let before = engine
            .neighbors(id(2), Direction::Both, None)
            .expect("before");
        engine.neighbors(id(2), Direction::Both, None).expect("hit");
        let key = engine.cache_key(&QueryType::Neighbors {
            node: id(2),
            direction: Direction::Both,
            kinds: None,
        });
        assert_eq!(cache.hit_count(&key), 1);

        engine.graph().remove_node(id(3), true).expect("remove");
        let after = engine
            .neighbors(id(2), Direction::Both, None)
            .expect("after");
        assert_eq!(before, vec![id(1), id(3)]);
        assert_eq!(after, vec![id(1)]);
        assert_eq!(cache.hit_count(&key), 0);
    }

    #[test]
    fn density_and_components() {
        let engine = QueryEngine::new(SharedGraph::default(), None, QueryConfig::default());
        assert!((engine.density().expect("empty") - 0.0).abs() < f64::EPSILON);
        chain(engine.graph(), 3);
        engine
            .graph()
            .add_node(Node::actor("lonely").with_id(id(10)))
            .expect("add");
        let density = engine.density().expect("density");
        assert!((density - 2.0 / 12.0).abs() < 1e-9);
        assert_eq!(
            engine.connected_components().expect("components"),
            vec![vec![id(1), id(2), id(3)], vec![id(10)]]
        );
        assert_eq!(
            engine
                .communities(Some(CommunityAlgorithm::WeakComponents))
                .expect("communities")
                .len(),
            2
        );
    }

    #[test]
    fn flow_trace_accumulates_loss() {
        let engine = QueryEngine::new(SharedGraph::default(), None, QueryConfig::default());
        let graph = engine.graph();
        let mut source = Node::flow("grain", FlowNature::Output, FlowType::Material).with_id(id(1));
        let mut relay = Node::flow("storage", FlowNature::Transfer, FlowType::Material).with_id(id(2));
        if let Node::Flow(flow) = &mut source {
            flow.quantity = Some(100.0);
            flow.loss_factor = Some(0.1);
        }
        if let Node::Flow(flow) = &mut relay {
            flow.loss_factor = Some(0.5);
        }
        graph.add_node(source).expect("source");
        graph.add_node(relay).expect("relay");
        graph
            .add_node(Node::actor("market").with_id(id(3)))
            .expect("market");
        graph
            .add_relationship(Relationship::new(id(1), id(2), RelationshipKind::Transfers))
            .expect("transfer");
        graph
            .add_relationship(Relationship::new(id(2), id(3), RelationshipKind::Supplies))
            .expect("supply");

        let trace = engine.trace_flows(None, None).expect("trace");
        // Both Flow nodes are sources: 1->2->3 and 2->3.
        assert_eq!(trace.paths.len(), 2);
        let full = &trace.paths[0];
        assert_eq!(full.nodes, vec![id(1), id(2), id(3)]);
        assert!((full.cumulative_loss - 0.55).abs() < 1e-9);
        assert_eq!(full.delivered.map(|d| (d * 1e6).round() / 1e6), Some(45.0));
        assert_eq!(trace.volumes.get(&id(3)).map(|v| (v * 1e6).round() / 1e6), Some(45.0));
        assert!(!trace.truncated);

        let none = engine
            .trace_flows(Some(&[RelationshipKind::Funds]), None)
            .expect("trace");
        assert!(none.paths.is_empty());
    }
}
