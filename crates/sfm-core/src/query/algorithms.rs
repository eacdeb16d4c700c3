//! Graph algorithms over an index-compacted view of the graph.
//!
//! A [`View`] maps the (optionally kind-filtered) node set to dense indices
//! in identity order, so every algorithm visits nodes and breaks ties in
//! identity order without extra sorting. Parallel relationships are kept for
//! degree and weight purposes and collapsed for reachability.

use crate::primitives::{MAX_FLOW_PATHS, MAX_LABEL_PROPAGATION_ROUNDS, MAX_TRAVERSAL_DEPTH};
use crate::{Graph, NodeId, NodeKind, RelationshipKind};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};

#[derive(Debug, Clone, Copy)]
struct Edge {
    to: usize,
    weight: f64,
}

/// Dense, read-only copy of the adjacency needed by the algorithms.
#[derive(Debug)]
pub(crate) struct View {
    ids: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
    /// Outgoing relationships, one entry per relationship.
    out: Vec<Vec<Edge>>,
    /// Number of incoming relationships.
    in_degree: Vec<usize>,
    /// Distinct successors, sorted.
    succ: Vec<Vec<usize>>,
    /// Distinct predecessors, sorted.
    pred: Vec<Vec<usize>>,
}

impl View {
    /// Build a view over nodes of `kind` (all when `None`), following only
    /// relationships of `kinds` (all when `None`).
    pub(crate) fn build(
        graph: &Graph,
        kind: Option<NodeKind>,
        kinds: Option<&[RelationshipKind]>,
    ) -> Self {
        let ids: Vec<NodeId> = graph
            .node_ids()
            .into_iter()
            .filter(|id| kind.is_none_or(|k| graph.node_kind(*id) == Some(k)))
            .collect();
        let index: HashMap<NodeId, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let n = ids.len();
        let mut out = vec![Vec::new(); n];
        let mut in_degree = vec![0; n];
        let mut pred = vec![Vec::new(); n];
        for (i, id) in ids.iter().enumerate() {
            for rel in graph.outgoing_relationships(*id) {
                if kinds.is_some_and(|k| !k.contains(&rel.kind)) {
                    continue;
                }
                let Some(&j) = index.get(&rel.target_id) else {
                    continue;
                };
                out[i].push(Edge {
                    to: j,
                    weight: rel.weight,
                });
                in_degree[j] += 1;
                pred[j].push(i);
            }
        }

        let mut succ = Vec::with_capacity(n);
        for edges in &mut out {
            edges.sort_by(|a, b| a.to.cmp(&b.to).then(a.weight.total_cmp(&b.weight)));
            let mut targets: Vec<usize> = edges.iter().map(|e| e.to).collect();
            targets.dedup();
            succ.push(targets);
        }
        for sources in &mut pred {
            sources.sort_unstable();
            sources.dedup();
        }

        Self {
            ids,
            index,
            out,
            in_degree,
            succ,
            pred,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn id(&self, index: usize) -> NodeId {
        self.ids[index]
    }

    pub(crate) fn index_of(&self, id: NodeId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.out.iter().map(Vec::len).sum()
    }

    fn undirected(&self, v: usize) -> Vec<usize> {
        let mut all: Vec<usize> = self.succ[v]
            .iter()
            .chain(&self.pred[v])
            .copied()
            .filter(|&u| u != v)
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}

// =============================================================================
// PATHS
// =============================================================================

/// Fewest-hops path from `source` to `target` over outgoing relationships.
pub(crate) fn bfs_path(view: &View, source: usize, target: usize) -> Option<Vec<usize>> {
    if source == target {
        return Some(vec![source]);
    }
    let mut parent: Vec<Option<usize>> = vec![None; view.len()];
    let mut depth = vec![0usize; view.len()];
    let mut seen = vec![false; view.len()];
    let mut queue = VecDeque::from([source]);
    seen[source] = true;

    while let Some(current) = queue.pop_front() {
        if depth[current] >= MAX_TRAVERSAL_DEPTH {
            continue;
        }
        for &next in &view.succ[current] {
            if seen[next] {
                continue;
            }
            seen[next] = true;
            parent[next] = Some(current);
            depth[next] = depth[current] + 1;
            if next == target {
                return Some(unwind(&parent, source, target));
            }
            queue.push_back(next);
        }
    }
    None
}

#[derive(Debug, PartialEq)]
struct Frontier {
    cost: f64,
    node: usize,
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; lower index wins ties.
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Cheapest path where a relationship costs `1 / weight`.
///
/// Relationships with a non-positive or non-finite weight are not
/// traversable. Returns the path and its total cost.
pub(crate) fn dijkstra_path(view: &View, source: usize, target: usize) -> Option<(Vec<usize>, f64)> {
    if source == target {
        return Some((vec![source], 0.0));
    }
    let n = view.len();
    let mut dist = vec![f64::INFINITY; n];
    let mut hops = vec![0usize; n];
    let mut parent: Vec<Option<usize>> = vec![None; n];
    let mut done = vec![false; n];
    let mut heap = BinaryHeap::from([Frontier {
        cost: 0.0,
        node: source,
    }]);
    dist[source] = 0.0;

    while let Some(Frontier { cost, node }) = heap.pop() {
        if done[node] {
            continue;
        }
        done[node] = true;
        if node == target {
            return Some((unwind(&parent, source, target), cost));
        }
        if hops[node] >= MAX_TRAVERSAL_DEPTH {
            continue;
        }
        for edge in &view.out[node] {
            if !(edge.weight.is_finite() && edge.weight > 0.0) || done[edge.to] {
                continue;
            }
            let next = cost + 1.0 / edge.weight;
            if next < dist[edge.to] {
                dist[edge.to] = next;
                hops[edge.to] = hops[node] + 1;
                parent[edge.to] = Some(node);
                heap.push(Frontier {
                    cost: next,
                    node: edge.to,
                });
            }
        }
    }
    None
}

fn unwind(parent: &[Option<usize>], source: usize, target: usize) -> Vec<usize> {
    let mut path = vec![target];
    let mut current = target;
    while current != source {
        match parent[current] {
            Some(p) => {
                path.push(p);
                current = p;
            }
            None => break,
        }
    }
    path.reverse();
    path
}

/// Hop distances from `source` following outgoing relationships.
fn distances_from(view: &View, source: usize) -> Vec<Option<usize>> {
    let mut dist = vec![None; view.len()];
    dist[source] = Some(0);
    let mut queue = VecDeque::from([source]);
    while let Some(v) = queue.pop_front() {
        let Some(d) = dist[v] else { continue };
        for &w in &view.succ[v] {
            if dist[w].is_none() {
                dist[w] = Some(d + 1);
                queue.push_back(w);
            }
        }
    }
    dist
}

// =============================================================================
// CENTRALITY
// =============================================================================

fn degree_scale(n: usize) -> Option<f64> {
    (n > 1).then(|| 1.0 / (n - 1) as f64)
}

/// Degree centrality (in + out relationships) normalised by `n - 1`.
///
/// A graph with a single node scores it 1.0.
pub(crate) fn degree(view: &View) -> Vec<f64> {
    let Some(scale) = degree_scale(view.len()) else {
        return vec![1.0; view.len()];
    };
    (0..view.len())
        .map(|v| (view.out[v].len() + view.in_degree[v]) as f64 * scale)
        .collect()
}

pub(crate) fn in_degree(view: &View) -> Vec<f64> {
    let Some(scale) = degree_scale(view.len()) else {
        return vec![1.0; view.len()];
    };
    view.in_degree.iter().map(|&d| d as f64 * scale).collect()
}

pub(crate) fn out_degree(view: &View) -> Vec<f64> {
    let Some(scale) = degree_scale(view.len()) else {
        return vec![1.0; view.len()];
    };
    view.out.iter().map(|edges| edges.len() as f64 * scale).collect()
}

/// Directed betweenness (Brandes), normalised by `(n - 1)(n - 2)`.
pub(crate) fn betweenness(view: &View) -> Vec<f64> {
    let n = view.len();
    let mut scores = vec![0.0; n];

    for s in 0..n {
        let mut stack = Vec::with_capacity(n);
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut dist: Vec<Option<usize>> = vec![None; n];
        sigma[s] = 1.0;
        dist[s] = Some(0);
        let mut queue = VecDeque::from([s]);

        while let Some(v) = queue.pop_front() {
            stack.push(v);
            let Some(dv) = dist[v] else { continue };
            for &w in &view.succ[v] {
                if dist[w].is_none() {
                    dist[w] = Some(dv + 1);
                    queue.push_back(w);
                }
                if dist[w] == Some(dv + 1) {
                    sigma[w] += sigma[v];
                    preds[w].push(v);
                }
            }
        }

        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &preds[w] {
                delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
            }
            if w != s {
                scores[w] += delta[w];
            }
        }
    }

    if n > 2 {
        let scale = 1.0 / ((n - 1) * (n - 2)) as f64;
        for score in &mut scores {
            *score *= scale;
        }
    }
    scores
}

/// Closeness over outgoing distances with the Wasserman-Faust correction
/// for partially reachable graphs.
pub(crate) fn closeness(view: &View) -> Vec<f64> {
    let n = view.len();
    (0..n)
        .map(|v| {
            let dist = distances_from(view, v);
            let (reached, total) = dist
                .iter()
                .enumerate()
                .filter(|(u, _)| *u != v)
                .filter_map(|(_, d)| *d)
                .fold((0usize, 0usize), |(r, t), d| (r + 1, t + d));
            if total == 0 || n <= 1 {
                return 0.0;
            }
            let reached = reached as f64;
            (reached / total as f64) * (reached / (n - 1) as f64)
        })
        .collect()
}

// =============================================================================
// PARTITIONS
// =============================================================================

fn sorted_groups(groups: impl IntoIterator<Item = Vec<usize>>) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = groups
        .into_iter()
        .map(|mut g| {
            g.sort_unstable();
            g
        })
        .collect();
    groups.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.first().cmp(&b.first())));
    groups
}

/// Weakly connected components, largest first, ties by lowest member.
pub(crate) fn weak_components(view: &View) -> Vec<Vec<usize>> {
    let n = view.len();
    let mut seen = vec![false; n];
    let mut groups = Vec::new();
    for start in 0..n {
        if seen[start] {
            continue;
        }
        seen[start] = true;
        let mut group = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(v) = queue.pop_front() {
            group.push(v);
            for &u in view.succ[v].iter().chain(&view.pred[v]) {
                if !seen[u] {
                    seen[u] = true;
                    queue.push_back(u);
                }
            }
        }
        groups.push(group);
    }
    sorted_groups(groups)
}

/// Asynchronous label propagation in index order.
///
/// Each node adopts the most frequent label among its undirected
/// neighbours, keeping its own label when it is among the most frequent and
/// otherwise taking the lowest. Runs until stable or the round limit.
pub(crate) fn label_propagation(view: &View) -> Vec<Vec<usize>> {
    let n = view.len();
    let neighbours: Vec<Vec<usize>> = (0..n).map(|v| view.undirected(v)).collect();
    let mut labels: Vec<usize> = (0..n).collect();

    for _ in 0..MAX_LABEL_PROPAGATION_ROUNDS {
        let mut changed = false;
        for v in 0..n {
            let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
            for &u in &neighbours[v] {
                *counts.entry(labels[u]).or_default() += 1;
            }
            let Some(best) = counts.values().copied().max() else {
                continue;
            };
            if counts.get(&labels[v]) == Some(&best) {
                continue;
            }
            if let Some((&label, _)) = counts.iter().find(|(_, c)| **c == best) {
                labels[v] = label;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (v, label) in labels.into_iter().enumerate() {
        groups.entry(label).or_default().push(v);
    }
    sorted_groups(groups.into_values())
}

// =============================================================================
// FLOWS
// =============================================================================

/// Result of [`simple_paths`].
#[derive(Debug, Default)]
pub(crate) struct PathSet {
    pub(crate) paths: Vec<Vec<usize>>,
    pub(crate) truncated: bool,
}

/// Maximal simple paths starting at each source.
///
/// A path ends where it cannot be extended without revisiting a node or
/// exceeding `MAX_TRAVERSAL_DEPTH` hops. Collection stops at
/// `MAX_FLOW_PATHS`.
pub(crate) fn simple_paths(view: &View, sources: &[usize]) -> PathSet {
    let mut set = PathSet::default();
    let mut on_path = vec![false; view.len()];
    for &source in sources {
        let mut path = vec![source];
        on_path[source] = true;
        walk(view, &mut path, &mut on_path, &mut set);
        on_path[source] = false;
        if set.truncated {
            break;
        }
    }
    set
}

fn walk(view: &View, path: &mut Vec<usize>, on_path: &mut [bool], set: &mut PathSet) {
    if set.paths.len() >= MAX_FLOW_PATHS {
        set.truncated = true;
        return;
    }
    let Some(&node) = path.last() else { return };
    let mut extended = false;
    if path.len() <= MAX_TRAVERSAL_DEPTH {
        for &next in &view.succ[node] {
            if on_path[next] {
                continue;
            }
            extended = true;
            path.push(next);
            on_path[next] = true;
            walk(view, path, on_path, set);
            on_path[next] = false;
            path.pop();
            if set.truncated {
                return;
            }
        }
    }
    if !extended && path.len() > 1 {
        set.paths.push(path.clone());
    }
}

// =============================================================================
// TESTS
// =============================================================================
