//! In-memory adjacency for the relation graph.
//!
//! The graph is a cache over the `E|…` rows of the LSM store. It is rebuilt
//! from a scan on open and kept current by the coordinator after every
//! logged edge mutation. Self-loops and repeated identical edges are
//! allowed; each stored edge is identified by its [`EdgeKey`].

use crate::keys::EdgeKey;
use crate::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub relation: String,
    pub weight: f64,
    /// Sequence number of the mutation that created the edge.
    pub seq: u64,
}

impl Edge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            from: self.from,
            to: self.to,
            relation: self.relation.clone(),
            seq: self.seq,
        }
    }
}

/// A bounded slice of the graph, for inspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSample {
    pub nodes: Vec<NodeId>,
    pub edges: Vec<Edge>,
}

#[derive(Default)]
struct Adjacency {
    outgoing: BTreeMap<NodeId, Vec<Edge>>,
    /// `to -> edge keys` for cleanup when a node is deleted.
    incoming: BTreeMap<NodeId, Vec<EdgeKey>>,
    edges: usize,
}

#[derive(Default)]
pub struct GraphStore {
    inner: RwLock<Adjacency>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, edge: Edge) {
        let mut g = self.inner.write();
        g.incoming.entry(edge.to).or_default().push(edge.key());
        g.outgoing.entry(edge.from).or_default().push(edge);
        g.edges += 1;
    }

    /// Keys of every stored `from -[relation]-> to` edge.
    pub fn matching(&self, from: NodeId, to: NodeId, relation: &str) -> Vec<EdgeKey> {
        let g = self.inner.read();
        g.outgoing
            .get(&from)
            .map(|list| {
                list.iter()
                    .filter(|e| e.to == to && e.relation == relation)
                    .map(Edge::key)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys of every edge with `node` at either end.
    pub fn touching(&self, node: NodeId) -> Vec<EdgeKey> {
        let g = self.inner.read();
        let mut keys: Vec<EdgeKey> = g
            .outgoing
            .get(&node)
            .map(|list| list.iter().map(Edge::key).collect())
            .unwrap_or_default();
        if let Some(inc) = g.incoming.get(&node) {
            // Self-loops are already listed as outgoing.
            keys.extend(inc.iter().filter(|k| k.from != node).cloned());
        }
        keys
    }

    pub fn remove(&self, keys: &[EdgeKey]) -> usize {
        let mut g = self.inner.write();
        let mut removed = 0;
        for key in keys {
            if let Some(list) = g.outgoing.get_mut(&key.from) {
                let before = list.len();
                list.retain(|e| !(e.to == key.to && e.seq == key.seq && e.relation == key.relation));
                removed += before - list.len();
                if list.is_empty() {
                    g.outgoing.remove(&key.from);
                }
            }
            if let Some(list) = g.incoming.get_mut(&key.to) {
                list.retain(|k| k != key);
                if list.is_empty() {
                    g.incoming.remove(&key.to);
                }
            }
        }
        g.edges -= removed;
        removed
    }

    /// Distinct targets of `node`'s outgoing edges that pass `visible`,
    /// optionally restricted to one relation, in ascending id order.
    pub fn neighbors(&self, node: NodeId, relation: Option<&str>, visible: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        let g = self.inner.read();
        let targets: BTreeSet<NodeId> = g
            .outgoing
            .get(&node)
            .into_iter()
            .flatten()
            .filter(|e| relation.map_or(true, |r| e.relation == r))
            .map(|e| e.to)
            .filter(|&to| visible(to))
            .collect();
        targets.into_iter().collect()
    }

    pub fn edges_from(&self, node: NodeId, visible: impl Fn(NodeId) -> bool) -> Vec<Edge> {
        self.inner
            .read()
            .outgoing
            .get(&node)
            .into_iter()
            .flatten()
            .filter(|e| visible(e.to))
            .cloned()
            .collect()
    }

    /// Breadth-first walk over outgoing edges, entering only nodes that pass
    /// `visible`. Returns every node reachable within `max_depth` hops,
    /// starting with `start`, each exactly once, in visit order.
    pub fn traverse(&self, start: NodeId, max_depth: usize, visible: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        let g = self.inner.read();
        let mut seen: HashSet<NodeId> = HashSet::from([start]);
        let mut order = vec![start];
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let mut next: Vec<NodeId> = g
                .outgoing
                .get(&node)
                .into_iter()
                .flatten()
                .map(|e| e.to)
                .collect();
            next.sort_unstable();
            for target in next {
                if !seen.contains(&target) && visible(target) {
                    seen.insert(target);
                    order.push(target);
                    queue.push_back((target, depth + 1));
                }
            }
        }
        order
    }

    /// Up to `limit` edges in source order whose ends both pass `visible`,
    /// plus the nodes they touch.
    pub fn sample(&self, limit: usize, visible: impl Fn(NodeId) -> bool) -> GraphSample {
        let g = self.inner.read();
        let edges: Vec<Edge> = g
            .outgoing
            .values()
            .flatten()
            .filter(|e| visible(e.from) && visible(e.to))
            .take(limit)
            .cloned()
            .collect();
        let nodes: BTreeSet<NodeId> = edges.iter().flat_map(|e| [e.from, e.to]).collect();
        GraphSample {
            nodes: nodes.into_iter().collect(),
            edges,
        }
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: NodeId, to: NodeId, relation: &str, seq: u64) -> Edge {
        Edge {
            from,
            to,
            relation: relation.into(),
            weight: 1.0,
            seq,
        }
    }

    fn all(_: NodeId) -> bool {
        true
    }

    fn chain() -> GraphStore {
        let g = GraphStore::new();
        g.add(edge(1, 2, "next", 1));
        g.add(edge(2, 3, "next", 2));
        g.add(edge(3, 4, "next", 3));
        g.add(edge(1, 5, "ref", 4));
        g
    }

    #[test]
    fn neighbors_filter_by_relation() {
        let g = chain();
        assert_eq!(g.neighbors(1, None, all), vec![2, 5]);
        assert_eq!(g.neighbors(1, Some("ref"), all), vec![5]);
        assert!(g.neighbors(1, Some("missing"), all).is_empty());
        assert!(g.neighbors(42, None, all).is_empty());
    }

    #[test]
    fn traverse_respects_depth() {
        let g = chain();
        assert_eq!(g.traverse(1, 0, all), vec![1]);
        assert_eq!(g.traverse(1, 1, all), vec![1, 2, 5]);
        assert_eq!(g.traverse(1, 3, all), vec![1, 2, 5, 3, 4]);
    }

    #[test]
    fn traverse_visits_cycles_once() {
        let g = GraphStore::new();
        g.add(edge(1, 2, "x", 1));
        g.add(edge(2, 1, "x", 2));
        g.add(edge(2, 2, "self", 3));
        assert_eq!(g.traverse(1, 10, all), vec![1, 2]);
    }

    #[test]
    fn duplicate_edges_are_additive_and_removed_together() {
        let g = GraphStore::new();
        g.add(edge(1, 2, "dup", 1));
        g.add(edge(1, 2, "dup", 2));
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.neighbors(1, None, all), vec![2]);
        let keys = g.matching(1, 2, "dup");
        assert_eq!(keys.len(), 2);
        assert_eq!(g.remove(&keys), 2);
        assert_eq!(g.edge_count(), 0);
        assert!(g.neighbors(1, None, all).is_empty());
    }

    #[test]
    fn touching_covers_both_directions_without_double_counting_loops() {
        let g = GraphStore::new();
        g.add(edge(1, 2, "a", 1));
        g.add(edge(3, 1, "b", 2));
        g.add(edge(1, 1, "loop", 3));
        let keys = g.touching(1);
        assert_eq!(keys.len(), 3);
        g.remove(&keys);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn hidden_nodes_are_skipped_and_not_walked_through() {
        let g = chain();
        let hide_two = |id: NodeId| id != 2;
        assert_eq!(g.neighbors(1, None, hide_two), vec![5]);
        assert_eq!(g.traverse(1, 3, hide_two), vec![1, 5]);
        assert_eq!(g.edges_from(1, hide_two).len(), 1);
        let sample = g.sample(10, hide_two);
        assert_eq!(sample.edges.len(), 2);
        assert_eq!(sample.nodes, vec![1, 3, 4, 5]);
    }

    #[test]
    fn sample_is_bounded() {
        let g = chain();
        let sample = g.sample(2, all);
        assert_eq!(sample.edges.len(), 2);
        assert_eq!(sample.nodes, vec![1, 2, 5]);
    }
}
