//! Layer search and filtered k-NN.
//!
//! Filtered-out and deleted nodes are still expanded for navigation; they
//! are only kept out of the result set.

use super::distance::l2_norm;
use super::visited::VisitedSet;
use super::{DistanceMetric, HnswNode, VectorIndex};
use crate::NodeId;
use ordered_float::OrderedFloat;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

thread_local! {
    static SEARCH_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::new(0));
}

/// Best-first search of one layer. Returns up to `ef` accepted nodes sorted
/// by ascending distance. Links pointing outside the registry are skipped
/// and the owning node is pushed onto `dangling`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn search_layer<F: Fn(&HnswNode) -> bool>(
    nodes: &[Arc<HnswNode>],
    metric: DistanceMetric,
    query: &[f32],
    query_norm: f32,
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    dangling: &mut Vec<u32>,
    accept: &F,
) -> Vec<(f32, u32)> {
    visited.clear();
    visited.ensure_capacity(nodes.len());
    // Min-heap of nodes to expand, max-heap of accepted results.
    let mut candidates: BinaryHeap<Reverse<(OrderedFloat<f32>, u32)>> = BinaryHeap::new();
    let mut results: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::with_capacity(ef + 1);
    let mut worst = f32::MAX;

    for &ep in entry_points {
        let Some(node) = nodes.get(ep as usize) else {
            continue;
        };
        if !visited.insert(ep) {
            continue;
        }
        let dist = metric.distance_prenorm(query, query_norm, &node.vector);
        candidates.push(Reverse((OrderedFloat(dist), ep)));
        if accept(node) {
            results.push((OrderedFloat(dist), ep));
            if results.len() > ef {
                results.pop();
            }
            if results.len() >= ef {
                worst = results.peek().map_or(f32::MAX, |r| r.0 .0);
            }
        }
    }

    while let Some(Reverse((OrderedFloat(c_dist), c_id))) = candidates.pop() {
        if results.len() >= ef && c_dist > worst {
            break;
        }
        let node = &nodes[c_id as usize];
        let Some(slot) = node.links.get(layer) else {
            continue;
        };
        let links = slot.load();
        for &next in links.iter() {
            let Some(neighbour) = nodes.get(next as usize) else {
                dangling.push(c_id);
                continue;
            };
            if !visited.insert(next) {
                continue;
            }
            let dist = metric.distance_prenorm(query, query_norm, &neighbour.vector);
            if results.len() < ef || dist < worst {
                candidates.push(Reverse((OrderedFloat(dist), next)));
                if accept(neighbour) {
                    results.push((OrderedFloat(dist), next));
                    if results.len() > ef {
                        results.pop();
                    }
                    if results.len() >= ef {
                        worst = results.peek().map_or(f32::MAX, |r| r.0 .0);
                    }
                }
            }
        }
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|(d, id)| (d.0, id))
        .collect()
}

impl VectorIndex {
    /// The `k` nearest live vectors for which `filter` returns true, as
    /// `(distance, id)` pairs ordered by distance then id.
    pub fn search<F: Fn(NodeId) -> bool>(&self, query: &[f32], k: usize, filter: F) -> Vec<(f32, NodeId)> {
        if k == 0 {
            return Vec::new();
        }
        let _gate = self.rebuild_gate.read();
        let mut dangling = Vec::new();
        let hits = {
            let nodes = self.nodes.read();
            let Some(ep) = *self.entry.read() else {
                return Vec::new();
            };
            let metric = self.config.distance_metric;
            let norm = l2_norm(query);
            let accept = |n: &HnswNode| !n.is_deleted() && filter(n.external_id);

            SEARCH_VISITED.with(|cell| {
                let mut visited = cell.borrow_mut();
                let accept_all = |_: &HnswNode| true;
                let mut current = ep.id;
                for layer in (1..=ep.level).rev() {
                    let found = search_layer(
                        &nodes, metric, query, norm, &[current], 1, layer, &mut visited, &mut dangling, &accept_all,
                    );
                    if let Some(&(_, nearest)) = found.first() {
                        current = nearest;
                    }
                }

                let total = nodes.len().max(1);
                let mut ef = self.config.ef_search.max(k).min(total);
                let mut found;
                loop {
                    found = search_layer(
                        &nodes, metric, query, norm, &[current], ef, 0, &mut visited, &mut dangling, &accept,
                    );
                    if found.len() >= k || ef >= total {
                        break;
                    }
                    ef = (ef * 2).min(total);
                }
                let mut hits: Vec<(f32, NodeId)> = found
                    .into_iter()
                    .map(|(d, id)| (d, nodes[id as usize].external_id))
                    .collect();
                hits.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                hits.truncate(k);
                hits
            })
        };

        if !dangling.is_empty() {
            dangling.sort_unstable();
            dangling.dedup();
            let err = crate::RiceError::IndexInconsistency(format!(
                "{} node(s) link outside the registry",
                dangling.len()
            ));
            tracing::warn!(error = %err, "repairing HNSW links");
            for internal in dangling {
                self.repair(internal);
            }
        }
        hits
    }
}
