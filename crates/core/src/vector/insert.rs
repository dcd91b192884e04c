//! Insertion, neighbour selection and link repair.

use super::distance::l2_norm;
use super::search::search_layer;
use super::visited::VisitedSet;
use super::{EntryPoint, HnswNode, VectorIndex};
use crate::{NodeId, Result, RiceError};
use std::collections::HashSet;
use std::sync::Arc;

impl VectorIndex {
    /// Insert a vector under a new external id.
    pub fn insert(&self, id: NodeId, vector: Vec<f32>) -> Result<()> {
        let _gate = self.rebuild_gate.read();
        self.insert_node(id, vector)
    }

    /// Neighbours are chosen under a shared lock on the node registry; the
    /// node is then published fully linked, and back-links are added one
    /// neighbour at a time. Concurrent searches therefore never see a link
    /// to a node that is not yet in the registry.
    pub(super) fn insert_node(&self, id: NodeId, vector: Vec<f32>) -> Result<()> {
        if self.ids.read().contains_key(&id) {
            return Err(RiceError::DuplicateId(id));
        }
        let level = self.random_level();
        let norm = l2_norm(&vector);

        let (internal, links) = loop {
            let (links, planned_against) = {
                let nodes = self.nodes.read();
                let entry = *self.entry.read();
                let links = match entry {
                    Some(ep) => self.plan_links(&nodes, &vector, norm, level, ep),
                    None => vec![Vec::new(); level + 1],
                };
                (links, entry)
            };

            let mut nodes = self.nodes.write();
            let mut entry = self.entry.write();
            if planned_against.is_none() && entry.is_some() {
                // Another insert became the entry point first; plan again
                // so this node does not end up unreachable.
                continue;
            }
            let internal = nodes.len() as u32;
            nodes.push(Arc::new(HnswNode::new(id, vector.clone(), links.clone())));
            self.ids.write().insert(id, internal);
            if entry.map_or(true, |ep| level > ep.level) {
                *entry = Some(EntryPoint { id: internal, level });
            }
            break (internal, links);
        };
        self.live.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let nodes = self.nodes.read();
        for (layer, neighbours) in links.iter().enumerate() {
            for &neighbour in neighbours {
                self.add_back_link(&nodes, neighbour, internal, layer);
            }
        }
        Ok(())
    }

    /// Greedy descent from the entry point, then an `ef_construction` search
    /// on every layer the new node will occupy.
    fn plan_links(
        &self,
        nodes: &[Arc<HnswNode>],
        vector: &[f32],
        norm: f32,
        level: usize,
        ep: EntryPoint,
    ) -> Vec<Vec<u32>> {
        let metric = self.config.distance_metric;
        let mut visited = VisitedSet::new(nodes.len());
        let mut dangling = Vec::new();
        let accept_all = |_: &HnswNode| true;
        let mut current = ep.id;

        for layer in (level + 1..=ep.level).rev() {
            let found = search_layer(
                nodes, metric, vector, norm, &[current], 1, layer, &mut visited, &mut dangling, &accept_all,
            );
            if let Some(&(_, nearest)) = found.first() {
                current = nearest;
            }
        }

        let mut links = vec![Vec::new(); level + 1];
        let mut layer_eps = vec![current];
        for layer in (0..=level.min(ep.level)).rev() {
            let candidates = search_layer(
                nodes,
                metric,
                vector,
                norm,
                &layer_eps,
                self.config.ef_construction,
                layer,
                &mut visited,
                &mut dangling,
                &accept_all,
            );
            let selected = select_neighbors_heuristic(nodes, metric, &candidates, self.max_links(layer));
            links[layer] = selected.iter().map(|&(_, id)| id).collect();
            layer_eps = candidates.iter().map(|&(_, id)| id).collect();
            if layer_eps.is_empty() {
                layer_eps.push(ep.id);
            }
        }
        links
    }

    fn add_back_link(&self, nodes: &[Arc<HnswNode>], target: u32, new: u32, layer: usize) {
        let Some(node) = nodes.get(target as usize) else {
            return;
        };
        let Some(slot) = node.links.get(layer) else {
            return;
        };
        let _edit = node.link_lock.lock();
        let mut list: Vec<u32> = slot.load().as_ref().clone();
        if list.contains(&new) {
            return;
        }
        list.push(new);
        let max = self.max_links(layer);
        if list.len() > max {
            let metric = self.config.distance_metric;
            let candidates: Vec<(f32, u32)> = list
                .iter()
                .filter_map(|&c| {
                    nodes
                        .get(c as usize)
                        .map(|other| (metric.distance(&node.vector, &other.vector), c))
                })
                .collect();
            list = select_neighbors_heuristic(nodes, metric, &candidates, max)
                .into_iter()
                .map(|(_, id)| id)
                .collect();
        }
        slot.store(Arc::new(list));
    }

    /// Rebuild the links of `internal` after a dangling reference was found:
    /// drop ids outside the registry and re-run neighbour selection for
    /// every layer of the node.
    pub(crate) fn repair(&self, internal: u32) {
        let nodes = self.nodes.read();
        let Some(node) = nodes.get(internal as usize).cloned() else {
            return;
        };
        let Some(ep) = *self.entry.read() else {
            return;
        };
        let planned = if ep.id == internal {
            vec![Vec::new(); node.level + 1]
        } else {
            self.plan_links(&nodes, &node.vector, l2_norm(&node.vector), node.level, ep)
        };
        let _edit = node.link_lock.lock();
        for (layer, slot) in node.links.iter().enumerate() {
            let mut merged: Vec<u32> = slot
                .load()
                .iter()
                .copied()
                .filter(|&id| (id as usize) < nodes.len() && id != internal)
                .collect();
            let mut seen: HashSet<u32> = merged.iter().copied().collect();
            if let Some(extra) = planned.get(layer) {
                for &id in extra {
                    if id != internal && seen.insert(id) {
                        merged.push(id);
                    }
                }
            }
            let max = self.max_links(layer);
            if merged.len() > max {
                let metric = self.config.distance_metric;
                let candidates: Vec<(f32, u32)> = merged
                    .iter()
                    .map(|&c| (metric.distance(&node.vector, &nodes[c as usize].vector), c))
                    .collect();
                merged = select_neighbors_heuristic(&nodes, metric, &candidates, max)
                    .into_iter()
                    .map(|(_, id)| id)
                    .collect();
            }
            slot.store(Arc::new(merged));
        }
        tracing::info!(node = node.external_id, internal, "repaired HNSW links");
    }
}

/// Diversity-preferring neighbour selection: a candidate is kept only if it
/// is closer to the base than to every neighbour already kept. Remaining
/// slots are filled with the closest leftovers.
pub(crate) fn select_neighbors_heuristic(
    nodes: &[Arc<HnswNode>],
    metric: super::DistanceMetric,
    candidates: &[(f32, u32)],
    m: usize,
) -> Vec<(f32, u32)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    sorted.dedup_by_key(|c| c.1);

    let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
    for &(dist_to_base, cid) in &sorted {
        if selected.len() >= m {
            break;
        }
        let Some(candidate) = nodes.get(cid as usize) else {
            continue;
        };
        let diverse = selected.iter().all(|&(_, sid)| {
            nodes
                .get(sid as usize)
                .map_or(true, |s| dist_to_base <= metric.distance(&candidate.vector, &s.vector))
        });
        if diverse {
            selected.push((dist_to_base, cid));
        }
    }

    if selected.len() < m {
        let chosen: HashSet<u32> = selected.iter().map(|&(_, id)| id).collect();
        for &(dist, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            if !chosen.contains(&cid) && (cid as usize) < nodes.len() {
                selected.push((dist, cid));
            }
        }
    }
    selected
}
