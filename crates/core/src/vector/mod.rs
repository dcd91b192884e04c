//! Concurrent HNSW vector index.
//!
//! Nodes live in an append-only registry and are addressed by a dense
//! internal `u32`. Each node keeps one neighbour list per layer behind an
//! [`ArcSwap`], so searches read edge lists without taking any lock on the
//! node. Writers serialise per node through a small mutex and publish a
//! whole new list with a single atomic store.
//!
//! Deletes are soft: the node stays in the graph for navigation and is
//! skipped in results. An update tombstones the old node and inserts a fresh
//! one under the same external id. Once tombstones outnumber live nodes (and
//! there are at least [`TOMBSTONE_REBUILD_MIN`] of them) the graph is rebuilt
//! from the live vectors, so update-heavy workloads stay bounded.
//!
//! Recall depends on `m`, `ef_construction` and `ef_search` (see
//! [`HnswConfig`]). Filtered searches double `ef` until `k` accepted results
//! are found or the whole graph has been considered.

pub mod distance;
mod insert;
mod search;
mod visited;

pub use distance::DistanceMetric;

use crate::config::{
    HNSW_DEFAULT_EF_CONSTRUCTION, HNSW_DEFAULT_EF_SEARCH, HNSW_DEFAULT_M, HNSW_DEFAULT_MAX_LAYERS,
};
use crate::NodeId;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Fewest tombstones that can trigger a rebuild.
pub const TOMBSTONE_REBUILD_MIN: usize = 64;

/// HNSW tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Links per node on layers above 0.
    pub m: usize,
    /// Links per node on layer 0 (usually `2 * m`).
    pub m_max0: usize,
    /// Candidate list size while inserting.
    pub ef_construction: usize,
    /// Minimum candidate list size while searching.
    pub ef_search: usize,
    pub max_layers: usize,
    pub distance_metric: DistanceMetric,
    /// Fixed seed for level assignment. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: HNSW_DEFAULT_M,
            m_max0: HNSW_DEFAULT_M * 2,
            ef_construction: HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: HNSW_DEFAULT_EF_SEARCH,
            max_layers: HNSW_DEFAULT_MAX_LAYERS,
            distance_metric: DistanceMetric::Cosine,
            seed: None,
        }
    }
}

pub(crate) struct HnswNode {
    pub(crate) external_id: NodeId,
    pub(crate) vector: Vec<f32>,
    pub(crate) level: usize,
    /// `links[layer]` for every layer `0..=level`.
    pub(crate) links: Vec<ArcSwap<Vec<u32>>>,
    pub(crate) link_lock: Mutex<()>,
    pub(crate) deleted: AtomicBool,
}

impl HnswNode {
    fn new(external_id: NodeId, vector: Vec<f32>, links: Vec<Vec<u32>>) -> Self {
        let level = links.len().saturating_sub(1);
        Self {
            external_id,
            vector,
            level,
            links: links.into_iter().map(ArcSwap::from_pointee).collect(),
            link_lock: Mutex::new(()),
            deleted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryPoint {
    pub(crate) id: u32,
    pub(crate) level: usize,
}

pub struct VectorIndex {
    config: HnswConfig,
    nodes: RwLock<Vec<Arc<HnswNode>>>,
    ids: RwLock<HashMap<NodeId, u32>>,
    entry: RwLock<Option<EntryPoint>>,
    rng: Mutex<StdRng>,
    live: AtomicUsize,
    /// Shared by inserts, removes and searches; a rebuild holds it exclusively.
    rebuild_gate: RwLock<()>,
}

impl VectorIndex {
    pub fn new(config: HnswConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }

    fn with_rng(config: HnswConfig, rng: StdRng) -> Self {
        Self {
            config,
            nodes: RwLock::new(Vec::new()),
            ids: RwLock::new(HashMap::new()),
            entry: RwLock::new(None),
            rng: Mutex::new(rng),
            live: AtomicUsize::new(0),
            rebuild_gate: RwLock::new(()),
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Number of live (not deleted) vectors.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes in the graph including soft-deleted ones.
    pub fn graph_size(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn tombstones(&self) -> usize {
        self.graph_size().saturating_sub(self.len())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        let _gate = self.rebuild_gate.read();
        self.ids.read().contains_key(&id)
    }

    pub fn vector(&self, id: NodeId) -> Option<Vec<f32>> {
        let _gate = self.rebuild_gate.read();
        let internal = *self.ids.read().get(&id)?;
        self.nodes.read().get(internal as usize).map(|n| n.vector.clone())
    }

    /// Soft-delete `id`. Returns false if it was not indexed.
    pub fn remove(&self, id: NodeId) -> bool {
        let removed = {
            let _gate = self.rebuild_gate.read();
            self.remove_node(id)
        };
        if removed {
            self.rebuild_if_sparse();
        }
        removed
    }

    fn remove_node(&self, id: NodeId) -> bool {
        let Some(internal) = self.ids.write().remove(&id) else {
            return false;
        };
        let nodes = self.nodes.read();
        if let Some(node) = nodes.get(internal as usize) {
            node.deleted.store(true, Ordering::Release);
        }
        self.live.fetch_sub(1, Ordering::Relaxed);

        let mut entry = self.entry.write();
        if matches!(*entry, Some(ep) if ep.id == internal) {
            // Prefer a live node on the highest layer; a deleted entry point
            // still navigates, so keep it if nothing is live.
            let replacement = nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| !n.is_deleted())
                .max_by_key(|(i, n)| (n.level, std::cmp::Reverse(*i)))
                .map(|(i, n)| EntryPoint {
                    id: i as u32,
                    level: n.level,
                });
            if replacement.is_some() {
                *entry = replacement;
            }
        }
        true
    }

    /// Replace the vector stored for `id`.
    pub fn update(&self, id: NodeId, vector: Vec<f32>) -> crate::Result<()> {
        {
            let _gate = self.rebuild_gate.read();
            self.remove_node(id);
            self.insert_node(id, vector)?;
        }
        self.rebuild_if_sparse();
        Ok(())
    }

    fn rebuild_if_sparse(&self) {
        let tombstones = self.tombstones();
        if tombstones >= TOMBSTONE_REBUILD_MIN && tombstones > self.len() {
            self.rebuild();
        }
    }

    /// Re-link the live vectors into a fresh graph, dropping every tombstone.
    /// Readers and writers wait while it runs.
    pub fn rebuild(&self) {
        let _gate = self.rebuild_gate.write();
        let live: Vec<(NodeId, Vec<f32>)> = self
            .nodes
            .read()
            .iter()
            .filter(|n| !n.is_deleted())
            .map(|n| (n.external_id, n.vector.clone()))
            .collect();
        let before = self.graph_size();
        let seed: u64 = self.rng.lock().gen();
        let fresh = VectorIndex::with_rng(self.config.clone(), StdRng::seed_from_u64(seed));
        for (id, vector) in live {
            if let Err(e) = fresh.insert_node(id, vector) {
                tracing::error!(node = id, error = %e, "HNSW rebuild aborted");
                return;
            }
        }

        let VectorIndex {
            nodes,
            ids,
            entry,
            live,
            ..
        } = fresh;
        *self.nodes.write() = nodes.into_inner();
        *self.ids.write() = ids.into_inner();
        *self.entry.write() = entry.into_inner();
        self.live.store(live.into_inner(), Ordering::Relaxed);
        tracing::debug!(before, after = self.graph_size(), "HNSW graph rebuilt");
    }

    fn random_level(&self) -> usize {
        let ml = 1.0 / (self.config.m.max(2) as f64).ln();
        let r: f64 = self.rng.lock().gen();
        let level = (-(1.0 - r).ln() * ml).floor() as usize;
        level.min(self.config.max_layers.saturating_sub(1))
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m_max0
        } else {
            self.config.m
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;

    pub(crate) fn seeded_config() -> HnswConfig {
        HnswConfig {
            seed: Some(7),
            ..HnswConfig::default()
        }
    }

    pub(crate) fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect()
    }

    #[test]
    fn levels_follow_geometric_distribution() {
        let index = VectorIndex::new(seeded_config());
        let levels: Vec<usize> = (0..10_000).map(|_| index.random_level()).collect();
        let zero = levels.iter().filter(|&&l| l == 0).count();
        // P(level 0) = 1 - 1/m = 0.9375 for m = 16.
        assert!(zero > 9_000 && zero < 9_700, "level-0 count {zero}");
        assert!(levels.iter().all(|&l| l < HNSW_DEFAULT_MAX_LAYERS));
    }

    #[test]
    fn remove_and_contains() {
        let index = VectorIndex::new(seeded_config());
        index.insert(1, vec![1.0, 0.0]).unwrap();
        index.insert(2, vec![0.0, 1.0]).unwrap();
        assert!(index.contains(1));
        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert!(!index.contains(1));
        assert_eq!(index.len(), 1);
        assert_eq!(index.graph_size(), 2, "soft delete keeps the node in the graph");
    }

    #[test]
    fn update_replaces_vector() {
        let index = VectorIndex::new(seeded_config());
        index.insert(5, vec![1.0, 0.0]).unwrap();
        index.update(5, vec![0.0, 1.0]).unwrap();
        assert_eq!(index.vector(5).unwrap(), vec![0.0, 1.0]);
        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 1.0], 1, |_| true);
        assert_eq!(hits[0].1, 5);
        assert!(hits[0].0 < 1e-6);
    }

    #[test]
    fn repeated_updates_keep_the_graph_bounded() {
        let index = VectorIndex::new(seeded_config());
        index.insert(1, vec![1.0, 0.0]).unwrap();
        index.insert(2, vec![0.0, 1.0]).unwrap();
        for i in 0..500 {
            let angle = i as f32 * 0.01;
            index.update(1, vec![angle.cos(), angle.sin()]).unwrap();
            assert!(index.graph_size() <= 2 + TOMBSTONE_REBUILD_MIN, "size {}", index.graph_size());
        }
        assert_eq!(index.len(), 2);
        let last = 499.0f32 * 0.01;
        assert_eq!(index.vector(1).unwrap(), vec![last.cos(), last.sin()]);
        let hits = index.search(&[0.0, 1.0], 2, |_| true);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1, 2);
    }

    #[test]
    fn rebuild_drops_tombstones_and_keeps_results() {
        let index = VectorIndex::new(seeded_config());
        let data = random_vectors(300, 8, 4);
        for (i, v) in data.iter().enumerate() {
            index.insert(i as u64, v.clone()).unwrap();
        }
        for id in 0..100u64 {
            index.remove(id);
        }
        index.rebuild();
        assert_eq!(index.graph_size(), 200);
        assert_eq!(index.tombstones(), 0);
        let hits = index.search(&data[150], 1, |_| true);
        assert_eq!(hits[0].1, 150);
        assert!(!index.contains(5));
    }

    #[test]
    fn deleting_the_entry_point_promotes_a_live_node() {
        let index = VectorIndex::new(seeded_config());
        let data = random_vectors(50, 4, 9);
        for (i, v) in data.iter().enumerate() {
            index.insert(i as u64, v.clone()).unwrap();
        }
        let ep = (*index.entry.read()).unwrap();
        let ep_external = index.nodes.read()[ep.id as usize].external_id;
        index.remove(ep_external);
        let next = (*index.entry.read()).unwrap();
        assert_ne!(next.id, ep.id);
        assert!(!index.nodes.read()[next.id as usize].is_deleted());
    }

    #[test]
    fn config_deserializes_metric_names() {
        let cfg: HnswConfig = serde_json::from_str(r#"{"distance_metric": "hamming", "seed": 3}"#).unwrap();
        assert_eq!(cfg.distance_metric, DistanceMetric::Hamming);
        assert_eq!(cfg.seed, Some(3));
        assert_eq!(cfg.m, HNSW_DEFAULT_M);
    }
}
