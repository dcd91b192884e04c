//! Shared helpers for the engine integration tests.
#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ricedb::{EngineConfig, HnswConfig, Metadata, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test harness. `RUST_LOG=ricedb=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Foreground maintenance and a fixed HNSW seed so runs are repeatable.
pub fn config() -> EngineConfig {
    EngineConfig {
        background_maintenance: false,
        wal_sync: false,
        hnsw: HnswConfig {
            seed: Some(42),
            ..HnswConfig::default()
        },
        ..EngineConfig::default()
    }
}

pub fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

pub fn meta(pairs: &[(&str, Value)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Path of the WAL segment currently being written.
pub fn newest_wal_segment(db_dir: &Path) -> PathBuf {
    let mut segments: Vec<PathBuf> = fs::read_dir(db_dir.join("wal"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    segments.sort();
    segments.pop().expect("no WAL segment")
}

/// Newest segment that actually holds records.
pub fn newest_nonempty_wal_segment(db_dir: &Path) -> PathBuf {
    let mut segments: Vec<PathBuf> = fs::read_dir(db_dir.join("wal"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| fs::metadata(p).unwrap().len() > 0)
        .collect();
    segments.sort();
    segments.pop().expect("no non-empty WAL segment")
}
