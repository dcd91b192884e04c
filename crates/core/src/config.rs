//! Engine configuration.
//!
//! Compile-time defaults and validation limits live here as constants. Runtime
//! configuration is an [`EngineConfig`] value, either built in code (every
//! field has a default) or loaded from a JSON document.

use crate::sdm::SdmConfig;
use crate::vector::HnswConfig;
use crate::{Result, RiceError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of links per HNSW node on layers above 0.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default candidate list size while building the HNSW graph.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default candidate list size while searching layer 0.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 64;

/// Hard cap on the number of HNSW layers.
pub const HNSW_DEFAULT_MAX_LAYERS: usize = 16;

/// MemTable size (approximate bytes of keys + values) that triggers a flush.
pub const DEFAULT_MEMTABLE_BYTES: usize = 4 * 1024 * 1024;

/// One sparse index entry is written every this many keys.
pub const DEFAULT_SSTABLE_INDEX_INTERVAL: usize = 16;

/// Bloom filter budget per key. 10 bits gives roughly a 1% false positive rate.
pub const DEFAULT_BLOOM_BITS_PER_KEY: usize = 10;

/// Number of live SSTables that schedules a background compaction.
pub const DEFAULT_COMPACTION_TRIGGER: usize = 4;

/// Width of SDM addresses and data words, in 64-bit chunks.
pub const SDM_WORDS: usize = 16;

/// Width of SDM addresses and data words, in bits.
pub const SDM_BITS: usize = SDM_WORDS * 64;

/// Default Hamming radius used when reading the SDM.
pub const SDM_DEFAULT_RADIUS: u32 = 256;

/// Default number of cells the SDM table holds before evicting the oldest.
pub const SDM_DEFAULT_CAPACITY: usize = 100_000;

/// Maximum accepted vector dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum `k` for a single search request.
pub const MAX_K: usize = 10_000;

/// Maximum number of metadata keys per node.
pub const MAX_METADATA_KEYS: usize = 64;

/// Maximum length of a metadata key or string value, in bytes.
pub const MAX_METADATA_STRING_BYTES: usize = 64 * 1024;

/// Maximum length of an edge relation label, in bytes.
pub const MAX_RELATION_BYTES: usize = 256;

/// Maximum number of items in one batch call.
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Maximum depth accepted by graph traversal.
pub const MAX_TRAVERSAL_DEPTH: usize = 64;

/// Runtime configuration for a [`Database`](crate::Database).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed vector dimension. `None` adopts the dimension of the first insert.
    pub dimension: Option<usize>,
    /// Approximate MemTable size in bytes that triggers a flush.
    pub memtable_flush_bytes: usize,
    /// Keys between two sparse index entries in an SSTable.
    pub sstable_index_interval: usize,
    /// Bloom filter bits per key.
    pub bloom_bits_per_key: usize,
    /// Live segment count that schedules a compaction.
    pub compaction_trigger: usize,
    /// Run flush and compaction on a background thread.
    pub background_maintenance: bool,
    /// fsync every WAL append. Turning this off trades durability for speed.
    pub wal_sync: bool,
    /// Vector index tuning.
    pub hnsw: HnswConfig,
    /// Sparse distributed memory tuning.
    pub sdm: SdmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: None,
            memtable_flush_bytes: DEFAULT_MEMTABLE_BYTES,
            sstable_index_interval: DEFAULT_SSTABLE_INDEX_INTERVAL,
            bloom_bits_per_key: DEFAULT_BLOOM_BITS_PER_KEY,
            compaction_trigger: DEFAULT_COMPACTION_TRIGGER,
            background_maintenance: true,
            wal_sync: true,
            hnsw: HnswConfig::default(),
            sdm: SdmConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(dim) = self.dimension {
            if dim == 0 || dim > MAX_DIMENSION {
                return Err(RiceError::Validation(format!(
                    "dimension must be in 1..={MAX_DIMENSION}, got {dim}"
                )));
            }
        }
        if self.memtable_flush_bytes == 0 {
            return Err(RiceError::Validation(
                "memtable_flush_bytes must be > 0".into(),
            ));
        }
        if self.sstable_index_interval == 0 {
            return Err(RiceError::Validation(
                "sstable_index_interval must be > 0".into(),
            ));
        }
        if self.bloom_bits_per_key == 0 {
            return Err(RiceError::Validation(
                "bloom_bits_per_key must be > 0".into(),
            ));
        }
        if self.compaction_trigger < 2 {
            return Err(RiceError::Validation(
                "compaction_trigger must be >= 2".into(),
            ));
        }
        if self.hnsw.m < 2 {
            return Err(RiceError::Validation("hnsw.m must be >= 2".into()));
        }
        if self.hnsw.m_max0 < self.hnsw.m {
            return Err(RiceError::Validation("hnsw.m_max0 must be >= hnsw.m".into()));
        }
        if self.hnsw.ef_construction == 0 || self.hnsw.ef_search == 0 {
            return Err(RiceError::Validation(
                "hnsw ef parameters must be > 0".into(),
            ));
        }
        if self.hnsw.max_layers == 0 {
            return Err(RiceError::Validation("hnsw.max_layers must be > 0".into()));
        }
        if self.sdm.capacity == 0 {
            return Err(RiceError::Validation("sdm.capacity must be > 0".into()));
        }
        if self.sdm.radius as usize > SDM_BITS {
            return Err(RiceError::Validation(format!(
                "sdm.radius must be <= {SDM_BITS}"
            )));
        }
        Ok(())
    }
}
