//! Sparse distributed memory.
//!
//! A content-addressable table of `(address, data)` cells over 1024-bit
//! vectors. A read collects every cell written by the same user whose
//! address lies within the configured Hamming radius of the query and
//! returns the bitwise majority of their data, so a noisy address still
//! recalls what was stored near it.
//!
//! The table holds at most `capacity` cells; the oldest cell is evicted
//! first. Writes are logged through the WAL and the whole table is
//! snapshotted at every checkpoint.

use crate::config::{SDM_BITS, SDM_DEFAULT_CAPACITY, SDM_DEFAULT_RADIUS, SDM_WORDS};
use crate::{Result, RiceError, UserId};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// A 1024-bit address or data word, stored as 16 `u64` chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitVector([u64; SDM_WORDS]);

impl BitVector {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let mut chunks = [0u64; SDM_WORDS];
        rng.fill(&mut chunks[..]);
        Self(chunks)
    }

    pub fn from_chunks(chunks: &[u64]) -> Result<Self> {
        let chunks: [u64; SDM_WORDS] = chunks.try_into().map_err(|_| {
            RiceError::Validation(format!(
                "bit vector needs exactly {SDM_WORDS} chunks, got {}",
                chunks.len()
            ))
        })?;
        Ok(Self(chunks))
    }

    pub fn chunks(&self) -> &[u64; SDM_WORDS] {
        &self.0
    }

    pub fn hamming_distance(&self, other: &BitVector) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    pub fn bit(&self, i: usize) -> bool {
        (self.0[i / 64] >> (i % 64)) & 1 == 1
    }

    pub fn set_bit(&mut self, i: usize, value: bool) {
        let mask = 1u64 << (i % 64);
        if value {
            self.0[i / 64] |= mask;
        } else {
            self.0[i / 64] &= !mask;
        }
    }

    pub fn flip_bit(&mut self, i: usize) {
        self.0[i / 64] ^= 1u64 << (i % 64);
    }

    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|c| c.count_ones()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdmConfig {
    /// Maximum cells held before the oldest is evicted.
    pub capacity: usize,
    /// Hamming radius for reads, in bits.
    pub radius: u32,
}

impl Default for SdmConfig {
    fn default() -> Self {
        Self {
            capacity: SDM_DEFAULT_CAPACITY,
            radius: SDM_DEFAULT_RADIUS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Cell {
    address: BitVector,
    data: BitVector,
    writer: UserId,
}

/// Result of a successful read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recall {
    pub data: BitVector,
    /// Cells that voted.
    pub matches: usize,
    /// Hamming distance of the closest voting cell.
    pub nearest: u32,
}

pub struct SdmStore {
    config: SdmConfig,
    cells: RwLock<VecDeque<Cell>>,
}

impl SdmStore {
    pub fn new(config: SdmConfig) -> Self {
        Self {
            config,
            cells: RwLock::new(VecDeque::new()),
        }
    }

    pub fn write(&self, address: BitVector, data: BitVector, writer: UserId) {
        let mut cells = self.cells.write();
        cells.push_back(Cell {
            address,
            data,
            writer,
        });
        while cells.len() > self.config.capacity {
            cells.pop_front();
        }
    }

    /// Majority vote over `reader`'s cells within the radius of `address`.
    /// Ties resolve to 0. `None` when no cell is close enough.
    pub fn read(&self, address: &BitVector, reader: UserId) -> Option<Recall> {
        let cells = self.cells.read();
        let mut votes = [0i32; SDM_BITS];
        let mut matches = 0;
        let mut nearest = u32::MAX;
        for cell in cells.iter().filter(|c| c.writer == reader) {
            let dist = cell.address.hamming_distance(address);
            if dist > self.config.radius {
                continue;
            }
            matches += 1;
            nearest = nearest.min(dist);
            for (i, vote) in votes.iter_mut().enumerate() {
                *vote += if cell.data.bit(i) { 1 } else { -1 };
            }
        }
        if matches == 0 {
            return None;
        }
        let mut data = BitVector::zero();
        for (i, vote) in votes.iter().enumerate() {
            if *vote > 0 {
                data.set_bit(i, true);
            }
        }
        Some(Recall {
            data,
            matches,
            nearest,
        })
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    /// Persist every cell to `dir/<id>.snap` (tmp file, fsync, rename).
    pub fn save_snapshot(&self, dir: &Path, id: u64) -> Result<PathBuf> {
        let cells: Vec<Cell> = self.cells.read().iter().cloned().collect();
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{id:020}.snap.tmp"));
        let dest = snapshot_path(dir, id);
        {
            let file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
            let mut out = BufWriter::new(file);
            bincode::serialize_into(&mut out, &cells)?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &dest)?;
        crate::sstable::sync_dir(dir)?;
        Ok(dest)
    }

    /// Replace the table contents with a snapshot.
    pub fn load_snapshot(&self, dir: &Path, id: u64) -> Result<usize> {
        let file = File::open(snapshot_path(dir, id))?;
        let loaded: Vec<Cell> = bincode::deserialize_from(BufReader::new(file))?;
        let mut cells = self.cells.write();
        cells.clear();
        cells.extend(loaded);
        while cells.len() > self.config.capacity {
            cells.pop_front();
        }
        Ok(cells.len())
    }
}

pub(crate) fn snapshot_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.snap"))
}

/// Remove every snapshot file in `dir` other than `keep`.
pub(crate) fn remove_stale_snapshots(dir: &Path, keep: Option<u64>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let keep_path = keep.map(|id| snapshot_path(dir, id));
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if Some(&path) != keep_path.as_ref() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn flip(v: &BitVector, n: usize, rng: &mut StdRng) -> BitVector {
        let mut out = *v;
        let mut flipped = std::collections::HashSet::new();
        while flipped.len() < n {
            let i = rng.gen_range(0..SDM_BITS);
            if flipped.insert(i) {
                out.flip_bit(i);
            }
        }
        out
    }

    #[test]
    fn hamming_distance_counts_differing_bits() {
        let a = BitVector::zero();
        let mut b = BitVector::zero();
        b.set_bit(0, true);
        b.set_bit(1023, true);
        assert_eq!(a.hamming_distance(&b), 2);
        assert_eq!(b.count_ones(), 2);
        assert!(b.bit(1023));
    }

    #[test]
    fn from_chunks_requires_sixteen_words() {
        assert!(BitVector::from_chunks(&[0; 16]).is_ok());
        assert!(matches!(BitVector::from_chunks(&[0; 15]), Err(RiceError::Validation(_))));
    }

    #[test]
    fn noisy_address_recalls_stored_data() {
        let mut rng = StdRng::seed_from_u64(1);
        let sdm = SdmStore::new(SdmConfig::default());
        let address = BitVector::random(&mut rng);
        let data = BitVector::random(&mut rng);
        sdm.write(address, data, 7);
        // Unrelated cells from the same writer sit ~512 bits away.
        for _ in 0..20 {
            sdm.write(BitVector::random(&mut rng), BitVector::random(&mut rng), 7);
        }
        let noisy = flip(&address, 100, &mut rng);
        let recall = sdm.read(&noisy, 7).expect("within radius");
        assert_eq!(recall.data, data);
        assert_eq!(recall.matches, 1);
        assert_eq!(recall.nearest, 100);
    }

    #[test]
    fn read_far_from_everything_is_none() {
        let mut rng = StdRng::seed_from_u64(2);
        let sdm = SdmStore::new(SdmConfig::default());
        sdm.write(BitVector::random(&mut rng), BitVector::random(&mut rng), 1);
        assert!(sdm.read(&BitVector::random(&mut rng), 1).is_none());
    }

    #[test]
    fn cells_are_private_to_their_writer() {
        let sdm = SdmStore::new(SdmConfig::default());
        let addr = BitVector::zero();
        let mut data = BitVector::zero();
        data.set_bit(5, true);
        sdm.write(addr, data, 1);
        assert!(sdm.read(&addr, 2).is_none());
        assert_eq!(sdm.read(&addr, 1).unwrap().data, data);
    }

    #[test]
    fn majority_vote_breaks_ties_to_zero() {
        let sdm = SdmStore::new(SdmConfig::default());
        let addr = BitVector::zero();
        let mut one = BitVector::zero();
        one.set_bit(3, true);
        one.set_bit(4, true);
        let mut two = BitVector::zero();
        two.set_bit(4, true);
        sdm.write(addr, one, 1);
        sdm.write(addr, two, 1);
        let out = sdm.read(&addr, 1).unwrap().data;
        assert!(!out.bit(3), "1 vs 1 vote is a tie");
        assert!(out.bit(4));
        assert_eq!(out.count_ones(), 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let sdm = SdmStore::new(SdmConfig { capacity: 2, radius: 0 });
        let mut a = BitVector::zero();
        a.set_bit(0, true);
        let mut b = BitVector::zero();
        b.set_bit(1, true);
        let mut c = BitVector::zero();
        c.set_bit(2, true);
        sdm.write(a, a, 1);
        sdm.write(b, b, 1);
        sdm.write(c, c, 1);
        assert_eq!(sdm.len(), 2);
        assert!(sdm.read(&a, 1).is_none());
        assert!(sdm.read(&c, 1).is_some());
    }

    #[test]
    fn snapshot_restores_cells() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let sdm = SdmStore::new(SdmConfig::default());
        let addr = BitVector::random(&mut rng);
        let data = BitVector::random(&mut rng);
        sdm.write(addr, data, 4);
        sdm.save_snapshot(dir.path(), 9).unwrap();

        let restored = SdmStore::new(SdmConfig::default());
        assert_eq!(restored.load_snapshot(dir.path(), 9).unwrap(), 1);
        assert_eq!(restored.read(&addr, 4).unwrap().data, data);

        remove_stale_snapshots(dir.path(), None).unwrap();
        assert!(!snapshot_path(dir.path(), 9).exists());
    }
}
