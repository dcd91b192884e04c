//! Sorted in-memory write buffer.
//!
//! The MemTable holds the newest version of every key written since the last
//! flush. A `None` value is a tombstone that shadows older versions stored
//! in SSTables.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Per-entry bookkeeping overhead counted towards the flush threshold.
const ENTRY_OVERHEAD: usize = 24;

/// One version of a key: the sequence number that wrote it and the value,
/// or `None` for a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub seq: u64,
    pub value: Option<Vec<u8>>,
}

impl Versioned {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Default)]
pub struct MemTable {
    map: RwLock<BTreeMap<Vec<u8>, Versioned>>,
    approx_bytes: AtomicUsize,
    max_seq: AtomicU64,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: Vec<u8>, seq: u64, value: Vec<u8>) {
        self.upsert(key, Versioned { seq, value: Some(value) });
    }

    pub fn delete(&self, key: Vec<u8>, seq: u64) {
        self.upsert(key, Versioned { seq, value: None });
    }

    fn upsert(&self, key: Vec<u8>, version: Versioned) {
        let added = key.len() + version.value.as_ref().map_or(0, Vec::len) + ENTRY_OVERHEAD;
        let seq = version.seq;
        let mut map = self.map.write();
        if let Some(existing) = map.get(&key) {
            // Replay can hand us a record older than what is already here.
            if existing.seq > seq {
                return;
            }
        }
        map.insert(key, version);
        drop(map);
        self.approx_bytes.fetch_add(added, Ordering::Relaxed);
        self.max_seq.fetch_max(seq, Ordering::Relaxed);
    }

    pub fn get(&self, key: &[u8]) -> Option<Versioned> {
        self.map.read().get(key).cloned()
    }

    /// Copy out all versions whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Versioned)> {
        let map = self.map.read();
        map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Copy out every entry in key order. Used when flushing.
    pub fn entries(&self) -> Vec<(Vec<u8>, Versioned)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Approximate memory footprint. Overwrites are counted again, so this
    /// grows monotonically until the table is frozen.
    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_sequence_wins() {
        let mem = MemTable::new();
        mem.put(b"k".to_vec(), 5, b"new".to_vec());
        mem.put(b"k".to_vec(), 3, b"stale".to_vec());
        assert_eq!(mem.get(b"k").unwrap().value.as_deref(), Some(&b"new"[..]));

        mem.delete(b"k".to_vec(), 6);
        assert!(mem.get(b"k").unwrap().is_tombstone());
        assert_eq!(mem.max_seq(), 6);
    }

    #[test]
    fn prefix_scan_stops_at_prefix_boundary() {
        let mem = MemTable::new();
        mem.put(b"A1".to_vec(), 1, vec![1]);
        mem.put(b"A2".to_vec(), 2, vec![2]);
        mem.put(b"B1".to_vec(), 3, vec![3]);
        let keys: Vec<Vec<u8>> = mem.scan_prefix(b"A").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"A1".to_vec(), b"A2".to_vec()]);
    }

    #[test]
    fn size_tracks_writes() {
        let mem = MemTable::new();
        assert!(mem.is_empty());
        mem.put(vec![0; 10], 1, vec![0; 100]);
        assert!(mem.approx_bytes() >= 110);
        assert_eq!(mem.len(), 1);
    }
}
