//! Log-structured merge store.
//!
//! Writes go to the active [`MemTable`]. A flush freezes it, writes it out as
//! an [`SsTable`] and records the new segment in the [`Manifest`]. Reads
//! consult the active MemTable, then the frozen one still being flushed,
//! then segments from newest to oldest; the first version found wins.
//!
//! Compaction merges every live segment into one with a k-way heap merge,
//! keeping the newest version per key and dropping tombstones. Readers hold
//! `Arc` handles to the segment list they started with, so retiring inputs
//! never blocks or breaks an in-flight read.

use crate::manifest::{Manifest, ManifestState};
use crate::memtable::{MemTable, Versioned};
use crate::sstable::{self, SsTable, SsTableIter, SsTableOptions, SsTableWriter};
use crate::{Result, RiceError};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct LsmOptions {
    pub flush_bytes: usize,
    pub compaction_trigger: usize,
    pub table: SsTableOptions,
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub inputs: usize,
    pub entries_in: u64,
    pub entries_out: u64,
    pub tombstones_dropped: u64,
    pub output: Option<u64>,
}

struct MemTables {
    active: Arc<MemTable>,
    immutable: Option<Arc<MemTable>>,
}

pub struct LsmStore {
    dir: PathBuf,
    options: LsmOptions,
    manifest: Manifest,
    memtables: RwLock<MemTables>,
    segments: RwLock<Arc<Vec<Arc<SsTable>>>>,
    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
}

impl LsmStore {
    /// Open the segment directory, drop files the manifest does not list and
    /// map every live segment.
    pub fn open(dir: impl AsRef<Path>, manifest_path: impl AsRef<Path>, options: LsmOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let manifest = Manifest::open(manifest_path)?;
        let state = manifest.state();

        remove_orphans(&dir, &state.segments)?;

        let mut segments = Vec::with_capacity(state.segments.len());
        for id in &state.segments {
            segments.push(Arc::new(SsTable::open(&dir, *id)?));
        }
        tracing::debug!(segments = segments.len(), "lsm store opened");

        Ok(Self {
            dir,
            options,
            manifest,
            memtables: RwLock::new(MemTables {
                active: Arc::new(MemTable::new()),
                immutable: None,
            }),
            segments: RwLock::new(Arc::new(segments)),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
        })
    }

    pub fn manifest_state(&self) -> ManifestState {
        self.manifest.state()
    }

    pub fn put(&self, key: Vec<u8>, seq: u64, value: Vec<u8>) {
        self.memtables.read().active.put(key, seq, value);
    }

    pub fn delete(&self, key: Vec<u8>, seq: u64) {
        self.memtables.read().active.delete(key, seq);
    }

    fn snapshot(&self) -> (Arc<MemTable>, Option<Arc<MemTable>>, Arc<Vec<Arc<SsTable>>>) {
        let (active, immutable) = {
            let mem = self.memtables.read();
            (Arc::clone(&mem.active), mem.immutable.clone())
        };
        // Segments are read after the MemTables: a flush publishes its
        // segment before it clears the frozen table.
        let segments = Arc::clone(&self.segments.read());
        (active, immutable, segments)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (active, immutable, segments) = self.snapshot();
        if let Some(v) = active.get(key) {
            return Ok(v.value);
        }
        if let Some(v) = immutable.as_ref().and_then(|m| m.get(key)) {
            return Ok(v.value);
        }
        for table in segments.iter().rev() {
            if let Some(v) = table.get(key)? {
                return Ok(v.value);
            }
        }
        Ok(None)
    }

    /// All live entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (active, immutable, segments) = self.snapshot();
        let mut merged: BTreeMap<Vec<u8>, Versioned> = BTreeMap::new();
        let mut absorb = |key: Vec<u8>, version: Versioned| match merged.get(&key) {
            Some(existing) if existing.seq > version.seq => {}
            _ => {
                merged.insert(key, version);
            }
        };
        for table in segments.iter() {
            for entry in table.iter_from(prefix) {
                let (key, version) = entry?;
                if !key.starts_with(prefix) {
                    break;
                }
                absorb(key, version);
            }
        }
        for mem in immutable.iter().chain(std::iter::once(&active)) {
            for (key, version) in mem.scan_prefix(prefix) {
                absorb(key, version);
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.value.map(|value| (k, value)))
            .collect())
    }

    pub fn should_flush(&self) -> bool {
        self.memtables.read().active.approx_bytes() >= self.options.flush_bytes
    }

    pub fn needs_compaction(&self) -> bool {
        self.segments.read().len() >= self.options.compaction_trigger
    }

    pub fn memtable_bytes(&self) -> usize {
        self.memtables.read().active.approx_bytes()
    }

    pub fn segment_ids(&self) -> Vec<u64> {
        self.segments.read().iter().map(|t| t.id()).collect()
    }

    /// Serialises flushes. Held by the caller for the whole freeze/persist
    /// sequence.
    pub fn flush_guard(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }

    /// Swap in an empty active MemTable and return the frozen one. If an
    /// earlier flush failed its table is returned again instead. Returns
    /// `None` when there is nothing to flush.
    pub fn freeze(&self) -> Option<Arc<MemTable>> {
        let mut mem = self.memtables.write();
        if let Some(pending) = &mem.immutable {
            return Some(Arc::clone(pending));
        }
        if mem.active.is_empty() {
            return None;
        }
        let frozen = std::mem::replace(&mut mem.active, Arc::new(MemTable::new()));
        mem.immutable = Some(Arc::clone(&frozen));
        Some(frozen)
    }

    /// Write `frozen` (if any) as a new segment and commit the manifest with
    /// the extra checkpoint fields set by `extra`.
    pub fn persist(
        &self,
        frozen: Option<&Arc<MemTable>>,
        extra: impl FnOnce(&mut ManifestState),
    ) -> Result<Option<u64>> {
        let table = match frozen {
            Some(mem) if !mem.is_empty() => {
                let id = self.manifest.allocate_segment_id();
                let entries = mem.entries();
                let mut writer = SsTableWriter::create(&self.dir, id, entries.len(), self.options.table)?;
                for (key, version) in &entries {
                    if let Err(e) = writer.add(key, version) {
                        writer.abandon();
                        return Err(e);
                    }
                }
                Some(Arc::new(writer.finish()?))
            }
            _ => None,
        };

        let mut segments = self.segments.write();
        let mut ids: Vec<u64> = segments.iter().map(|t| t.id()).collect();
        if let Some(t) = &table {
            ids.push(t.id());
        }
        if let Err(e) = self.manifest.commit(|s| {
            s.segments = ids;
            extra(s);
        }) {
            if let Some(t) = &table {
                t.mark_obsolete();
            }
            return Err(e);
        }
        if let Some(t) = &table {
            let mut next: Vec<Arc<SsTable>> = segments.iter().cloned().collect();
            next.push(Arc::clone(t));
            *segments = Arc::new(next);
        }
        drop(segments);

        if frozen.is_some() {
            self.memtables.write().immutable = None;
        }
        if let Some(t) = &table {
            tracing::info!(segment = t.id(), entries = t.entry_count(), "memtable flushed");
        }
        Ok(table.map(|t| t.id()))
    }

    /// Merge all live segments into one.
    pub fn compact(&self) -> Result<Option<CompactionStats>> {
        let _guard = self.compaction_lock.lock();
        let inputs = Arc::clone(&self.segments.read());
        if inputs.len() < 2 {
            return Ok(None);
        }
        let entries_in: u64 = inputs.iter().map(|t| t.entry_count()).sum();
        let id = self.manifest.allocate_segment_id();
        let mut writer = SsTableWriter::create(&self.dir, id, entries_in as usize, self.options.table)?;
        let mut stats = CompactionStats {
            inputs: inputs.len(),
            entries_in,
            ..CompactionStats::default()
        };

        let merge = MergeIter::new(inputs.iter().map(|t| t.iter()).collect());
        for item in merge {
            let step = item.and_then(|(key, version)| {
                if version.is_tombstone() {
                    // Nothing older than the inputs exists, so the
                    // tombstone has nothing left to shadow.
                    stats.tombstones_dropped += 1;
                    Ok(())
                } else {
                    writer.add(&key, &version)
                }
            });
            if let Err(e) = step {
                writer.abandon();
                return Err(e);
            }
        }

        let output = if writer.entry_count() == 0 {
            writer.abandon();
            None
        } else {
            Some(Arc::new(writer.finish()?))
        };
        stats.entries_out = output.as_ref().map_or(0, |t| t.entry_count());
        stats.output = output.as_ref().map(|t| t.id());

        let mut segments = self.segments.write();
        // Flushes only append, so the inputs are still a prefix of the list.
        let prefix_ok = segments.len() >= inputs.len()
            && segments.iter().zip(inputs.iter()).all(|(a, b)| a.id() == b.id());
        if !prefix_ok {
            if let Some(t) = &output {
                t.mark_obsolete();
            }
            return Err(RiceError::Internal(
                "segment list changed underneath compaction".into(),
            ));
        }
        let mut next: Vec<Arc<SsTable>> = output.iter().cloned().collect();
        next.extend(segments[inputs.len()..].iter().cloned());
        let ids: Vec<u64> = next.iter().map(|t| t.id()).collect();
        if let Err(e) = self.manifest.commit(|s| s.segments = ids) {
            if let Some(t) = &output {
                t.mark_obsolete();
            }
            return Err(e);
        }
        *segments = Arc::new(next);
        drop(segments);

        for table in inputs.iter() {
            table.mark_obsolete();
        }
        tracing::info!(
            inputs = stats.inputs,
            entries_in = stats.entries_in,
            entries_out = stats.entries_out,
            tombstones_dropped = stats.tombstones_dropped,
            "compaction finished"
        );
        Ok(Some(stats))
    }
}

/// Delete temporary files and segments not referenced by the manifest.
fn remove_orphans(dir: &Path, live: &[u64]) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path.extension().and_then(|e| e.to_str());
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        let orphan = match (ext, id) {
            (Some(sstable::TMP_EXT), _) => true,
            (Some(sstable::SST_EXT), Some(id)) => !live.contains(&id),
            _ => false,
        };
        if orphan {
            tracing::warn!(path = %path.display(), "removing orphaned segment file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// K-way merge
// ---------------------------------------------------------------------------

/// Merges sorted segment iterators, yielding only the newest version of
/// each key. Heap order is key ascending, then sequence descending.
struct MergeIter {
    sources: Vec<SsTableIter>,
    heads: Vec<Option<Versioned>>,
    heap: BinaryHeap<Reverse<(Vec<u8>, Reverse<u64>, usize)>>,
    last_key: Option<Vec<u8>>,
    pending_error: Option<RiceError>,
}

impl MergeIter {
    fn new(sources: Vec<SsTableIter>) -> Self {
        let n = sources.len();
        let mut merge = Self {
            sources,
            heads: vec![None; n],
            heap: BinaryHeap::with_capacity(n),
            last_key: None,
            pending_error: None,
        };
        for src in 0..n {
            merge.advance(src);
        }
        merge
    }

    fn advance(&mut self, src: usize) {
        match self.sources[src].next() {
            Some(Ok((key, version))) => {
                self.heap.push(Reverse((key, Reverse(version.seq), src)));
                self.heads[src] = Some(version);
            }
            Some(Err(e)) => {
                self.pending_error.get_or_insert(e);
            }
            None => {}
        }
    }
}

impl Iterator for MergeIter {
    type Item = Result<(Vec<u8>, Versioned)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.pending_error.take() {
                self.heap.clear();
                return Some(Err(e));
            }
            let Reverse((key, _, src)) = self.heap.pop()?;
            let version = self.heads[src].take();
            self.advance(src);
            if self.last_key.as_deref() == Some(key.as_slice()) {
                continue;
            }
            self.last_key = Some(key.clone());
            if let Some(version) = version {
                return Some(Ok((key, version)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LsmOptions {
        LsmOptions {
            flush_bytes: 1024,
            compaction_trigger: 3,
            table: SsTableOptions {
                index_interval: 4,
                bloom_bits_per_key: 10,
            },
        }
    }

    fn open(dir: &Path) -> LsmStore {
        LsmStore::open(dir.join("sst"), dir.join("manifest.redb"), options()).unwrap()
    }

    fn flush(store: &LsmStore) {
        let _g = store.flush_guard();
        let frozen = store.freeze();
        store.persist(frozen.as_ref(), |_| {}).unwrap();
    }

    #[test]
    fn reads_see_memtable_then_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.put(b"a".to_vec(), 1, b"one".to_vec());
        flush(&store);
        store.put(b"a".to_vec(), 2, b"two".to_vec());
        assert_eq!(store.get(b"a").unwrap().unwrap(), b"two");
        flush(&store);
        assert_eq!(store.segment_ids().len(), 2);
        assert_eq!(store.get(b"a").unwrap().unwrap(), b"two");

        store.delete(b"a".to_vec(), 3);
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn prefix_scan_merges_all_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.put(b"x1".to_vec(), 1, b"old".to_vec());
        store.put(b"x2".to_vec(), 2, b"keep".to_vec());
        flush(&store);
        store.put(b"x1".to_vec(), 3, b"new".to_vec());
        store.delete(b"x2".to_vec(), 4);
        store.put(b"y1".to_vec(), 5, b"other".to_vec());

        let rows = store.scan_prefix(b"x").unwrap();
        assert_eq!(rows, vec![(b"x1".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn compaction_preserves_visible_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut seq = 0;
        for round in 0..4u8 {
            for k in 0..20u8 {
                seq += 1;
                if (k + round) % 7 == 0 {
                    store.delete(vec![b'k', k], seq);
                } else {
                    store.put(vec![b'k', k], seq, vec![round, k]);
                }
            }
            flush(&store);
        }
        let before = store.scan_prefix(b"k").unwrap();
        let point_before: Vec<_> = (0..20u8).map(|k| store.get(&[b'k', k]).unwrap()).collect();

        let stats = store.compact().unwrap().expect("compaction ran");
        assert_eq!(stats.inputs, 4);
        assert!(stats.tombstones_dropped > 0);
        assert_eq!(store.segment_ids().len(), 1);

        assert_eq!(store.scan_prefix(b"k").unwrap(), before);
        let point_after: Vec<_> = (0..20u8).map(|k| store.get(&[b'k', k]).unwrap()).collect();
        assert_eq!(point_after, point_before);
    }

    #[test]
    fn compaction_retires_input_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.put(b"a".to_vec(), 1, vec![1]);
        flush(&store);
        store.put(b"b".to_vec(), 2, vec![2]);
        flush(&store);
        let old = store.segment_ids();
        store.compact().unwrap();
        for id in old {
            assert!(!sstable::table_path(&dir.path().join("sst"), id).exists());
        }
    }

    #[test]
    fn reopen_drops_unlisted_files_and_keeps_segments() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.put(b"a".to_vec(), 1, vec![1]);
            flush(&store);
        }
        let stray = sstable::table_path(&dir.path().join("sst"), 999);
        fs::write(&stray, b"junk").unwrap();
        fs::write(dir.path().join("sst").join("00000000000000000998.tmp"), b"junk").unwrap();

        let store = open(dir.path());
        assert!(!stray.exists());
        assert_eq!(store.get(b"a").unwrap().unwrap(), vec![1]);
        assert_eq!(store.manifest_state().segments.len(), 1);
    }

    #[test]
    fn freeze_of_empty_memtable_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert!(store.freeze().is_none());
        assert_eq!(store.persist(None, |s| s.last_sequence = 9).unwrap(), None);
        assert_eq!(store.manifest_state().last_sequence, 9);
    }
}
