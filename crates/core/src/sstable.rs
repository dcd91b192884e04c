//! Immutable sorted segment files.
//!
//! Layout of `sst/<id:020>.sst`:
//!
//! ```text
//! [entries...][sparse index][bloom filter][footer: 64 bytes]
//!
//! entry  = key_len u32 | key | seq u64 | kind u8 | val_len u32 | val
//! index  = count u32 | (key_len u32 | key | offset u64)*
//! footer = index_off u64 | index_len u64 | bloom_off u64 | bloom_len u64
//!        | entries u64 | max_seq u64 | crc32 u32 | version u32 | magic u64
//! ```
//!
//! All integers are little-endian. The CRC covers every byte before the
//! footer and is verified when the file is opened. Tables are written to a
//! `.tmp` file, fsynced and renamed into place, so a reader never observes a
//! partial segment.

use crate::bloom::BloomFilter;
use crate::memtable::Versioned;
use crate::{Result, RiceError};
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const MAGIC: u64 = 0x5249_4345_5353_5431; // "RICESST1"
const FORMAT_VERSION: u32 = 1;
const FOOTER_LEN: usize = 64;
const KIND_PUT: u8 = 0;
const KIND_TOMBSTONE: u8 = 1;

pub(crate) const SST_EXT: &str = "sst";
pub(crate) const TMP_EXT: &str = "tmp";

#[derive(Debug, Clone, Copy)]
pub struct SsTableOptions {
    pub index_interval: usize,
    pub bloom_bits_per_key: usize,
}

pub(crate) fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.{SST_EXT}"))
}

fn tmp_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.{TMP_EXT}"))
}

/// fsync a directory so a rename inside it is durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Streams sorted entries into a new segment file.
pub struct SsTableWriter {
    id: u64,
    dir: PathBuf,
    out: BufWriter<File>,
    crc: crc32fast::Hasher,
    offset: u64,
    index: Vec<(Vec<u8>, u64)>,
    bloom: BloomFilter,
    entries: u64,
    max_seq: u64,
    interval: usize,
    last_key: Option<Vec<u8>>,
}

impl SsTableWriter {
    pub fn create(dir: &Path, id: u64, expected_keys: usize, opts: SsTableOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path(dir, id))?;
        Ok(Self {
            id,
            dir: dir.to_path_buf(),
            out: BufWriter::new(file),
            crc: crc32fast::Hasher::new(),
            offset: 0,
            index: Vec::new(),
            bloom: BloomFilter::new(expected_keys, opts.bloom_bits_per_key),
            entries: 0,
            max_seq: 0,
            interval: opts.index_interval.max(1),
            last_key: None,
        })
    }

    /// Append one entry. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], version: &Versioned) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(RiceError::Internal(
                    "sstable keys must be strictly ascending".into(),
                ));
            }
        }
        if self.entries % self.interval as u64 == 0 {
            self.index.push((key.to_vec(), self.offset));
        }
        let value = version.value.as_deref().unwrap_or(&[]);
        let kind = if version.is_tombstone() { KIND_TOMBSTONE } else { KIND_PUT };

        let mut buf = Vec::with_capacity(4 + key.len() + 8 + 1 + 4 + value.len());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&version.seq.to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
        self.write(&buf)?;

        self.bloom.insert(key);
        self.entries += 1;
        self.max_seq = self.max_seq.max(version.seq);
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.out.write_all(buf)?;
        self.crc.update(buf);
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Write index, bloom filter and footer, make the file durable and
    /// move it into place.
    pub fn finish(mut self) -> Result<SsTable> {
        let index_off = self.offset;
        let mut index = Vec::new();
        index.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for (key, off) in &self.index {
            index.extend_from_slice(&(key.len() as u32).to_le_bytes());
            index.extend_from_slice(key);
            index.extend_from_slice(&off.to_le_bytes());
        }
        self.write(&index)?;

        let bloom_off = self.offset;
        let bloom = self.bloom.encode();
        self.write(&bloom)?;

        let crc = self.crc.clone().finalize();
        let mut footer = Vec::with_capacity(FOOTER_LEN);
        footer.extend_from_slice(&index_off.to_le_bytes());
        footer.extend_from_slice(&(index.len() as u64).to_le_bytes());
        footer.extend_from_slice(&bloom_off.to_le_bytes());
        footer.extend_from_slice(&(bloom.len() as u64).to_le_bytes());
        footer.extend_from_slice(&self.entries.to_le_bytes());
        footer.extend_from_slice(&self.max_seq.to_le_bytes());
        footer.extend_from_slice(&crc.to_le_bytes());
        footer.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        footer.extend_from_slice(&MAGIC.to_le_bytes());
        self.out.write_all(&footer)?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;

        let tmp = tmp_path(&self.dir, self.id);
        let dest = table_path(&self.dir, self.id);
        fs::rename(&tmp, &dest)?;
        sync_dir(&self.dir)?;
        SsTable::open(&self.dir, self.id)
    }

    /// Drop a half-written table.
    pub fn abandon(self) {
        let tmp = tmp_path(&self.dir, self.id);
        drop(self.out);
        if let Err(e) = fs::remove_file(&tmp) {
            tracing::warn!(path = %tmp.display(), error = %e, "could not remove abandoned sstable");
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// A memory-mapped, immutable segment.
///
/// Held behind `Arc`. When compaction retires a table it is marked obsolete
/// and the file is removed once the last reader drops its handle.
pub struct SsTable {
    id: u64,
    path: PathBuf,
    mmap: Mmap,
    data_end: usize,
    index: Vec<(Vec<u8>, usize)>,
    bloom: BloomFilter,
    entries: u64,
    max_seq: u64,
    obsolete: AtomicBool,
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("id", &self.id)
            .field("entries", &self.entries)
            .field("max_seq", &self.max_seq)
            .finish()
    }
}

fn corrupt(path: &Path, what: &str) -> RiceError {
    RiceError::Storage(format!("corrupt sstable {}: {what}", path.display()))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

/// Decode the entry starting at `pos`. Returns key, version and the offset
/// of the next entry.
fn decode_entry(buf: &[u8], pos: usize) -> Option<(&[u8], Versioned, usize)> {
    let key_len = read_u32(buf, pos)? as usize;
    let key_start = pos + 4;
    let key = buf.get(key_start..key_start + key_len)?;
    let mut at = key_start + key_len;
    let seq = read_u64(buf, at)?;
    at += 8;
    let kind = *buf.get(at)?;
    at += 1;
    let val_len = read_u32(buf, at)? as usize;
    at += 4;
    let val = buf.get(at..at + val_len)?;
    at += val_len;
    let value = match kind {
        KIND_PUT => Some(val.to_vec()),
        KIND_TOMBSTONE => None,
        _ => return None,
    };
    Some((key, Versioned { seq, value }, at))
}

impl SsTable {
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        let path = table_path(dir, id);
        let file = File::open(&path)?;
        // SAFETY: segment files are never modified after the rename that
        // publishes them; they are only ever deleted.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < FOOTER_LEN {
            return Err(corrupt(&path, "file shorter than footer"));
        }
        let footer_at = mmap.len() - FOOTER_LEN;
        let field = |i: usize| read_u64(&mmap, footer_at + i * 8).ok_or_else(|| corrupt(&path, "footer"));
        let index_off = field(0)? as usize;
        let index_len = field(1)? as usize;
        let bloom_off = field(2)? as usize;
        let bloom_len = field(3)? as usize;
        let entries = field(4)?;
        let max_seq = field(5)?;
        let crc = read_u32(&mmap, footer_at + 48).ok_or_else(|| corrupt(&path, "footer"))?;
        let magic = read_u64(&mmap, footer_at + 56).ok_or_else(|| corrupt(&path, "footer"))?;
        if magic != MAGIC {
            return Err(corrupt(&path, "bad magic"));
        }
        if crc32fast::hash(&mmap[..footer_at]) != crc {
            return Err(corrupt(&path, "checksum mismatch"));
        }
        let index_end = index_off.checked_add(index_len);
        let bloom_end = bloom_off.checked_add(bloom_len);
        if index_end != Some(bloom_off) || bloom_end != Some(footer_at) {
            return Err(corrupt(&path, "section offsets"));
        }

        let index_buf = &mmap[index_off..bloom_off];
        let count = read_u32(index_buf, 0).ok_or_else(|| corrupt(&path, "index"))? as usize;
        let mut index = Vec::with_capacity(count);
        let mut at = 4;
        for _ in 0..count {
            let len = read_u32(index_buf, at).ok_or_else(|| corrupt(&path, "index"))? as usize;
            let key = index_buf
                .get(at + 4..at + 4 + len)
                .ok_or_else(|| corrupt(&path, "index"))?
                .to_vec();
            let off = read_u64(index_buf, at + 4 + len).ok_or_else(|| corrupt(&path, "index"))?;
            index.push((key, off as usize));
            at += 4 + len + 8;
        }
        let bloom = BloomFilter::decode(&mmap[bloom_off..footer_at])
            .ok_or_else(|| corrupt(&path, "bloom filter"))?;

        Ok(Self {
            id,
            path,
            mmap,
            data_end: index_off,
            index,
            bloom,
            entries,
            max_seq,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    pub fn size_bytes(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Offset of the index block that may contain `key`, or `None` if the
    /// key sorts before the first key in the table.
    fn block_for(&self, key: &[u8]) -> Option<(usize, usize)> {
        let idx = self.index.partition_point(|(k, _)| k.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        let start = self.index[idx - 1].1;
        let end = self.index.get(idx).map_or(self.data_end, |(_, off)| *off);
        Some((start, end))
    }

    /// Point lookup. A returned tombstone means the key was deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Versioned>> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        let Some((mut pos, end)) = self.block_for(key) else {
            return Ok(None);
        };
        let data = &self.mmap[..self.data_end];
        while pos < end {
            let (k, version, next) =
                decode_entry(data, pos).ok_or_else(|| corrupt(&self.path, "entry"))?;
            match k.cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(version)),
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => pos = next,
            }
        }
        Ok(None)
    }

    /// Iterate entries with key >= `start` in key order.
    pub fn iter_from(self: &Arc<Self>, start: &[u8]) -> SsTableIter {
        let pos = self.block_for(start).map_or(0, |(s, _)| s);
        SsTableIter {
            table: Arc::clone(self),
            pos,
            lower: start.to_vec(),
        }
    }

    pub fn iter(self: &Arc<Self>) -> SsTableIter {
        self.iter_from(&[])
    }

    /// Retire this table. The file is deleted when the last handle drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for SsTable {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove obsolete sstable");
            }
        }
    }
}

/// Owning cursor over an [`SsTable`].
pub struct SsTableIter {
    table: Arc<SsTable>,
    pos: usize,
    lower: Vec<u8>,
}

impl Iterator for SsTableIter {
    type Item = Result<(Vec<u8>, Versioned)>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = &self.table.mmap[..self.table.data_end];
        while self.pos < data.len() {
            let Some((key, version, next)) = decode_entry(data, self.pos) else {
                self.pos = data.len();
                return Some(Err(corrupt(&self.table.path, "entry")));
            };
            self.pos = next;
            if key < self.lower.as_slice() {
                continue;
            }
            return Some(Ok((key.to_vec(), version)));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTS: SsTableOptions = SsTableOptions {
        index_interval: 4,
        bloom_bits_per_key: 10,
    };

    fn build(dir: &Path, id: u64, n: u32) -> Arc<SsTable> {
        let mut w = SsTableWriter::create(dir, id, n as usize, OPTS).unwrap();
        for i in 0..n {
            let value = if i % 10 == 9 { None } else { Some(i.to_le_bytes().to_vec()) };
            w.add(&i.to_be_bytes(), &Versioned { seq: i as u64 + 1, value }).unwrap();
        }
        Arc::new(w.finish().unwrap())
    }

    #[test]
    fn point_lookups_hit_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let table = build(dir.path(), 1, 100);
        assert_eq!(table.entry_count(), 100);
        assert_eq!(table.max_seq(), 100);
        for i in 0u32..100 {
            let v = table.get(&i.to_be_bytes()).unwrap().expect("key present");
            assert_eq!(v.seq, i as u64 + 1);
            if i % 10 == 9 {
                assert!(v.is_tombstone());
            } else {
                assert_eq!(v.value.unwrap(), i.to_le_bytes().to_vec());
            }
        }
        assert!(table.get(&1000u32.to_be_bytes()).unwrap().is_none());
        assert!(table.get(b"").unwrap().is_none());
    }

    #[test]
    fn iter_from_seeks_into_the_middle() {
        let dir = tempfile::tempdir().unwrap();
        let table = build(dir.path(), 1, 50);
        let keys: Vec<Vec<u8>> = table
            .iter_from(&45u32.to_be_bytes())
            .map(|r| r.unwrap().0)
            .collect();
        let expected: Vec<Vec<u8>> = (45u32..50).map(|i| i.to_be_bytes().to_vec()).collect();
        assert_eq!(keys, expected);
        assert_eq!(table.iter().count(), 50);
    }

    #[test]
    fn out_of_order_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SsTableWriter::create(dir.path(), 1, 2, OPTS).unwrap();
        w.add(b"b", &Versioned { seq: 1, value: Some(vec![]) }).unwrap();
        let err = w.add(b"a", &Versioned { seq: 2, value: Some(vec![]) }).unwrap_err();
        assert!(matches!(err, RiceError::Internal(_)));
        w.abandon();
        assert!(!tmp_path(dir.path(), 1).exists());
    }

    #[test]
    fn flipped_byte_fails_checksum_on_open() {
        let dir = tempfile::tempdir().unwrap();
        drop(build(dir.path(), 3, 20));
        let path = table_path(dir.path(), 3);
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        let err = SsTable::open(dir.path(), 3).unwrap_err();
        assert!(matches!(err, RiceError::Storage(_)), "got {err:?}");
    }

    #[test]
    fn oversized_footer_lengths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        drop(build(dir.path(), 4, 20));
        let path = table_path(dir.path(), 4);
        let mut bytes = fs::read(&path).unwrap();
        let index_len_at = bytes.len() - FOOTER_LEN + 8;
        bytes[index_len_at..index_len_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        let err = SsTable::open(dir.path(), 4).unwrap_err();
        assert!(matches!(err, RiceError::Storage(_)), "got {err:?}");
    }

    #[test]
    fn obsolete_table_is_removed_after_last_reader() {
        let dir = tempfile::tempdir().unwrap();
        let table = build(dir.path(), 2, 10);
        let reader = Arc::clone(&table);
        table.mark_obsolete();
        drop(table);
        assert!(table_path(dir.path(), 2).exists(), "reader still holds it");
        drop(reader);
        assert!(!table_path(dir.path(), 2).exists());
    }
}
