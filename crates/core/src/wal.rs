//! Segmented write-ahead log.
//!
//! Every mutation is appended here before it touches the MemTable or any
//! in-memory index. Records are framed as
//! `[u32 length BE][u32 CRC32 BE][bincode payload]` and written to numbered
//! segment files under `wal/`. A checkpoint rotates to a fresh segment; once
//! the rotated-out segments are covered by a committed SSTable they are
//! deleted.
//!
//! Replay stops at the first torn or corrupt frame and truncates the segment
//! there, so a crash in the middle of an append loses at most that one
//! unacknowledged record.

use crate::keys::EdgeKey;
use crate::sdm::BitVector;
use crate::{NodeId, NodeRecord, Result, RiceError, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SEGMENT_EXT: &str = "log";
const FRAME_HEADER: usize = 8;

/// Upper bound on a single frame payload; anything larger is treated as a
/// corrupt length prefix.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One logged mutation. Each variant carries the full effect of the
/// operation, so replaying a record never consults prior state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    /// New node plus its initial permission masks (owner first).
    Insert {
        node: NodeId,
        record: NodeRecord,
        grants: Vec<(UserId, u8)>,
    },
    /// Replace the stored record of an existing node.
    Update {
        node: NodeId,
        record: NodeRecord,
        vector_changed: bool,
    },
    /// Remove a node together with its ACL rows and every edge touching it.
    Delete {
        node: NodeId,
        acl_users: Vec<UserId>,
        edges: Vec<EdgeKey>,
    },
    EdgeAdd {
        from: NodeId,
        to: NodeId,
        relation: String,
        weight: f64,
    },
    EdgeRemove {
        edges: Vec<EdgeKey>,
    },
    /// Set the permission mask of `user` on `node`. A mask of 0 removes the row.
    PermissionSet {
        node: NodeId,
        user: UserId,
        mask: u8,
    },
    SdmWrite {
        address: BitVector,
        data: BitVector,
        writer: UserId,
    },
}

impl WalOp {
    pub fn kind(&self) -> &'static str {
        match self {
            WalOp::Insert { .. } => "insert",
            WalOp::Update { .. } => "update",
            WalOp::Delete { .. } => "delete",
            WalOp::EdgeAdd { .. } => "edge-add",
            WalOp::EdgeRemove { .. } => "edge-remove",
            WalOp::PermissionSet { .. } => "permission-change",
            WalOp::SdmWrite { .. } => "sdm-write",
        }
    }
}

/// A sequenced, timestamped mutation as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub op: WalOp,
}

/// Diagnostic statistics from a WAL replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Segments read.
    pub segments: usize,
    /// Records decoded and returned.
    pub records: usize,
    /// Frames whose CRC did not match (replay of that segment stopped).
    pub crc_errors: usize,
    /// Whether a segment ended in a partial frame.
    pub truncated: bool,
    /// Bytes cut from segment tails.
    pub bytes_discarded: u64,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct SegmentWriter {
    id: u64,
    file: BufWriter<File>,
    len: u64,
    records: u64,
    next_seq: u64,
    failed: bool,
}

/// Append-only log of [`WalRecord`]s split into numbered segment files.
pub struct WriteAheadLog {
    dir: PathBuf,
    sync: bool,
    writer: Mutex<SegmentWriter>,
}

impl WriteAheadLog {
    /// Start writing a new segment `segment_id` in `dir`. The first record
    /// appended gets sequence number `next_seq`.
    pub fn create(dir: impl AsRef<Path>, segment_id: u64, next_seq: u64, sync: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let file = open_segment(&dir, segment_id)?;
        let len = file.metadata()?.len();
        Ok(Self {
            dir,
            sync,
            writer: Mutex::new(SegmentWriter {
                id: segment_id,
                file: BufWriter::new(file),
                len,
                records: 0,
                next_seq,
                failed: false,
            }),
        })
    }

    /// Assign the next sequence number to `op` and append it durably.
    ///
    /// A write failure leaves the log refusing further appends; the engine
    /// has to be reopened so replay can restore a consistent tail.
    pub fn append(&self, op: WalOp) -> Result<WalRecord> {
        let mut w = self.writer.lock();
        if w.failed {
            return Err(RiceError::Storage(
                "write-ahead log failed earlier; reopen the database to recover".into(),
            ));
        }
        let record = WalRecord {
            seq: w.next_seq,
            timestamp: Utc::now(),
            op,
        };
        let frame = encode_frame(&record)?;
        if let Err(e) = write_frame(&mut w, &frame, self.sync) {
            w.failed = true;
            let start = w.len;
            // Best effort: drop the partial frame so later replays end cleanly.
            let _ = w.file.get_ref().set_len(start);
            tracing::error!(segment = w.id, error = %e, "WAL append failed");
            return Err(e.into());
        }
        w.len += frame.len() as u64;
        w.records += 1;
        w.next_seq += 1;
        Ok(record)
    }

    /// Close the current segment and start the next one. Returns the id of
    /// the segment that was closed; every record appended so far lives in
    /// segments with id <= the returned value.
    pub fn rotate(&self) -> Result<u64> {
        let mut w = self.writer.lock();
        w.file.flush()?;
        w.file.get_ref().sync_all()?;
        let closed = w.id;
        let next = closed + 1;
        let file = open_segment(&self.dir, next)?;
        w.id = next;
        w.file = BufWriter::new(file);
        w.len = 0;
        w.records = 0;
        tracing::debug!(closed, next, "WAL segment rotated");
        Ok(closed)
    }

    /// Sequence number of the most recently appended record (0 if none yet).
    pub fn last_sequence(&self) -> u64 {
        self.writer.lock().next_seq.saturating_sub(1)
    }

    pub fn current_segment(&self) -> u64 {
        self.writer.lock().id
    }

    /// Records appended to the segment currently being written.
    pub fn pending_records(&self) -> u64 {
        self.writer.lock().records
    }

    /// Remove every segment with id <= `through`.
    pub fn delete_segments_through(&self, through: u64) -> Result<usize> {
        let mut removed = 0;
        for id in list_segments(&self.dir)? {
            if id <= through {
                fs::remove_file(segment_path(&self.dir, id))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn write_frame(w: &mut SegmentWriter, frame: &[u8], sync: bool) -> io::Result<()> {
    w.file.write_all(frame)?;
    w.file.flush()?;
    if sync {
        w.file.get_ref().sync_data()?;
    }
    Ok(())
}

fn open_segment(dir: &Path, id: u64) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(segment_path(dir, id))
}

pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.{SEGMENT_EXT}"))
}

/// Ids of all segment files in `dir`, ascending.
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn encode_frame(record: &WalRecord) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Read every segment in `dir` with id > `after_segment`, in order.
///
/// A torn or corrupt tail is cut off at the last good frame. Corruption in a
/// segment that is followed by newer segments is reported the same way; the
/// records after the damage in that segment are lost but later segments are
/// still read.
pub fn replay(dir: &Path, after_segment: u64) -> Result<(Vec<WalRecord>, ReplayStats)> {
    let mut records = Vec::new();
    let mut stats = ReplayStats::default();
    for id in list_segments(dir)? {
        if id <= after_segment {
            continue;
        }
        stats.segments += 1;
        replay_segment(&segment_path(dir, id), &mut records, &mut stats)?;
    }
    Ok((records, stats))
}

fn replay_segment(path: &Path, out: &mut Vec<WalRecord>, stats: &mut ReplayStats) -> Result<()> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut good_len: u64 = 0;
    let mut header = [0u8; FRAME_HEADER];

    loop {
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if good_len < file_len {
                    stats.truncated = true;
                }
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let stored_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_FRAME_BYTES {
            tracing::warn!(path = %path.display(), len, "WAL frame length out of range, stopping replay");
            stats.crc_errors += 1;
            break;
        }
        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!(path = %path.display(), "WAL truncated mid-record, stopping replay");
                stats.truncated = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        if crc32fast::hash(&payload) != stored_crc {
            tracing::warn!(path = %path.display(), offset = good_len, "WAL record CRC mismatch, stopping replay");
            stats.crc_errors += 1;
            break;
        }
        match bincode::deserialize::<WalRecord>(&payload) {
            Ok(record) => {
                out.push(record);
                stats.records += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "WAL record undecodable, stopping replay");
                stats.crc_errors += 1;
                break;
            }
        }
        good_len += (FRAME_HEADER + len) as u64;
    }

    if good_len < file_len {
        stats.bytes_discarded += file_len - good_len;
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(good_len)?;
        file.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metadata;
    use std::io::Seek;

    fn insert_op(node: NodeId) -> WalOp {
        WalOp::Insert {
            node,
            record: NodeRecord {
                vector: vec![node as f32, 1.0],
                metadata: Metadata::new(),
                owner: 1,
            },
            grants: vec![(1, 0b111)],
        }
    }

    #[test]
    fn appended_records_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::create(dir.path(), 1, 1, true).unwrap();
        for n in 0..5 {
            let rec = wal.append(insert_op(n)).unwrap();
            assert_eq!(rec.seq, n + 1);
        }
        assert_eq!(wal.last_sequence(), 5);
        drop(wal);

        let (records, stats) = replay(dir.path(), 0).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(stats.records, 5);
        assert!(!stats.truncated);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(records[2].op, insert_op(2));
    }

    #[test]
    fn torn_tail_is_truncated_and_prior_records_survive() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::create(dir.path(), 1, 1, true).unwrap();
        wal.append(insert_op(1)).unwrap();
        wal.append(insert_op(2)).unwrap();
        drop(wal);

        let path = segment_path(dir.path(), 1);
        let good_len = fs::metadata(&path).unwrap().len();
        // Half-written frame: header claims 100 bytes, only 3 follow.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&100u32.to_be_bytes()).unwrap();
        f.write_all(&0u32.to_be_bytes()).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        drop(f);

        let (records, stats) = replay(dir.path(), 0).unwrap();
        assert_eq!(records.len(), 2);
        assert!(stats.truncated);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len, "tail should be cut");
    }

    #[test]
    fn crc_mismatch_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::create(dir.path(), 1, 1, true).unwrap();
        wal.append(insert_op(1)).unwrap();
        let first_end = fs::metadata(segment_path(dir.path(), 1)).unwrap().len();
        wal.append(insert_op(2)).unwrap();
        drop(wal);

        // Flip a payload byte of the second record.
        let path = segment_path(dir.path(), 1);
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.seek(io::SeekFrom::Start(first_end + FRAME_HEADER as u64 + 2)).unwrap();
        let mut b = [0u8; 1];
        f.read_exact(&mut b).unwrap();
        f.seek(io::SeekFrom::Start(first_end + FRAME_HEADER as u64 + 2)).unwrap();
        f.write_all(&[b[0] ^ 0xFF]).unwrap();
        drop(f);

        let (records, stats) = replay(dir.path(), 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(stats.crc_errors, 1);
    }

    #[test]
    fn rotation_splits_segments_and_replay_skips_checkpointed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::create(dir.path(), 1, 1, false).unwrap();
        wal.append(insert_op(1)).unwrap();
        let closed = wal.rotate().unwrap();
        assert_eq!(closed, 1);
        assert_eq!(wal.current_segment(), 2);
        assert_eq!(wal.pending_records(), 0);
        wal.append(insert_op(2)).unwrap();

        assert_eq!(list_segments(dir.path()).unwrap(), vec![1, 2]);
        let (records, _) = replay(dir.path(), 1).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 2);

        assert_eq!(wal.delete_segments_through(1).unwrap(), 1);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![2]);
    }

    #[test]
    fn sequence_numbers_continue_from_the_given_start() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::create(dir.path(), 7, 41, true).unwrap();
        let rec = wal.append(WalOp::PermissionSet { node: 1, user: 2, mask: 1 }).unwrap();
        assert_eq!(rec.seq, 41);
        assert_eq!(rec.op.kind(), "permission-change");
    }
}
