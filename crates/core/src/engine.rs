//! RiceDB: embedded multi-agent AI database engine.
//!
//! A [`Database`] stores caller-identified nodes (a dense vector plus scalar
//! metadata) and answers similarity queries over them, while keeping a typed
//! relation graph between nodes, per-node read/write/delete permissions and
//! a sparse distributed memory of 1024-bit words.
//!
//! Every mutation is appended to a write-ahead log and applied to an LSM
//! store before it is acknowledged. The HNSW vector index, the graph
//! adjacency and the permission bitmaps are in-memory views over the LSM
//! and are rebuilt from it on open.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use ricedb::{Database, Metadata, Permissions};
//!
//! let db = Database::open("agents.ricedb").unwrap();
//!
//! // Node 1, owned by user 100.
//! db.insert(1, vec![0.1, 0.9, 0.3], Metadata::new(), 100).unwrap();
//!
//! // User 200 cannot see it until the owner grants read access.
//! assert!(db.search(&[0.1, 0.9, 0.3], 200, 5, None).unwrap().is_empty());
//! db.grant(100, 1, 200, Permissions::READ).unwrap();
//! assert_eq!(db.search(&[0.1, 0.9, 0.3], 200, 5, None).unwrap()[0].id, 1);
//! ```

pub mod acl;
mod bloom;
pub mod config;
pub mod embedding;
pub mod events;
pub mod filter;
pub mod graph;
mod keys;
mod lsm;
mod manifest;
mod memtable;
pub mod sdm;
mod sstable;
mod validation;
pub mod vector;
mod wal;

pub use acl::{Permission, Permissions};
pub use config::EngineConfig;
pub use embedding::{HashEmbedder, TextEmbedder};
pub use events::{Event, EventFilter, EventKind, Subscription};
pub use filter::{Condition, FilterOp, MetadataFilter};
pub use graph::{Edge, GraphSample};
pub use keys::EdgeKey;
pub use lsm::CompactionStats;
pub use sdm::{BitVector, Recall, SdmConfig};
pub use vector::{DistanceMetric, HnswConfig};
pub use wal::ReplayStats;

use acl::AclStore;
use events::EventBus;
use graph::GraphStore;
use lsm::{LsmOptions, LsmStore};
use parking_lot::{Mutex, MutexGuard, RwLock};
use roaring::RoaringTreemap;
use sdm::SdmStore;
use serde::{Deserialize, Serialize};
use sstable::SsTableOptions;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use vector::VectorIndex;
use wal::{WalOp, WalRecord, WriteAheadLog};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RiceError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("node {0} already exists")]
    DuplicateId(NodeId),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("index inconsistency: {0}")]
    IndexInconsistency(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RiceError {
    fn from(e: std::io::Error) -> Self {
        RiceError::Storage(e.to_string())
    }
}
impl From<serde_json::Error> for RiceError {
    fn from(e: serde_json::Error) -> Self {
        RiceError::Serialization(e.to_string())
    }
}
impl From<bincode::Error> for RiceError {
    fn from(e: bincode::Error) -> Self {
        RiceError::Serialization(e.to_string())
    }
}
impl From<redb::DatabaseError> for RiceError {
    fn from(e: redb::DatabaseError) -> Self {
        RiceError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for RiceError {
    fn from(e: redb::TransactionError) -> Self {
        RiceError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for RiceError {
    fn from(e: redb::TableError) -> Self {
        RiceError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for RiceError {
    fn from(e: redb::StorageError) -> Self {
        RiceError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for RiceError {
    fn from(e: redb::CommitError) -> Self {
        RiceError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RiceError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Caller-assigned node identifier. Immutable once used.
pub type NodeId = u64;

/// Identity on whose behalf an operation runs.
pub type UserId = u64;

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Ordered metadata attached to a node.
pub type Metadata = BTreeMap<String, Value>;

/// What the LSM store keeps under a node key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub owner: UserId,
}

/// Acknowledgement of a durable mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// WAL sequence number assigned to the mutation.
    pub sequence: u64,
}

/// A node as seen by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: NodeId,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub owner: UserId,
    /// The viewing user's permissions on the node.
    pub permissions: Permissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: NodeId,
    pub distance: f32,
    pub metadata: Metadata,
}

/// Input row for [`Database::batch_insert`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    pub id: NodeId,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    pub owner: UserId,
}

#[derive(Debug)]
pub struct BatchFailure<K> {
    pub item: K,
    pub error: RiceError,
}

/// Per-item outcome of a batch call. Items are attempted independently.
#[derive(Debug)]
pub struct BatchReport<K> {
    pub successful: Vec<K>,
    pub failed: Vec<BatchFailure<K>>,
}

impl<K> Default for BatchReport<K> {
    fn default() -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<K> BatchReport<K> {
    fn record(&mut self, item: K, outcome: Result<Ack>) {
        match outcome {
            Ok(_) => self.successful.push(item),
            Err(error) => self.failed.push(BatchFailure { item, error }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub last_sequence: u64,
    /// Live nodes in the vector index.
    pub nodes: usize,
    /// Nodes in the HNSW graph, including soft-deleted ones.
    pub hnsw_graph_size: usize,
    pub edges: usize,
    pub acl_nodes: usize,
    pub sdm_cells: usize,
    pub dimension: Option<usize>,
    pub memtable_bytes: usize,
    pub segments: Vec<u64>,
    pub wal_segment: u64,
    pub subscribers: usize,
    /// What the last open recovered from the WAL.
    pub recovery: ReplayStats,
}

// ---------------------------------------------------------------------------
// Shared engine state
// ---------------------------------------------------------------------------

const WAL_DIR: &str = "wal";
const SST_DIR: &str = "sst";
const SDM_DIR: &str = "sdm";
const MANIFEST_FILE: &str = "manifest.redb";
const NODE_LOCK_STRIPES: usize = 64;
const TEXT_FIELD: &str = "text";

/// Where a checkpoint cuts the WAL.
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    wal_segment: u64,
    last_sequence: u64,
}

/// Who may observe an event.
enum Audience {
    Readers(NodeId),
    Captured(RoaringTreemap),
    Only(UserId),
}

struct Shared {
    config: EngineConfig,
    sdm_dir: PathBuf,
    wal: WriteAheadLog,
    /// Writers hold it shared from WAL append through LSM apply; a
    /// checkpoint holds it exclusively while it cuts the log.
    write_gate: RwLock<()>,
    lsm: LsmStore,
    vectors: VectorIndex,
    graph: GraphStore,
    acl: AclStore,
    sdm: SdmStore,
    events: EventBus,
    dimension: Mutex<Option<usize>>,
    node_locks: Box<[Mutex<()>]>,
    pending_checkpoint: Mutex<Option<Checkpoint>>,
    flush_scheduled: AtomicBool,
    recovery: ReplayStats,
}

/// Apply the durable effect of `record`: LSM rows, and SDM cells which are
/// covered by snapshots instead.
fn apply_durable(lsm: &LsmStore, sdm: &SdmStore, record: &WalRecord) -> Result<()> {
    let seq = record.seq;
    match &record.op {
        WalOp::Insert {
            node,
            record: stored,
            grants,
        } => {
            lsm.put(keys::node_key(*node), seq, bincode::serialize(stored)?);
            for (user, mask) in grants {
                lsm.put(keys::acl_key(*node, *user), seq, vec![*mask]);
            }
        }
        WalOp::Update {
            node,
            record: stored,
            ..
        } => {
            lsm.put(keys::node_key(*node), seq, bincode::serialize(stored)?);
        }
        WalOp::Delete {
            node,
            acl_users,
            edges,
        } => {
            lsm.delete(keys::node_key(*node), seq);
            for user in acl_users {
                lsm.delete(keys::acl_key(*node, *user), seq);
            }
            for edge in edges {
                lsm.delete(edge.encode(), seq);
            }
        }
        WalOp::EdgeAdd {
            from,
            to,
            relation,
            weight,
        } => {
            let key = EdgeKey {
                from: *from,
                to: *to,
                relation: relation.clone(),
                seq,
            };
            lsm.put(key.encode(), seq, weight.to_le_bytes().to_vec());
        }
        WalOp::EdgeRemove { edges } => {
            for edge in edges {
                lsm.delete(edge.encode(), seq);
            }
        }
        WalOp::PermissionSet { node, user, mask } => {
            if *mask == 0 {
                lsm.delete(keys::acl_key(*node, *user), seq);
            } else {
                lsm.put(keys::acl_key(*node, *user), seq, vec![*mask]);
            }
        }
        WalOp::SdmWrite {
            address,
            data,
            writer,
        } => sdm.write(*address, *data, *writer),
    }
    Ok(())
}

fn stripe(id: NodeId) -> usize {
    (id % NODE_LOCK_STRIPES as u64) as usize
}

impl Shared {
    fn lock_node(&self, id: NodeId) -> MutexGuard<'_, ()> {
        self.node_locks[stripe(id)].lock()
    }

    /// Lock both ends of an edge, lower stripe first.
    fn lock_pair(&self, a: NodeId, b: NodeId) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (lo, hi) = (stripe(a).min(stripe(b)), stripe(a).max(stripe(b)));
        let first = self.node_locks[lo].lock();
        let second = (hi != lo).then(|| self.node_locks[hi].lock());
        (first, second)
    }

    fn dimension(&self) -> Option<usize> {
        *self.dimension.lock()
    }

    /// Fix the engine dimension on the first insert, or check against it.
    fn pin_dimension(&self, len: usize) -> Result<()> {
        let mut dim = self.dimension.lock();
        match *dim {
            Some(d) if d != len => Err(RiceError::Validation(format!(
                "vector must have exactly {d} dimensions, got {len}"
            ))),
            Some(_) => Ok(()),
            None => {
                *dim = Some(len);
                Ok(())
            }
        }
    }

    fn load(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        match self.lsm.get(&keys::node_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The stored record, if it exists and `user` may read it. Both failure
    /// cases produce the same error.
    fn visible(&self, id: NodeId, user: UserId) -> Result<NodeRecord> {
        match self.load(id)? {
            Some(record) if self.acl.check(id, user, Permission::Read) => Ok(record),
            _ => Err(RiceError::NotFound(format!("node {id}"))),
        }
    }

    /// Permission rows only exist for live nodes, so this also checks
    /// existence without touching the LSM store.
    fn readable(&self, id: NodeId, user: UserId) -> bool {
        self.acl.check(id, user, Permission::Read)
    }

    fn require_readable(&self, id: NodeId, user: UserId) -> Result<()> {
        if self.readable(id, user) {
            Ok(())
        } else {
            Err(RiceError::NotFound(format!("node {id}")))
        }
    }

    /// Users who may read both ends of an edge.
    fn edge_readers(&self, from: NodeId, to: NodeId) -> RoaringTreemap {
        &self.acl.readers(from) & &self.acl.readers(to)
    }

    fn require(&self, id: NodeId, user: UserId, perm: Permission) -> Result<()> {
        if self.acl.check(id, user, perm) {
            Ok(())
        } else {
            Err(RiceError::Unauthorized(format!(
                "user {user} lacks {perm:?} permission on node {id}"
            )))
        }
    }

    /// Log `op`, then make it visible in the LSM store and the indexes.
    fn commit(&self, op: WalOp) -> Result<WalRecord> {
        let record = {
            let _gate = self.write_gate.read();
            let record = self.wal.append(op)?;
            apply_durable(&self.lsm, &self.sdm, &record)?;
            record
        };
        self.apply_to_indexes(&record);
        Ok(record)
    }

    fn apply_to_indexes(&self, record: &WalRecord) {
        match &record.op {
            WalOp::Insert {
                node,
                record: stored,
                grants,
            } => {
                if let Err(e) = self.vectors.insert(*node, stored.vector.clone()) {
                    tracing::error!(node, seq = record.seq, error = %e, "vector index rejected logged insert");
                }
                for (user, mask) in grants {
                    self.acl.set(*node, *user, Permissions::from_mask(*mask));
                }
            }
            WalOp::Update {
                node,
                record: stored,
                vector_changed,
            } => {
                if *vector_changed {
                    if let Err(e) = self.vectors.update(*node, stored.vector.clone()) {
                        tracing::error!(node, seq = record.seq, error = %e, "vector index rejected logged update");
                    }
                }
            }
            WalOp::Delete { node, edges, .. } => {
                self.vectors.remove(*node);
                self.acl.remove_node(*node);
                self.graph.remove(edges);
            }
            WalOp::EdgeAdd {
                from,
                to,
                relation,
                weight,
            } => self.graph.add(Edge {
                from: *from,
                to: *to,
                relation: relation.clone(),
                weight: *weight,
                seq: record.seq,
            }),
            WalOp::EdgeRemove { edges } => {
                self.graph.remove(edges);
            }
            WalOp::PermissionSet { node, user, mask } => {
                self.acl.set(*node, *user, Permissions::from_mask(*mask));
            }
            WalOp::SdmWrite { .. } => {}
        }
        tracing::trace!(seq = record.seq, op = record.op.kind(), "mutation applied");
    }

    fn publish(&self, record: &WalRecord, kind: EventKind, node: Option<NodeId>, vector: Option<Vec<f32>>, audience: Audience) {
        let event = Event {
            sequence: record.seq,
            kind,
            node,
            vector,
        };
        match audience {
            Audience::Readers(id) => self
                .events
                .publish(&event, |u| self.acl.check(id, u, Permission::Read)),
            Audience::Captured(readers) => self.events.publish(&event, |u| readers.contains(u)),
            Audience::Only(user) => self.events.publish(&event, |u| u == user),
        }
    }

    /// Persist the MemTable as an SSTable, record the checkpoint in the
    /// manifest and drop the WAL segments it covers. Returns false when
    /// there was nothing to checkpoint.
    fn checkpoint(&self) -> Result<bool> {
        let _flush = self.lsm.flush_guard();
        let retry = self.pending_checkpoint.lock().take();
        let (frozen, point) = match retry {
            // An earlier persist failed; its frozen table is still pending.
            Some(point) => (self.lsm.freeze(), point),
            None => {
                let _gate = self.write_gate.write();
                if self.lsm.memtable_bytes() == 0 && self.wal.pending_records() == 0 {
                    return Ok(false);
                }
                let closed = self.wal.rotate()?;
                self.sdm.save_snapshot(&self.sdm_dir, closed)?;
                let point = Checkpoint {
                    wal_segment: closed,
                    last_sequence: self.wal.last_sequence(),
                };
                (self.lsm.freeze(), point)
            }
        };

        let persisted = self.lsm.persist(frozen.as_ref(), |s| {
            s.checkpoint_wal_segment = point.wal_segment;
            s.last_sequence = s.last_sequence.max(point.last_sequence);
            s.sdm_snapshot = Some(point.wal_segment);
        });
        let segment = match persisted {
            Ok(segment) => segment,
            Err(e) => {
                *self.pending_checkpoint.lock() = Some(point);
                return Err(e);
            }
        };

        let removed = self.wal.delete_segments_through(point.wal_segment)?;
        sdm::remove_stale_snapshots(&self.sdm_dir, Some(point.wal_segment))?;
        tracing::info!(
            wal_segment = point.wal_segment,
            last_sequence = point.last_sequence,
            segment,
            wal_segments_removed = removed,
            "checkpoint complete"
        );
        Ok(true)
    }

    fn compact_if_needed(&self) {
        if !self.lsm.needs_compaction() {
            return;
        }
        if let Err(e) = self.lsm.compact() {
            tracing::error!(error = %e, "compaction failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Background maintenance
// ---------------------------------------------------------------------------

enum Task {
    Flush,
    Shutdown,
}

struct Maintenance {
    tx: Mutex<Sender<Task>>,
    handle: Option<JoinHandle<()>>,
}

fn run_maintenance(shared: Arc<Shared>, rx: Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        match task {
            Task::Shutdown => break,
            Task::Flush => {
                shared.flush_scheduled.store(false, Ordering::Release);
                if let Err(e) = shared.checkpoint() {
                    tracing::error!(error = %e, "background flush failed");
                    continue;
                }
                shared.compact_if_needed();
            }
        }
    }
    tracing::debug!("maintenance thread stopped");
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// An open RiceDB data directory.
///
/// All methods take `&self`; share a `Database` between threads with an
/// [`Arc`]. Dropping it stops the maintenance thread. Everything
/// acknowledged is already in the WAL, so no explicit close is needed.
pub struct Database {
    shared: Arc<Shared>,
    maintenance: Option<Maintenance>,
}

impl Database {
    /// Open or create a database directory with the default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    /// Open or create a database directory, replaying any WAL records that
    /// were not yet checkpointed and rebuilding the in-memory indexes.
    pub fn open_with_config(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let dir = path.as_ref().to_path_buf();
        let wal_dir = dir.join(WAL_DIR);
        let sdm_dir = dir.join(SDM_DIR);
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&sdm_dir)?;

        let lsm = LsmStore::open(
            dir.join(SST_DIR),
            dir.join(MANIFEST_FILE),
            LsmOptions {
                flush_bytes: config.memtable_flush_bytes,
                compaction_trigger: config.compaction_trigger,
                table: SsTableOptions {
                    index_interval: config.sstable_index_interval,
                    bloom_bits_per_key: config.bloom_bits_per_key,
                },
            },
        )?;
        let state = lsm.manifest_state();

        let sdm = SdmStore::new(config.sdm.clone());
        if let Some(id) = state.sdm_snapshot {
            let cells = sdm.load_snapshot(&sdm_dir, id)?;
            tracing::debug!(snapshot = id, cells, "SDM snapshot loaded");
        }
        sdm::remove_stale_snapshots(&sdm_dir, state.sdm_snapshot)?;

        let (records, recovery) = wal::replay(&wal_dir, state.checkpoint_wal_segment)?;
        let mut last_seq = state.last_sequence;
        let mut replayed = 0usize;
        for record in &records {
            if record.seq <= state.last_sequence {
                continue;
            }
            apply_durable(&lsm, &sdm, record)?;
            last_seq = last_seq.max(record.seq);
            replayed += 1;
        }

        let newest_segment = wal::list_segments(&wal_dir)?
            .last()
            .copied()
            .unwrap_or(0)
            .max(state.checkpoint_wal_segment);
        let wal = WriteAheadLog::create(&wal_dir, newest_segment + 1, last_seq + 1, config.wal_sync)?;
        wal.delete_segments_through(state.checkpoint_wal_segment)?;

        let vectors = VectorIndex::new(config.hnsw.clone());
        let mut dimension = config.dimension;
        for (key, value) in lsm.scan_prefix(&keys::node_prefix())? {
            let Some(id) = keys::decode_node_key(&key) else {
                tracing::warn!(key = ?key, "skipping malformed node key");
                continue;
            };
            let record: NodeRecord = bincode::deserialize(&value)?;
            match dimension {
                Some(d) if d != record.vector.len() => {
                    return Err(RiceError::Validation(format!(
                        "node {id} has {} dimensions but the database uses {d}",
                        record.vector.len()
                    )));
                }
                Some(_) => {}
                None => dimension = Some(record.vector.len()),
            }
            vectors.insert(id, record.vector)?;
        }

        let acl = AclStore::new();
        for (key, value) in lsm.scan_prefix(&keys::acl_prefix())? {
            if let Some((node, user)) = keys::decode_acl_key(&key) {
                let mask = value.first().copied().unwrap_or(0);
                acl.set(node, user, Permissions::from_mask(mask));
            }
        }

        let graph = GraphStore::new();
        for (key, value) in lsm.scan_prefix(&keys::edge_prefix())? {
            let Some(edge) = EdgeKey::decode(&key) else {
                tracing::warn!(key = ?key, "skipping malformed edge key");
                continue;
            };
            let weight: [u8; 8] = value.as_slice().try_into().map_err(|_| {
                RiceError::IndexInconsistency(format!(
                    "edge {} -> {} has a {}-byte weight",
                    edge.from,
                    edge.to,
                    value.len()
                ))
            })?;
            graph.add(Edge {
                from: edge.from,
                to: edge.to,
                relation: edge.relation,
                weight: f64::from_le_bytes(weight),
                seq: edge.seq,
            });
        }

        tracing::info!(
            path = %dir.display(),
            nodes = vectors.len(),
            edges = graph.edge_count(),
            segments = state.segments.len(),
            replayed,
            truncated = recovery.truncated,
            "database opened"
        );

        let shared = Arc::new(Shared {
            sdm_dir,
            wal,
            write_gate: RwLock::new(()),
            lsm,
            vectors,
            graph,
            acl,
            sdm,
            events: EventBus::new(),
            dimension: Mutex::new(dimension),
            node_locks: (0..NODE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            pending_checkpoint: Mutex::new(None),
            flush_scheduled: AtomicBool::new(false),
            recovery,
            config,
        });

        let maintenance = if shared.config.background_maintenance {
            let (tx, rx) = mpsc::channel();
            let worker = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("ricedb-maintenance".into())
                .spawn(move || run_maintenance(worker, rx))?;
            Some(Maintenance {
                tx: Mutex::new(tx),
                handle: Some(handle),
            })
        } else {
            None
        };

        let db = Self { shared, maintenance };
        db.after_write();
        Ok(db)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Schedule a flush once the MemTable is over its threshold.
    fn after_write(&self) {
        let s = &self.shared;
        if !s.lsm.should_flush() {
            return;
        }
        match &self.maintenance {
            Some(m) => {
                if !s.flush_scheduled.swap(true, Ordering::AcqRel) && m.tx.lock().send(Task::Flush).is_err() {
                    s.flush_scheduled.store(false, Ordering::Release);
                    tracing::error!("maintenance thread is gone; flush not scheduled");
                }
            }
            None => {
                if let Err(e) = s.checkpoint() {
                    tracing::error!(error = %e, "flush failed");
                    return;
                }
                s.compact_if_needed();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Insert a new node owned by `owner`, who gets every permission on it.
    ///
    /// Fails with [`RiceError::DuplicateId`] if `id` is in use; use
    /// [`update`](Self::update) to overwrite.
    pub fn insert(&self, id: NodeId, vector: Vec<f32>, metadata: Metadata, owner: UserId) -> Result<Ack> {
        self.insert_with_acl(id, vector, metadata, &[(owner, Permissions::ALL)])
    }

    /// Insert a node and grant every listed `(user, permissions)` pair. The
    /// first user is the owner and always gets every permission.
    pub fn insert_with_acl(
        &self,
        id: NodeId,
        vector: Vec<f32>,
        metadata: Metadata,
        user_permissions: &[(UserId, Permissions)],
    ) -> Result<Ack> {
        let s = &self.shared;
        validation::vector(&vector, s.dimension())?;
        validation::metadata(&metadata)?;
        let Some(&(owner, _)) = user_permissions.first() else {
            return Err(RiceError::Validation(
                "insert_with_acl needs at least the owner".into(),
            ));
        };
        let mut masks: BTreeMap<UserId, Permissions> = BTreeMap::new();
        for (i, (user, perms)) in user_permissions.iter().enumerate() {
            let perms = if i == 0 { Permissions::ALL } else { *perms };
            let merged = masks.get(user).copied().unwrap_or_default().union(perms);
            masks.insert(*user, merged);
        }
        let mut grants = vec![(owner, Permissions::ALL.mask())];
        grants.extend(
            masks
                .into_iter()
                .filter(|(u, p)| *u != owner && !p.is_empty())
                .map(|(u, p)| (u, p.mask())),
        );

        let guard = s.lock_node(id);
        if s.load(id)?.is_some() {
            return Err(RiceError::DuplicateId(id));
        }
        s.pin_dimension(vector.len())?;
        let event_vector = vector.clone();
        let record = s.commit(WalOp::Insert {
            node: id,
            record: NodeRecord {
                vector,
                metadata,
                owner,
            },
            grants,
        })?;
        s.publish(&record, EventKind::NodeInserted, Some(id), Some(event_vector), Audience::Readers(id));
        drop(guard);
        self.after_write();
        Ok(Ack { sequence: record.seq })
    }

    /// Replace the vector and metadata of a node. Needs write permission;
    /// a node the caller cannot read is reported as not found.
    pub fn update(&self, id: NodeId, vector: Vec<f32>, metadata: Metadata, user: UserId) -> Result<Ack> {
        let s = &self.shared;
        validation::vector(&vector, s.dimension())?;
        validation::metadata(&metadata)?;
        self.rewrite(id, user, |old| NodeRecord {
            vector,
            metadata,
            owner: old.owner,
        })
    }

    /// Replace only the metadata of a node.
    pub fn update_metadata(&self, id: NodeId, metadata: Metadata, user: UserId) -> Result<Ack> {
        validation::metadata(&metadata)?;
        self.rewrite(id, user, |old| NodeRecord {
            vector: old.vector.clone(),
            metadata,
            owner: old.owner,
        })
    }

    fn rewrite(&self, id: NodeId, user: UserId, build: impl FnOnce(&NodeRecord) -> NodeRecord) -> Result<Ack> {
        let s = &self.shared;
        let guard = s.lock_node(id);
        let old = s.visible(id, user)?;
        s.require(id, user, Permission::Write)?;
        let next = build(&old);
        let vector_changed = next.vector != old.vector;
        let event_vector = vector_changed.then(|| next.vector.clone());
        let record = s.commit(WalOp::Update {
            node: id,
            record: next,
            vector_changed,
        })?;
        s.publish(&record, EventKind::NodeUpdated, Some(id), event_vector, Audience::Readers(id));
        drop(guard);
        self.after_write();
        Ok(Ack { sequence: record.seq })
    }

    pub fn get_node(&self, id: NodeId, user: UserId) -> Result<NodeView> {
        let s = &self.shared;
        let record = s.visible(id, user)?;
        Ok(NodeView {
            id,
            vector: record.vector,
            metadata: record.metadata,
            owner: record.owner,
            permissions: s.acl.permissions(id, user),
        })
    }

    /// Delete a node with its permissions and every edge touching it.
    pub fn delete(&self, id: NodeId, user: UserId) -> Result<Ack> {
        let s = &self.shared;
        let guard = s.lock_node(id);
        s.visible(id, user)?;
        s.require(id, user, Permission::Delete)?;
        let readers = s.acl.readers(id);
        let record = s.commit(WalOp::Delete {
            node: id,
            acl_users: s.acl.users_of(id),
            edges: s.graph.touching(id),
        })?;
        s.publish(&record, EventKind::NodeDeleted, Some(id), None, Audience::Captured(readers));
        drop(guard);
        self.after_write();
        Ok(Ack { sequence: record.seq })
    }

    /// Insert many nodes; each succeeds or fails on its own.
    pub fn batch_insert(&self, nodes: Vec<NewNode>) -> Result<BatchReport<NodeId>> {
        validation::batch(nodes.len())?;
        let mut report = BatchReport::default();
        for node in nodes {
            let outcome = self.insert(node.id, node.vector, node.metadata, node.owner);
            report.record(node.id, outcome);
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// The `k` nearest nodes `user` may read, ordered by ascending distance
    /// and then id. Nodes hidden by permissions or by `filter` never take a
    /// result slot. Nothing visible yields an empty list.
    pub fn search(
        &self,
        query: &[f32],
        user: UserId,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        let s = &self.shared;
        validation::k(k)?;
        validation::vector(query, s.dimension())?;
        let filter = filter.filter(|f| !f.is_empty());

        let loaded: RefCell<HashMap<NodeId, NodeRecord>> = RefCell::new(HashMap::new());
        let failure: RefCell<Option<RiceError>> = RefCell::new(None);
        let hits = s.vectors.search(query, k, |id| {
            if !s.acl.check(id, user, Permission::Read) {
                return false;
            }
            let Some(filter) = filter else {
                return true;
            };
            match s.load(id) {
                Ok(Some(record)) => {
                    let keep = filter.matches(&record.metadata);
                    if keep {
                        loaded.borrow_mut().insert(id, record);
                    }
                    keep
                }
                Ok(None) => false,
                Err(e) => {
                    failure.borrow_mut().get_or_insert(e);
                    false
                }
            }
        });
        if let Some(e) = failure.into_inner() {
            return Err(e);
        }

        let mut loaded = loaded.into_inner();
        let mut out = Vec::with_capacity(hits.len());
        for (distance, id) in hits {
            let record = match loaded.remove(&id) {
                Some(r) => r,
                // Deleted after the index answered.
                None => match s.load(id)? {
                    Some(r) => r,
                    None => continue,
                },
            };
            out.push(SearchHit {
                id,
                distance,
                metadata: record.metadata,
            });
        }
        Ok(out)
    }

    /// Embed `text` and insert it. The text is kept under the `text`
    /// metadata field unless the caller already set one.
    pub fn insert_text(
        &self,
        id: NodeId,
        text: &str,
        mut metadata: Metadata,
        owner: UserId,
        embedder: &dyn TextEmbedder,
    ) -> Result<Ack> {
        let vector = embedder.embed(text)?;
        metadata
            .entry(TEXT_FIELD.to_string())
            .or_insert_with(|| Value::Text(text.to_string()));
        self.insert(id, vector, metadata, owner)
    }

    pub fn search_text(
        &self,
        text: &str,
        user: UserId,
        k: usize,
        filter: Option<&MetadataFilter>,
        embedder: &dyn TextEmbedder,
    ) -> Result<Vec<SearchHit>> {
        let query = embedder.embed(text)?;
        self.search(&query, user, k, filter)
    }

    // -----------------------------------------------------------------------
    // Graph
    // -----------------------------------------------------------------------

    /// Add a directed edge. `user` needs write permission on `from` and read
    /// permission on `to`. Repeating an identical call adds another edge.
    pub fn add_edge(&self, from: NodeId, to: NodeId, relation: &str, weight: f64, user: UserId) -> Result<Ack> {
        validation::relation(relation)?;
        validation::weight(weight)?;
        let s = &self.shared;
        let guards = s.lock_pair(from, to);
        s.visible(from, user)?;
        s.visible(to, user)?;
        s.require(from, user, Permission::Write)?;
        let record = s.commit(WalOp::EdgeAdd {
            from,
            to,
            relation: relation.to_string(),
            weight,
        })?;
        s.publish(
            &record,
            EventKind::EdgeAdded {
                to,
                relation: relation.to_string(),
            },
            Some(from),
            None,
            Audience::Captured(s.edge_readers(from, to)),
        );
        drop(guards);
        self.after_write();
        Ok(Ack { sequence: record.seq })
    }

    /// Same as [`add_edge`](Self::add_edge), in subject-relation-object order.
    pub fn link(&self, from: NodeId, relation: &str, to: NodeId, weight: f64, user: UserId) -> Result<Ack> {
        self.add_edge(from, to, relation, weight, user)
    }

    /// Remove every `from -> to` edge labelled `relation`. Needs the same
    /// permissions as [`add_edge`](Self::add_edge). Returns how many edges
    /// were removed; removing an absent edge is a no-op and logs nothing.
    pub fn remove_edge(&self, from: NodeId, to: NodeId, relation: &str, user: UserId) -> Result<usize> {
        validation::relation(relation)?;
        let s = &self.shared;
        let guards = s.lock_pair(from, to);
        s.visible(from, user)?;
        s.visible(to, user)?;
        s.require(from, user, Permission::Write)?;
        let edges = s.graph.matching(from, to, relation);
        if edges.is_empty() {
            return Ok(0);
        }
        let removed = edges.len();
        let record = s.commit(WalOp::EdgeRemove { edges })?;
        s.publish(
            &record,
            EventKind::EdgeRemoved {
                to,
                relation: relation.to_string(),
            },
            Some(from),
            None,
            Audience::Captured(s.edge_readers(from, to)),
        );
        drop(guards);
        self.after_write();
        Ok(removed)
    }

    /// Distinct targets of edges leaving `node` that `user` may read,
    /// optionally restricted to one relation, ascending.
    pub fn neighbors(&self, node: NodeId, relation: Option<&str>, user: UserId) -> Result<Vec<NodeId>> {
        let s = &self.shared;
        s.require_readable(node, user)?;
        Ok(s.graph.neighbors(node, relation, |id| s.readable(id, user)))
    }

    pub fn edges_from(&self, node: NodeId, user: UserId) -> Result<Vec<Edge>> {
        let s = &self.shared;
        s.require_readable(node, user)?;
        Ok(s.graph.edges_from(node, |id| s.readable(id, user)))
    }

    /// Nodes `user` may read that are reachable from `start` in at most
    /// `max_depth` hops through readable nodes, `start` first, each once.
    pub fn traverse(&self, start: NodeId, max_depth: usize, user: UserId) -> Result<Vec<NodeId>> {
        validation::depth(max_depth)?;
        let s = &self.shared;
        s.require_readable(start, user)?;
        Ok(s.graph.traverse(start, max_depth, |id| s.readable(id, user)))
    }

    /// Up to `limit` edges whose endpoints `user` may both read.
    pub fn sample_graph(&self, limit: usize, user: UserId) -> GraphSample {
        let s = &self.shared;
        s.graph.sample(limit, |id| s.readable(id, user))
    }

    // -----------------------------------------------------------------------
    // Access control
    // -----------------------------------------------------------------------

    /// Add `permissions` to what `user` already holds on `node`. The caller
    /// needs write permission.
    pub fn grant(&self, caller: UserId, node: NodeId, user: UserId, permissions: Permissions) -> Result<Ack> {
        if permissions.is_empty() {
            return Err(RiceError::Validation("grant needs at least one permission".into()));
        }
        let s = &self.shared;
        let guard = s.lock_node(node);
        s.visible(node, caller)?;
        s.require(node, caller, Permission::Write)?;
        let mask = s.acl.permissions(node, user).union(permissions).mask();
        let ack = self.set_permissions(node, user, mask)?;
        drop(guard);
        self.after_write();
        Ok(ack)
    }

    /// Clear every permission `user` holds on `node`. The owner's
    /// permissions cannot be revoked.
    pub fn revoke(&self, caller: UserId, node: NodeId, user: UserId) -> Result<Ack> {
        let s = &self.shared;
        let guard = s.lock_node(node);
        let record = s.visible(node, caller)?;
        s.require(node, caller, Permission::Write)?;
        if record.owner == user {
            return Err(RiceError::Validation(format!(
                "cannot revoke the owner of node {node}"
            )));
        }
        let ack = self.set_permissions(node, user, 0)?;
        drop(guard);
        self.after_write();
        Ok(ack)
    }

    /// Caller holds the node lock.
    fn set_permissions(&self, node: NodeId, user: UserId, mask: u8) -> Result<Ack> {
        let s = &self.shared;
        // Users who could read before the change hear about it too.
        let mut audience = s.acl.readers(node);
        let record = s.commit(WalOp::PermissionSet { node, user, mask })?;
        audience |= s.acl.readers(node);
        audience.insert(user);
        s.publish(
            &record,
            EventKind::PermissionChanged { user },
            Some(node),
            None,
            Audience::Captured(audience),
        );
        Ok(Ack { sequence: record.seq })
    }

    pub fn check(&self, node: NodeId, user: UserId, permission: Permission) -> bool {
        self.shared.acl.check(node, user, permission)
    }

    pub fn permissions(&self, node: NodeId, user: UserId) -> Permissions {
        self.shared.acl.permissions(node, user)
    }

    /// Apply many grants; each succeeds or fails on its own.
    pub fn batch_grant(
        &self,
        caller: UserId,
        grants: &[(NodeId, UserId, Permissions)],
    ) -> Result<BatchReport<(NodeId, UserId)>> {
        validation::batch(grants.len())?;
        let mut report = BatchReport::default();
        for &(node, user, perms) in grants {
            report.record((node, user), self.grant(caller, node, user, perms));
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Sparse distributed memory
    // -----------------------------------------------------------------------

    pub fn write_sdm(&self, address: BitVector, data: BitVector, user: UserId) -> Result<Ack> {
        let s = &self.shared;
        let record = s.commit(WalOp::SdmWrite {
            address,
            data,
            writer: user,
        })?;
        s.publish(&record, EventKind::SdmWritten, None, None, Audience::Only(user));
        self.after_write();
        Ok(Ack { sequence: record.seq })
    }

    /// Majority-vote recall over `user`'s cells near `address`, or `None`
    /// when nothing is within the configured radius.
    pub fn read_sdm(&self, address: &BitVector, user: UserId) -> Option<BitVector> {
        self.recall_sdm(address, user).map(|r| r.data)
    }

    pub fn read_sdm_or_zero(&self, address: &BitVector, user: UserId) -> BitVector {
        self.read_sdm(address, user).unwrap_or_default()
    }

    /// Like [`read_sdm`](Self::read_sdm), with match statistics.
    pub fn recall_sdm(&self, address: &BitVector, user: UserId) -> Option<Recall> {
        self.shared.sdm.read(address, user)
    }

    // -----------------------------------------------------------------------
    // Events and maintenance
    // -----------------------------------------------------------------------

    /// Stream of committed mutations `user` may see. Dropping the
    /// subscription ends it.
    pub fn subscribe(&self, user: UserId, filter: EventFilter) -> Subscription {
        self.shared.events.subscribe(user, filter)
    }

    /// Checkpoint now: write the MemTable to an SSTable and trim the WAL.
    /// Returns false if there was nothing to write.
    pub fn flush(&self) -> Result<bool> {
        self.shared.checkpoint()
    }

    /// Merge every SSTable into one, regardless of the trigger.
    pub fn compact(&self) -> Result<Option<CompactionStats>> {
        self.shared.lsm.compact()
    }

    pub fn stats(&self) -> EngineStats {
        let s = &self.shared;
        EngineStats {
            last_sequence: s.wal.last_sequence(),
            nodes: s.vectors.len(),
            hnsw_graph_size: s.vectors.graph_size(),
            edges: s.graph.edge_count(),
            acl_nodes: s.acl.node_count(),
            sdm_cells: s.sdm.len(),
            dimension: s.dimension(),
            memtable_bytes: s.lsm.memtable_bytes(),
            segments: s.lsm.segment_ids(),
            wal_segment: s.wal.current_segment(),
            subscribers: s.events.subscriber_count(),
            recovery: s.recovery.clone(),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(mut m) = self.maintenance.take() {
            let _ = m.tx.lock().send(Task::Shutdown);
            if let Some(handle) = m.handle.take() {
                if handle.join().is_err() {
                    tracing::error!("maintenance thread panicked");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
