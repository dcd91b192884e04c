//! Durable record of which segments make up the database.
//!
//! The manifest is a single JSON document stored in a redb table. Every
//! flush and compaction commits a new version in one redb write
//! transaction, which is what makes segment changes atomic: files that exist
//! on disk but are not listed here are leftovers of an interrupted operation
//! and are deleted at open.

use crate::Result;
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MANIFEST: TableDefinition<&str, &str> = TableDefinition::new("manifest");
const CURRENT_KEY: &str = "current";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestState {
    /// Live segment ids, oldest data first.
    pub segments: Vec<u64>,
    /// Next id handed out for a segment file.
    pub next_segment_id: u64,
    /// Every WAL segment with id <= this is covered by `segments`.
    pub checkpoint_wal_segment: u64,
    /// Highest sequence number contained in `segments`.
    pub last_sequence: u64,
    /// SDM snapshot written at the last checkpoint, if any.
    pub sdm_snapshot: Option<u64>,
}

pub struct Manifest {
    db: Database,
    state: Mutex<ManifestState>,
}

impl Manifest {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(MANIFEST)?;
            write_txn.commit()?;
        }
        let state = {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(MANIFEST)?;
            let current: ManifestState = match table.get(CURRENT_KEY)? {
                Some(raw) => serde_json::from_str(raw.value())?,
                None => ManifestState {
                    next_segment_id: 1,
                    ..ManifestState::default()
                },
            };
            current
        };
        Ok(Self {
            db,
            state: Mutex::new(state),
        })
    }

    pub fn state(&self) -> ManifestState {
        self.state.lock().clone()
    }

    /// Reserve a segment id. The reservation becomes durable with the next
    /// commit; an id reserved by an operation that never commits is simply
    /// skipped.
    pub fn allocate_segment_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_segment_id;
        state.next_segment_id += 1;
        id
    }

    /// Apply `change` to the current state and persist the result. The
    /// in-memory state is only replaced once the redb commit succeeds.
    pub fn commit(&self, change: impl FnOnce(&mut ManifestState)) -> Result<ManifestState> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        change(&mut next);
        let raw = serde_json::to_string(&next)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MANIFEST)?;
            table.insert(CURRENT_KEY, raw.as_str())?;
        }
        write_txn.commit()?;
        *state = next.clone();
        Ok(next)
    }
}
