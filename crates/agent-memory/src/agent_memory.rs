//! Session scratchpad for agents that coordinate through RiceDB.
//!
//! Each session is an append-only, time-ordered log of short notes written
//! by agents. The first user to write into a session owns it; every other
//! user is refused. Entries may carry a time-to-live and disappear once
//! [`SessionMemory::sweep_expired`] runs past their expiry.
//!
//! # Usage
//!
//! ```rust,no_run
//! use ricedb_agent_memory::{MemoryQuery, SessionMemory};
//!
//! let memory = SessionMemory::open("./scratchpad.redb").unwrap();
//! memory
//!     .add(1, "triage-42", "planner", "split the ticket in two", Default::default(), None)
//!     .unwrap();
//! let notes = memory.get(1, "triage-42", &MemoryQuery::default()).unwrap();
//! assert_eq!(notes[0].agent_id, "planner");
//! ```

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use ricedb::UserId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use ulid::Ulid;

pub use ricedb::RiceError as Error;
pub type Result<T> = std::result::Result<T, Error>;

/// `session \x1f timestamp_ms \x1f ulid` -> JSON [`MemoryEntry`].
const ENTRIES: TableDefinition<&str, &str> = TableDefinition::new("entries");
/// session -> owning user.
const SESSIONS: TableDefinition<&str, u64> = TableDefinition::new("sessions");

const KEY_SEPARATOR: char = '\u{1f}';
const DEFAULT_LIMIT: usize = 50;

pub type EntryMetadata = BTreeMap<String, String>;

/// One note in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// ULID, unique across sessions.
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: EntryMetadata,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Parameters for [`SessionMemory::get`].
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    pub limit: usize,
    /// Only entries strictly later than this instant.
    pub after: Option<DateTime<Utc>>,
    /// Every pair must be present in the entry's metadata.
    pub filter: EntryMetadata,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            after: None,
            filter: EntryMetadata::new(),
        }
    }
}

impl MemoryQuery {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, after: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }
}

/// Live feed of entries added to one session.
pub struct MemoryWatch {
    rx: Receiver<MemoryEntry>,
}

impl MemoryWatch {
    pub fn try_recv(&self) -> Option<MemoryEntry> {
        match self.rx.try_recv() {
            Ok(entry) => Some(entry),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<MemoryEntry> {
        match self.rx.recv_timeout(timeout) {
            Ok(entry) => Some(entry),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Durable session scratchpad backed by a single redb file.
pub struct SessionMemory {
    db: Database,
    watchers: Mutex<HashMap<String, Vec<(UserId, Sender<MemoryEntry>)>>>,
}

impl SessionMemory {
    /// Open or create a scratchpad at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(ENTRIES)?;
            write_txn.open_table(SESSIONS)?;
            write_txn.commit()?;
        }
        Ok(Self {
            db,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Append a note to `session_id`, claiming the session for `caller` if
    /// nobody owns it yet.
    pub fn add(
        &self,
        caller: UserId,
        session_id: &str,
        agent_id: &str,
        content: &str,
        metadata: EntryMetadata,
        ttl: Option<Duration>,
    ) -> Result<MemoryEntry> {
        self.add_at(caller, session_id, agent_id, content, metadata, ttl, Utc::now())
    }

    /// [`add`](Self::add) with an explicit timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn add_at(
        &self,
        caller: UserId,
        session_id: &str,
        agent_id: &str,
        content: &str,
        metadata: EntryMetadata,
        ttl: Option<Duration>,
        timestamp: DateTime<Utc>,
    ) -> Result<MemoryEntry> {
        validate_session_id(session_id)?;
        if agent_id.is_empty() {
            return Err(Error::Validation("agent id must not be empty".into()));
        }
        if ttl.is_some_and(|t| t <= Duration::zero()) {
            return Err(Error::Validation("ttl must be positive".into()));
        }
        let entry = MemoryEntry {
            id: Ulid::from_datetime(timestamp.into()).to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            content: content.to_string(),
            metadata,
            timestamp,
            expires_at: ttl.map(|t| timestamp + t),
        };
        let key = entry_key(session_id, timestamp, &entry.id);
        let raw = serde_json::to_string(&entry)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut sessions = write_txn.open_table(SESSIONS)?;
            let owner = sessions.get(session_id)?.map(|g| g.value());
            match owner {
                Some(owner) if owner != caller => {
                    return Err(Error::Unauthorized(format!(
                        "session {session_id} belongs to another user"
                    )))
                }
                Some(_) => {}
                None => {
                    sessions.insert(session_id, caller)?;
                }
            }
            let mut entries = write_txn.open_table(ENTRIES)?;
            entries.insert(key.as_str(), raw.as_str())?;
        }
        write_txn.commit()?;

        tracing::debug!(session = session_id, agent = agent_id, id = %entry.id, "memory entry added");
        self.notify(caller, &entry);
        Ok(entry)
    }

    /// Entries of `session_id` ordered by `(timestamp, id)`, oldest first.
    /// Expired entries that have not been swept yet are skipped.
    pub fn get(&self, caller: UserId, session_id: &str, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        validate_session_id(session_id)?;
        let read_txn = self.db.begin_read()?;
        let sessions = read_txn.open_table(SESSIONS)?;
        match sessions.get(session_id)?.map(|g| g.value()) {
            None => return Ok(Vec::new()),
            Some(owner) if owner != caller => {
                return Err(Error::Unauthorized(format!(
                    "session {session_id} belongs to another user"
                )))
            }
            Some(_) => {}
        }

        let now = Utc::now();
        let start = match query.after {
            // Timestamps are keyed at millisecond precision.
            Some(after) => timestamp_prefix(session_id, after.timestamp_millis() + 1),
            None => session_prefix(session_id),
        };
        let end = session_end(session_id);
        let entries = read_txn.open_table(ENTRIES)?;
        let mut out = Vec::new();
        for item in entries.range(start.as_str()..end.as_str())? {
            if out.len() >= query.limit {
                break;
            }
            let (_key, raw) = item?;
            let entry: MemoryEntry = serde_json::from_str(raw.value())?;
            if entry.is_expired(now) {
                continue;
            }
            if query
                .filter
                .iter()
                .all(|(k, v)| entry.metadata.get(k) == Some(v))
            {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Remove every entry of `session_id` and release its ownership.
    /// Returns how many entries were removed.
    pub fn clear(&self, caller: UserId, session_id: &str) -> Result<usize> {
        validate_session_id(session_id)?;
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut sessions = write_txn.open_table(SESSIONS)?;
            let owner = sessions.get(session_id)?.map(|g| g.value());
            match owner {
                None => 0,
                Some(owner) if owner != caller => {
                    return Err(Error::Unauthorized(format!(
                        "session {session_id} belongs to another user"
                    )))
                }
                Some(_) => {
                    sessions.remove(session_id)?;
                    let mut entries = write_txn.open_table(ENTRIES)?;
                    let start = session_prefix(session_id);
                    let end = session_end(session_id);
                    let keys: Vec<String> = entries
                        .range(start.as_str()..end.as_str())?
                        .map(|item| item.map(|(k, _)| k.value().to_string()))
                        .collect::<std::result::Result<_, _>>()?;
                    for key in &keys {
                        entries.remove(key.as_str())?;
                    }
                    keys.len()
                }
            }
        };
        write_txn.commit()?;
        tracing::info!(session = session_id, removed, "memory session cleared");
        Ok(removed)
    }

    /// Delete every entry whose expiry is at or before `now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let entries = read_txn.open_table(ENTRIES)?;
            let mut keys = Vec::new();
            for item in entries.iter()? {
                let (key, raw) = item?;
                let entry: MemoryEntry = serde_json::from_str(raw.value())?;
                if entry.is_expired(now) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        if expired.is_empty() {
            return Ok(0);
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut entries = write_txn.open_table(ENTRIES)?;
            for key in &expired {
                entries.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        tracing::debug!(removed = expired.len(), "expired memory entries swept");
        Ok(expired.len())
    }

    /// Receive every entry `caller` adds to `session_id` from now on.
    /// Sessions owned by another user are refused. Dropping the returned
    /// handle unsubscribes it.
    pub fn watch(&self, caller: UserId, session_id: &str) -> Result<MemoryWatch> {
        validate_session_id(session_id)?;
        let read_txn = self.db.begin_read()?;
        let sessions = read_txn.open_table(SESSIONS)?;
        if let Some(owner) = sessions.get(session_id)?.map(|g| g.value()) {
            if owner != caller {
                return Err(Error::Unauthorized(format!(
                    "session {session_id} belongs to another user"
                )));
            }
        }

        let (tx, rx) = mpsc::channel();
        self.watchers
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push((caller, tx));
        Ok(MemoryWatch { rx })
    }

    // `writer` already passed the ownership check, so watchers of any other
    // user are skipped. That covers a session claimed after the watch began.
    fn notify(&self, writer: UserId, entry: &MemoryEntry) {
        let mut watchers = self.watchers.lock();
        if let Some(senders) = watchers.get_mut(&entry.session_id) {
            senders.retain(|(user, tx)| *user != writer || tx.send(entry.clone()).is_ok());
            if senders.is_empty() {
                watchers.remove(&entry.session_id);
            }
        }
    }
}

fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() {
        return Err(Error::Validation("session id must not be empty".into()));
    }
    if session_id.chars().any(char::is_control) {
        return Err(Error::Validation(
            "session id must not contain control characters".into(),
        ));
    }
    Ok(())
}

fn session_prefix(session_id: &str) -> String {
    format!("{session_id}{KEY_SEPARATOR}")
}

fn session_end(session_id: &str) -> String {
    // The separator is followed by digits only, so the next code point bounds the range.
    format!("{session_id}{}", char::from(KEY_SEPARATOR as u8 + 1))
}

fn timestamp_prefix(session_id: &str, millis: i64) -> String {
    format!("{session_id}{KEY_SEPARATOR}{:020}", millis.max(0))
}

fn entry_key(session_id: &str, timestamp: DateTime<Utc>, id: &str) -> String {
    format!(
        "{}{KEY_SEPARATOR}{id}",
        timestamp_prefix(session_id, timestamp.timestamp_millis())
    )
}
