//! Durable snapshot persistence using redb
//!
//! The store engine only requires that a conforming durable store exist: it
//! loads the last snapshot at startup and hands updated snapshots over
//! after each change, never awaiting durability. [`RedbSnapshotStore`] is
//! the shipped ACID-compliant implementation; [`MemorySnapshotStore`] backs
//! tests and throwaway sessions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreResult;

const SNAPSHOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Persistence collaborator contract
///
/// Snapshots are opaque document bytes keyed by a storage identifier.
pub trait SnapshotStore: Send {
    /// Load the last durable snapshot, if any
    fn load(&self, doc_id: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Durably write the current snapshot
    fn save(&self, doc_id: &str, snapshot: &[u8]) -> StoreResult<()>;

    /// Remove all durable state for the identifier
    fn destroy(&mut self, doc_id: &str) -> StoreResult<()>;
}

/// Snapshot store backed by a redb database file
#[derive(Clone)]
pub struct RedbSnapshotStore {
    db: Arc<RwLock<Database>>,
}

impl RedbSnapshotStore {
    /// Create or open a snapshot database at the given path.
    ///
    /// Creates the parent directory and the snapshots table if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SNAPSHOTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl SnapshotStore for RedbSnapshotStore {
    fn load(&self, doc_id: &str) -> StoreResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        Ok(table.get(doc_id)?.map(|v| v.value().to_vec()))
    }

    fn save(&self, doc_id: &str, snapshot: &[u8]) -> StoreResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            table.insert(doc_id, snapshot)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn destroy(&mut self, doc_id: &str) -> StoreResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            table.remove(doc_id)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory snapshot store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, doc_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(doc_id).cloned())
    }

    fn save(&self, doc_id: &str, snapshot: &[u8]) -> StoreResult<()> {
        self.entries
            .lock()
            .insert(doc_id.to_string(), snapshot.to_vec());
        Ok(())
    }

    fn destroy(&mut self, doc_id: &str) -> StoreResult<()> {
        self.entries.lock().remove(doc_id);
        Ok(())
    }
}
