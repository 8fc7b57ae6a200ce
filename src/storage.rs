//! Storage trait and default redb implementation.

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::CoreError;

/// Node state: "election" -> persisted election state (msgpack)
pub(crate) const NODE_META: TableDefinition<&str, &[u8]> = TableDefinition::new("_docweave_node_meta");

/// Known peers: node_id -> PeerEntry (msgpack)
pub(crate) const PEERS: TableDefinition<&str, &[u8]> = TableDefinition::new("_docweave_peers");

/// File metadata rows: (node_id, file_id) -> FileRecord (msgpack)
pub(crate) const FILE_META: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("_docweave_file_meta");

/// Append-only node checkpoints: id -> NodeCheckpoint (msgpack)
pub(crate) const NODE_CHECKPOINTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("_docweave_node_checkpoints");

/// Append-only global checkpoints: id -> GlobalCheckpoint (msgpack)
pub(crate) const GLOBAL_CHECKPOINTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("_docweave_global_checkpoints");

/// Replication tasks: doc_id -> ReplicationTask (msgpack)
pub(crate) const REPLICATION_TASKS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("_docweave_replication_tasks");

/// Rows destined for one node when replacing file metadata wholesale.
pub type NodeRows = (String, Vec<(String, Vec<u8>)>);

// ============================================================================
// Storage trait
// ============================================================================

/// Byte-oriented storage backend for the coordination core.
///
/// The core handles all serialization; implementations just store and
/// retrieve raw bytes.
pub trait Storage: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Get the persisted node state (None if not yet written).
    fn get_node_state(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Persist the node state.
    fn put_node_state(&self, data: &[u8]) -> Result<(), Self::Error>;

    fn put_peer(&self, node_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    fn list_peers(&self) -> Result<Vec<Vec<u8>>, Self::Error>;

    fn put_file_meta(&self, node_id: &str, file_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    fn get_file_meta(&self, node_id: &str, file_id: &str) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Remove one row. Returns whether it existed.
    fn remove_file_meta(&self, node_id: &str, file_id: &str) -> Result<bool, Self::Error>;

    /// All rows, or only those of `node_id`, ordered by (node_id, file_id).
    fn list_file_meta(&self, node_id: Option<&str>) -> Result<Vec<Vec<u8>>, Self::Error>;

    /// Atomically delete every row of each listed node and insert the given
    /// rows in their place.
    fn replace_file_meta(&self, nodes: &[NodeRows]) -> Result<(), Self::Error>;

    /// Append a node checkpoint. Returns its id.
    fn append_node_checkpoint(&self, data: &[u8]) -> Result<u64, Self::Error>;

    fn get_node_checkpoint(&self, id: u64) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Append a global checkpoint. Returns its id.
    fn append_global_checkpoint(&self, data: &[u8]) -> Result<u64, Self::Error>;

    fn get_global_checkpoint(&self, id: u64) -> Result<Option<Vec<u8>>, Self::Error>;

    fn list_global_checkpoints(&self) -> Result<Vec<(u64, Vec<u8>)>, Self::Error>;

    fn put_replication_task(&self, doc_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    fn list_replication_tasks(&self) -> Result<Vec<Vec<u8>>, Self::Error>;
}

// ============================================================================
// File metadata rows
// ============================================================================

/// One node's metadata row for a stored file replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub node_id: String,
    pub file_id: String,
    pub content_hash: String,
    /// Unix millis of the last write, if known.
    pub last_updated: Option<u64>,
    #[serde(default)]
    pub restored_from_checkpoint: bool,
}

/// Typed access to file metadata rows on any [`Storage`].
pub trait FileMetadata: Storage {
    fn put_file(&self, record: &FileRecord) -> Result<(), CoreError> {
        let data = rmp_serde::to_vec_named(record)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        self.put_file_meta(&record.node_id, &record.file_id, &data)
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    fn file(&self, node_id: &str, file_id: &str) -> Result<Option<FileRecord>, CoreError> {
        self.get_file_meta(node_id, file_id)
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .map(|data| decode_record(&data))
            .transpose()
    }

    fn remove_file(&self, node_id: &str, file_id: &str) -> Result<bool, CoreError> {
        self.remove_file_meta(node_id, file_id)
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    fn files(&self, node_id: Option<&str>) -> Result<Vec<FileRecord>, CoreError> {
        self.list_file_meta(node_id)
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .iter()
            .map(|data| decode_record(data))
            .collect()
    }
}

impl<T: Storage> FileMetadata for T {}

fn decode_record(data: &[u8]) -> Result<FileRecord, CoreError> {
    rmp_serde::from_slice(data).map_err(|e| CoreError::Deserialization(e.to_string()))
}

// ============================================================================
// RedbStorage — default implementation
// ============================================================================

/// Default `Storage` implementation backed by redb.
///
/// Uses `_docweave_`-prefixed table names to avoid collisions when sharing
/// a redb instance with the application's own tables.
#[derive(Debug, Clone)]
pub struct RedbStorage {
    db: Arc<redb::Database>,
}

/// Errors from the redb storage backend.
#[derive(Debug, thiserror::Error)]
pub enum RedbStorageError {
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Database error: {0}")]
    Database(Box<redb::DatabaseError>),
    #[error("Redb error: {0}")]
    Redb(Box<redb::Error>),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
}

impl From<redb::CommitError> for RedbStorageError {
    fn from(e: redb::CommitError) -> Self {
        Self::Commit(Box::new(e))
    }
}

impl From<redb::DatabaseError> for RedbStorageError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Database(Box::new(e))
    }
}

impl From<redb::Error> for RedbStorageError {
    fn from(e: redb::Error) -> Self {
        Self::Redb(Box::new(e))
    }
}

impl From<redb::StorageError> for RedbStorageError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(Box::new(e))
    }
}

impl From<redb::TableError> for RedbStorageError {
    fn from(e: redb::TableError) -> Self {
        Self::Table(Box::new(e))
    }
}

impl From<redb::TransactionError> for RedbStorageError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl RedbStorage {
    /// Create a new `RedbStorage` from a shared redb instance, creating the
    /// `_docweave_*` tables if they don't already exist.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, RedbStorageError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(NODE_META)?;
            let _ = write_txn.open_table(PEERS)?;
            let _ = write_txn.open_table(FILE_META)?;
            let _ = write_txn.open_table(NODE_CHECKPOINTS)?;
            let _ = write_txn.open_table(GLOBAL_CHECKPOINTS)?;
            let _ = write_txn.open_table(REPLICATION_TASKS)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, RedbStorageError> {
        let db = redb::Database::create(path)?;
        Self::new(Arc::new(db))
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &redb::Database {
        &self.db
    }

    fn put_str_key(
        &self,
        table: TableDefinition<'_, &'static str, &'static [u8]>,
        key: &str,
        data: &[u8],
    ) -> Result<(), RedbStorageError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list_str_values(
        &self,
        table: TableDefinition<'_, &'static str, &'static [u8]>,
    ) -> Result<Vec<Vec<u8>>, RedbStorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let mut values = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            values.push(value.value().to_vec());
        }
        Ok(values)
    }

    fn append_u64_key(
        &self,
        table: TableDefinition<'_, u64, &'static [u8]>,
        data: &[u8],
    ) -> Result<u64, RedbStorageError> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut table = write_txn.open_table(table)?;
            let previous = match table.last()? {
                Some((key, _)) => key.value(),
                None => 0,
            };
            let id = previous + 1;
            table.insert(id, data)?;
            id
        };
        write_txn.commit()?;
        Ok(id)
    }

    fn get_u64_key(
        &self,
        table: TableDefinition<'_, u64, &'static [u8]>,
        id: u64,
    ) -> Result<Option<Vec<u8>>, RedbStorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        match table.get(id)? {
            Some(data) => Ok(Some(data.value().to_vec())),
            None => Ok(None),
        }
    }
}

impl Storage for RedbStorage {
    type Error = RedbStorageError;

    fn get_node_state(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NODE_META)?;
        match table.get("election")? {
            Some(data) => Ok(Some(data.value().to_vec())),
            None => Ok(None),
        }
    }

    fn put_node_state(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.put_str_key(NODE_META, "election", data)
    }

    fn put_peer(&self, node_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        self.put_str_key(PEERS, node_id, data)
    }

    fn list_peers(&self) -> Result<Vec<Vec<u8>>, Self::Error> {
        self.list_str_values(PEERS)
    }

    fn put_file_meta(&self, node_id: &str, file_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(FILE_META)?;
            table.insert((node_id, file_id), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_file_meta(&self, node_id: &str, file_id: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FILE_META)?;
        match table.get((node_id, file_id))? {
            Some(data) => Ok(Some(data.value().to_vec())),
            None => Ok(None),
        }
    }

    fn remove_file_meta(&self, node_id: &str, file_id: &str) -> Result<bool, Self::Error> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(FILE_META)?;
            let removed = table.remove((node_id, file_id))?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn list_file_meta(&self, node_id: Option<&str>) -> Result<Vec<Vec<u8>>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FILE_META)?;
        let mut rows = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            let (row_node, _) = key.value();
            if node_id.map_or(true, |n| n == row_node) {
                rows.push(value.value().to_vec());
            }
        }
        Ok(rows)
    }

    fn replace_file_meta(&self, nodes: &[NodeRows]) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(FILE_META)?;
            for (node_id, rows) in nodes {
                let mut stale = Vec::new();
                for result in table.iter()? {
                    let (key, _) = result?;
                    let (row_node, file_id) = key.value();
                    if row_node == node_id.as_str() {
                        stale.push(file_id.to_string());
                    }
                }
                for file_id in &stale {
                    table.remove((node_id.as_str(), file_id.as_str()))?;
                }
                for (file_id, data) in rows {
                    table.insert((node_id.as_str(), file_id.as_str()), data.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn append_node_checkpoint(&self, data: &[u8]) -> Result<u64, Self::Error> {
        self.append_u64_key(NODE_CHECKPOINTS, data)
    }

    fn get_node_checkpoint(&self, id: u64) -> Result<Option<Vec<u8>>, Self::Error> {
        self.get_u64_key(NODE_CHECKPOINTS, id)
    }

    fn append_global_checkpoint(&self, data: &[u8]) -> Result<u64, Self::Error> {
        self.append_u64_key(GLOBAL_CHECKPOINTS, data)
    }

    fn get_global_checkpoint(&self, id: u64) -> Result<Option<Vec<u8>>, Self::Error> {
        self.get_u64_key(GLOBAL_CHECKPOINTS, id)
    }

    fn list_global_checkpoints(&self) -> Result<Vec<(u64, Vec<u8>)>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(GLOBAL_CHECKPOINTS)?;
        let mut entries = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            entries.push((key.value(), value.value().to_vec()));
        }
        Ok(entries)
    }

    fn put_replication_task(&self, doc_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        self.put_str_key(REPLICATION_TASKS, doc_id, data)
    }

    fn list_replication_tasks(&self) -> Result<Vec<Vec<u8>>, Self::Error> {
        self.list_str_values(REPLICATION_TASKS)
    }
}
