//! Embedded key/value plumbing shared by the object index and the
//! element store.
//!
//! Both stores are separate redb databases under `<root>/index/`. redb
//! admits one writer per database, so keeping the auto-committed metadata
//! writes and the multi-step element transactions in different files means
//! neither ever waits on the other.

use redb::{Database, TableDefinition};
use std::path::Path;

/// Object index: lowercase object ID -> bincode-encoded `ObjectMetadata`
pub const OBJECT_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("objindex");

/// Element payloads: `"<id byte len>:<lowercase object id><element id>"` -> bytes
pub const ELEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("elements");

/// Error type for embedded store operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database {0} is in use by another process")]
    InUse(String),
    #[error("{0}")]
    Inconsistent(String),
}

impl From<redb::TransactionError> for KvError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<KvError> for dostore_common::Error {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Inconsistent(msg) => Self::Inconsistent(msg),
            KvError::Io(io) => Self::Io(io),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

fn database_error(path: &Path, e: redb::DatabaseError) -> KvError {
    match e {
        redb::DatabaseError::DatabaseAlreadyOpen => KvError::InUse(path.display().to_string()),
        other => other.into(),
    }
}

/// Open (or create) a redb database and make sure `table` exists so that
/// later read transactions never fail on a missing table.
///
/// redb locks the file exclusively in both modes: a read-only open fails
/// with [`KvError::InUse`] while any other handle has the database open.
pub(crate) fn open_database(
    path: &Path,
    table: TableDefinition<&str, &[u8]>,
    read_only: bool,
) -> KvResult<Database> {
    if read_only {
        return Database::open(path).map_err(|e| database_error(path, e));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::create(path).map_err(|e| database_error(path, e))?;

    let write_txn = db.begin_write()?;
    {
        let _t = write_txn.open_table(table)?;
    }
    write_txn.commit()?;

    Ok(db)
}
