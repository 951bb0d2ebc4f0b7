//! dostore Storage Engine - Hashed-directory object storage
//!
//! This crate implements the storage engine for dostore digital objects:
//! - Hashed directory layout for element files
//! - Object index (per-object metadata records in redb)
//! - Embedded element store for small payloads, with tiering to files
//! - Per-object mutexes and per-element reader/writer locks
//! - Legacy layout migration
//! - Object archives for export and import
//! - Transaction log seam for replication

pub mod archive;
pub mod elements;
pub mod engine;
pub mod hashdir;
pub mod index;
mod kv;
pub mod locks;
pub mod object;
pub mod payload;
pub mod txnlog;

// Re-exports
pub use archive::{ArchiveEntry, ArchiveReader, ArchiveWriter, EntryKind};
pub use elements::{ElementBatch, ElementStore};
pub use engine::{Attributes, HashedStorage, ObjectStorage, StorageOptions, INDEX_DIR};
pub use hashdir::{convert_from_file_name, convert_to_file_name, PathHasher};
pub use index::{ObjectIds, ObjectIndex};
pub use kv::{KvError, KvResult};
pub use locks::{ElementLocks, ObjectGuard, ObjectLocks, ReadGuard, WriteGuard};
pub use object::{ElementLocation, MigrationState, ObjectMetadata};
pub use payload::ElementReader;
pub use txnlog::{
    MemoryTransactionLog, NullTransactionLog, Transaction, TransactionLog, TxnAction,
};
