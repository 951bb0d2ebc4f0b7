//! Embedded element store
//!
//! Small element payloads live here as single redb records keyed by
//! `"<byte length of object key>:<object key><element id>"`. The length
//! prefix makes every object's records one contiguous key range, so
//! deleting or listing an object is a prefix scan.
//!
//! Unlike the object index, this store hands out explicit multi-record
//! transactions ([`ElementBatch`]) for migrations.

use crate::kv::{self, KvResult, ELEMENTS};
use dostore_common::ObjectKey;
use redb::{Database, ReadableTable, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

fn object_prefix(key: &ObjectKey) -> String {
    format!("{}:{}", key.as_str().len(), key.as_str())
}

fn element_key(key: &ObjectKey, element_id: &str) -> String {
    format!("{}{}", object_prefix(key), element_id)
}

/// Persistent store of embedded element payloads
#[derive(Clone)]
pub struct ElementStore {
    db: Arc<Database>,
}

impl ElementStore {
    /// Open (or create) the element database at the given path
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> KvResult<Self> {
        let db = kv::open_database(path.as_ref(), ELEMENTS, read_only)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Read a whole payload
    pub fn get(&self, key: &ObjectKey, element_id: &str) -> KvResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(ELEMENTS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table
            .get(element_key(key, element_id).as_str())?
            .map(|v| v.value().to_vec()))
    }

    /// Store a whole payload in its own transaction
    pub fn put(&self, key: &ObjectKey, element_id: &str, data: &[u8]) -> KvResult<()> {
        let mut batch = self.batch()?;
        batch.insert(key, element_id, data)?;
        batch.commit()
    }

    /// Delete one payload. Returns whether a record was present.
    pub fn remove(&self, key: &ObjectKey, element_id: &str) -> KvResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(ELEMENTS)?;
            table.remove(element_key(key, element_id).as_str())?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Delete every payload of an object in one transaction
    pub fn remove_object(&self, key: &ObjectKey) -> KvResult<usize> {
        let prefix = object_prefix(key);
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(ELEMENTS)?;
            let mut doomed = Vec::new();
            for entry in table.range::<&str>(prefix.as_str()..)? {
                let (k, _) = entry?;
                let k = k.value();
                if !k.starts_with(&prefix) {
                    break;
                }
                doomed.push(k.to_string());
            }
            for k in &doomed {
                table.remove(k.as_str())?;
            }
            doomed.len()
        };
        write_txn.commit()?;
        if removed > 0 {
            debug!("Removed {} embedded elements of {}", removed, key);
        }
        Ok(removed)
    }

    /// Element IDs that have an embedded record for this object
    pub fn list(&self, key: &ObjectKey) -> KvResult<Vec<String>> {
        let prefix = object_prefix(key);
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(ELEMENTS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in table.range::<&str>(prefix.as_str()..)? {
            let (k, _) = entry?;
            match k.value().strip_prefix(&prefix) {
                Some(el) => out.push(el.to_string()),
                None => break,
            }
        }
        Ok(out)
    }

    /// Begin an explicit multi-record transaction
    pub fn batch(&self) -> KvResult<ElementBatch> {
        Ok(ElementBatch {
            txn: self.db.begin_write()?,
        })
    }
}

/// Explicit element-store transaction.
///
/// Dropping a batch without committing aborts it.
pub struct ElementBatch {
    txn: WriteTransaction,
}

impl ElementBatch {
    pub fn insert(&mut self, key: &ObjectKey, element_id: &str, data: &[u8]) -> KvResult<()> {
        let mut table = self.txn.open_table(ELEMENTS)?;
        table.insert(element_key(key, element_id).as_str(), data)?;
        Ok(())
    }

    pub fn remove(&mut self, key: &ObjectKey, element_id: &str) -> KvResult<()> {
        let mut table = self.txn.open_table(ELEMENTS)?;
        table.remove(element_key(key, element_id).as_str())?;
        Ok(())
    }

    pub fn commit(self) -> KvResult<()> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn abort(self) -> KvResult<()> {
        self.txn.abort()?;
        Ok(())
    }
}
