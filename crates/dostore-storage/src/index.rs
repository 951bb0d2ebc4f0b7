//! Object index backed by redb.
//!
//! Maps each lowercase object ID to its [`ObjectMetadata`]. Every `put` is
//! its own committed write transaction and is never chained with element
//! payload writes. Readers see the last committed record, so a reader
//! racing a writer observes either the old or the new dictionary, never a
//! mixture. Callers serialize read-modify-write cycles with the per-object
//! lock.

use crate::kv::{self, KvError, KvResult, OBJECT_INDEX};
use crate::object::ObjectMetadata;
use dostore_common::{ObjectKey, Result};
use redb::{Database, ReadableTable};
use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tracing::error;

/// Number of index records fetched per read transaction while listing
const SCAN_BATCH: usize = 256;

/// Persistent object index
#[derive(Clone)]
pub struct ObjectIndex {
    db: Arc<Database>,
}

impl ObjectIndex {
    /// Open (or create) the index database at the given path
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> KvResult<Self> {
        let db = kv::open_database(path.as_ref(), OBJECT_INDEX, read_only)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Fetch the record for an object, if the index has ever seen it
    pub fn get(&self, key: &ObjectKey) -> KvResult<Option<ObjectMetadata>> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(OBJECT_INDEX) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(raw) = table.get(key.as_str())? else {
            return Ok(None);
        };
        let metadata: ObjectMetadata = bincode::deserialize(raw.value())?;
        if ObjectKey::new(&metadata.id) != *key {
            return Err(KvError::Inconsistent(format!(
                "metadata ID does not match index key: {} != {}",
                metadata.id, key
            )));
        }
        Ok(Some(metadata))
    }

    /// Store the record for an object (auto-committed)
    pub fn put(&self, metadata: &ObjectMetadata) -> KvResult<()> {
        let key = ObjectKey::new(&metadata.id);
        let bytes = bincode::serialize(metadata)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECT_INDEX)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read up to `limit` records with keys strictly after `after`.
    ///
    /// Records that fail to decode are logged and skipped; a record whose
    /// ID disagrees with its key is reported under the key.
    pub fn scan_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> KvResult<Vec<(String, ObjectMetadata)>> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(OBJECT_INDEX) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let range = match after {
            Some(last) => table.range::<&str>((Bound::Excluded(last), Bound::Unbounded))?,
            None => table.range::<&str>(..)?,
        };

        let mut result = Vec::new();
        for entry in range.take(limit) {
            let (k, v) = entry?;
            let key = k.value().to_string();
            match bincode::deserialize::<ObjectMetadata>(v.value()) {
                Ok(mut metadata) => {
                    if ObjectKey::new(&metadata.id).as_str() != key {
                        error!(
                            "Error listing objects: metadata ID does not match index key: {} != {}",
                            metadata.id, key
                        );
                        metadata.id.clone_from(&key);
                    }
                    result.push((key, metadata));
                }
                Err(e) => error!("Failed to decode index entry '{}': {}", key, e),
            }
        }
        Ok(result)
    }

    /// Lazily iterate the IDs of existing objects.
    ///
    /// Each batch is read in a fresh read transaction, so objects created
    /// or deleted while iterating may or may not be observed.
    #[must_use]
    pub fn object_ids(&self) -> ObjectIds {
        ObjectIds {
            index: self.clone(),
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

/// Restartable cursor over existing object IDs
pub struct ObjectIds {
    index: ObjectIndex,
    last_key: Option<String>,
    buffer: VecDeque<String>,
    exhausted: bool,
}

impl Iterator for ObjectIds {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(id) = self.buffer.pop_front() {
                return Some(Ok(id));
            }
            if self.exhausted {
                return None;
            }
            match self.index.scan_after(self.last_key.as_deref(), SCAN_BATCH) {
                Ok(batch) => {
                    if batch.len() < SCAN_BATCH {
                        self.exhausted = true;
                    }
                    if let Some((key, _)) = batch.last() {
                        self.last_key = Some(key.clone());
                    }
                    self.buffer.extend(
                        batch
                            .into_iter()
                            .filter(|(_, md)| md.exists())
                            .map(|(_, md)| md.id),
                    );
                }
                Err(e) => {
                    error!("Error scanning object index: {}", e);
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}
