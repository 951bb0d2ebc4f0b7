//! Storage engine facade
//!
//! [`HashedStorage`] composes the path hasher, the object index, the
//! embedded element store and the lock tables into the [`ObjectStorage`]
//! contract.
//!
//! Metadata writes are individually committed and are never chained with
//! element payload transactions. Every read-modify-write of an object's
//! metadata happens under that object's mutex; payload I/O happens under
//! the element's read or write lock only, so long transfers never block
//! metadata changes of other elements. Lock order is element lock first,
//! then object lock.

use crate::archive::{ArchiveReader, ArchiveWriter, EntryKind};
use crate::elements::ElementStore;
use crate::hashdir::{remove_empty_dirs_from, PathHasher};
use crate::index::ObjectIndex;
use crate::locks::{ElementLocks, ObjectGuard, ObjectLocks};
use crate::object::{
    ElementLocation, MigrationState, ObjectMetadata, DATE_CREATED_ATTRIBUTE,
    DATE_MODIFIED_ATTRIBUTE, SIZE_ATTRIBUTE,
};
use crate::payload::{self, ElementReader};
use crate::txnlog::{NullTransactionLog, Transaction, TransactionLog, TxnAction};
use dostore_common::{
    now_millis, ByteRange, Error, ObjectKey, Result, StorageProperties, Timestamp, WriteOptions,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Directory (under the root) holding the embedded databases
pub const INDEX_DIR: &str = "index";
const OBJECT_INDEX_FILE: &str = "objindex.redb";
const ELEMENTS_FILE: &str = "elements.redb";

/// Attribute map as exchanged with callers
pub type Attributes = BTreeMap<String, String>;

/// Storage engine contract consumed by the rest of the repository
pub trait ObjectStorage: Send + Sync {
    /// Create an object, generating an ID when none is given. Returns the ID.
    fn create_object(&self, object_id: Option<&str>, opts: &WriteOptions) -> Result<String>;

    /// Record the deletion of an object
    fn delete_object(&self, object_id: &str, opts: &WriteOptions) -> Result<()>;

    fn object_exists(&self, object_id: &str) -> Result<bool>;

    fn element_exists(&self, object_id: &str, element_id: &str) -> Result<bool>;

    /// Lazily enumerate existing objects
    fn list_objects(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + Send + '_>>;

    /// Elements of an existing object (empty if the object does not exist)
    fn list_elements(&self, object_id: &str) -> Result<Vec<String>>;

    /// Open an element for reading. `None` if the object or element does
    /// not exist.
    fn get_element(
        &self,
        object_id: &str,
        element_id: &str,
        range: ByteRange,
    ) -> Result<Option<ElementReader>>;

    /// Write (or append to) an element from a byte stream
    fn put_element(
        &self,
        object_id: &str,
        element_id: &str,
        input: &mut dyn Read,
        append: bool,
        opts: &WriteOptions,
    ) -> Result<()>;

    /// Delete an element. Returns whether it existed.
    fn delete_element(&self, object_id: &str, element_id: &str, opts: &WriteOptions)
    -> Result<bool>;

    /// Object attributes (`element_id = None`) or element attributes,
    /// including the derived `internal.*` attributes
    fn get_attributes(&self, object_id: &str, element_id: Option<&str>) -> Result<Attributes>;

    /// Set attributes; writes older than the stored timestamp are dropped
    fn set_attributes(
        &self,
        object_id: &str,
        element_id: Option<&str>,
        attributes: &Attributes,
        opts: &WriteOptions,
    ) -> Result<()>;

    /// Delete attributes; deletions older than the stored timestamp are dropped
    fn delete_attributes(
        &self,
        object_id: &str,
        element_id: Option<&str>,
        keys: &[String],
        opts: &WriteOptions,
    ) -> Result<()>;

    /// Export an object as an archive
    fn serialize_object(&self, object_id: &str, sink: &mut dyn Write) -> Result<()>;

    /// Replace an object with the contents of an archive
    fn deserialize_object(
        &self,
        object_id: &str,
        source: &mut dyn Read,
        opts: &WriteOptions,
    ) -> Result<()>;
}

/// Options fixed at open time
#[derive(Clone)]
pub struct StorageOptions {
    /// Reject every mutation and never create or migrate anything.
    ///
    /// The embedded databases are still locked exclusively, so a read-only
    /// open fails while another process (or handle) has the root open.
    pub read_only: bool,
    /// Prefix of generated object IDs
    pub id_prefix: String,
    /// Layout used when the root has no properties file yet
    pub properties: StorageProperties,
    /// Receiver of mutation records
    pub txn_log: Arc<dyn TransactionLog>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            id_prefix: String::new(),
            properties: StorageProperties::default(),
            txn_log: Arc::new(NullTransactionLog),
        }
    }
}

impl StorageOptions {
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: StorageProperties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_txn_log(mut self, txn_log: Arc<dyn TransactionLog>) -> Self {
        self.txn_log = txn_log;
        self
    }
}

/// Storage engine over a hashed directory tree plus embedded databases
pub struct HashedStorage {
    root: PathBuf,
    props: StorageProperties,
    hasher: PathHasher,
    index: ObjectIndex,
    elements: ElementStore,
    object_locks: ObjectLocks,
    element_locks: ElementLocks,
    read_only: bool,
    id_prefix: String,
    txn_log: Arc<dyn TransactionLog>,
    #[cfg(test)]
    migration_fault: parking_lot::Mutex<Option<MigrationFault>>,
}

/// Failure injected into the next migration
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MigrationFault {
    /// Fail before the element batch commits
    PayloadCommit,
    /// Fail after the payloads landed, before the metadata commit
    MetadataCommit,
}

impl HashedStorage {
    /// Open a storage root, initializing it if it is new (unless read-only)
    pub fn open(root: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let props = if options.read_only {
            if !root.is_dir() {
                return Err(Error::storage(format!(
                    "storage directory {} does not exist",
                    root.display()
                )));
            }
            StorageProperties::load(&root)?.unwrap_or(options.properties)
        } else {
            fs::create_dir_all(&root)?;
            match StorageProperties::load(&root)? {
                Some(props) => props,
                None => {
                    options.properties.validate()?;
                    options.properties.save(&root)?;
                    info!("Initialized storage root {:?}", root);
                    options.properties
                }
            }
        };
        props.validate()?;

        let index_dir = root.join(INDEX_DIR);
        let index = ObjectIndex::open(index_dir.join(OBJECT_INDEX_FILE), options.read_only)
            .map_err(|e| {
                error!("Error loading object index in {:?}: {}", index_dir, e);
                Error::from(e)
            })?;
        let elements = ElementStore::open(index_dir.join(ELEMENTS_FILE), options.read_only)?;

        info!(
            "Opened storage at {:?} (hash={} len={} segment={} threshold={}{})",
            root,
            props.hash_alg,
            props.hash_len,
            props.segment_size,
            props.max_db_element_size,
            if options.read_only { ", read-only" } else { "" }
        );

        Ok(Self {
            hasher: PathHasher::new(&props),
            root,
            props,
            index,
            elements,
            object_locks: ObjectLocks::new(),
            element_locks: ElementLocks::new(),
            read_only: options.read_only,
            id_prefix: options.id_prefix,
            txn_log: options.txn_log,
            #[cfg(test)]
            migration_fault: parking_lot::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn properties(&self) -> &StorageProperties {
        &self.props
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Absolute directory of an object
    #[must_use]
    pub fn object_dir(&self, object_id: &str) -> PathBuf {
        self.root.join(self.hasher.object_path(object_id))
    }

    fn element_path(&self, object_id: &str, element_id: &str) -> PathBuf {
        self.object_dir(object_id)
            .join(crate::hashdir::convert_to_file_name(element_id))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn log(&self, opts: &WriteOptions, txn: Transaction) -> Result<()> {
        if !opts.log_txn {
            return Ok(());
        }
        let action = txn.action;
        self.txn_log
            .add_transaction(txn.metadata(opts.txn_metadata.clone()))
            .map_err(|e| {
                error!("Failed to log {} transaction: {}", action, e);
                match e {
                    Error::TransactionLog(_) => e,
                    other => Error::TransactionLog(other.to_string()),
                }
            })
    }

    fn stored_metadata(&self, key: &ObjectKey, object_id: &str) -> Result<ObjectMetadata> {
        match self.index.get(key)? {
            Some(md) => Ok(md),
            None => {
                // Never-seen objects are born in the tiered layout
                let mut md = ObjectMetadata::new(object_id);
                md.mark_migrated();
                Ok(md)
            }
        }
    }

    /// Current metadata of an object, bringing legacy objects into the
    /// tiered layout first. Never fails for objects the index has never
    /// seen; those come back as empty, non-existing records.
    pub fn object_metadata(&self, object_id: &str) -> Result<ObjectMetadata> {
        let key = ObjectKey::new(object_id);
        let md = self.stored_metadata(&key, object_id)?;
        if md.migration_state() == MigrationState::Unmigrated && !self.read_only {
            let guard = self.object_locks.lock(&key);
            return self.metadata_locked(object_id, &guard);
        }
        Ok(md)
    }

    /// Metadata for a read-modify-write cycle. The guard proves the caller
    /// holds the object lock.
    fn metadata_locked(&self, object_id: &str, guard: &ObjectGuard<'_>) -> Result<ObjectMetadata> {
        let md = self.stored_metadata(guard.key(), object_id)?;
        if md.migration_state() == MigrationState::Unmigrated && !self.read_only {
            return self.migrate_locked(md, guard);
        }
        Ok(md)
    }

    /// Move an object's legacy element files into the tiered layout.
    ///
    /// Returns whether a migration was performed; already migrated objects
    /// are left untouched.
    pub fn ensure_migrated(&self, object_id: &str) -> Result<bool> {
        self.check_writable()?;
        let key = ObjectKey::new(object_id);
        let guard = self.object_locks.lock(&key);
        let md = self.stored_metadata(&key, object_id)?;
        if md.migration_state() == MigrationState::Migrated {
            return Ok(false);
        }
        self.migrate_locked(md, &guard)?;
        Ok(true)
    }

    fn migrate_locked(
        &self,
        mut md: ObjectMetadata,
        guard: &ObjectGuard<'_>,
    ) -> Result<ObjectMetadata> {
        let key = guard.key();
        let dir = self.object_dir(&md.id);
        let half = (self.props.max_db_element_size / 2) as u64;

        let mut moved = Vec::new();
        let files = payload::list_element_files(&dir)?;
        let (small, large): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|f| f.len < half && !md.force_file(&f.element_id));

        if !small.is_empty() {
            let mut batch = self.elements.batch()?;
            for file in &small {
                let data = payload::read_file(&file.path)?;
                batch.insert(key, &file.element_id, &data)?;
                moved.push((file, data.len() as u64));
            }
            #[cfg(test)]
            self.injected_fault(MigrationFault::PayloadCommit)?;
            batch.commit()?;
        }

        for (file, size) in &moved {
            md.set_element_exists(&file.element_id, true);
            md.set_element_location(&file.element_id, ElementLocation::Embedded { size: *size });
        }
        for file in &large {
            if md.element_location(&file.element_id).is_none() {
                md.set_element_location(&file.element_id, ElementLocation::File);
            }
        }
        md.mark_migrated();
        #[cfg(test)]
        self.injected_fault(MigrationFault::MetadataCommit)?;
        self.index.put(&md)?;

        // Files go only once both the payload and metadata commits landed
        for (file, _) in &moved {
            if let Err(e) = payload::remove_file(&file.path) {
                warn!("Failed to remove migrated file {:?}: {}", file.path, e);
            }
        }
        if !moved.is_empty() {
            remove_empty_dirs_from(&self.root, &dir);
        }
        info!(
            "Migrated {}: {} elements embedded, {} kept as files",
            md.id,
            moved.len(),
            large.len()
        );
        Ok(md)
    }

    #[cfg(test)]
    fn injected_fault(&self, at: MigrationFault) -> Result<()> {
        let mut fault = self.migration_fault.lock();
        if *fault == Some(at) {
            *fault = None;
            return Err(Error::storage(format!("injected {at:?} failure")));
        }
        Ok(())
    }

    /// Record where a freshly written payload lives. Returns `false` when
    /// the object or element disappeared while the payload was written.
    fn record_location(
        &self,
        object_id: &str,
        element_id: &str,
        location: ElementLocation,
    ) -> Result<bool> {
        let key = ObjectKey::new(object_id);
        let guard = self.object_locks.lock(&key);
        let mut md = self.metadata_locked(object_id, &guard)?;
        if !md.exists() || !md.element_exists(element_id) {
            return Ok(false);
        }
        md.set_element_location(element_id, location);
        self.index.put(&md)?;
        Ok(true)
    }

    fn remove_payload(
        &self,
        key: &ObjectKey,
        object_id: &str,
        element_id: &str,
        location: Option<ElementLocation>,
    ) -> Result<()> {
        match location {
            Some(ElementLocation::File) => {
                let path = self.element_path(object_id, element_id);
                payload::remove_file(&path)?;
                if let Some(dir) = path.parent() {
                    remove_empty_dirs_from(&self.root, dir);
                }
            }
            Some(ElementLocation::Embedded { .. }) | None => {
                self.elements.remove(key, element_id)?;
            }
        }
        Ok(())
    }

    /// Store the payload while the caller holds the element write lock
    #[allow(clippy::too_many_arguments)]
    fn write_payload(
        &self,
        key: &ObjectKey,
        object_id: &str,
        element_id: &str,
        input: &mut dyn Read,
        append: bool,
        previous: Option<ElementLocation>,
        force_file: bool,
    ) -> Result<()> {
        let path = self.element_path(object_id, element_id);
        let threshold = self.props.max_db_element_size;

        if previous == Some(ElementLocation::File) {
            let len = payload::write_file(&path, &[], input, append)?;
            if !force_file && !append && len < (threshold / 2) as u64 {
                let data = payload::read_file(&path)?;
                self.elements.put(key, element_id, &data)?;
                let location = ElementLocation::Embedded {
                    size: data.len() as u64,
                };
                if !self.record_location(object_id, element_id, location)? {
                    self.elements.remove(key, element_id)?;
                    return Err(Error::ObjectNotFound(object_id.to_string()));
                }
                payload::remove_file(&path)?;
                if let Some(dir) = path.parent() {
                    remove_empty_dirs_from(&self.root, dir);
                }
                debug!("Moved {}/{} ({} bytes) into the element store", object_id, element_id, len);
            }
            return Ok(());
        }

        let mut buf = if append {
            self.elements.get(key, element_id)?.unwrap_or_default()
        } else {
            Vec::new()
        };
        let to_file =
            force_file || buf.len() > threshold || payload::fill_up_to(&mut buf, input, threshold)?;

        if to_file {
            let len = payload::write_file(&path, &buf, input, false)?;
            if !self.record_location(object_id, element_id, ElementLocation::File)? {
                payload::remove_file(&path)?;
                return Err(Error::ObjectNotFound(object_id.to_string()));
            }
            if self.elements.remove(key, element_id)? {
                debug!("Moved {}/{} ({} bytes) out to a file", object_id, element_id, len);
            }
        } else {
            self.elements.put(key, element_id, &buf)?;
            let location = ElementLocation::Embedded {
                size: buf.len() as u64,
            };
            if !self.record_location(object_id, element_id, location)? {
                self.elements.remove(key, element_id)?;
                return Err(Error::ObjectNotFound(object_id.to_string()));
            }
        }
        Ok(())
    }
}

impl ObjectStorage for HashedStorage {
    fn create_object(&self, object_id: Option<&str>, opts: &WriteOptions) -> Result<String> {
        self.check_writable()?;
        let object_id = match object_id {
            Some("") => return Err(Error::invalid_argument("object ID must not be empty")),
            Some(id) => id.to_string(),
            None => format!("{}{}", self.id_prefix, uuid::Uuid::new_v4()),
        };
        let key = ObjectKey::new(&object_id);

        let guard = self.object_locks.lock(&key);
        let mut md = self.metadata_locked(&object_id, &guard)?;
        if md.exists() {
            return Err(Error::ObjectAlreadyExists(object_id));
        }

        let creation_time = match opts.timestamp {
            Some(ts) => ts,
            // A local re-creation must land after the tombstone it replaces
            None => now_millis().max(md.date_deleted + 1),
        };
        let recorded = md.date_created.max(creation_time);
        md.date_created = recorded;
        md.update_modification(recorded);
        self.index.put(&md)?;

        self.log(opts, Transaction::new(TxnAction::ObjectAdd, &object_id, creation_time))?;
        if md.exists() {
            debug!("Created object {}", object_id);
        } else {
            debug!(
                "Creation of {} at {} precedes its deletion at {}; object stays deleted",
                object_id, creation_time, md.date_deleted
            );
        }
        Ok(object_id)
    }

    fn delete_object(&self, object_id: &str, opts: &WriteOptions) -> Result<()> {
        self.check_writable()?;
        let key = ObjectKey::new(object_id);

        let guard = self.object_locks.lock(&key);
        let mut md = self.metadata_locked(object_id, &guard)?;
        let date_created = md.date_created;
        if date_created > 0 && !md.exists() {
            return Err(Error::ObjectNotFound(object_id.to_string()));
        }

        // Re-created after this deletion event: only what predates the
        // event goes away
        let mut superseded = Vec::new();
        if let Some(ts) = opts.timestamp
            && date_created > ts
        {
            for element_id in md.elements_modified_before(ts) {
                let existed = md.element_exists(&element_id);
                let location = md.forget_element(&element_id);
                md.prune_attributes_before(Some(&element_id), ts);
                if existed {
                    superseded.push((element_id, location));
                }
            }
        }

        let now = now_millis();
        let (deletion_time, actual_time) = match opts.timestamp {
            Some(ts) => (ts, ts),
            None if now < date_created => (date_created + 1, now),
            None => (now, now),
        };

        let purge = deletion_time >= date_created;
        let had_files = purge && md.clear_all_elements();
        md.prune_attributes_before(None, deletion_time);
        md.date_deleted = deletion_time;
        md.update_modification(deletion_time);
        self.index.put(&md)?;

        self.log(
            opts,
            Transaction::new(TxnAction::ObjectDel, object_id, deletion_time).actual_time(actual_time),
        )?;
        drop(guard);

        // Physical cleanup; the tombstone is already durable
        if purge {
            self.elements.remove_object(&key)?;
        } else {
            for (element_id, location) in superseded {
                self.remove_payload(&key, object_id, &element_id, location)?;
            }
        }
        if had_files {
            let dir = self.object_dir(object_id);
            if let Err(e) = fs::remove_dir_all(&dir)
                && e.kind() != io::ErrorKind::NotFound
            {
                error!(
                    "Unable to finish deleting {:?} for {}; deletion is recorded: {}",
                    dir, object_id, e
                );
            }
            if let Some(parent) = dir.parent() {
                remove_empty_dirs_from(&self.root, parent);
            }
        }
        debug!("Deleted object {} at {}", object_id, deletion_time);
        Ok(())
    }

    fn object_exists(&self, object_id: &str) -> Result<bool> {
        Ok(self.object_metadata(object_id)?.exists())
    }

    fn element_exists(&self, object_id: &str, element_id: &str) -> Result<bool> {
        let md = self.object_metadata(object_id)?;
        Ok(md.exists() && md.element_exists(element_id))
    }

    fn list_objects(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + Send + '_>> {
        Ok(Box::new(self.index.object_ids()))
    }

    fn list_elements(&self, object_id: &str) -> Result<Vec<String>> {
        let md = self.object_metadata(object_id)?;
        if !md.exists() {
            return Ok(Vec::new());
        }
        Ok(md.elements())
    }

    fn get_element(
        &self,
        object_id: &str,
        element_id: &str,
        range: ByteRange,
    ) -> Result<Option<ElementReader>> {
        let key = ObjectKey::new(object_id);
        let md = self.object_metadata(object_id)?;
        if !md.exists() || !md.element_exists(element_id) {
            return Ok(None);
        }

        let guard = self.element_locks.read(ElementLocks::key(&key, element_id));
        // Look again now that no writer can be mid-flight
        let md = self.object_metadata(object_id)?;
        if !md.exists() || !md.element_exists(element_id) {
            return Ok(None);
        }

        match md.element_location(element_id) {
            Some(ElementLocation::File) => {
                let path = self.element_path(object_id, element_id);
                Ok(Some(ElementReader::file(&path, range, guard)?))
            }
            Some(ElementLocation::Embedded { .. }) | None => {
                let data = self.elements.get(&key, element_id)?.unwrap_or_default();
                drop(guard);
                Ok(Some(ElementReader::embedded(data, range)))
            }
        }
    }

    fn put_element(
        &self,
        object_id: &str,
        element_id: &str,
        input: &mut dyn Read,
        append: bool,
        opts: &WriteOptions,
    ) -> Result<()> {
        self.check_writable()?;
        let key = ObjectKey::new(object_id);
        if !self.object_metadata(object_id)?.exists() {
            return Err(Error::ObjectNotFound(object_id.to_string()));
        }

        let _write = self.element_locks.write(ElementLocks::key(&key, element_id));

        let (modification_time, previous, force_file) = {
            let guard = self.object_locks.lock(&key);
            let mut md = self.metadata_locked(object_id, &guard)?;
            if !md.exists() {
                return Err(Error::ObjectNotFound(object_id.to_string()));
            }
            let stored = md.element_timestamp(element_id).unwrap_or(0);
            let modification_time = match opts.timestamp {
                Some(ts) if stored >= ts => {
                    warn!(
                        "Attempt to overwrite newer element {}/{} (stored {}, attempted {})",
                        object_id, element_id, stored, ts
                    );
                    return Err(Error::StaleWrite {
                        object: object_id.to_string(),
                        element: Some(element_id.to_string()),
                        stored,
                        attempted: ts,
                    });
                }
                Some(ts) => ts,
                None => now_millis(),
            };

            md.set_element_timestamp(element_id, modification_time);
            md.set_element_exists(element_id, true);
            if stored == 0 {
                md.init_element_created(element_id, modification_time);
            }
            md.update_modification(modification_time);
            let previous = md.element_location(element_id);
            let force_file = md.force_file(element_id);
            self.index.put(&md)?;
            (modification_time, previous, force_file)
        };

        self.write_payload(&key, object_id, element_id, input, append, previous, force_file)
            .inspect_err(|e| error!("Error writing element {}/{}: {}", object_id, element_id, e))?;

        self.log(
            opts,
            Transaction::new(TxnAction::DataUpdate, object_id, modification_time)
                .element(Some(element_id)),
        )
    }

    fn delete_element(
        &self,
        object_id: &str,
        element_id: &str,
        opts: &WriteOptions,
    ) -> Result<bool> {
        self.check_writable()?;
        let key = ObjectKey::new(object_id);
        let md = self.object_metadata(object_id)?;
        if !md.exists() {
            return Err(Error::ObjectNotFound(object_id.to_string()));
        }
        if !md.element_exists(element_id) {
            return Ok(false);
        }

        let _write = self.element_locks.write(ElementLocks::key(&key, element_id));

        let (actual_time, location) = {
            let guard = self.object_locks.lock(&key);
            let mut md = self.metadata_locked(object_id, &guard)?;
            if !md.exists() {
                return Err(Error::ObjectNotFound(object_id.to_string()));
            }
            if !md.element_exists(element_id) {
                return Ok(false);
            }
            let stored = md.element_timestamp(element_id).unwrap_or(0);
            if let Some(ts) = opts.timestamp
                && stored >= ts
            {
                warn!(
                    "Attempt to delete newer element {}/{} (stored {}, attempted {})",
                    object_id, element_id, stored, ts
                );
                return Err(Error::StaleWrite {
                    object: object_id.to_string(),
                    element: Some(element_id.to_string()),
                    stored,
                    attempted: ts,
                });
            }
            let actual_time = opts.timestamp.unwrap_or_else(now_millis);

            md.set_element_timestamp(element_id, actual_time);
            md.set_element_exists(element_id, false);
            let location = md.element_location(element_id);
            md.clear_element_location(element_id);
            md.prune_attributes_before(Some(element_id), actual_time);
            md.update_modification(actual_time);
            self.index.put(&md)?;
            (actual_time, location)
        };

        self.remove_payload(&key, object_id, element_id, location)?;

        self.log(
            opts,
            Transaction::new(TxnAction::DataDel, object_id, actual_time).element(Some(element_id)),
        )?;
        Ok(true)
    }

    fn get_attributes(&self, object_id: &str, element_id: Option<&str>) -> Result<Attributes> {
        let md = self.object_metadata(object_id)?;
        let mut attributes = md.attributes(element_id);

        match element_id {
            None => {
                attributes
                    .entry(DATE_CREATED_ATTRIBUTE.to_string())
                    .or_insert_with(|| md.date_created.to_string());
                if let Some(modified) = md.modified() {
                    attributes
                        .entry(DATE_MODIFIED_ATTRIBUTE.to_string())
                        .or_insert_with(|| modified.to_string());
                }
            }
            Some(el) => {
                if let Some(modified) = md.element_timestamp(el) {
                    attributes
                        .entry(DATE_MODIFIED_ATTRIBUTE.to_string())
                        .or_insert_with(|| modified.to_string());
                }
                if let Some(created) = md.element_created(el) {
                    attributes
                        .entry(DATE_CREATED_ATTRIBUTE.to_string())
                        .or_insert_with(|| created.to_string());
                }
                if !attributes.contains_key(SIZE_ATTRIBUTE) {
                    let size = match md.element_location(el) {
                        Some(ElementLocation::File) => {
                            Some(payload::file_len(&self.element_path(object_id, el))?)
                        }
                        Some(ElementLocation::Embedded { size }) => Some(size),
                        None => None,
                    };
                    if let Some(size) = size {
                        attributes.insert(SIZE_ATTRIBUTE.to_string(), size.to_string());
                    }
                }
            }
        }
        Ok(attributes)
    }

    fn set_attributes(
        &self,
        object_id: &str,
        element_id: Option<&str>,
        attributes: &Attributes,
        opts: &WriteOptions,
    ) -> Result<()> {
        self.apply_attributes(
            object_id,
            element_id,
            attributes.iter().map(|(k, v)| (k.as_str(), Some(v.as_str()))),
            opts,
        )
    }

    fn delete_attributes(
        &self,
        object_id: &str,
        element_id: Option<&str>,
        keys: &[String],
        opts: &WriteOptions,
    ) -> Result<()> {
        self.apply_attributes(
            object_id,
            element_id,
            keys.iter().map(|k| (k.as_str(), None)),
            opts,
        )
    }

    fn serialize_object(&self, object_id: &str, sink: &mut dyn Write) -> Result<()> {
        let md = self.object_metadata(object_id)?;
        if !md.exists() {
            return Err(Error::ObjectNotFound(object_id.to_string()));
        }

        let mut writer = ArchiveWriter::new(sink)?;
        writer.write_metadata(&md)?;
        for element_id in md.elements() {
            // Deleted since the metadata snapshot: skip
            let Some(mut reader) = self.get_element(object_id, &element_id, ByteRange::full())?
            else {
                continue;
            };
            writer.write_element(&element_id, &mut reader)?;
        }
        writer.finish()?;
        debug!("Serialized object {}", object_id);
        Ok(())
    }

    fn deserialize_object(
        &self,
        object_id: &str,
        source: &mut dyn Read,
        opts: &WriteOptions,
    ) -> Result<()> {
        self.check_writable()?;
        let mut archive = ArchiveReader::new(source)?;
        let archived = archive.read_metadata()?;

        if self.object_exists(object_id)? {
            self.delete_object(object_id, opts)?;
        }
        self.create_object(Some(object_id), opts)?;

        {
            let key = ObjectKey::new(object_id);
            let guard = self.object_locks.lock(&key);
            let current = self.metadata_locked(object_id, &guard)?;
            let mut imported = ObjectMetadata::with_tags(
                current.id.clone(),
                archived.date_created,
                archived.date_deleted,
                archived.tags().clone(),
            );
            // Placement and modification times are decided again as the
            // elements arrive
            imported.clear_all_elements();
            imported.clear_element_timestamps();
            imported.mark_migrated();
            if !imported.exists() {
                imported.date_created = current.date_created;
                imported.date_deleted = current.date_deleted;
            }
            self.index.put(&imported)?;
        }

        while let Some(mut entry) = archive.next_entry()? {
            if entry.kind != EntryKind::Element {
                return Err(Error::Deserialization(format!(
                    "unexpected entry '{}' in archive of {}",
                    entry.name, object_id
                )));
            }
            let element_id = entry.name.clone();
            self.put_element(object_id, &element_id, &mut entry, false, opts)
                .map_err(|e| match e {
                    Error::Io(io)
                        if matches!(
                            io.kind(),
                            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
                        ) =>
                    {
                        Error::Deserialization(format!("element '{element_id}': {io}"))
                    }
                    other => other,
                })?;
        }
        debug!("Deserialized object {}", object_id);
        Ok(())
    }
}

impl HashedStorage {
    fn apply_attributes<'a>(
        &self,
        object_id: &str,
        element_id: Option<&str>,
        changes: impl Iterator<Item = (&'a str, Option<&'a str>)>,
        opts: &WriteOptions,
    ) -> Result<()> {
        self.check_writable()?;
        let key = ObjectKey::new(object_id);
        let guard = self.object_locks.lock(&key);
        let mut md = self.metadata_locked(object_id, &guard)?;
        let timestamp: Timestamp = opts.timestamp.unwrap_or_else(now_millis);

        let mut applied = Attributes::new();
        let mut deleting = false;
        for (name, value) in changes {
            deleting = value.is_none();
            if md.apply_attribute(element_id, name, value, timestamp) {
                applied.insert(name.to_string(), value.unwrap_or_default().to_string());
            } else {
                warn!(
                    "Ignoring stale attribute write {} on {}{} at {} (stored {})",
                    name,
                    object_id,
                    element_id.map(|e| format!("/{e}")).unwrap_or_default(),
                    timestamp,
                    md.attribute_timestamp(element_id, name).unwrap_or(0)
                );
            }
        }

        md.update_modification(timestamp);
        self.index.put(&md)?;

        if !applied.is_empty() {
            let action = if deleting {
                TxnAction::AttributeDelete
            } else {
                TxnAction::AttributeUpdate
            };
            self.log(
                opts,
                Transaction::new(action, object_id, timestamp)
                    .element(element_id)
                    .attributes(applied),
            )?;
        }
        Ok(())
    }
}
