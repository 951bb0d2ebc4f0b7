//! In-process lock tables
//!
//! Two independent layers:
//!
//! - [`ObjectLocks`]: one mutex per object key, held across the
//!   read-modify-write of an object's metadata record.
//! - [`ElementLocks`]: shared-read / exclusive-write exclusion per
//!   (object, element), held for the duration of payload I/O.
//!
//! Entries exist only while somebody holds or waits on them. Nothing is
//! persisted; a restarted process starts from empty tables.
//!
//! Lock order is element write lock, then object lock.

use crate::hashdir::convert_to_file_name;
use dashmap::DashMap;
use dostore_common::ObjectKey;
use parking_lot::{ArcMutexGuard, Condvar, Mutex, RawMutex};
use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;

const ELEMENT_LOCK_SHARDS: usize = 16;

/// Per-object metadata mutexes
#[derive(Default)]
pub struct ObjectLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ObjectLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the object's mutex is ours
    pub fn lock(&self, key: &ObjectKey) -> ObjectGuard<'_> {
        let mutex = Arc::clone(&self.locks.entry(key.as_str().to_string()).or_default());
        let guard = mutex.lock_arc();
        ObjectGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held object mutex; released on drop
pub struct ObjectGuard<'a> {
    locks: &'a ObjectLocks,
    key: ObjectKey,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl ObjectGuard<'_> {
    /// Key of the locked object
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }
}

impl Drop for ObjectGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map itself still references the mutex: nobody waits on it
        self.locks
            .locks
            .remove_if(self.key.as_str(), |_, m| Arc::strong_count(m) == 1);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockState {
    Readers(usize),
    Writer,
}

#[derive(Default)]
struct Shard {
    entries: Mutex<HashMap<String, LockState>>,
    changed: Condvar,
}

struct ElementLocksInner {
    shards: Vec<Shard>,
    hasher: RandomState,
}

impl ElementLocksInner {
    fn shard(&self, key: &str) -> &Shard {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn release_read(&self, key: &str) {
        let shard = self.shard(key);
        let mut entries = shard.entries.lock();
        match entries.get_mut(key) {
            Some(LockState::Readers(n)) if *n > 1 => *n -= 1,
            Some(LockState::Readers(_)) => {
                entries.remove(key);
                shard.changed.notify_all();
            }
            // Writer or absent: not ours to touch
            _ => {}
        }
    }

    fn release_write(&self, key: &str) {
        let shard = self.shard(key);
        let mut entries = shard.entries.lock();
        if entries.get(key) == Some(&LockState::Writer) {
            entries.remove(key);
            shard.changed.notify_all();
        }
    }
}

/// Per-element reader/writer registry
#[derive(Clone)]
pub struct ElementLocks {
    inner: Arc<ElementLocksInner>,
}

impl Default for ElementLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementLocks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ElementLocksInner {
                shards: (0..ELEMENT_LOCK_SHARDS).map(|_| Shard::default()).collect(),
                hasher: RandomState::new(),
            }),
        }
    }

    /// Registry key `<escaped element>$<object>`. The element part is
    /// escaped so a `$` inside an element ID cannot alias another pair.
    #[must_use]
    pub fn key(object: &ObjectKey, element_id: &str) -> String {
        format!("{}${}", convert_to_file_name(element_id), object)
    }

    /// Join the readers of an element, waiting out any writer
    pub fn read(&self, key: String) -> ReadGuard {
        let shard = self.inner.shard(&key);
        let mut entries = shard.entries.lock();
        loop {
            match entries.get_mut(&key) {
                None => {
                    entries.insert(key.clone(), LockState::Readers(1));
                    break;
                }
                Some(LockState::Readers(n)) => {
                    *n += 1;
                    break;
                }
                Some(LockState::Writer) => shard.changed.wait(&mut entries),
            }
        }
        drop(entries);
        ReadGuard {
            held: Some((Arc::clone(&self.inner), key)),
        }
    }

    /// Become the only holder of an element, waiting for readers and any
    /// other writer to leave
    pub fn write(&self, key: String) -> WriteGuard {
        let shard = self.inner.shard(&key);
        let mut entries = shard.entries.lock();
        while entries.contains_key(&key) {
            shard.changed.wait(&mut entries);
        }
        entries.insert(key.clone(), LockState::Writer);
        drop(entries);
        WriteGuard {
            held: Some((Arc::clone(&self.inner), key)),
        }
    }

    /// Number of elements currently locked
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.entries.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared hold on an element. Released on drop or by [`ReadGuard::release`].
pub struct ReadGuard {
    held: Option<(Arc<ElementLocksInner>, String)>,
}

impl ReadGuard {
    /// Release early; later calls (and the drop) do nothing
    pub fn release(&mut self) {
        if let Some((inner, key)) = self.held.take() {
            inner.release_read(&key);
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive hold on an element
pub struct WriteGuard {
    held: Option<(Arc<ElementLocksInner>, String)>,
}

impl WriteGuard {
    pub fn release(&mut self) {
        if let Some((inner, key)) = self.held.take() {
            inner.release_write(&key);
        }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_object_lock_entries_are_reclaimed() {
        let locks = ObjectLocks::new();
        let key = ObjectKey::new("Obj");
        {
            let guard = locks.lock(&key);
            assert_eq!(guard.key().as_str(), "obj");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_object_lock_is_exclusive() {
        let locks = Arc::new(ObjectLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let key = ObjectKey::new("shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let key = key.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _g = locks.lock(&key);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_key_escapes_element() {
        let obj = ObjectKey::new("o");
        assert_ne!(ElementLocks::key(&obj, "a$b"), ElementLocks::key(&ObjectKey::new("b$o"), "a"));
        assert_eq!(ElementLocks::key(&obj, "el"), "el$o");
    }

    #[test]
    fn test_readers_share_and_release_is_idempotent() {
        let locks = ElementLocks::new();
        let mut a = locks.read("k".into());
        let b = locks.read("k".into());
        assert_eq!(locks.len(), 1);

        a.release();
        a.release();
        assert!(!a.is_held());
        assert_eq!(locks.len(), 1);

        drop(b);
        drop(a);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let locks = ElementLocks::new();
        let readers: Vec<_> = (0..4).map(|_| locks.read("k".into())).collect();
        let wrote = Arc::new(AtomicBool::new(false));

        let writer = {
            let locks = locks.clone();
            let wrote = Arc::clone(&wrote);
            thread::spawn(move || {
                let _w = locks.write("k".into());
                wrote.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!wrote.load(Ordering::SeqCst));

        let mut readers = readers;
        while let Some(r) = readers.pop() {
            assert!(!wrote.load(Ordering::SeqCst));
            drop(r);
        }
        writer.join().unwrap();
        assert!(wrote.load(Ordering::SeqCst));
        assert!(locks.is_empty());
    }

    #[test]
    fn test_writers_never_overlap() {
        let locks = ElementLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..6u8)
            .map(|id| {
                let locks = locks.clone();
                let active = Arc::clone(&active);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _w = locks.write("k".into());
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        // A writer's bytes land contiguously
                        for _ in 0..4 {
                            log.lock().push(id);
                            thread::yield_now();
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let log = log.lock();
        assert_eq!(log.len(), 6 * 20 * 4);
        for chunk in log.chunks(4) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_distinct_elements_do_not_block() {
        let locks = ElementLocks::new();
        let _w = locks.write("a$o".into());
        // Would deadlock if elements shared one entry
        let _r = locks.read("b$o".into());
        let _w2 = locks.write("c$o".into());
        assert_eq!(locks.len(), 3);
    }
}
