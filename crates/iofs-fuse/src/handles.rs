//! Registry of open file and directory sessions.
//!
//! Every `open`/`create`/`opendir` moves its host resource into a table and
//! hands the kernel an opaque 64-bit id. The matching `release`/`releasedir`
//! removes the entry, which drops (closes) the resource exactly once.
//!
//! # Handle Lifecycle
//!
//! 1. **Insert**: the resource is moved in and a fresh id is returned
//! 2. **Get**: later calls borrow or clone the resource through its id
//! 3. **Remove**: release takes the resource back out and drops it
//!
//! Ids come from a counter that only moves forward, so an id is never handed
//! out twice. A call that arrives with a released id finds nothing and fails
//! with `EBADF` instead of touching some other session's descriptor.

use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::dirstream::DirStream;
use crate::error::{FsError, FsResult};

/// Open files keyed by handle id.
///
/// Callers clone the `Arc` out before doing I/O so no shard lock is held
/// across a blocking host call.
pub type FileHandles = HandleTable<Arc<File>>;

/// Open directory streams keyed by handle id.
pub type DirHandles = HandleTable<Arc<Mutex<DirStream>>>;

/// Thread-safe table with never-reused auto-incrementing ids.
///
/// ```
/// use iofs_fuse::handles::HandleTable;
///
/// let table: HandleTable<String> = HandleTable::new();
/// let id = table.insert("file1".to_string());
/// assert_eq!(table.remove(id), Some("file1".to_string()));
/// assert!(table.get(id).is_err());
/// ```
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    /// Next id to hand out (0 is reserved for "no handle").
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    /// Create an empty table. Ids start at 1.
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a value and return its id.
    pub fn insert(&self, value: V) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, value);
        id
    }

    /// Borrow the value behind `id`.
    pub fn get(&self, id: u64) -> FsResult<Ref<'_, u64, V>> {
        self.handles.get(&id).ok_or(FsError::InvalidHandle(id))
    }

    /// Clone the value behind `id` out of the table.
    pub fn get_cloned(&self, id: u64) -> FsResult<V>
    where
        V: Clone,
    {
        self.get(id).map(|v| v.value().clone())
    }

    /// Remove and return the value behind `id`.
    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    /// Get the number of open handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_sequential_ids() {
        let table: HandleTable<&str> = HandleTable::new();
        assert_eq!(table.insert("a"), 1);
        assert_eq!(table.insert("b"), 2);
        assert_eq!(table.insert("c"), 3);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_unknown_id_is_invalid_handle() {
        let table: HandleTable<u8> = HandleTable::new();
        assert!(matches!(table.get(99), Err(FsError::InvalidHandle(99))));
    }

    #[test]
    fn test_removed_id_is_never_reused() {
        let table: HandleTable<u8> = HandleTable::new();
        let first = table.insert(1);
        assert_eq!(table.remove(first), Some(1));
        assert!(table.remove(first).is_none());

        let second = table.insert(2);
        assert_ne!(first, second);
        assert!(table.get(first).is_err());
        assert!(!table.is_empty());
    }

    #[test]
    fn test_get_cloned_outlives_remove() {
        let table: HandleTable<Arc<String>> = HandleTable::new();
        let id = table.insert(Arc::new("open".to_string()));
        let held = table.get_cloned(id).unwrap();
        drop(table.remove(id));
        assert_eq!(*held, "open");
        assert!(table.get_cloned(id).is_err());
    }

    #[test]
    fn test_remove_drops_resource() {
        let marker = Arc::new(());
        let table: HandleTable<Arc<()>> = HandleTable::new();
        let id = table.insert(Arc::clone(&marker));
        assert_eq!(Arc::strong_count(&marker), 2);
        drop(table.remove(id));
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_concurrent_inserts_unique() {
        let table = Arc::new(HandleTable::<usize>::new());
        let workers: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || (0..100).map(|i| table.insert(t * 100 + i)).collect::<Vec<_>>())
            })
            .collect();

        let mut ids = HashSet::new();
        for w in workers {
            for id in w.join().unwrap() {
                assert!(ids.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(ids.len(), 800);
        assert_eq!(table.len(), 800);
    }
}
