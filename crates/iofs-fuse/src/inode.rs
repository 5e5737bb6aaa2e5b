//! Inode management for the FUSE adapter.
//!
//! The engine is path based while the kernel speaks in inode numbers. This
//! module keeps the bidirectional mapping between the two, with FUSE
//! `nlookup` reference counting on top so entries are dropped once the
//! kernel forgets them.
//!
//! Inode numbers are synthetic and never reused. Host inode numbers are not
//! exposed: the source tree may span several host filesystems.

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Virtual path as seen through the mount point.
    pub path: PathBuf,
    /// Lookup count for proper `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn with_nlookup(path: PathBuf, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count by `count` and returns the new value.
    /// Returns `None` if the count would go negative.
    ///
    /// Uses `AcqRel` so the decrement is ordered before the eviction check
    /// that follows it.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }

    /// Returns the current lookup count.
    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe table mapping inode numbers to virtual paths.
///
/// Lock order is `by_path` before `by_ino`; no method takes them the other
/// way round.
#[derive(Debug)]
pub struct InodeTable {
    by_ino: DashMap<u64, InodeEntry>,
    by_path: DashMap<PathBuf, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    /// Creates a new table with the root directory pre-allocated.
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let by_ino = DashMap::new();
        let by_path = DashMap::new();
        by_ino.insert(ROOT_INODE, InodeEntry::with_nlookup(root.clone(), 1));
        by_path.insert(root, ROOT_INODE);
        Self {
            by_ino,
            by_path,
            next_ino: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Returns the inode for `path`, allocating one if needed, and
    /// increments its lookup count.
    ///
    /// Used for every reply that hands the kernel a new reference:
    /// `lookup`, `create`, `mkdir`, `symlink`, `link` and `readdirplus`.
    /// Plain `readdir` never allocates.
    pub fn lookup(&self, path: &Path) -> u64 {
        match self.by_path.entry(path.to_path_buf()) {
            Entry::Occupied(occupied) => {
                let ino = *occupied.get();
                match self.by_ino.get(&ino) {
                    Some(entry) => {
                        entry.inc_nlookup();
                    }
                    // Evicted under a stale mapping; bring it back.
                    None => {
                        self.by_ino
                            .insert(ino, InodeEntry::with_nlookup(path.to_path_buf(), 1));
                    }
                }
                ino
            }
            Entry::Vacant(vacant) => {
                let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
                self.by_ino
                    .insert(ino, InodeEntry::with_nlookup(path.to_path_buf(), 1));
                vacant.insert(ino);
                ino
            }
        }
    }

    /// Looks up an entry by inode number.
    pub fn get(&self, inode: u64) -> Option<Ref<'_, u64, InodeEntry>> {
        self.by_ino.get(&inode)
    }

    /// Virtual path currently associated with `inode`.
    pub fn path(&self, inode: u64) -> Option<PathBuf> {
        self.by_ino.get(&inode).map(|entry| entry.path.clone())
    }

    /// Looks up an inode by virtual path.
    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        self.by_path.get(path).map(|ino| *ino)
    }

    /// Decrements the lookup count for an inode.
    /// If the count reaches zero, the inode is evicted.
    /// Returns `true` if the inode was evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }

        let path = match self.by_ino.get(&inode) {
            Some(entry) if entry.dec_nlookup(nlookup) == Some(0) => entry.path.clone(),
            _ => return false,
        };
        self.evict(inode, path)
    }

    fn evict(&self, inode: u64, path: PathBuf) -> bool {
        let unreferenced = |_: &u64, entry: &InodeEntry| entry.nlookup() == 0;
        match self.by_path.entry(path) {
            Entry::Occupied(occupied) if *occupied.get() == inode => {
                let evicted = self.by_ino.remove_if(&inode, unreferenced).is_some();
                if evicted {
                    occupied.remove();
                }
                evicted
            }
            _ => self.by_ino.remove_if(&inode, unreferenced).is_some(),
        }
    }

    /// Drops the path mapping after an `unlink`/`rmdir`.
    ///
    /// The inode entry itself stays until the kernel forgets it: the kernel
    /// may still pass a cached inode number to later operations.
    pub fn invalidate_path(&self, path: &Path) {
        self.by_path.remove(path);
    }

    /// Re-homes `from` and everything below it under `to` after a
    /// successful rename. Whatever was mapped at `to` is dropped first.
    pub fn rename(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        let moves = self.subtree(from, to);
        self.by_path
            .retain(|path, _| !path.starts_with(to) || path.starts_with(from));
        self.apply(&moves);
    }

    /// Swaps the subtrees at `a` and `b` after a `RENAME_EXCHANGE`.
    pub fn exchange(&self, a: &Path, b: &Path) {
        if a == b {
            return;
        }
        let mut moves = self.subtree(a, b);
        moves.extend(self.subtree(b, a));
        self.apply(&moves);
    }

    /// Collects `(old, new, ino)` for every mapping at or below `from`.
    fn subtree(&self, from: &Path, to: &Path) -> Vec<(PathBuf, PathBuf, u64)> {
        self.by_path
            .iter()
            .filter_map(|item| {
                let rest = item.key().strip_prefix(from).ok()?;
                let new = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                Some((item.key().clone(), new, *item.value()))
            })
            .collect()
    }

    fn apply(&self, moves: &[(PathBuf, PathBuf, u64)]) {
        for (old, _, ino) in moves {
            self.by_path.remove_if(old, |_, mapped| mapped == ino);
        }
        for (_, new, ino) in moves {
            self.by_path.insert(new.clone(), *ino);
            if let Some(mut entry) = self.by_ino.get_mut(ino) {
                entry.path.clone_from(new);
            }
        }
    }

    /// Returns the number of inodes currently in the table.
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Returns true if the table only contains the root inode.
    pub fn is_empty(&self) -> bool {
        self.by_ino.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> &Path {
        Path::new(s)
    }

    #[test]
    fn test_root_inode_exists() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INODE).unwrap(), p("/"));
        assert_eq!(table.get_inode(p("/")), Some(ROOT_INODE));
        assert!(table.is_empty());
    }

    #[test]
    fn test_lookup_allocates_once() {
        let table = InodeTable::new();
        let inode = table.lookup(p("/docs"));
        assert!(inode > ROOT_INODE);

        let again = table.lookup(p("/docs"));
        assert_eq!(inode, again);
        assert_eq!(table.get(inode).unwrap().nlookup(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lookup_then_forget_leaves_no_entry() {
        let table = InodeTable::new();
        let inode = table.lookup(p("/listed"));
        assert!(table.forget(inode, 1));
        assert_eq!(table.len(), 1);
        assert!(table.get_inode(p("/listed")).is_none());

        // An existing reference survives a matching lookup/forget pair.
        let kept = table.lookup(p("/kept"));
        assert_eq!(table.lookup(p("/kept")), kept);
        assert!(!table.forget(kept, 1));
        assert_eq!(table.get(kept).unwrap().nlookup(), 1);
    }

    #[test]
    fn test_forget_evicts() {
        let table = InodeTable::new();
        let inode = table.lookup(p("/temp"));

        assert!(table.forget(inode, 1));
        assert!(table.get(inode).is_none());
        assert!(table.get_inode(p("/temp")).is_none());
    }

    #[test]
    fn test_forget_partial() {
        let table = InodeTable::new();
        let inode = table.lookup(p("/f"));
        table.lookup(p("/f"));

        assert!(!table.forget(inode, 1));
        assert_eq!(table.get(inode).unwrap().nlookup(), 1);
        assert!(table.forget(inode, 1));
    }

    #[test]
    fn test_forget_underflow_is_ignored() {
        let table = InodeTable::new();
        let inode = table.lookup(p("/f"));
        assert!(!table.forget(inode, 5));
        assert_eq!(table.get(inode).unwrap().nlookup(), 1);
    }

    #[test]
    fn test_forget_root_never_evicts() {
        let table = InodeTable::new();
        assert!(!table.forget(ROOT_INODE, 1));
        assert!(table.get(ROOT_INODE).is_some());
    }

    #[test]
    fn test_inodes_not_reused() {
        let table = InodeTable::new();
        let first = table.lookup(p("/a"));
        table.forget(first, 1);
        let second = table.lookup(p("/a"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_invalidate_keeps_entry() {
        let table = InodeTable::new();
        let inode = table.lookup(p("/gone"));
        table.invalidate_path(p("/gone"));

        assert!(table.get_inode(p("/gone")).is_none());
        assert_eq!(table.path(inode).unwrap(), p("/gone"));

        // Forget still evicts cleanly.
        assert!(table.forget(inode, 1));
        assert!(table.get(inode).is_none());
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.lookup(p("/dir"));
        let file = table.lookup(p("/dir/sub/file"));
        let sibling = table.lookup(p("/dirty"));

        table.rename(p("/dir"), p("/moved"));

        assert_eq!(table.get_inode(p("/moved")), Some(dir));
        assert_eq!(table.get_inode(p("/moved/sub/file")), Some(file));
        assert_eq!(table.path(file).unwrap(), p("/moved/sub/file"));
        assert!(table.get_inode(p("/dir")).is_none());
        // Component-wise prefix: "/dirty" is not under "/dir".
        assert_eq!(table.get_inode(p("/dirty")), Some(sibling));
    }

    #[test]
    fn test_rename_replaces_target() {
        let table = InodeTable::new();
        let src = table.lookup(p("/a"));
        let dst = table.lookup(p("/b"));

        table.rename(p("/a"), p("/b"));

        assert_eq!(table.get_inode(p("/b")), Some(src));
        assert!(table.get_inode(p("/a")).is_none());
        // The replaced inode survives until forgotten.
        assert!(table.get(dst).is_some());
    }

    #[test]
    fn test_exchange_swaps() {
        let table = InodeTable::new();
        let a = table.lookup(p("/a"));
        let a_child = table.lookup(p("/a/x"));
        let b = table.lookup(p("/b"));

        table.exchange(p("/a"), p("/b"));

        assert_eq!(table.get_inode(p("/a")), Some(b));
        assert_eq!(table.get_inode(p("/b")), Some(a));
        assert_eq!(table.get_inode(p("/b/x")), Some(a_child));
        assert!(table.get_inode(p("/a/x")).is_none());
        assert_eq!(table.path(a).unwrap(), p("/b"));
        assert_eq!(table.path(b).unwrap(), p("/a"));
    }

    #[test]
    fn test_concurrent_allocation() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(InodeTable::new());
        let mut handles = vec![];

        for i in 0..10 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let path = PathBuf::from(format!("/file_{i}"));
                table.lookup(&path)
            }));
        }

        let inodes: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut sorted = inodes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), inodes.len());
        assert_eq!(table.len(), 11);
    }

    #[test]
    fn test_concurrent_same_path() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(InodeTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || table.lookup(p("/shared")))
            })
            .collect();

        let inodes: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(inodes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.get(inodes[0]).unwrap().nlookup(), 8);
    }
}
