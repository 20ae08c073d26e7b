//! Inode management for the FUSE filesystem.
//!
//! FUSE addresses everything by inode number while the overlay thinks
//! in virtual paths, so this table keeps a bidirectional mapping with
//! the kernel's `nlookup` reference counting on top. Entries are
//! evicted when the kernel forgets the last reference.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

#[derive(Debug)]
struct InodeEntry {
    path: String,
    /// Kernel reference count; drives eviction in `forget()`.
    nlookup: AtomicU64,
}

/// Thread-safe table mapping between inodes and virtual paths.
pub struct InodeTable {
    by_ino: DashMap<u64, InodeEntry>,
    by_path: DashMap<String, u64>,
    next: AtomicU64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Creates a table with the root directory pre-allocated. The root
    /// is never evicted.
    pub fn new() -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
            next: AtomicU64::new(ROOT_INODE + 1),
        };
        table.by_ino.insert(
            ROOT_INODE,
            InodeEntry {
                path: "/".to_owned(),
                nlookup: AtomicU64::new(1),
            },
        );
        table.by_path.insert("/".to_owned(), ROOT_INODE);
        table
    }

    /// Inode for a virtual path, incrementing its lookup count.
    /// Allocates a fresh inode for unseen paths.
    pub fn get_or_insert(&self, path: &str) -> u64 {
        self.insert_with_nlookup(path, 1)
    }

    /// Inode for a virtual path WITHOUT touching the lookup count.
    ///
    /// Plain `readdir` entries must not affect `nlookup`; only
    /// `lookup`, `create`, `mkdir`, `symlink`, and `link` replies do.
    pub fn get_or_insert_no_lookup_inc(&self, path: &str) -> u64 {
        self.insert_with_nlookup(path, 0)
    }

    fn insert_with_nlookup(&self, path: &str, inc: u64) -> u64 {
        if let Some(ino) = self.by_path.get(path).map(|r| *r) {
            if let Some(entry) = self.by_ino.get(&ino) {
                entry.nlookup.fetch_add(inc, Ordering::Relaxed);
                return ino;
            }
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        self.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_owned(),
                nlookup: AtomicU64::new(inc),
            },
        );
        self.by_path.insert(path.to_owned(), ino);
        ino
    }

    /// Virtual path for an inode, if it is live.
    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).map(|e| e.path.clone())
    }

    /// Inode for a virtual path, if one is allocated.
    pub fn inode_of(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).map(|r| *r)
    }

    /// Drops `nlookup` kernel references from an inode, evicting the
    /// entry when the count reaches zero. The root is never evicted.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let evict = match self.by_ino.get(&ino) {
            Some(entry) => {
                let old = entry.nlookup.fetch_sub(nlookup, Ordering::AcqRel);
                old <= nlookup
            }
            None => return,
        };
        if evict {
            if let Some((_, entry)) = self.by_ino.remove(&ino) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Rewrites the path of an entry and of everything beneath it,
    /// after a rename on the backing store.
    pub fn rename(&self, old: &str, new: &str) {
        let prefix = format!("{}/", old.trim_end_matches('/'));
        let moved: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|r| r.key() == old || r.key().starts_with(&prefix))
            .map(|r| (r.key().clone(), *r.value()))
            .collect();

        for (old_path, ino) in moved {
            let new_path = format!("{new}{}", &old_path[old.len()..]);
            self.by_path.remove(&old_path);
            self.by_path.insert(new_path.clone(), ino);
            if let Some(mut entry) = self.by_ino.get_mut(&ino) {
                entry.path = new_path;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

/// Joins a child name onto a parent virtual path.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preallocated() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INODE), Some("/".to_owned()));
        assert_eq!(table.inode_of("/"), Some(ROOT_INODE));
    }

    #[test]
    fn same_path_same_inode() {
        let table = InodeTable::new();
        let a = table.get_or_insert("/a.png");
        let b = table.get_or_insert("/a.png");
        assert_eq!(a, b);
        let c = table.get_or_insert("/b.png");
        assert_ne!(a, c);
    }

    #[test]
    fn forget_evicts_at_zero() {
        let table = InodeTable::new();
        let ino = table.get_or_insert("/a.png");
        table.get_or_insert("/a.png"); // nlookup = 2

        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), Some("/a.png".to_owned()));

        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), None);
        assert_eq!(table.inode_of("/a.png"), None);
    }

    #[test]
    fn readdir_entries_do_not_pin() {
        let table = InodeTable::new();
        let ino = table.get_or_insert_no_lookup_inc("/a.png");
        // One real lookup afterwards; a single forget evicts.
        assert_eq!(table.get_or_insert("/a.png"), ino);
        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), None);
    }

    #[test]
    fn root_survives_forget() {
        let table = InodeTable::new();
        table.forget(ROOT_INODE, 100);
        assert_eq!(table.path_of(ROOT_INODE), Some("/".to_owned()));
    }

    #[test]
    fn rename_rewrites_subtree() {
        let table = InodeTable::new();
        let dir = table.get_or_insert("/photos");
        let file = table.get_or_insert("/photos/a.png");
        let other = table.get_or_insert("/music/b.wav");

        table.rename("/photos", "/pictures");

        assert_eq!(table.path_of(dir), Some("/pictures".to_owned()));
        assert_eq!(table.path_of(file), Some("/pictures/a.png".to_owned()));
        assert_eq!(table.inode_of("/pictures/a.png"), Some(file));
        assert_eq!(table.inode_of("/photos/a.png"), None);
        assert_eq!(table.path_of(other), Some("/music/b.wav".to_owned()));
    }

    #[test]
    fn child_path_handles_root() {
        assert_eq!(child_path("/", "a.png"), "/a.png");
        assert_eq!(child_path("/photos", "a.png"), "/photos/a.png");
    }
}
