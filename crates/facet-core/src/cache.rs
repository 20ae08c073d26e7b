//! In-process cache of materialized descriptors.
//!
//! Conversions are expensive and deterministic, so a phantom file is
//! materialized once per mount and the resulting descriptor is kept
//! here, keyed by virtual path. Entries hold their descriptor behind an
//! [`Arc`]: removing or replacing an entry drops the cache's reference,
//! but the descriptor itself closes only once every outstanding handle
//! cloned from the entry has been dropped too.
//!
//! The map lock is only ever held for map operations. Materialization
//! runs outside the lock, so two threads racing on the same key may
//! both convert; the second insertion wins and the first entry is
//! dropped, which is harmless because each materializer keeps its own
//! reference to the descriptor it produced.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Default)]
pub struct DecodeCache {
    entries: Mutex<HashMap<String, Arc<OwnedFd>>>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared reference to a cached descriptor, if present.
    ///
    /// The clone keeps the descriptor open independently of the cache
    /// entry, so callers may hold it across a later eviction.
    pub fn lookup(&self, virtual_path: &str) -> Option<Arc<OwnedFd>> {
        self.entries.lock().get(virtual_path).cloned()
    }

    pub fn contains(&self, virtual_path: &str) -> bool {
        self.entries.lock().contains_key(virtual_path)
    }

    /// Stores a materialized descriptor, returning a shared reference
    /// for the inserting caller. An existing entry under the same key
    /// loses the cache's reference.
    pub fn insert(&self, virtual_path: String, fd: OwnedFd) -> Arc<OwnedFd> {
        let entry = Arc::new(fd);
        if let Some(old) = self
            .entries
            .lock()
            .insert(virtual_path, Arc::clone(&entry))
        {
            tracing::debug!(fd = old.as_raw_fd(), "replacing cached descriptor");
        }
        entry
    }

    /// Drops the cache's reference for a virtual path. Returns whether
    /// an entry was present. Handles cloned from the entry stay open.
    pub fn remove(&self, virtual_path: &str) -> bool {
        self.entries.lock().remove(virtual_path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd;

    fn memfd_with(content: &[u8]) -> OwnedFd {
        let fd = fd::memfd("cache-test").unwrap();
        fd::pwrite(fd.as_raw_fd(), content, 0).unwrap();
        fd
    }

    #[test]
    fn lookup_miss() {
        let cache = DecodeCache::new();
        assert!(cache.lookup("/a/b.png").is_none());
        assert!(!cache.contains("/a/b.png"));
    }

    #[test]
    fn insert_then_lookup() {
        let cache = DecodeCache::new();
        cache.insert("/a/b.png".into(), memfd_with(b"png bytes"));

        let entry = cache.lookup("/a/b.png").unwrap();
        let mut buf = [0u8; 9];
        fd::pread(entry.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf, b"png bytes");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reinsert_replaces_descriptor() {
        let cache = DecodeCache::new();
        cache.insert("/x.wav".into(), memfd_with(b"first"));
        let first = cache.lookup("/x.wav").unwrap();

        cache.insert("/x.wav".into(), memfd_with(b"second"));
        let second = cache.lookup("/x.wav").unwrap();
        assert_ne!(first.as_raw_fd(), second.as_raw_fd());
        assert_eq!(cache.len(), 1);

        let mut buf = [0u8; 6];
        fd::pread(second.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf, b"second");
    }

    #[test]
    fn replaced_entry_stays_open_while_referenced() {
        let cache = DecodeCache::new();
        cache.insert("/x.wav".into(), memfd_with(b"first"));
        let held = cache.lookup("/x.wav").unwrap();

        cache.insert("/x.wav".into(), memfd_with(b"second"));

        // The old descriptor still reads through the held reference.
        let mut buf = [0u8; 5];
        fd::pread(held.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf, b"first");
    }

    #[test]
    fn remove_drops_cache_reference_only() {
        let cache = DecodeCache::new();
        cache.insert("/x.wav".into(), memfd_with(b"bytes"));
        let held = cache.lookup("/x.wav").unwrap();

        assert!(cache.remove("/x.wav"));
        assert!(cache.lookup("/x.wav").is_none());
        assert!(!cache.remove("/x.wav"));
        assert!(cache.is_empty());

        let mut buf = [0u8; 5];
        fd::pread(held.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf, b"bytes");
    }
}
