//! Open file handle table.
//!
//! Every successful `open`/`create` registers an [`OpenedFile`] here
//! and hands the kernel the resulting handle id; `read`, `write`, and
//! friends look the descriptor back up by that id. Handle ids start at
//! 1 so that 0 stays available as "no handle".

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use facet_core::OpenedFile;

pub struct HandleTable {
    handles: DashMap<u64, OpenedFile>,
    next: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, file: OpenedFile) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, file);
        fh
    }

    /// Raw descriptor behind a handle id.
    pub fn raw_fd(&self, fh: u64) -> Option<std::os::fd::RawFd> {
        self.handles.get(&fh).map(|h| h.raw())
    }

    /// Removes a handle, returning the file so the caller decides how
    /// it closes. Dropping an `Owned` file closes its descriptor; a
    /// `Shared` one releases its reference to the cache entry.
    pub fn remove(&self, fh: u64) -> Option<OpenedFile> {
        self.handles.remove(&fh).map(|(_, file)| file)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
