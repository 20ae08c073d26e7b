//! Virtual-path resolution over a backing store.
//!
//! The overlay answers path questions for the filesystem layer. A
//! *virtual path* is what the mount's clients see (`/photos/a.png`); a
//! *real path* is where bytes actually live under the backing-store
//! root. Resolution order is fixed:
//!
//! 1. A physical file always wins. If the virtual path exists verbatim
//!    under the root, it is served as-is and no driver runs.
//! 2. Otherwise the driver registry may map the path to a master file
//!    and materialize a converted view.
//! 3. Otherwise the path maps to itself, and opening it fails the same
//!    way it would on the backing store.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::DecodeCache;
use crate::driver::{DriverError, DriverRegistry};
use crate::fd;

/// A descriptor handed out by [`Overlay::open_file`].
///
/// `Owned` descriptors belong to the caller and close on drop.
/// `Shared` descriptors reference a cache entry; the underlying
/// descriptor stays open until both the cache and every handle
/// referencing it are done with it.
#[derive(Debug)]
pub enum OpenedFile {
    Owned(OwnedFd),
    Shared(Arc<OwnedFd>),
}

impl OpenedFile {
    pub fn raw(&self) -> RawFd {
        match self {
            Self::Owned(fd) => fd.as_raw_fd(),
            Self::Shared(fd) => fd.as_raw_fd(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

pub struct Overlay {
    root: PathBuf,
    registry: DriverRegistry,
    cache: DecodeCache,
}

impl Overlay {
    pub fn new(root: PathBuf, registry: DriverRegistry) -> Self {
        Self {
            root,
            registry,
            cache: DecodeCache::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &DecodeCache {
        &self.cache
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Joins a virtual path onto the backing-store root, without any
    /// driver involvement.
    pub fn join(&self, virtual_path: &str) -> PathBuf {
        self.root.join(virtual_path.trim_start_matches('/'))
    }

    /// Real path a virtual path resolves to.
    ///
    /// Physical files win over driver mappings; unmatched paths map to
    /// themselves so that mutations and error reporting land on the
    /// backing store untouched.
    pub fn resolve(&self, virtual_path: &str) -> PathBuf {
        let real = self.join(virtual_path);
        if real.symlink_metadata().is_ok() {
            return real;
        }
        self.registry.resolve_real_path(&real).unwrap_or(real)
    }

    /// Names a backing-store directory entry should be listed under.
    ///
    /// `None` means the entry lists under its own name. `Some(names)`
    /// replaces the entry with its phantom names; the master itself is
    /// hidden from the listing.
    pub fn list_names(&self, real_entry: &Path) -> Option<Vec<PathBuf>> {
        self.registry.list_phantom_names(real_entry)
    }

    /// Opens a virtual path for I/O.
    ///
    /// Physical files open directly with the caller's flags. Phantom
    /// paths are served from the decode cache, materializing on first
    /// open; flags are ignored for them since the content is a
    /// read-only derived view. Paths nobody claims fall through to a
    /// direct open, which reports the backing store's own error.
    pub fn open_file(&self, virtual_path: &str, flags: i32, mode: u32) -> io::Result<OpenedFile> {
        let real = self.join(virtual_path);
        if real.symlink_metadata().is_ok() {
            return fd::open_raw(&real, flags, mode).map(OpenedFile::Owned);
        }

        if let Some(entry) = self.cache.lookup(virtual_path) {
            return Ok(OpenedFile::Shared(entry));
        }

        // Materialize outside the cache lock. Two racing opens may
        // both convert; the later insert wins, and each caller keeps
        // its own reference to the descriptor it was handed.
        match self.registry.materialize(&real) {
            Ok(Some(owned)) => {
                let entry = self.cache.insert(virtual_path.to_owned(), owned);
                Ok(OpenedFile::Shared(entry))
            }
            Ok(None) => fd::open_raw(&real, flags, mode).map(OpenedFile::Owned),
            Err(err) => {
                tracing::warn!(path = virtual_path, %err, "materialization failed");
                Err(driver_error_to_io(err))
            }
        }
    }

    /// Byte length a phantom path reports, or `None` when the path is
    /// physical and ordinary stat metadata applies.
    ///
    /// Materializes (and caches) the phantom if needed, since the only
    /// way to know a converted file's size is to convert it.
    pub fn phantom_size(&self, virtual_path: &str) -> io::Result<Option<u64>> {
        if self.join(virtual_path).symlink_metadata().is_ok() {
            return Ok(None);
        }
        let opened = self.open_file(virtual_path, libc::O_RDONLY, 0)?;
        fd::fd_size(opened.raw()).map(Some)
    }

    /// Whether a virtual path exists in the overlay at all, physically
    /// or as a resolvable phantom.
    pub fn exists(&self, virtual_path: &str) -> bool {
        let real = self.join(virtual_path);
        real.symlink_metadata().is_ok() || self.registry.resolve_real_path(&real).is_some()
    }

    /// Drops the cached entry for a virtual path. Called when the path
    /// is unlinked or its master may have changed. Handles already
    /// served from the entry stay open until they are released.
    pub fn invalidate(&self, virtual_path: &str) {
        if self.cache.remove(virtual_path) {
            tracing::debug!(path = virtual_path, "dropped cached descriptor");
        }
    }
}

fn driver_error_to_io(err: DriverError) -> io::Error {
    match err {
        DriverError::Io(io) => io,
        // Decode/encode failures surface as plain EIO to callers.
        other => io::Error::other(other),
    }
}
