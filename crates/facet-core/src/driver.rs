//! Conversion drivers and their ordered registry.
//!
//! A driver owns one family of conversions, described entirely by file
//! extensions: one *master* extension it reads and a fixed list of
//! *phantom* extensions it can produce. Drivers are stateless policy
//! objects; the registry tries them in a fixed order and the first
//! non-empty answer wins.

use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors produced while materializing a phantom file.
///
/// Recognition misses are not errors: the resolve/list methods return
/// `None` for paths that are not theirs, and the registry moves on to
/// the next driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver does not produce the requested output format.
    #[error("unsupported output format: .{0}")]
    UnsupportedFormat(String),

    /// The master file could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The converted output could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// I/O failure reading the master or staging the output.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One family of conversions.
///
/// All paths handed to a driver are real-form paths: the overlay has
/// already joined the virtual path onto the backing-store root, so
/// existence checks hit the right directory.
pub trait Driver: Send + Sync {
    /// Maps a phantom path back to its master path.
    ///
    /// Returns `Some` only when `path` carries one of this driver's
    /// phantom extensions *and* the master-substituted path exists on
    /// the backing store.
    fn resolve_real_path(&self, path: &Path) -> Option<PathBuf>;

    /// Enumerates the phantom names this driver exposes for a master
    /// path, in a fixed, deterministic order.
    ///
    /// Returns `Some` only when `path` carries the master extension.
    /// Does not check that the master exists: listing runs on names
    /// the caller already read out of a directory.
    fn list_phantom_names(&self, path: &Path) -> Option<Vec<PathBuf>>;

    /// Performs the conversion, returning a readable descriptor
    /// positioned at offset 0 holding the complete converted content.
    fn materialize(&self, master: &Path, phantom_ext: &str) -> Result<OwnedFd, DriverError>;
}

/// Returns the extension of `path` as a str, if it has one.
pub(crate) fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

/// Ordered list of drivers; first match wins.
///
/// The shipped configuration gives each extension to exactly one
/// driver. That is a configuration invariant, not something the
/// registry enforces.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Box<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drivers(drivers: Vec<Box<dyn Driver>>) -> Self {
        Self { drivers }
    }

    pub fn register(&mut self, driver: Box<dyn Driver>) {
        self.drivers.push(driver);
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// First driver's answer for "which master backs this phantom?".
    pub fn resolve_real_path(&self, path: &Path) -> Option<PathBuf> {
        self.drivers.iter().find_map(|d| d.resolve_real_path(path))
    }

    /// First driver's answer for "which names does this entry list as?".
    pub fn list_phantom_names(&self, path: &Path) -> Option<Vec<PathBuf>> {
        self.drivers.iter().find_map(|d| d.list_phantom_names(path))
    }

    /// Materializes the phantom at `path` through the first driver
    /// that recognizes it.
    ///
    /// `Ok(None)` means no driver claimed the path; `Err` means the
    /// recognizing driver's transform failed.
    pub fn materialize(&self, path: &Path) -> Result<Option<OwnedFd>, DriverError> {
        for driver in &self.drivers {
            if let Some(master) = driver.resolve_real_path(path) {
                let ext = extension(path).unwrap_or_default();
                return driver.materialize(&master, ext).map(Some);
            }
        }
        Ok(None)
    }
}
