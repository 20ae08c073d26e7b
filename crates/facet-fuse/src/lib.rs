//! FUSE mount surface for facetfs.
//!
//! [`OverlayFs`] adapts the inode-addressed fuser API onto the
//! path-based overlay engine in `facet-core`: an inode table maps the
//! kernel's numbers to virtual paths, a handle table tracks open
//! descriptors, and every operation passes through to the backing
//! store with phantom files spliced in where the drivers provide them.

pub mod attr;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod mount;

pub use config::MountConfig;
pub use error::{io_error_to_errno, FuseError, FuseResult};
pub use filesystem::OverlayFs;
pub use mount::{spawn_mount, MountHandle};
