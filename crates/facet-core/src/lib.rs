//! Overlay engine for facetfs.
//!
//! This crate contains everything below the FUSE boundary: the
//! [`Driver`] capability trait and its ordered [`DriverRegistry`], the
//! [`DecodeCache`] holding materialized descriptors, the [`Overlay`]
//! resolver that maps virtual paths onto the backing store, and the
//! raw descriptor utilities in [`fd`].
//!
//! The engine knows nothing about FUSE. It answers three questions:
//!
//! - What is the real backing-store path for this virtual path?
//! - Which names should a directory entry be listed under?
//! - Give me a readable descriptor for this path, materializing and
//!   caching a converted view if no physical file exists.

pub mod cache;
pub mod driver;
pub mod fd;
pub mod overlay;

pub use cache::DecodeCache;
pub use driver::{Driver, DriverError, DriverRegistry};
pub use overlay::{OpenedFile, Overlay};
