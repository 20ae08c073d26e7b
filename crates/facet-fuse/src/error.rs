//! Error handling and errno mapping for the FUSE layer.
//!
//! FUSE replies carry raw libc error codes, so every error the
//! filesystem can hit needs a deterministic mapping to one.

use std::io;

use thiserror::Error;

/// Errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FuseError {
    /// IO error against the backing store or a staged descriptor.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Inode the kernel referenced is not in the table.
    #[error("invalid inode: {0}")]
    InvalidInode(u64),

    /// File handle the kernel referenced is not in the table.
    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Name the kernel passed is not valid UTF-8.
    #[error("name is not valid UTF-8")]
    InvalidName,

    /// Operation not supported on this filesystem.
    #[error("operation not supported")]
    NotSupported,
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Io(e) => io_error_to_errno(e),
            FuseError::InvalidInode(_) => libc::ENOENT,
            FuseError::InvalidHandle(_) => libc::EBADF,
            FuseError::InvalidName => libc::EINVAL,
            FuseError::NotSupported => libc::ENOTSUP,
        }
    }
}

/// Result type for FUSE operations.
pub type FuseResult<T> = Result<T, FuseError>;

/// Maps an [`io::Error`] to a libc error code.
///
/// Errors that originate in a syscall carry their errno already; the
/// rest map by kind, defaulting to `EIO`.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    if let Some(errno) = e.raw_os_error() {
        return errno;
    }
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_os_errors_pass_through() {
        let e = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(io_error_to_errno(&e), libc::ENOSPC);
    }

    #[test]
    fn kinds_map_without_raw_errno() {
        let e = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(io_error_to_errno(&e), libc::ENOENT);
        let e = io::Error::new(io::ErrorKind::Other, "opaque");
        assert_eq!(io_error_to_errno(&e), libc::EIO);
    }

    #[test]
    fn fuse_error_variants_map() {
        assert_eq!(FuseError::InvalidInode(9).to_errno(), libc::ENOENT);
        assert_eq!(FuseError::InvalidHandle(9).to_errno(), libc::EBADF);
        assert_eq!(FuseError::InvalidName.to_errno(), libc::EINVAL);
        assert_eq!(FuseError::NotSupported.to_errno(), libc::ENOTSUP);
    }
}
