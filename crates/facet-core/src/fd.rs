//! Raw file-descriptor utilities.
//!
//! Ownership of descriptors is expressed with [`OwnedFd`]: exclusive,
//! move-only, closed on drop, with `into_raw_fd()` as the explicit
//! release hatch. This module adds the small set of raw operations the
//! overlay needs on top: anonymous memory-backed files for staging
//! converted output, positional I/O, and a size query that serializes
//! its seek sequence process-wide.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use parking_lot::Mutex;

/// Serializes seek-based size queries. The seek cursor is shared
/// kernel state per descriptor, so seek-to-end / seek-back must be
/// atomic with respect to other threads touching the same descriptor.
static SEEK_LOCK: Mutex<()> = Mutex::new(());

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_off(ret: libc::off_t) -> io::Result<libc::off_t> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Creates an anonymous memory-backed file. The name is only a
/// debugging label under `/proc/<pid>/fd/`.
pub fn memfd(name: &str) -> io::Result<OwnedFd> {
    let cname = CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let fd = cvt(unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens a backing-store path with the caller's raw flags, as the
/// kernel handed them to the filesystem.
pub fn open_raw(path: &Path, flags: i32, mode: u32) -> io::Result<OwnedFd> {
    let cpath = cstring(path)?;
    let fd = cvt(unsafe {
        libc::open(cpath.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Positional read; does not move the descriptor's cursor.
pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
    let n = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Positional write; does not move the descriptor's cursor.
pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> io::Result<usize> {
    let n = unsafe {
        libc::pwrite(
            fd,
            buf.as_ptr().cast::<libc::c_void>(),
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Moves the descriptor's cursor and returns the resulting offset.
pub fn lseek(fd: RawFd, offset: i64, whence: i32) -> io::Result<i64> {
    cvt_off(unsafe { libc::lseek(fd, offset as libc::off_t, whence) }).map(|o| o as i64)
}

/// Resets the descriptor's cursor to offset 0.
pub fn rewind(fd: &OwnedFd) -> io::Result<()> {
    lseek(fd.as_raw_fd(), 0, libc::SEEK_SET).map(|_| ())
}

/// Returns the byte length of the descriptor's content.
///
/// Implemented as seek-to-end / seek-back under [`SEEK_LOCK`]; the
/// cursor is restored to offset 0 before returning.
pub fn fd_size(fd: RawFd) -> io::Result<u64> {
    let _guard = SEEK_LOCK.lock();
    let size = lseek(fd, 0, libc::SEEK_END)?;
    lseek(fd, 0, libc::SEEK_SET)?;
    Ok(size as u64)
}

pub fn ftruncate(fd: RawFd, size: i64) -> io::Result<()> {
    cvt(unsafe { libc::ftruncate(fd, size as libc::off_t) }).map(|_| ())
}

pub fn fsync(fd: RawFd, datasync: bool) -> io::Result<()> {
    let ret = if datasync {
        unsafe { libc::fdatasync(fd) }
    } else {
        unsafe { libc::fsync(fd) }
    };
    cvt(ret).map(|_| ())
}

/// posix_fallocate-style allocation; only plain extension (mode 0 at
/// the caller) is meaningful for this filesystem.
pub fn fallocate(fd: RawFd, offset: i64, length: i64) -> io::Result<()> {
    let err = unsafe {
        libc::posix_fallocate(fd, offset as libc::off_t, length as libc::off_t)
    };
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Kernel-side range copy between two descriptors.
pub fn copy_file_range(
    fd_in: RawFd,
    mut offset_in: i64,
    fd_out: RawFd,
    mut offset_out: i64,
    len: usize,
) -> io::Result<usize> {
    let n = unsafe {
        libc::copy_file_range(
            fd_in,
            &raw mut offset_in,
            fd_out,
            &raw mut offset_out,
            len,
            0,
        )
    };
    if n == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn memfd_roundtrip() {
        let fd = memfd("facetfs-test").unwrap();
        let raw = fd.as_raw_fd();
        assert_eq!(pwrite(raw, b"hello", 0).unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(pread(raw, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn fd_size_restores_cursor() {
        let fd = memfd("facetfs-size").unwrap();
        let raw = fd.as_raw_fd();
        pwrite(raw, b"0123456789", 0).unwrap();

        // Move the cursor somewhere nonzero first.
        lseek(raw, 4, libc::SEEK_SET).unwrap();
        assert_eq!(fd_size(raw).unwrap(), 10);
        assert_eq!(lseek(raw, 0, libc::SEEK_CUR).unwrap(), 0);
    }

    #[test]
    fn fd_size_empty() {
        let fd = memfd("facetfs-empty").unwrap();
        assert_eq!(fd_size(fd.as_raw_fd()).unwrap(), 0);
    }

    #[test]
    fn concurrent_size_queries_agree() {
        let fd = Arc::new(memfd("facetfs-race").unwrap());
        pwrite(fd.as_raw_fd(), &[7u8; 4096], 0).unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let fd = Arc::clone(&fd);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    assert_eq!(fd_size(fd.as_raw_fd()).unwrap(), 4096);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn ftruncate_changes_size() {
        let fd = memfd("facetfs-trunc").unwrap();
        let raw = fd.as_raw_fd();
        pwrite(raw, b"abcdef", 0).unwrap();
        ftruncate(raw, 3).unwrap();
        assert_eq!(fd_size(raw).unwrap(), 3);
    }

    #[test]
    fn copy_range_between_memfds() {
        let src = memfd("facetfs-cfr-src").unwrap();
        let dst = memfd("facetfs-cfr-dst").unwrap();
        pwrite(src.as_raw_fd(), b"copy me", 0).unwrap();

        let n = copy_file_range(src.as_raw_fd(), 0, dst.as_raw_fd(), 0, 7).unwrap();
        assert_eq!(n, 7);

        let mut buf = [0u8; 7];
        pread(dst.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf, b"copy me");
    }
}
