//! Conversion from backing-store stat metadata to FUSE attributes.

use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};

/// Block size reported in filesystem statistics.
pub const BLOCK_SIZE: u32 = 4096;

/// lstat on a backing-store path.
pub fn lstat(path: &Path) -> io::Result<libc::stat> {
    nix::sys::stat::lstat(path).map_err(io::Error::from)
}

/// Builds a FUSE attribute record from raw stat data.
///
/// `size_override` substitutes the reported size; phantom files report
/// their converted length while keeping the master's other metadata.
pub fn file_attr(ino: u64, st: &libc::stat, size_override: Option<u64>) -> FileAttr {
    let size = size_override.unwrap_or(st.st_size as u64);
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: timestamp(st.st_atime, st.st_atime_nsec),
        mtime: timestamp(st.st_mtime, st.st_mtime_nsec),
        ctime: timestamp(st.st_ctime, st.st_ctime_nsec),
        crtime: timestamp(st.st_ctime, st.st_ctime_nsec),
        kind: file_type(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

pub fn file_type(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn timestamp(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_maps_regular_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        std::fs::write(&path, b"12345").unwrap();

        let st = lstat(&path).unwrap();
        let attr = file_attr(42, &st, None);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
    }

    #[test]
    fn size_override_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        std::fs::write(&path, b"12345").unwrap();

        let st = lstat(&path).unwrap();
        let attr = file_attr(42, &st, Some(9000));
        assert_eq!(attr.size, 9000);
        assert_eq!(attr.blocks, 9000u64.div_ceil(512));
    }

    #[test]
    fn directories_map_as_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let st = lstat(tmp.path()).unwrap();
        assert_eq!(file_attr(1, &st, None).kind, FileType::Directory);
    }

    #[test]
    fn missing_path_is_enoent() {
        let err = lstat(Path::new("/no/such/path")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
