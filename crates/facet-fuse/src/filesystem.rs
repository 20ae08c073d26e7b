//! FUSE filesystem implementation for the facetfs overlay.
//!
//! Every operation translates the kernel's inode into a virtual path,
//! asks the overlay how that path resolves, and passes the result
//! through to the backing store. Phantom files only exist in three
//! places: attribute queries (size override), directory listings
//! (name substitution), and open (materialization). Everything else
//! operates on literal backing-store paths, so mutations like unlink
//! and rename never chase a phantom back to its master.

use std::ffi::OsStr;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyLseek, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use tracing::{debug, info, trace};

use facet_core::{fd, OpenedFile, Overlay};

use crate::attr::{self, BLOCK_SIZE};
use crate::error::{io_error_to_errno, FuseError, FuseResult};
use crate::handles::HandleTable;
use crate::inode::{child_path, InodeTable, ROOT_INODE};

/// Kernel cache TTL. Zero, so phantom sizes never go stale.
const TTL: Duration = Duration::ZERO;

/// One directory listing entry, before `.`/`..` are prepended.
struct DirEntry {
    ino: u64,
    kind: FileType,
    name: String,
}

/// FUSE filesystem serving an [`Overlay`].
pub struct OverlayFs {
    overlay: Arc<Overlay>,
    inodes: InodeTable,
    handles: HandleTable,
}

impl OverlayFs {
    pub fn new(overlay: Overlay) -> Self {
        Self {
            overlay: Arc::new(overlay),
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
        }
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    fn vpath(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or(FuseError::InvalidInode(ino))
    }

    fn child_vpath(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let parent_path = self.vpath(parent)?;
        let name = name.to_str().ok_or(FuseError::InvalidName)?;
        Ok(child_path(&parent_path, name))
    }

    fn handle_fd(&self, fh: u64) -> FuseResult<std::os::fd::RawFd> {
        self.handles.raw_fd(fh).ok_or(FuseError::InvalidHandle(fh))
    }

    /// Attributes for a virtual path.
    ///
    /// Physical paths report their own stat data. Phantom paths borrow
    /// the master's metadata with the converted size substituted in,
    /// which forces materialization on first query.
    fn attr_for(&self, ino: u64, vpath: &str) -> FuseResult<FileAttr> {
        let real = self.overlay.join(vpath);
        match attr::lstat(&real) {
            Ok(st) => Ok(attr::file_attr(ino, &st, None)),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                let master = self.overlay.resolve(vpath);
                if master == real {
                    return Err(e.into());
                }
                let st = attr::lstat(&master)?;
                let size = self.overlay.phantom_size(vpath)?;
                Ok(attr::file_attr(ino, &st, size))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Listing for a virtual directory, with driver name substitution:
    /// master entries disappear and their phantom names take their
    /// place, inheriting the master's inode and type.
    fn directory_entries(&self, vpath: &str) -> FuseResult<Vec<DirEntry>> {
        let real_dir = self.overlay.join(vpath);
        let mut out = Vec::new();
        for dent in std::fs::read_dir(&real_dir)? {
            let dent = dent?;
            let Ok(name) = dent.file_name().into_string() else {
                continue;
            };
            let child = child_path(vpath, &name);
            if let Some(phantoms) = self.overlay.list_names(&dent.path()) {
                let master_ino = self.inodes.get_or_insert_no_lookup_inc(&child);
                for phantom in phantoms {
                    let Some(pname) = phantom.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    out.push(DirEntry {
                        ino: master_ino,
                        kind: FileType::RegularFile,
                        name: pname.to_owned(),
                    });
                }
            } else {
                let kind = dent
                    .file_type()
                    .map(|t| {
                        if t.is_dir() {
                            FileType::Directory
                        } else if t.is_symlink() {
                            FileType::Symlink
                        } else {
                            FileType::RegularFile
                        }
                    })
                    .unwrap_or(FileType::RegularFile);
                out.push(DirEntry {
                    ino: self.inodes.get_or_insert_no_lookup_inc(&child),
                    kind,
                    name,
                });
            }
        }
        Ok(out)
    }

    fn parent_ino(&self, vpath: &str) -> u64 {
        let parent = match vpath.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &vpath[..i],
        };
        self.inodes.inode_of(parent).unwrap_or(ROOT_INODE)
    }

    /// Shared tail of lookup/create/mkdir/symlink/link replies.
    fn entry_for(&self, vpath: &str) -> FuseResult<(u64, FileAttr)> {
        let ino = self.inodes.get_or_insert(vpath);
        match self.attr_for(ino, vpath) {
            Ok(a) => Ok((ino, a)),
            Err(e) => {
                self.inodes.forget(ino, 1);
                Err(e)
            }
        }
    }

    fn apply_times(
        real: &Path,
        st: &libc::stat,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> io::Result<()> {
        let resolve = |t: Option<TimeOrNow>, secs: i64, nanos: i64| match t {
            Some(TimeOrNow::SpecificTime(t)) => FileTime::from_system_time(t),
            Some(TimeOrNow::Now) => FileTime::now(),
            None => FileTime::from_unix_time(secs, nanos as u32),
        };
        filetime::set_file_times(
            real,
            resolve(atime, st.st_atime, st.st_atime_nsec),
            resolve(mtime, st.st_mtime, st.st_mtime_nsec),
        )
    }
}

impl Filesystem for OverlayFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(root = %self.overlay.root().display(), "overlay filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            cached = self.overlay.cache().len(),
            open_handles = self.handles.len(),
            "overlay filesystem shut down"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!(parent, path = %vpath, "lookup");

        if !self.overlay.exists(&vpath) {
            reply.error(libc::ENOENT);
            return;
        }
        match self.entry_for(&vpath) {
            Ok((_, a)) => reply.entry(&TTL, &a, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!(ino, path = %vpath, "getattr");
        match self.attr_for(ino, &vpath) {
            Ok(a) => reply.attr(&TTL, &a),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!(ino, path = %vpath, ?mode, ?uid, ?gid, ?size, "setattr");
        let real = self.overlay.join(&vpath);

        let result: io::Result<()> = (|| {
            if let Some(mode) = mode {
                std::fs::set_permissions(&real, std::fs::Permissions::from_mode(mode))?;
            }
            if uid.is_some() || gid.is_some() {
                nix::unistd::chown(
                    &real,
                    uid.map(nix::unistd::Uid::from_raw),
                    gid.map(nix::unistd::Gid::from_raw),
                )?;
            }
            if let Some(size) = size {
                match fh.and_then(|fh| self.handles.raw_fd(fh)) {
                    Some(raw) => fd::ftruncate(raw, size as i64)?,
                    None => {
                        let f = fd::open_raw(&real, libc::O_WRONLY, 0)?;
                        fd::ftruncate(f.as_raw_fd(), size as i64)?;
                    }
                }
            }
            if atime.is_some() || mtime.is_some() {
                let st = attr::lstat(&real)?;
                Self::apply_times(&real, &st, atime, mtime)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => match self.attr_for(ino, &vpath) {
                Ok(a) => reply.attr(&TTL, &a),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match std::fs::read_link(self.overlay.join(&vpath)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!(path = %vpath, mode, "mknod");
        let real = self.overlay.join(&vpath);
        let kind = nix::sys::stat::SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = nix::sys::stat::Mode::from_bits_truncate(mode & 0o7777);
        match nix::sys::stat::mknod(&real, kind, perm, rdev as libc::dev_t) {
            Ok(()) => match self.entry_for(&vpath) {
                Ok((_, a)) => reply.entry(&TTL, &a, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e as i32),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!(path = %vpath, "mkdir");
        let real = self.overlay.join(&vpath);
        let result = std::fs::create_dir(&real)
            .and_then(|()| std::fs::set_permissions(&real, std::fs::Permissions::from_mode(mode)));
        match result {
            Ok(()) => match self.entry_for(&vpath) {
                Ok((_, a)) => reply.entry(&TTL, &a, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!(path = %vpath, "unlink");
        match std::fs::remove_file(self.overlay.join(&vpath)) {
            Ok(()) => {
                self.overlay.invalidate(&vpath);
                reply.ok();
            }
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!(path = %vpath, "rmdir");
        match std::fs::remove_dir(self.overlay.join(&vpath)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let vpath = match self.child_vpath(parent, link_name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match std::os::unix::fs::symlink(target, self.overlay.join(&vpath)) {
            Ok(()) => match self.entry_for(&vpath) {
                Ok((_, a)) => reply.entry(&TTL, &a, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // No RENAME_NOREPLACE / RENAME_EXCHANGE support.
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let (old, new) = match (
            self.child_vpath(parent, name),
            self.child_vpath(newparent, newname),
        ) {
            (Ok(o), Ok(n)) => (o, n),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!(from = %old, to = %new, "rename");
        match std::fs::rename(self.overlay.join(&old), self.overlay.join(&new)) {
            Ok(()) => {
                self.inodes.rename(&old, &new);
                self.overlay.invalidate(&old);
                self.overlay.invalidate(&new);
                reply.ok();
            }
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (source, vpath) = match (self.vpath(ino), self.child_vpath(newparent, newname)) {
            (Ok(s), Ok(p)) => (s, p),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match std::fs::hard_link(self.overlay.join(&source), self.overlay.join(&vpath)) {
            Ok(()) => match self.entry_for(&vpath) {
                Ok((_, a)) => reply.entry(&TTL, &a, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!(ino, path = %vpath, flags, "open");
        match self.overlay.open_file(&vpath, flags, 0) {
            Ok(file) => {
                let fh = self.handles.insert(file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!(path = %vpath, "create");
        let real = self.overlay.join(&vpath);
        match fd::open_raw(&real, flags | libc::O_CREAT, mode) {
            Ok(fd) => match self.entry_for(&vpath) {
                Ok((_, a)) => {
                    let fh = self.handles.insert(OpenedFile::Owned(fd));
                    reply.created(&TTL, &a, 0, fh, 0);
                }
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(ino, fh, offset, size, "read");
        let raw = match self.handle_fd(fh) {
            Ok(raw) => raw,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let mut buf = vec![0u8; size as usize];
        match fd::pread(raw, &mut buf, offset) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(ino, fh, offset, size = data.len(), "write");
        let raw = match self.handle_fd(fh) {
            Ok(raw) => raw,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match fd::pwrite(raw, data, offset) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // Writes go straight through pwrite; nothing is buffered here.
        trace!(fh, "flush");
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(fh, "release");
        // Owned descriptors close on drop; shared ones release their
        // reference and the cached descriptor stays open for future
        // readers.
        drop(self.handles.remove(fh));
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let raw = match self.handle_fd(fh) {
            Ok(raw) => raw,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match fd::fsync(raw, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.vpath(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!(ino, path = %vpath, offset, "readdir");

        let entries = match self.directory_entries(&vpath) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let mut all = vec![
            DirEntry {
                ino,
                kind: FileType::Directory,
                name: ".".to_owned(),
            },
            DirEntry {
                ino: self.parent_ino(&vpath),
                kind: FileType::Directory,
                name: "..".to_owned(),
            },
        ];
        all.extend(entries);

        for (i, entry) in all.into_iter().enumerate().skip(offset as usize) {
            // Offset is the index of the next entry to emit.
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        match nix::sys::statvfs::statvfs(self.overlay.root()) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                BLOCK_SIZE,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as i32),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match xattr::set(self.overlay.resolve(&vpath), name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match xattr::get(self.overlay.resolve(&vpath), name) {
            Ok(Some(value)) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Ok(None) => reply.error(libc::ENODATA),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match xattr::list(self.overlay.resolve(&vpath)) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_encoded_bytes());
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32);
                } else if buf.len() <= size as usize {
                    reply.data(&buf);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match xattr::remove(self.overlay.resolve(&vpath), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let flags = nix::unistd::AccessFlags::from_bits_truncate(mask);
        match nix::unistd::access(&self.overlay.resolve(&vpath), flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        trace!(ino, fh, offset, length, mode, "fallocate");
        // Plain extension only; hole punching and friends are out.
        if mode != 0 {
            reply.error(FuseError::NotSupported.to_errno());
            return;
        }
        let raw = match self.handle_fd(fh) {
            Ok(raw) => raw,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match fd::fallocate(raw, offset, length) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        trace!(ino, fh, offset, whence, "lseek");
        let raw = match self.handle_fd(fh) {
            Ok(raw) => raw,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let size = match fd::fd_size(raw) {
            Ok(s) => s as i64,
            Err(e) => {
                reply.error(io_error_to_errno(&e));
                return;
            }
        };
        // Nothing here is sparse: data runs from 0 to EOF, the only
        // hole starts at EOF.
        let result = match whence {
            libc::SEEK_SET | libc::SEEK_CUR => Ok(offset),
            libc::SEEK_END => Ok(size + offset),
            libc::SEEK_DATA => {
                if offset < size {
                    Ok(offset)
                } else {
                    Err(libc::ENXIO)
                }
            }
            libc::SEEK_HOLE => {
                if offset < size {
                    Ok(size)
                } else {
                    Err(libc::ENXIO)
                }
            }
            _ => Err(libc::EINVAL),
        };
        match result {
            Ok(o) if o >= 0 => reply.offset(o),
            Ok(_) => reply.error(libc::EINVAL),
            Err(e) => reply.error(e),
        }
    }

    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        trace!(ino_in, ino_out, offset_in, offset_out, len, "copy_file_range");
        let (raw_in, raw_out) = match (self.handle_fd(fh_in), self.handle_fd(fh_out)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match fd::copy_file_range(raw_in, offset_in, raw_out, offset_out, len as usize) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facet_core::{Driver, DriverError, DriverRegistry};
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::path::PathBuf;

    struct UpperDriver;

    impl Driver for UpperDriver {
        fn resolve_real_path(&self, path: &Path) -> Option<PathBuf> {
            if path.extension()?.to_str()? != "up" {
                return None;
            }
            let master = path.with_extension("low");
            master.exists().then_some(master)
        }

        fn list_phantom_names(&self, path: &Path) -> Option<Vec<PathBuf>> {
            (path.extension()?.to_str()? == "low").then(|| vec![path.with_extension("up")])
        }

        fn materialize(&self, master: &Path, _ext: &str) -> Result<OwnedFd, DriverError> {
            let content = std::fs::read_to_string(master)?.to_uppercase();
            let out = fd::memfd("upper")?;
            fd::pwrite(out.as_raw_fd(), content.as_bytes(), 0)?;
            fd::rewind(&out)?;
            Ok(out)
        }
    }

    fn overlay_fs(root: &Path) -> OverlayFs {
        let registry = DriverRegistry::with_drivers(vec![Box::new(UpperDriver)]);
        OverlayFs::new(Overlay::new(root.to_path_buf(), registry))
    }

    #[test]
    fn listing_substitutes_master_names() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.low"), "hi").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "n").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let fs = overlay_fs(tmp.path());
        let mut names: Vec<(String, FileType)> = fs
            .directory_entries("/")
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            names,
            vec![
                ("a.up".to_owned(), FileType::RegularFile),
                ("notes.txt".to_owned(), FileType::RegularFile),
                ("sub".to_owned(), FileType::Directory),
            ]
        );
    }

    #[test]
    fn phantom_attr_reports_converted_size() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.low"), "hello").unwrap();

        let fs = overlay_fs(tmp.path());
        let ino = fs.inodes.get_or_insert("/a.up");
        let attr = fs.attr_for(ino, "/a.up").unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
    }

    #[test]
    fn physical_attr_is_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.low"), "hello").unwrap();

        let fs = overlay_fs(tmp.path());
        let ino = fs.inodes.get_or_insert("/a.low");
        let attr = fs.attr_for(ino, "/a.low").unwrap();
        assert_eq!(attr.size, 5);
    }

    #[test]
    fn missing_path_attr_is_enoent() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = overlay_fs(tmp.path());
        let ino = fs.inodes.get_or_insert("/gone.txt");
        let err = fs.attr_for(ino, "/gone.txt").unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn stale_references_map_to_distinct_errnos() {
        use std::os::unix::ffi::OsStrExt;

        let tmp = tempfile::tempdir().unwrap();
        let fs = overlay_fs(tmp.path());

        let err = fs.vpath(999).unwrap_err();
        assert!(matches!(err, FuseError::InvalidInode(999)));
        assert_eq!(err.to_errno(), libc::ENOENT);

        let err = fs.handle_fd(42).unwrap_err();
        assert!(matches!(err, FuseError::InvalidHandle(42)));
        assert_eq!(err.to_errno(), libc::EBADF);

        let garbled = OsStr::from_bytes(&[0x66, 0xff, 0x6f]);
        let err = fs.child_vpath(ROOT_INODE, garbled).unwrap_err();
        assert!(matches!(err, FuseError::InvalidName));
        assert_eq!(err.to_errno(), libc::EINVAL);
    }

    #[test]
    fn parent_ino_walks_up() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = overlay_fs(tmp.path());
        let dir = fs.inodes.get_or_insert("/photos");
        assert_eq!(fs.parent_ino("/photos/a.png"), dir);
        assert_eq!(fs.parent_ino("/photos"), ROOT_INODE);
        assert_eq!(fs.parent_ino("/"), ROOT_INODE);
    }
}
