//! The operation dispatcher: `fuse_mt` callbacks onto the facade.
//!
//! Thin by design. Every callback translates its arguments, obtains the
//! per-thread facade, delegates, and converts structured failures into
//! negated POSIX codes. File and directory handles live in tables keyed by
//! the `u64` handles the host passes back to us.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_mt::{
    CallbackResult, CreatedEntry, DirectoryEntry, FileAttr, FileType, FilesystemMT, RequestInfo,
    ResultCreate, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice, ResultStatfs,
    ResultWrite, ResultXattr, Statfs, Xattr,
};
use libc::c_int;
use tracing::{debug, error, warn};
use veilfs_core::{DirTraverser, EntryKind, File, FileStat, FileSystem, FsError};

use crate::context::{with_facade, MountContext};
use crate::error::ToErrno;

const TTL: Duration = Duration::from_secs(1);

/// Largest read we will service in one callback.
const MAX_READ_SIZE: u32 = 1024 * 1024;

#[cfg(target_os = "macos")]
const ENOATTR: c_int = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const ENOATTR: c_int = libc::ENODATA;

/// The mounted filesystem: per-mount context plus the open-handle tables.
pub struct VeilFs {
    ctx: Arc<MountContext>,
    files: Mutex<HashMap<u64, Arc<File>>>,
    dirs: Mutex<HashMap<u64, Arc<DirTraverser>>>,
    next_fh: AtomicU64,
}

impl VeilFs {
    pub fn new(ctx: Arc<MountContext>) -> Self {
        VeilFs {
            ctx,
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn files_guard(&self) -> MutexGuard<'_, HashMap<u64, Arc<File>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dirs_guard(&self) -> MutexGuard<'_, HashMap<u64, Arc<DirTraverser>>> {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn file(&self, fh: u64) -> Result<Arc<File>, c_int> {
        self.files_guard().get(&fh).cloned().ok_or(libc::EBADF)
    }

    /// Run `op` on this thread's facade, mapping failures to errno.
    fn facade<R>(&self, op: impl FnOnce(&FileSystem) -> Result<R, FsError>) -> Result<R, c_int> {
        with_facade(&self.ctx, |fs| {
            op(fs).map_err(|e| {
                let errno = e.to_errno();
                debug!(error = %e, errno, "operation failed");
                errno
            })
        })
    }

    fn check_writable(&self) -> Result<(), c_int> {
        if self.ctx.flags.read_only {
            Err(libc::EROFS)
        } else {
            Ok(())
        }
    }

    fn register_file(&self, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.files_guard().insert(fh, Arc::new(file));
        fh
    }

    fn make_attr(&self, stat: &FileStat) -> FileAttr {
        let m = &stat.metadata;
        let at = |secs: i64, nsecs: i64| {
            UNIX_EPOCH + Duration::new(secs.max(0) as u64, nsecs.max(0) as u32)
        };
        let file_type = m.file_type();
        let kind = if file_type.is_dir() {
            FileType::Directory
        } else if file_type.is_symlink() {
            FileType::Symlink
        } else if file_type.is_fifo() {
            FileType::NamedPipe
        } else if file_type.is_char_device() {
            FileType::CharDevice
        } else if file_type.is_block_device() {
            FileType::BlockDevice
        } else if file_type.is_socket() {
            FileType::Socket
        } else {
            FileType::RegularFile
        };
        FileAttr {
            size: stat.size,
            blocks: m.blocks(),
            atime: at(m.atime(), m.atime_nsec()),
            mtime: at(m.mtime(), m.mtime_nsec()),
            ctime: at(m.ctime(), m.ctime_nsec()),
            crtime: UNIX_EPOCH,
            kind,
            perm: (m.mode() & 0o7777) as u16,
            nlink: m.nlink() as u32,
            uid: m.uid(),
            gid: m.gid(),
            rdev: m.rdev() as u32,
            flags: 0,
        }
    }

    fn getattr_path(&self, path: &Path) -> ResultEntry {
        let stat = self.facade(|fs| fs.stat(path))?.ok_or(libc::ENOENT)?;
        Ok((TTL, self.make_attr(&stat)))
    }
}

impl FilesystemMT for VeilFs {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        debug!(root = %self.ctx.root.display(), "init");
        Ok(())
    }

    fn destroy(&self) {
        debug!("destroy");
        self.files_guard().clear();
        self.dirs_guard().clear();
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        if let Some(fh) = fh {
            let file = self.file(fh)?;
            let stat = file.stat().map_err(|e| e.to_errno())?;
            return Ok((TTL, self.make_attr(&stat)));
        }
        self.getattr_path(path)
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>, mode: u32) -> ResultEmpty {
        self.check_writable()?;
        self.facade(|fs| fs.chmod(path, mode))
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        self.check_writable()?;
        self.facade(|fs| fs.chown(path, uid, gid))
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        self.check_writable()?;
        if let Some(fh) = fh {
            let file = self.file(fh)?;
            return file.resize(size).map_err(|e| e.to_errno());
        }
        let file = self.facade(|fs| fs.open(path, libc::O_RDWR, 0o644))?;
        file.resize(size).map_err(|e| e.to_errno())
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        self.check_writable()?;
        if let Some(fh) = fh {
            if let Ok(file) = self.file(fh) {
                return file.utimens(atime, mtime).map_err(|e| e.to_errno());
            }
        }
        self.facade(|fs| fs.utimens(path, atime, mtime))
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> Result<Vec<u8>, c_int> {
        let target = self.facade(|fs| fs.readlink(path))?;
        Ok(target.into_bytes())
    }

    fn mkdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        self.check_writable()?;
        let path = parent.join(name);
        self.facade(|fs| fs.mkdir(&path, mode))?;
        self.getattr_path(&path)
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        self.check_writable()?;
        let path = parent.join(name);
        self.facade(|fs| fs.unlink(&path))
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        self.check_writable()?;
        let path = parent.join(name);
        self.facade(|fs| fs.rmdir(&path))
    }

    fn symlink(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        self.check_writable()?;
        let path = parent.join(name);
        let target = target.to_str().ok_or(libc::EILSEQ)?;
        self.facade(|fs| fs.symlink(target, &path))?;
        self.getattr_path(&path)
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        self.check_writable()?;
        let from = parent.join(name);
        let to = newparent.join(newname);
        self.facade(|fs| fs.rename(&from, &to))
    }

    fn link(
        &self,
        _req: RequestInfo,
        path: &Path,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEntry {
        self.check_writable()?;
        let dest = newparent.join(newname);
        self.facade(|fs| fs.link(path, &dest))?;
        self.getattr_path(&dest)
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        let flags = flags as i32;
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0 {
            self.check_writable()?;
        }
        let file = self.facade(|fs| fs.open(path, flags, 0o644))?;
        Ok((self.register_file(file), flags as u32))
    }

    fn read(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        let file = match self.file(fh) {
            Ok(f) => f,
            Err(e) => return callback(Err(e)),
        };
        let size = size.min(MAX_READ_SIZE) as usize;
        let mut buf = vec![0u8; size];
        match file.read(&mut buf, offset) {
            Ok(n) => callback(Ok(&buf[..n])),
            Err(e) => {
                error!(path = %path.display(), offset, size, error = %e, "read failed");
                callback(Err(e.to_errno()))
            }
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        self.check_writable()?;
        let file = self.file(fh)?;
        file.write(&data, offset).map_err(|e| {
            error!(path = %path.display(), offset, len = data.len(), error = %e, "write failed");
            e.to_errno()
        })?;
        Ok(data.len() as u32)
    }

    fn flush(&self, _req: RequestInfo, _path: &Path, fh: u64, _lock_owner: u64) -> ResultEmpty {
        let file = self.file(fh)?;
        file.flush().map_err(|e| e.to_errno())
    }

    fn release(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        self.files_guard().remove(&fh);
        Ok(())
    }

    fn fsync(&self, _req: RequestInfo, _path: &Path, fh: u64, _datasync: bool) -> ResultEmpty {
        let file = self.file(fh)?;
        file.fsync().map_err(|e| e.to_errno())
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        let traverser = self.facade(|fs| fs.opendir(path))?;
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.dirs_guard().insert(fh, Arc::new(traverser));
        Ok((fh, flags))
    }

    fn readdir(&self, _req: RequestInfo, _path: &Path, fh: u64) -> ResultReaddir {
        let traverser = self.dirs_guard().get(&fh).cloned().ok_or(libc::EBADF)?;
        let entries = self.facade(|fs| fs.list_dir(&traverser))?;

        let mut result = Vec::with_capacity(entries.len() + 2);
        result.push(DirectoryEntry { name: ".".into(), kind: FileType::Directory });
        result.push(DirectoryEntry { name: "..".into(), kind: FileType::Directory });
        for entry in entries {
            let kind = match entry.kind {
                EntryKind::Directory => FileType::Directory,
                EntryKind::Symlink => FileType::Symlink,
                EntryKind::File | EntryKind::Other => FileType::RegularFile,
            };
            result.push(DirectoryEntry { name: entry.name.into(), kind });
        }
        Ok(result)
    }

    fn releasedir(&self, _req: RequestInfo, _path: &Path, fh: u64, _flags: u32) -> ResultEmpty {
        self.dirs_guard().remove(&fh);
        Ok(())
    }

    fn statfs(&self, _req: RequestInfo, _path: &Path) -> ResultStatfs {
        let stat = self.facade(|fs| fs.statvfs())?;
        Ok(Statfs {
            blocks: stat.blocks,
            bfree: stat.blocks_free,
            bavail: stat.blocks_available,
            files: stat.files,
            ffree: stat.files_free,
            bsize: stat.block_size as u32,
            namelen: stat.name_max as u32,
            frsize: stat.fragment_size as u32,
        })
    }

    fn setxattr(
        &self,
        _req: RequestInfo,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        position: u32,
    ) -> ResultEmpty {
        if position != 0 {
            return Err(libc::EINVAL);
        }
        // Host quirks: macOS insists on writing these two attributes and
        // misbehaves unless we pretend accordingly.
        if name == "com.apple.quarantine" {
            return Ok(());
        }
        if name == "com.apple.FinderInfo" {
            return Err(libc::EACCES);
        }
        self.check_writable()?;
        self.facade(|fs| fs.setxattr(path, name, value, flags as i32))
    }

    fn getxattr(&self, _req: RequestInfo, path: &Path, name: &OsStr, size: u32) -> ResultXattr {
        if name == "com.apple.quarantine" || name == "com.apple.FinderInfo" {
            return Err(ENOATTR);
        }
        if size == 0 {
            let len = self.facade(|fs| fs.getxattr_len(path, name))?;
            return Ok(Xattr::Size(len as u32));
        }
        let value = self.facade(|fs| fs.getxattr(path, name))?;
        if value.len() > size as usize {
            return Err(libc::ERANGE);
        }
        Ok(Xattr::Data(value))
    }

    fn listxattr(&self, _req: RequestInfo, path: &Path, size: u32) -> ResultXattr {
        let names = self.facade(|fs| fs.listxattr(path))?;
        let mut data = Vec::new();
        for name in names {
            data.extend_from_slice(name.as_encoded_bytes());
            data.push(0);
        }
        if size == 0 {
            return Ok(Xattr::Size(data.len() as u32));
        }
        if data.len() > size as usize {
            return Err(libc::ERANGE);
        }
        Ok(Xattr::Data(data))
    }

    fn removexattr(&self, _req: RequestInfo, path: &Path, name: &OsStr) -> ResultEmpty {
        self.check_writable()?;
        self.facade(|fs| fs.removexattr(path, name))
    }

    fn create(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> ResultCreate {
        self.check_writable()?;
        let path = parent.join(name);
        let file = self.facade(|fs| fs.create(&path, mode))?;
        let stat = file.stat().map_err(|e| {
            warn!(path = %path.display(), error = %e, "fstat after create failed");
            e.to_errno()
        })?;
        let attr = self.make_attr(&stat);
        Ok(CreatedEntry {
            ttl: TTL,
            attr,
            fh: self.register_file(file),
            flags,
        })
    }
}
