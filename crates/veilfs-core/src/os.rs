//! OS primitives adapter.
//!
//! A thin abstraction over the host's file calls: [`Stream`] provides
//! positional read/write/resize on a backing file, [`OsFileStream`] is the
//! real implementation over `std::fs::File`, and [`MemoryStream`] is an
//! in-memory stand-in used by the test suites. The syscall wrappers at the
//! bottom cover the handful of operations `std` does not expose
//! (statvfs, lchown, utimens, extended attributes).

use std::ffi::{CStr, CString, OsString};
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// Positional I/O on a backing file.
///
/// Offsets are absolute; no cursor is involved. `read` returns the number
/// of bytes actually read and only returns short on end of file.
pub trait Stream: Send + Sync {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn resize(&self, new_size: u64) -> io::Result<()>;
    fn size(&self) -> io::Result<u64>;
    fn flush(&self) -> io::Result<()>;
    fn fsync(&self) -> io::Result<()>;

    /// Whether the backing store punches holes for unwritten regions.
    fn is_sparse(&self) -> bool {
        false
    }
}

impl<T: Stream + ?Sized> Stream for &T {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read(buf, offset)
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        (**self).write(buf, offset)
    }

    fn resize(&self, new_size: u64) -> io::Result<()> {
        (**self).resize(new_size)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }

    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }

    fn fsync(&self) -> io::Result<()> {
        (**self).fsync()
    }

    fn is_sparse(&self) -> bool {
        (**self).is_sparse()
    }
}

/// A [`Stream`] over an open OS file descriptor.
pub struct OsFileStream {
    file: fs::File,
}

impl OsFileStream {
    pub fn new(file: fs::File) -> Self {
        OsFileStream { file }
    }

    pub fn metadata(&self) -> io::Result<fs::Metadata> {
        self.file.metadata()
    }

    /// Set access and modification times on the open descriptor.
    pub fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
        let times = [to_timespec(atime), to_timespec(mtime)];
        check_libc(unsafe { libc::futimens(self.file.as_raw_fd(), times.as_ptr()) })
    }
}

impl Stream for OsFileStream {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        // pread may return short on signals or pipes; loop until the buffer
        // is full or end of file.
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn resize(&self, new_size: u64) -> io::Result<()> {
        self.file.set_len(new_size)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&self) -> io::Result<()> {
        // No userspace buffering on positional writes.
        Ok(())
    }

    fn fsync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn is_sparse(&self) -> bool {
        true
    }
}

/// An in-memory [`Stream`].
///
/// Reads past the end are short; writes past the end zero-fill the gap,
/// which mirrors how a sparse backing file behaves.
#[derive(Default)]
pub struct MemoryStream {
    data: Mutex<Vec<u8>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the raw backing bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.guard().clone()
    }

    /// Overwrite the raw backing bytes (corruption injection in tests).
    pub fn set_contents(&self, data: Vec<u8>) {
        *self.guard() = data;
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Stream for MemoryStream {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.guard();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.guard();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn resize(&self, new_size: u64) -> io::Result<()> {
        self.guard().resize(new_size as usize, 0);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.guard().len() as u64)
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn fsync(&self) -> io::Result<()> {
        Ok(())
    }

    fn is_sparse(&self) -> bool {
        true
    }
}

fn check_libc(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn to_timespec(t: Option<SystemTime>) -> libc::timespec {
    match t.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok()) {
        Some(d) => libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

/// statvfs(3) on the given path.
pub fn statvfs(path: &Path) -> io::Result<libc::statvfs> {
    let c = c_path(path)?;
    let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
    check_libc(unsafe { libc::statvfs(c.as_ptr(), &mut out) })?;
    Ok(out)
}

/// lchown(2); `None` leaves the respective id unchanged.
pub fn lchown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    let c = c_path(path)?;
    check_libc(unsafe {
        libc::lchown(c.as_ptr(), uid.unwrap_or(u32::MAX), gid.unwrap_or(u32::MAX))
    })
}

/// utimensat(2) without following symlinks.
pub fn utimens(path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
    let c = c_path(path)?;
    let times = [to_timespec(atime), to_timespec(mtime)];
    check_libc(unsafe {
        libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW)
    })
}

#[cfg(target_os = "linux")]
mod sys_xattr {
    use super::*;

    pub unsafe fn get(
        path: *const libc::c_char,
        name: *const libc::c_char,
        value: *mut libc::c_void,
        size: libc::size_t,
    ) -> libc::ssize_t {
        libc::lgetxattr(path, name, value, size)
    }

    pub unsafe fn set(
        path: *const libc::c_char,
        name: *const libc::c_char,
        value: *const libc::c_void,
        size: libc::size_t,
        flags: libc::c_int,
    ) -> libc::c_int {
        libc::lsetxattr(path, name, value, size, flags)
    }

    pub unsafe fn list(
        path: *const libc::c_char,
        list: *mut libc::c_char,
        size: libc::size_t,
    ) -> libc::ssize_t {
        libc::llistxattr(path, list, size)
    }

    pub unsafe fn remove(path: *const libc::c_char, name: *const libc::c_char) -> libc::c_int {
        libc::lremovexattr(path, name)
    }
}

#[cfg(target_os = "macos")]
mod sys_xattr {
    use super::*;

    pub unsafe fn get(
        path: *const libc::c_char,
        name: *const libc::c_char,
        value: *mut libc::c_void,
        size: libc::size_t,
    ) -> libc::ssize_t {
        libc::getxattr(path, name, value, size, 0, libc::XATTR_NOFOLLOW)
    }

    pub unsafe fn set(
        path: *const libc::c_char,
        name: *const libc::c_char,
        value: *const libc::c_void,
        size: libc::size_t,
        flags: libc::c_int,
    ) -> libc::c_int {
        libc::setxattr(path, name, value, size, 0, flags | libc::XATTR_NOFOLLOW)
    }

    pub unsafe fn list(
        path: *const libc::c_char,
        list: *mut libc::c_char,
        size: libc::size_t,
    ) -> libc::ssize_t {
        libc::listxattr(path, list, size, libc::XATTR_NOFOLLOW)
    }

    pub unsafe fn remove(path: *const libc::c_char, name: *const libc::c_char) -> libc::c_int {
        libc::removexattr(path, name, libc::XATTR_NOFOLLOW)
    }
}

fn check_ssize(rc: libc::ssize_t) -> io::Result<usize> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Read an extended attribute value, without following symlinks.
pub fn get_xattr(path: &Path, name: &CStr) -> io::Result<Vec<u8>> {
    let c = c_path(path)?;
    loop {
        let len = check_ssize(unsafe {
            sys_xattr::get(c.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
        })?;
        let mut buf = vec![0u8; len];
        let rc = unsafe {
            sys_xattr::get(c.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        };
        match check_ssize(rc) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            // The attribute grew between the two calls; retry.
            Err(e) if e.raw_os_error() == Some(libc::ERANGE) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// The stored size of an extended attribute value.
pub fn get_xattr_len(path: &Path, name: &CStr) -> io::Result<usize> {
    let c = c_path(path)?;
    check_ssize(unsafe { sys_xattr::get(c.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) })
}

/// Write an extended attribute value, without following symlinks.
pub fn set_xattr(path: &Path, name: &CStr, value: &[u8], flags: libc::c_int) -> io::Result<()> {
    let c = c_path(path)?;
    check_libc(unsafe {
        sys_xattr::set(c.as_ptr(), name.as_ptr(), value.as_ptr().cast(), value.len(), flags)
    })
}

/// List extended attribute names, without following symlinks.
pub fn list_xattr(path: &Path) -> io::Result<Vec<OsString>> {
    let c = c_path(path)?;
    loop {
        let len =
            check_ssize(unsafe { sys_xattr::list(c.as_ptr(), std::ptr::null_mut(), 0) })?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; len];
        let rc = unsafe { sys_xattr::list(c.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        match check_ssize(rc) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf
                    .split(|&b| b == 0)
                    .filter(|s| !s.is_empty())
                    .map(|s| OsString::from_vec(s.to_vec()))
                    .collect());
            }
            Err(e) if e.raw_os_error() == Some(libc::ERANGE) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Remove an extended attribute, without following symlinks.
pub fn remove_xattr(path: &Path, name: &CStr) -> io::Result<()> {
    let c = c_path(path)?;
    check_libc(unsafe { sys_xattr::remove(c.as_ptr(), name.as_ptr()) })
}
