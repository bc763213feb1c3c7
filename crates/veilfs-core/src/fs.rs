//! Filesystem facade.
//!
//! [`FileSystem`] holds the three subkeys, the backing root, and the mount
//! geometry, and exposes path-level operations by composing the name codec
//! with the host OS primitives. Regular file I/O goes through [`File`]
//! handles, each of which owns one AEAD crypt stream behind a mutex.
//!
//! The facade is intentionally cheap to construct: the dispatcher builds
//! one instance per callback thread.

use std::ffi::{CString, OsStr};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use aead::Payload;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use tracing::{debug, instrument, trace};
use zeroize::Zeroizing;

use crate::block::BlockStream;
use crate::crypt::{logical_size, AesGcmCryptStream, MAC_SIZE};
use crate::error::{FsError, NameError};
use crate::keys::{MasterKey, KEY_SIZE};
use crate::name::NameCodec;
use crate::os::{self, OsFileStream, Stream};

/// Nonce size for encrypted xattr values.
const XATTR_NONCE_SIZE: usize = 12;

/// Mount-wide behavior flags.
#[derive(Debug, Clone, Copy)]
pub struct MountFlags {
    /// Reject all mutating operations.
    pub read_only: bool,
    /// Verify block MACs on read. Off only for forensic mounts.
    pub verify: bool,
}

impl Default for MountFlags {
    fn default() -> Self {
        MountFlags { read_only: false, verify: true }
    }
}

/// Backing metadata with the logical (plaintext) size substituted in.
pub struct FileStat {
    pub metadata: fs::Metadata,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One decrypted directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Directory-iteration state: pins the translated backing directory for an
/// opendir/releasedir lifecycle. Listing re-reads the directory, which
/// gives every readdir call rewind semantics.
pub struct DirTraverser {
    real_path: PathBuf,
}

/// Filesystem statistics with `f_namemax` rewritten for name expansion.
#[derive(Debug, Clone, Copy)]
pub struct VfsStat {
    pub block_size: u64,
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u64,
}

/// An open regular file: an AEAD crypt stream behind a mutex.
///
/// All I/O on a handle serializes through the mutex; independent handles to
/// the same path race only at the backing filesystem, as the host's
/// semantics dictate. Handles are exclusively owned by the opener and are
/// not interned across opens.
pub struct File {
    stream: Mutex<AesGcmCryptStream<OsFileStream>>,
}

impl File {
    fn new(stream: AesGcmCryptStream<OsFileStream>) -> Self {
        File { stream: Mutex::new(stream) }
    }

    fn guard(&self) -> MutexGuard<'_, AesGcmCryptStream<OsFileStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        Ok(self.guard().read(buf, offset)?)
    }

    pub fn write(&self, data: &[u8], offset: u64) -> Result<(), FsError> {
        Ok(self.guard().write(data, offset)?)
    }

    pub fn resize(&self, new_size: u64) -> Result<(), FsError> {
        Ok(self.guard().resize(new_size)?)
    }

    pub fn size(&self) -> Result<u64, FsError> {
        Ok(self.guard().size()?)
    }

    pub fn flush(&self) -> Result<(), FsError> {
        Ok(self.guard().flush()?)
    }

    pub fn fsync(&self) -> Result<(), FsError> {
        let mut guard = self.guard();
        guard.flush()?;
        guard.inner().fsync()?;
        Ok(())
    }

    pub fn utimens(
        &self,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), FsError> {
        Ok(self.guard().inner().utimens(atime, mtime)?)
    }

    /// fstat with the logical size substituted in.
    pub fn stat(&self) -> Result<FileStat, FsError> {
        let guard = self.guard();
        let metadata = guard.inner().metadata()?;
        let size = guard.size()?;
        Ok(FileStat { metadata, size })
    }
}

/// The stateful facade over one backing directory.
pub struct FileSystem {
    root: PathBuf,
    names: NameCodec,
    content_key: Zeroizing<[u8; KEY_SIZE]>,
    xattr_key: Zeroizing<[u8; KEY_SIZE]>,
    block_size: usize,
    iv_size: usize,
    flags: MountFlags,
}

impl FileSystem {
    pub fn new(
        root: impl Into<PathBuf>,
        master_key: &MasterKey,
        block_size: usize,
        iv_size: usize,
        flags: MountFlags,
    ) -> Self {
        FileSystem {
            root: root.into(),
            names: NameCodec::new(master_key.name_key()),
            content_key: Zeroizing::new(*master_key.content_key()),
            xattr_key: Zeroizing::new(*master_key.xattr_key()),
            block_size,
            iv_size,
            flags,
        }
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    /// Map a plaintext path from the mounted view to its backing path.
    fn translate_path(&self, path: &Path) -> Result<PathBuf, FsError> {
        let mut real = self.root.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => {
                    let name = name.to_str().ok_or(NameError::NotUtf8)?;
                    real.push(self.names.encrypt_component(name)?);
                }
                _ => return Err(FsError::InvalidPath),
            }
        }
        Ok(real)
    }

    fn rewrite_size(&self, real: &Path, metadata: &fs::Metadata) -> Result<u64, FsError> {
        if metadata.is_file() {
            Ok(logical_size(metadata.len(), self.block_size, self.iv_size))
        } else if metadata.file_type().is_symlink() {
            // The stored target is encrypted; report the plaintext length.
            let target = fs::read_link(real)?;
            let target = target.to_str().ok_or(NameError::NotUtf8)?;
            Ok(self.names.decrypt_path(target)?.len() as u64)
        } else {
            Ok(metadata.len())
        }
    }

    /// stat by path. `Ok(None)` means the file does not exist.
    #[instrument(level = "trace", skip(self))]
    pub fn stat(&self, path: &Path) -> Result<Option<FileStat>, FsError> {
        let real = self.translate_path(path)?;
        let metadata = match fs::symlink_metadata(&real) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size = self.rewrite_size(&real, &metadata)?;
        Ok(Some(FileStat { metadata, size }))
    }

    /// Open or create a file. `flags` are host open(2) flags; `O_TRUNC` is
    /// stripped from the backing open and applied as a logical resize so
    /// the file header survives truncation.
    #[instrument(level = "debug", skip(self, mode))]
    pub fn open(&self, path: &Path, flags: i32, mode: u32) -> Result<File, FsError> {
        let real = self.translate_path(path)?;

        let mut options = fs::OpenOptions::new();
        options.read(true);
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            options.write(true);
        }
        if flags & libc::O_CREAT != 0 {
            options.create(true);
            options.mode(mode);
        }
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        }

        let backing = options.open(&real)?;
        let stream = AesGcmCryptStream::new(
            OsFileStream::new(backing),
            &self.content_key,
            self.block_size,
            self.iv_size,
            self.flags.verify,
        )?;
        let file = File::new(stream);
        if flags & libc::O_TRUNC != 0 {
            file.resize(0)?;
        }
        Ok(file)
    }

    /// Create a new file, failing if it already exists.
    pub fn create(&self, path: &Path, mode: u32) -> Result<File, FsError> {
        self.open(path, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, mode)
    }

    pub fn unlink(&self, path: &Path) -> Result<(), FsError> {
        let real = self.translate_path(path)?;
        Ok(fs::remove_file(real)?)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        let real = self.translate_path(path)?;
        fs::DirBuilder::new().mode(mode).create(real)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<(), FsError> {
        let real = self.translate_path(path)?;
        Ok(fs::remove_dir(real)?)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        let real = self.translate_path(path)?;
        Ok(fs::set_permissions(real, fs::Permissions::from_mode(mode))?)
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), FsError> {
        let real = self.translate_path(path)?;
        Ok(os::lchown(&real, uid, gid)?)
    }

    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), FsError> {
        let real = self.translate_path(path)?;
        Ok(os::utimens(&real, atime, mtime)?)
    }

    /// Rename; atomicity is whatever the backing filesystem provides.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let real_from = self.translate_path(from)?;
        let real_to = self.translate_path(to)?;
        Ok(fs::rename(real_from, real_to)?)
    }

    pub fn link(&self, source: &Path, dest: &Path) -> Result<(), FsError> {
        let real_source = self.translate_path(source)?;
        let real_dest = self.translate_path(dest)?;
        Ok(fs::hard_link(real_source, real_dest)?)
    }

    /// Create a symlink. The target is itself a path in the encrypted view,
    /// so its components are encrypted before being stored.
    pub fn symlink(&self, target: &str, link: &Path) -> Result<(), FsError> {
        let real_link = self.translate_path(link)?;
        let encrypted_target = self.names.encrypt_path(target)?;
        Ok(std::os::unix::fs::symlink(Path::new(&encrypted_target), real_link)?)
    }

    pub fn readlink(&self, path: &Path) -> Result<String, FsError> {
        let real = self.translate_path(path)?;
        let target = fs::read_link(real)?;
        let target = target.to_str().ok_or(NameError::NotUtf8)?;
        Ok(self.names.decrypt_path(target)?)
    }

    /// Filesystem statistics, with the name limit shrunk to what survives
    /// base32 expansion plus the 16-byte synthesized IV.
    pub fn statvfs(&self) -> Result<VfsStat, FsError> {
        let st = os::statvfs(&self.root)?;
        Ok(VfsStat {
            block_size: st.f_bsize as u64,
            fragment_size: st.f_frsize as u64,
            blocks: st.f_blocks as u64,
            blocks_free: st.f_bfree as u64,
            blocks_available: st.f_bavail as u64,
            files: st.f_files as u64,
            files_free: st.f_ffree as u64,
            name_max: (st.f_namemax as u64) * 5 / 8 - 16,
        })
    }

    pub fn opendir(&self, path: &Path) -> Result<DirTraverser, FsError> {
        let real = self.translate_path(path)?;
        // Surface ENOENT/ENOTDIR at opendir time.
        fs::read_dir(&real)?;
        Ok(DirTraverser { real_path: real })
    }

    /// List a directory through its traverser. Backing entries that do not
    /// decode are not part of the encrypted view and are skipped.
    pub fn list_dir(&self, traverser: &DirTraverser) -> Result<Vec<DirEntry>, FsError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&traverser.real_path)? {
            let entry = entry?;
            let backing_name = entry.file_name();
            let Some(backing_name) = backing_name.to_str() else {
                continue;
            };
            let name = match self.names.decrypt_component(backing_name) {
                Ok(name) => name,
                Err(e) => {
                    trace!(entry = backing_name, error = %e, "skipping undecodable entry");
                    continue;
                }
            };
            let metadata = entry.metadata()?;
            let kind = if metadata.is_dir() {
                EntryKind::Directory
            } else if metadata.file_type().is_symlink() {
                EntryKind::Symlink
            } else if metadata.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            let size = if kind == EntryKind::File {
                logical_size(metadata.len(), self.block_size, self.iv_size)
            } else {
                metadata.len()
            };
            entries.push(DirEntry { name, kind, size });
        }
        Ok(entries)
    }

    fn xattr_cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&*self.xattr_key).into())
    }

    fn xattr_name(name: &OsStr) -> Result<CString, FsError> {
        CString::new(name.as_bytes()).map_err(|_| FsError::InvalidPath)
    }

    /// Extended attribute names pass through unencrypted.
    pub fn listxattr(&self, path: &Path) -> Result<Vec<std::ffi::OsString>, FsError> {
        let real = self.translate_path(path)?;
        Ok(os::list_xattr(&real)?)
    }

    /// The plaintext length of an attribute value, for size probes.
    pub fn getxattr_len(&self, path: &Path, name: &OsStr) -> Result<u64, FsError> {
        let real = self.translate_path(path)?;
        let stored = os::get_xattr_len(&real, &Self::xattr_name(name)?)?;
        let overhead = XATTR_NONCE_SIZE + MAC_SIZE;
        if stored < overhead {
            return Err(FsError::XattrVerification { name: name.to_string_lossy().into_owned() });
        }
        Ok((stored - overhead) as u64)
    }

    /// Read and decrypt an attribute value. The attribute name is bound as
    /// associated data, so values cannot be transplanted between names.
    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>, FsError> {
        let real = self.translate_path(path)?;
        let stored = os::get_xattr(&real, &Self::xattr_name(name)?)?;
        if stored.len() < XATTR_NONCE_SIZE + MAC_SIZE {
            return Err(FsError::XattrVerification { name: name.to_string_lossy().into_owned() });
        }
        let payload = Payload {
            msg: &stored[XATTR_NONCE_SIZE..],
            aad: name.as_bytes(),
        };
        self.xattr_cipher()
            .decrypt(Nonce::from_slice(&stored[..XATTR_NONCE_SIZE]), payload)
            .map_err(|_| FsError::XattrVerification { name: name.to_string_lossy().into_owned() })
    }

    /// Encrypt and store an attribute value.
    pub fn setxattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        let real = self.translate_path(path)?;
        let mut nonce = [0u8; XATTR_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let payload = Payload { msg: value, aad: name.as_bytes() };
        let sealed = self
            .xattr_cipher()
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| FsError::XattrVerification { name: name.to_string_lossy().into_owned() })?;

        let mut stored = Vec::with_capacity(XATTR_NONCE_SIZE + sealed.len());
        stored.extend_from_slice(&nonce);
        stored.extend_from_slice(&sealed);
        debug!(path = %path.display(), stored_len = stored.len(), "setting xattr");
        Ok(os::set_xattr(&real, &Self::xattr_name(name)?, &stored, flags)?)
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<(), FsError> {
        let real = self.translate_path(path)?;
        Ok(os::remove_xattr(&real, &Self::xattr_name(name)?)?)
    }
}
