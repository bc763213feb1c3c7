//! Cryptographic storage layer for veilfs.
//!
//! veilfs exposes a plaintext view of a backing directory whose file
//! contents and file names are stored encrypted at rest. This crate is the
//! storage core: the authenticated block-indexed content stream, the
//! deterministic filename codec, per-file session-key derivation from the
//! master key, and the filesystem facade that composes them with the host
//! OS's file and directory primitives.
//!
//! The host-interface dispatcher (FUSE callback table) lives in the
//! `veilfs-fuse` crate.

pub mod block;
pub mod crypt;
pub mod error;
pub mod fs;
pub mod keys;
pub mod name;
pub mod os;

pub use block::BlockStream;
pub use crypt::{AesGcmCryptStream, DEFAULT_BLOCK_SIZE, DEFAULT_IV_SIZE, HEADER_SIZE, MAC_SIZE};
pub use error::{FsError, KeyError, NameError, StreamError};
pub use fs::{DirEntry, DirTraverser, EntryKind, File, FileStat, FileSystem, MountFlags, VfsStat};
pub use keys::{MasterKey, KEY_SIZE, MASTER_KEY_SIZE};
pub use name::NameCodec;
pub use os::{MemoryStream, OsFileStream, Stream};
