//! Error types for the storage core.
//!
//! Failures inside the crypt stream and block stream carry the originating
//! block, offset and length so the dispatcher can log something useful
//! before collapsing them into a POSIX error code.

use std::io;

use thiserror::Error;

/// Errors constructing a [`crate::keys::MasterKey`].
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("master key has wrong length: got {actual} bytes, expected {expected}")]
    WrongLength { actual: usize, expected: usize },
}

/// Errors from the block-based and AEAD crypt streams.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Construction-time geometry violation (block size or IV size out of
    /// range).
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The requested block index is past the maximum stream length.
    #[error("block {block} is past the maximum stream length")]
    TooLong { block: u64 },

    /// The underlying file starts with a partial header.
    #[error("corrupt file header: read {actual} bytes, expected 0 or {expected}")]
    CorruptHeader { actual: usize, expected: usize },

    /// AEAD authentication failed for a block.
    ///
    /// The ciphertext was tampered with, blocks were swapped, or the wrong
    /// key was used.
    #[error("verification failed for block {block} at underlying offset {offset} ({len} bytes)")]
    Verification { block: u64, offset: u64, len: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from the deterministic name codec.
#[derive(Debug, Error)]
pub enum NameError {
    /// The backing entry is not valid base32 for our alphabet. Directory
    /// listings drop such entries silently; they are not part of the
    /// encrypted view.
    #[error("name is not valid base32: {name:?}")]
    Encoding { name: String },

    /// SIV authentication failed: tampered name or wrong key.
    #[error("name fails authentication: {name:?}")]
    Verification { name: String },

    /// A path component or decrypted name is not valid UTF-8.
    #[error("name is not valid UTF-8")]
    NotUtf8,

    /// SIV encryption failed. Does not happen with valid keys.
    #[error("unexpected name encryption failure")]
    Encryption,
}

/// Facade-level error, aggregating the component errors.
#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The path contains components that cannot be translated (e.g. `..`).
    #[error("path contains unsupported components")]
    InvalidPath,

    /// An extended attribute value failed authentication or is too short
    /// to be one of ours.
    #[error("extended attribute {name:?} failed verification")]
    XattrVerification { name: String },
}
