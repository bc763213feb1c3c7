//! Conversion from core errors to POSIX error codes.
//!
//! The dispatcher catches every structured failure at the callback
//! boundary and hands the host a negated errno: argument and geometry
//! violations become `EINVAL`, authentication failures become `EIO`, and
//! backing I/O keeps its original errno. An I/O error with no errno is the
//! catch-all for unexpected failures and maps to `EPERM`. No error is
//! recovered silently except the all-zero sparse-block convention inside
//! the crypt stream itself.

use std::io;

use libc::c_int;
use veilfs_core::{FsError, NameError, StreamError};

/// Conversion to a libc error code.
pub trait ToErrno {
    fn to_errno(&self) -> c_int;
}

pub fn io_error_to_errno(e: &io::Error) -> c_int {
    e.raw_os_error().unwrap_or(libc::EPERM)
}

impl ToErrno for StreamError {
    fn to_errno(&self) -> c_int {
        match self {
            StreamError::InvalidArgument { .. } => libc::EINVAL,
            StreamError::TooLong { .. } => libc::EINVAL,
            StreamError::CorruptHeader { .. } => libc::EINVAL,
            StreamError::Verification { .. } => libc::EIO,
            StreamError::Io(e) => io_error_to_errno(e),
        }
    }
}

impl ToErrno for NameError {
    fn to_errno(&self) -> c_int {
        match self {
            NameError::Encoding { .. } => libc::EIO,
            NameError::Verification { .. } => libc::EIO,
            NameError::NotUtf8 => libc::EILSEQ,
            NameError::Encryption => libc::EIO,
        }
    }
}

impl ToErrno for FsError {
    fn to_errno(&self) -> c_int {
        match self {
            FsError::Stream(e) => e.to_errno(),
            FsError::Name(e) => e.to_errno(),
            FsError::Io(e) => io_error_to_errno(e),
            FsError::InvalidPath => libc::EINVAL,
            FsError::XattrVerification { .. } => libc::EIO,
        }
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> c_int {
        io_error_to_errno(self)
    }
}
