//! FUSE dispatcher for veilfs.
//!
//! Maps the host's path-based filesystem callbacks onto the `veilfs-core`
//! facade. Each dispatch thread lazily constructs its own facade instance
//! (the AES engines are not shared across threads); all facades share the
//! same master key and backing root through the [`MountContext`].

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;

pub mod context;
pub mod dispatch;
pub mod error;

pub use context::MountContext;
pub use dispatch::VeilFs;
pub use error::ToErrno;

/// Mount a veilfs volume and block until it is unmounted.
///
/// `options` are passed through to the host FUSE library (e.g.
/// `["-o", "fsname=veilfs"]`).
pub fn mount(
    ctx: MountContext,
    mountpoint: &Path,
    threads: usize,
    options: &[&OsStr],
) -> io::Result<()> {
    let fs = VeilFs::new(Arc::new(ctx));
    fuse_mt::mount(fuse_mt::FuseMT::new(fs, threads), &mountpoint, options)
}
