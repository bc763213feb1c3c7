//! Per-mount context and per-thread facade storage.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;
use veilfs_core::crypt::{MAX_IV_SIZE, MIN_BLOCK_SIZE, MIN_IV_SIZE};
use veilfs_core::{FileSystem, FsError, MasterKey, MountFlags, StreamError};

/// Everything a callback thread needs to build its facade: the backing
/// root, the master key, and the mount geometry. Owned by the host for the
/// lifetime of the mount and shared across threads by `Arc`.
pub struct MountContext {
    pub root: PathBuf,
    pub master_key: MasterKey,
    pub block_size: usize,
    pub iv_size: usize,
    pub flags: MountFlags,
}

impl MountContext {
    /// Validate geometry up front so a bad mount fails at mount time, not
    /// on the first file operation.
    pub fn new(
        root: impl Into<PathBuf>,
        master_key: MasterKey,
        block_size: usize,
        iv_size: usize,
        flags: MountFlags,
    ) -> Result<Self, FsError> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(StreamError::InvalidArgument {
                reason: format!("block size {block_size} below minimum {MIN_BLOCK_SIZE}"),
            }
            .into());
        }
        if !(MIN_IV_SIZE..=MAX_IV_SIZE).contains(&iv_size) {
            return Err(StreamError::InvalidArgument {
                reason: format!("IV size {iv_size} out of range [{MIN_IV_SIZE}, {MAX_IV_SIZE}]"),
            }
            .into());
        }
        Ok(MountContext {
            root: root.into(),
            master_key,
            block_size,
            iv_size,
            flags,
        })
    }
}

thread_local! {
    // Keyed by context address so unit tests can host several mounts in
    // one process.
    static FACADE: RefCell<Option<(usize, Rc<FileSystem>)>> = const { RefCell::new(None) };
}

/// Run `f` with this thread's facade, constructing it on first use.
pub fn with_facade<R>(ctx: &Arc<MountContext>, f: impl FnOnce(&FileSystem) -> R) -> R {
    FACADE.with(|cell| {
        let key = Arc::as_ptr(ctx) as usize;
        let facade = {
            let mut slot = cell.borrow_mut();
            match slot.as_ref() {
                Some((cached, facade)) if *cached == key => Rc::clone(facade),
                _ => {
                    debug!(thread = ?std::thread::current().id(), "building per-thread facade");
                    let facade = Rc::new(FileSystem::new(
                        ctx.root.clone(),
                        &ctx.master_key,
                        ctx.block_size,
                        ctx.iv_size,
                        ctx.flags,
                    ));
                    *slot = Some((key, Rc::clone(&facade)));
                    facade
                }
            }
        };
        f(&facade)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_geometry() {
        let key = MasterKey::random();
        assert!(MountContext::new("/tmp", key, 16, 12, MountFlags::default()).is_err());
        let key = MasterKey::random();
        assert!(MountContext::new("/tmp", key, 4096, 64, MountFlags::default()).is_err());
        let key = MasterKey::random();
        assert!(MountContext::new("/tmp", key, 4096, 12, MountFlags::default()).is_ok());
    }

    #[test]
    fn facade_is_cached_per_thread_and_context() {
        let ctx = Arc::new(
            MountContext::new("/tmp", MasterKey::random(), 4096, 12, MountFlags::default())
                .unwrap(),
        );
        let first = with_facade(&ctx, |fs| fs as *const FileSystem as usize);
        let second = with_facade(&ctx, |fs| fs as *const FileSystem as usize);
        assert_eq!(first, second);

        let other = Arc::new(
            MountContext::new("/tmp", MasterKey::random(), 4096, 12, MountFlags::default())
                .unwrap(),
        );
        let third = with_facade(&other, |fs| fs as *const FileSystem as usize);
        assert_ne!(first, third);
    }

    #[test]
    fn facades_differ_across_threads() {
        let ctx = Arc::new(
            MountContext::new("/tmp", MasterKey::random(), 4096, 12, MountFlags::default())
                .unwrap(),
        );
        let here = with_facade(&ctx, |fs| fs as *const FileSystem as usize);
        let ctx2 = Arc::clone(&ctx);
        let there = std::thread::spawn(move || {
            with_facade(&ctx2, |fs| fs as *const FileSystem as usize)
        })
        .join()
        .unwrap();
        assert_ne!(here, there);
    }
}
