//! The caching and consistency engine.
//!
//! [`Proxy`] is the process-wide context shared by every connected client:
//! the cache, the store client and the descriptor counter. Each client drives
//! its own [`FileHandler`], which owns that client's descriptor table. The
//! handler methods delegate to the free functions in the submodules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

pub mod cache;
mod close;
mod open;
mod prelude;
mod read_ops;
pub mod session;
pub mod transfer;
mod write_ops;

pub use cache::{Cache, CacheKey, CacheRootError, CachedFileRecord, ReleaseOutcome};
pub use session::{Session, SessionMode, Whence};

use crate::api_client::{OpenMode, RemoteStore};
use crate::error::{Fd, FsError};

/// First descriptor handed out. Descriptors are never reused.
pub const FIRST_FD: Fd = 100;
/// Default size of the chunks pushed to the store on close.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

pub struct Proxy<S: RemoteStore> {
    pub(crate) cache: Cache,
    pub(crate) store: S,
    next_fd: AtomicI32,
    pub(crate) upload_chunk_size: usize,
}

impl<S: RemoteStore> Proxy<S> {
    pub fn new(cache: Cache, store: S) -> Self {
        Self {
            cache,
            store,
            next_fd: AtomicI32::new(FIRST_FD),
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }

    /// Overrides the upload chunk size. Zero is treated as one byte.
    pub fn with_upload_chunk_size(mut self, size: usize) -> Self {
        self.upload_chunk_size = size.max(1);
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn allocate_fd(&self) -> Fd {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates the handler for one newly connected client.
    pub fn handler(self: &Arc<Self>) -> FileHandler<S> {
        FileHandler {
            proxy: Arc::clone(self),
            sessions: HashMap::new(),
            dirs: HashSet::new(),
        }
    }
}

/// One client's view of the proxy: its open sessions and directory
/// descriptors.
pub struct FileHandler<S: RemoteStore> {
    pub(crate) proxy: Arc<Proxy<S>>,
    pub(crate) sessions: HashMap<Fd, Session>,
    pub(crate) dirs: HashSet<Fd>,
}

impl<S: RemoteStore> FileHandler<S> {
    pub async fn open(&mut self, path: &str, mode: OpenMode) -> Result<Fd, FsError> {
        open::open(self, path, mode).await
    }

    pub async fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        close::close(self, fd).await
    }

    /// Reads into `buf`; `None` stands for a missing buffer.
    pub async fn read(&mut self, fd: Fd, buf: Option<&mut [u8]>) -> Result<usize, FsError> {
        read_ops::read(self, fd, buf).await
    }

    pub async fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize, FsError> {
        write_ops::write(self, fd, data).await
    }

    pub async fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Result<u64, FsError> {
        read_ops::lseek(self, fd, offset, whence).await
    }

    pub async fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        write_ops::unlink(self, path).await
    }

    /// Abrupt disconnect: drops every descriptor without writing anything
    /// back.
    pub async fn clientdone(&mut self) {
        close::clientdone(self).await
    }

    pub fn proxy(&self) -> &Arc<Proxy<S>> {
        &self.proxy
    }

    pub fn open_descriptors(&self) -> usize {
        self.sessions.len() + self.dirs.len()
    }

    pub fn session(&self, fd: Fd) -> Option<&Session> {
        self.sessions.get(&fd)
    }

    pub fn is_directory(&self, fd: Fd) -> bool {
        self.dirs.contains(&fd)
    }
}
