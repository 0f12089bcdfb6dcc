//! Re-exports shared by the operation files (`open.rs`, `close.rs`, ...).

pub use std::sync::Arc;

pub use tracing::{debug, info, warn};

pub use crate::api_client::{FileMetadata, OpenMode, RemoteStore};
pub use crate::error::{Fd, FsError};

pub use super::cache::{CacheKey, CachedFileRecord};
pub use super::session::{Session, SessionMode, Whence};
pub use super::transfer;
pub use super::{FileHandler, Proxy};
