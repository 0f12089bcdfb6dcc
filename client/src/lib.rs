//! Client-side caching proxy with open/close session consistency.
//!
//! Clients operate on whole-file copies held in a local, size-bounded cache.
//! Copies are fetched from the authoritative store on open and pushed back
//! on close.

pub mod api_client;
pub mod config;
pub mod error;
pub mod fs;
pub mod gateway;

pub use api_client::{HttpStore, OpenMode, RemoteStore};
pub use error::{Errno, Fd, FsError};
pub use fs::{Cache, FileHandler, Proxy, Whence};
