//! Error codes handed back to clients and the proxy's internal error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Integer handle returned by `open`.
pub type Fd = i32;

/// POSIX-flavoured sentinel codes. These are what crosses the client
/// boundary; the wire form is the symbolic name (`"ENOENT"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Errno {
    #[serde(rename = "EBADF")]
    BadDescriptor,
    #[serde(rename = "EISDIR")]
    IsDirectory,
    #[serde(rename = "EINVAL")]
    InvalidArgument,
    #[serde(rename = "EIO")]
    Io,
    #[serde(rename = "ENOMEM")]
    OutOfMemory,
    #[serde(rename = "EBUSY")]
    Busy,
    #[serde(rename = "EPERM")]
    PermissionDenied,
    #[serde(rename = "EEXIST")]
    AlreadyExists,
    #[serde(rename = "ENOENT")]
    NotFound,
}

impl Errno {
    /// Negative `libc` value, the way a syscall wrapper would return it.
    pub fn code(self) -> i32 {
        -match self {
            Errno::BadDescriptor => libc::EBADF,
            Errno::IsDirectory => libc::EISDIR,
            Errno::InvalidArgument => libc::EINVAL,
            Errno::Io => libc::EIO,
            Errno::OutOfMemory => libc::ENOMEM,
            Errno::Busy => libc::EBUSY,
            Errno::PermissionDenied => libc::EPERM,
            Errno::AlreadyExists => libc::EEXIST,
            Errno::NotFound => libc::ENOENT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Errno::BadDescriptor => "EBADF",
            Errno::IsDirectory => "EISDIR",
            Errno::InvalidArgument => "EINVAL",
            Errno::Io => "EIO",
            Errno::OutOfMemory => "ENOMEM",
            Errno::Busy => "EBUSY",
            Errno::PermissionDenied => "EPERM",
            Errno::AlreadyExists => "EEXIST",
            Errno::NotFound => "ENOENT",
        }
    }
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("bad file descriptor: {0}")]
    BadDescriptor(Fd),

    /// Write attempted through a descriptor opened for reading.
    #[error("descriptor {0} is not open for writing")]
    NotWritable(Fd),

    #[error("descriptor {0} refers to a directory")]
    IsDirectory(Fd),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("cache cannot make room for {0} bytes")]
    OutOfSpace(u64),

    /// The store could not be reached or refused the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an error code of its own.
    #[error("store reported {}", .0.name())]
    Store(Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    pub fn errno(&self) -> Errno {
        match self {
            FsError::BadDescriptor(_) | FsError::NotWritable(_) => Errno::BadDescriptor,
            FsError::IsDirectory(_) => Errno::IsDirectory,
            FsError::InvalidArgument(_) => Errno::InvalidArgument,
            FsError::OutOfSpace(_) => Errno::OutOfMemory,
            FsError::Unavailable(_) => Errno::Busy,
            FsError::Store(errno) => *errno,
            FsError::Io(_) => Errno::Io,
        }
    }
}

impl From<reqwest::Error> for FsError {
    fn from(err: reqwest::Error) -> Self {
        FsError::Unavailable(err.to_string())
    }
}
