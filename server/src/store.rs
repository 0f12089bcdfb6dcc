//! The authoritative file store.
//!
//! Every logical path handed to the store is resolved against a fixed root
//! directory. Resolution is lexical first (no filesystem access), so a path
//! that climbs out of the root with `..` is rejected before anything is
//! touched; existing targets are then canonicalized to catch symlinks that
//! point outside the root.
//!
//! Uploads never touch the published file. `invalidate` opens a staging file
//! under [`STAGING_DIR`], chunks land there, and `mint_version` renames it
//! over the target. Readers see either the old bytes or the new ones.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Largest chunk served by [`Store::read_chunk`].
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Directory below the root holding in-flight uploads. Not addressable by
/// callers.
pub const STAGING_DIR: &str = ".afs_staging";

/// How the caller intends to open a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    Read,
    Write,
    Create,
    CreateNew,
}

/// Error codes reported back to the proxy inside a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Errno {
    #[serde(rename = "EISDIR")]
    IsDirectory,
    #[serde(rename = "EINVAL")]
    InvalidArgument,
    #[serde(rename = "EIO")]
    Io,
    #[serde(rename = "EPERM")]
    PermissionDenied,
    #[serde(rename = "EEXIST")]
    AlreadyExists,
    #[serde(rename = "ENOENT")]
    NotFound,
}

impl From<&io::Error> for Errno {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Errno::NotFound,
            io::ErrorKind::PermissionDenied => Errno::PermissionDenied,
            io::ErrorKind::AlreadyExists => Errno::AlreadyExists,
            _ => Errno::Io,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("path escapes the store root: {0}")]
    Escape(String),

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("root path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn errno(&self) -> Errno {
        match self {
            StoreError::Escape(_) => Errno::PermissionDenied,
            StoreError::NotFound(_) => Errno::NotFound,
            StoreError::NotADirectory(_) => Errno::Io,
            StoreError::Io(err) => Errno::from(err),
        }
    }
}

/// Answer to a metadata request. `error` is set instead of failing the call,
/// the other fields are only meaningful when it is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub error: Option<Errno>,
    pub is_dir: bool,
    pub size: u64,
    pub last_modified: i64,
    pub normalized_path: String,
}

impl FileMetadata {
    fn failed(errno: Errno) -> Self {
        Self {
            error: Some(errno),
            is_dir: false,
            size: 0,
            last_modified: -1,
            normalized_path: String::new(),
        }
    }
}

/// A bounded byte range of a stored file. `size == -1` marks end of file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub size: i64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn end_of_file(offset: u64) -> Self {
        Self { offset, size: -1, data: Vec::new() }
    }

    pub fn is_end(&self) -> bool {
        self.size < 0
    }
}

/// A logical path after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Absolute location below the root.
    pub absolute: PathBuf,
    /// Root-relative, `/`-separated form handed back to callers.
    pub normalized: String,
}

pub struct Store {
    root: PathBuf,
    /// Last version handed out per absolute path. Versions never go backwards.
    versions: Mutex<HashMap<PathBuf, i64>>,
}

impl Store {
    /// Opens a store rooted at an existing directory.
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        let root = fs::canonicalize(root).await?;
        if !fs::metadata(&root).await?.is_dir() {
            return Err(StoreError::NotADirectory(root));
        }
        fs::create_dir_all(root.join(STAGING_DIR)).await?;

        Ok(Self {
            root,
            versions: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically resolves `path` against the root without touching the
    /// filesystem.
    pub fn resolve(&self, path: &str) -> Result<Resolved, StoreError> {
        let mut normalized = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(StoreError::Escape(path.to_owned()));
                    }
                }
                Component::Prefix(_) => return Err(StoreError::Escape(path.to_owned())),
            }
        }
        if normalized.starts_with(STAGING_DIR) {
            return Err(StoreError::Escape(path.to_owned()));
        }

        Ok(Resolved {
            absolute: self.root.join(&normalized),
            normalized: normalized.to_string_lossy().into_owned(),
        })
    }

    /// Resolves `path` and checks that whatever already exists on disk for it
    /// stays inside the root once symlinks are followed.
    pub async fn locate(&self, path: &str) -> Result<Resolved, StoreError> {
        let resolved = self.resolve(path)?;

        let existing = match fs::canonicalize(&resolved.absolute).await {
            Ok(real) => Some(real),
            Err(err) if err.kind() == io::ErrorKind::NotFound => match resolved.absolute.parent() {
                Some(parent) => fs::canonicalize(parent).await.ok(),
                None => None,
            },
            Err(err) => return Err(err.into()),
        };

        if let Some(real) = existing {
            if !real.starts_with(&self.root) {
                tracing::warn!(path, real = %real.display(), "path violation detected");
                return Err(StoreError::Escape(path.to_owned()));
            }
        }

        Ok(resolved)
    }

    /// Validates `path` for `mode` and describes it.
    ///
    /// Store-side failures are folded into [`FileMetadata::error`]; the call
    /// itself never fails.
    pub async fn metadata(&self, path: &str, mode: OpenMode) -> FileMetadata {
        match self.inspect(path, mode).await {
            Ok(meta) => meta,
            Err(errno) => {
                tracing::debug!(path, ?mode, ?errno, "metadata request rejected");
                FileMetadata::failed(errno)
            }
        }
    }

    async fn inspect(&self, path: &str, mode: OpenMode) -> Result<FileMetadata, Errno> {
        let resolved = self.locate(path).await.map_err(|e| e.errno())?;
        let target = &resolved.absolute;
        let existing = fs::metadata(target).await.ok();

        if let Some(meta) = &existing {
            if meta.is_dir() {
                if mode != OpenMode::Read {
                    return Err(Errno::IsDirectory);
                }
                return Ok(FileMetadata {
                    error: None,
                    is_dir: true,
                    size: 0,
                    last_modified: mtime_millis(meta),
                    normalized_path: resolved.normalized,
                });
            }
        }

        match mode {
            OpenMode::CreateNew => {
                if existing.is_some() {
                    return Err(Errno::AlreadyExists);
                }
                create_file(target, true).await?;
            }
            OpenMode::Create => {
                if existing.is_some() {
                    check_access(target, true).await?;
                } else {
                    create_file(target, false).await?;
                }
            }
            OpenMode::Read => {
                if existing.is_none() {
                    return Err(Errno::NotFound);
                }
                check_access(target, false).await?;
            }
            OpenMode::Write => {
                if existing.is_none() {
                    return Err(Errno::NotFound);
                }
                check_access(target, true).await?;
            }
        }

        let meta = fs::metadata(target).await.map_err(|e| Errno::from(&e))?;
        let version = self.observe_version(target, mtime_millis(&meta));
        tracing::debug!(path = %resolved.normalized, size = meta.len(), version, "metadata served");

        Ok(FileMetadata {
            error: None,
            is_dir: false,
            size: meta.len(),
            last_modified: version,
            normalized_path: resolved.normalized,
        })
    }

    /// Reads at most [`MAX_CHUNK_SIZE`] bytes starting at `offset`.
    pub async fn read_chunk(&self, path: &str, offset: u64) -> Result<Chunk, StoreError> {
        let resolved = self.locate(path).await?;
        let mut file = match fs::File::open(&resolved.absolute).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(resolved.normalized));
            }
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata().await?.len();
        if offset >= len {
            return Ok(Chunk::end_of_file(offset));
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut data = Vec::with_capacity(MAX_CHUNK_SIZE.min((len - offset) as usize));
        file.take(MAX_CHUNK_SIZE as u64).read_to_end(&mut data).await?;

        Ok(Chunk {
            offset,
            size: data.len() as i64,
            data,
        })
    }

    /// Writes `data` at `offset` of the pending upload for `path`.
    pub async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let resolved = self.locate(path).await?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.staging_path(&resolved))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Starts a fresh upload for `path`, dropping any earlier unpublished
    /// chunks. The published content stays untouched until
    /// [`Store::mint_version`].
    pub async fn invalidate(&self, path: &str) -> Result<(), StoreError> {
        let resolved = self.locate(path).await?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.staging_path(&resolved))
            .await?;
        tracing::debug!(path = %resolved.normalized, "upload staged");
        Ok(())
    }

    /// Publishes the pending upload of `path`, if any, and stamps it with a
    /// version newer than any handed out before.
    pub async fn mint_version(&self, path: &str) -> Result<i64, StoreError> {
        let resolved = self.locate(path).await?;
        let staged = self.staging_path(&resolved);
        match fs::rename(&staged, &resolved.absolute).await {
            Ok(()) => tracing::debug!(path = %resolved.normalized, "upload published"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let meta = match fs::metadata(&resolved.absolute).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(resolved.normalized));
            }
            Err(err) => return Err(err.into()),
        };

        let mtime = mtime_millis(&meta);
        let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        let version = match versions.get(&resolved.absolute) {
            Some(&last) if last >= mtime => last + 1,
            _ => mtime,
        };
        versions.insert(resolved.absolute, version);
        Ok(version)
    }

    /// Removes a regular file.
    pub async fn unlink(&self, path: &str) -> Result<(), Errno> {
        let resolved = self.locate(path).await.map_err(|e| e.errno())?;
        let meta = fs::metadata(&resolved.absolute)
            .await
            .map_err(|e| Errno::from(&e))?;

        if meta.is_dir() {
            return Err(Errno::IsDirectory);
        }
        if meta.permissions().readonly() {
            return Err(Errno::PermissionDenied);
        }

        fs::remove_file(&resolved.absolute)
            .await
            .map_err(|e| Errno::from(&e))?;
        if let Err(e) = fs::remove_file(self.staging_path(&resolved)).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %resolved.normalized, error = %e, "could not drop pending upload");
            }
        }
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&resolved.absolute);
        tracing::info!(path = %resolved.normalized, "file unlinked");
        Ok(())
    }

    // One flat file per logical path; `%` and `/` are escaped so names never
    // collide.
    fn staging_path(&self, resolved: &Resolved) -> PathBuf {
        let name = resolved.normalized.replace('%', "%25").replace('/', "%2F");
        self.root.join(STAGING_DIR).join(name)
    }

    fn observe_version(&self, target: &Path, mtime: i64) -> i64 {
        let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        match versions.get(target) {
            Some(&tracked) if tracked >= mtime => tracked,
            _ => {
                versions.insert(target.to_path_buf(), mtime);
                mtime
            }
        }
    }
}

async fn create_file(target: &Path, exclusive: bool) -> Result<(), Errno> {
    let mut options = OpenOptions::new();
    options.write(true);
    if exclusive {
        options.create_new(true);
    } else {
        options.create(true).truncate(false);
    }
    options.open(target).await.map(drop).map_err(|e| Errno::from(&e))
}

async fn check_access(target: &Path, write: bool) -> Result<(), Errno> {
    let result = OpenOptions::new()
        .read(true)
        .write(write)
        .open(target)
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Errno::NotFound),
        Err(_) => Err(Errno::PermissionDenied),
    }
}

fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
