//! Size-bounded cache of whole-file copies.
//!
//! Shared copies are read-only, keyed by `(logical path, version)` and may be
//! used by many readers at once. Private copies belong to exactly one write
//! session; they count toward the size limit but are never reclaimed by
//! eviction. All bookkeeping lives behind one mutex, so every public method is
//! a single critical section.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;
use thiserror::Error;
use url::form_urlencoded;

use crate::error::{Fd, FsError};

#[derive(Debug, Error)]
pub enum CacheRootError {
    #[error("cache path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("cache path holds data that does not belong to this proxy: {0}")]
    Foreign(PathBuf),

    #[error("IO error while preparing cache directory: {0}")]
    Io(#[from] std::io::Error),
}

/// File name of a cached copy inside the cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key of the shared copy of `logical_path` at `version`.
    ///
    /// The path is form-urlencoded, so `/` never reaches the file name and two
    /// different paths never share a key.
    pub fn shared(logical_path: &str, version: i64) -> Self {
        let encoded: String = form_urlencoded::byte_serialize(logical_path.as_bytes()).collect();
        CacheKey(format!("{encoded}@{version}"))
    }

    /// Key of the private write copy cloned from `self` for descriptor `fd`.
    pub fn private(&self, fd: Fd) -> Self {
        CacheKey(format!("{}.w{}", self.0, fd))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of one physical copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFileRecord {
    /// Path as the client spelled it.
    pub logical_path: String,
    pub cache_path: PathBuf,
    /// The store's canonical spelling; versions are tracked under this name.
    pub normalized_input_path: String,
    pub size: u64,
    pub version: i64,
    pub reader_count: u32,
    pub is_read_only: bool,
    pub is_dir: bool,
}

impl CachedFileRecord {
    pub fn shared(
        logical_path: &str,
        normalized_input_path: &str,
        cache_path: PathBuf,
        size: u64,
        version: i64,
    ) -> Self {
        Self {
            logical_path: logical_path.to_owned(),
            cache_path,
            normalized_input_path: normalized_input_path.to_owned(),
            size,
            version,
            reader_count: 0,
            is_read_only: true,
            is_dir: false,
        }
    }

    /// A distinct, writable record for a private clone of this copy.
    pub fn private_copy(&self, cache_path: PathBuf) -> Self {
        Self {
            cache_path,
            reader_count: 0,
            is_read_only: false,
            ..self.clone()
        }
    }

    fn evictable(&self) -> bool {
        self.is_read_only && self.reader_count == 0
    }
}

/// What happened to a shared copy when one of its readers went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other readers still hold the copy.
    InUse(u32),
    /// Last reader gone and a newer version is known, so the copy was dropped.
    Evicted,
    /// Last reader gone, copy kept warm at the head of the recency list.
    Retained,
    /// The key was not in the cache.
    Missing,
}

struct CacheState {
    records: HashMap<CacheKey, CachedFileRecord>,
    /// Shared copies only, most recently used first.
    recency: LruCache<CacheKey, ()>,
    /// Freshest version materialized per normalized path.
    versions: HashMap<String, i64>,
    current_size: u64,
}

impl CacheState {
    fn has_space(&self, size: u64, limit: u64) -> bool {
        self.current_size.saturating_add(size) <= limit
    }

    fn put(&mut self, key: CacheKey, record: CachedFileRecord) {
        let size = record.size;
        if let Some(previous) = self.records.insert(key, record) {
            self.current_size -= previous.size;
        }
        self.current_size += size;
    }

    fn evict(&mut self, key: &CacheKey) -> Option<CachedFileRecord> {
        let record = self.records.remove(key)?;
        self.recency.pop(key);
        self.current_size -= record.size;

        // Deleted while still holding the lock so a re-materialization of the
        // same key cannot race with the unlink.
        if let Err(e) = std::fs::remove_file(&record.cache_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(key = %key, error = %e, "could not delete evicted copy");
            }
        }
        tracing::debug!(key = %key, size = record.size, current = self.current_size, "evicted");
        Some(record)
    }

    fn evict_for_space(&mut self, required: u64, limit: u64) -> bool {
        if required > limit {
            return false;
        }
        if self.has_space(required, limit) {
            return true;
        }

        // Least recently used first.
        let candidates: Vec<CacheKey> = self.recency.iter().rev().map(|(k, _)| k.clone()).collect();
        for key in candidates {
            let evictable = self.records.get(&key).is_some_and(CachedFileRecord::evictable);
            if evictable {
                self.evict(&key);
                if self.has_space(required, limit) {
                    return true;
                }
            }
        }
        false
    }

    fn make_room(&mut self, size: u64, limit: u64) -> Result<(), FsError> {
        if self.has_space(size, limit) || self.evict_for_space(size, limit) {
            Ok(())
        } else {
            Err(FsError::OutOfSpace(size))
        }
    }
}

pub struct Cache {
    root: PathBuf,
    size_limit: u64,
    state: Mutex<CacheState>,
    /// Serializes the open path from the stale check through the pin, so two
    /// openers never both materialize the same key.
    admission: tokio::sync::Mutex<()>,
}

impl Cache {
    // Changing this name makes existing cache directories look foreign.
    pub const MARKER_FILE: &'static str = ".afs_cache";

    /// Creates an empty cache over `root` without touching the filesystem.
    pub fn new(root: PathBuf, size_limit: u64) -> Self {
        Self {
            root,
            size_limit,
            state: Mutex::new(CacheState {
                records: HashMap::new(),
                recency: LruCache::unbounded(),
                versions: HashMap::new(),
                current_size: 0,
            }),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    /// Prepares `root` as a cache directory and creates a cache over it.
    ///
    /// A missing directory is created. An existing one must either be empty or
    /// carry the marker file of an earlier run; in the latter case its old
    /// contents are wiped, since nothing survives a restart.
    pub async fn open(root: &Path, size_limit: u64) -> Result<Self, CacheRootError> {
        let root = match tokio::fs::canonicalize(root).await {
            Ok(path) => {
                if !tokio::fs::metadata(&path).await?.is_dir() {
                    return Err(CacheRootError::NotADirectory(path));
                }

                let marker = path.join(Self::MARKER_FILE);
                let mut entries = tokio::fs::read_dir(&path).await?;
                let is_empty = entries.next_entry().await?.is_none();
                if !(is_empty || tokio::fs::try_exists(&marker).await?) {
                    return Err(CacheRootError::Foreign(path));
                }

                let mut entries = tokio::fs::read_dir(&path).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_name() == Self::MARKER_FILE {
                        continue;
                    }
                    if entry.file_type().await?.is_dir() {
                        tokio::fs::remove_dir_all(entry.path()).await?;
                    } else {
                        tokio::fs::remove_file(entry.path()).await?;
                    }
                }
                path
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(root).await?;
                tokio::fs::canonicalize(root).await?
            }
            Err(e) => return Err(e.into()),
        };

        tokio::fs::write(root.join(Self::MARKER_FILE), b"").await?;
        tracing::info!(root = %root.display(), size_limit, "cache ready");
        Ok(Self::new(root, size_limit))
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical location of the copy stored under `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    pub fn current_size(&self) -> u64 {
        self.state().current_size
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state().records.contains_key(key)
    }

    /// Sum of the sizes of every record currently held.
    pub fn accounted_size(&self) -> u64 {
        self.state().records.values().map(|r| r.size).sum()
    }

    /// Shared keys, most recently used first.
    pub fn recency_order(&self) -> Vec<CacheKey> {
        self.state().recency.iter().map(|(k, _)| k.clone()).collect()
    }

    pub async fn admit(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.admission.lock().await
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<CachedFileRecord> {
        self.state().records.get(key).cloned()
    }

    /// Inserts or replaces the record under `key`. A replaced record's size is
    /// taken out of the accounting before the new one is added.
    pub fn put(&self, key: CacheKey, record: CachedFileRecord) {
        self.state().put(key, record);
    }

    /// Marks `key` most recently used, adding it to the recency list if needed.
    pub fn touch(&self, key: &CacheKey) {
        self.state().recency.put(key.clone(), ());
    }

    pub fn has_space(&self, size: u64) -> bool {
        self.state().has_space(size, self.size_limit)
    }

    /// Drops the record under `key` and deletes its bytes. Absent keys are
    /// ignored.
    pub fn evict(&self, key: &CacheKey) -> Option<CachedFileRecord> {
        self.state().evict(key)
    }

    /// Evicts unused shared copies, least recently used first, until
    /// `required` bytes fit. Copies with readers and private copies are never
    /// touched.
    pub fn evict_for_space(&self, required: u64) -> bool {
        self.state().evict_for_space(required, self.size_limit)
    }

    /// Makes room for `record` (evicting if needed) and inserts it, or fails
    /// with [`FsError::OutOfSpace`].
    pub fn reserve(&self, key: CacheKey, record: CachedFileRecord) -> Result<(), FsError> {
        let mut state = self.state();
        state.make_room(record.size, self.size_limit)?;
        state.put(key, record);
        Ok(())
    }

    /// Makes sure `size` more bytes fit, evicting idle shared copies if
    /// needed.
    pub fn make_room(&self, size: u64) -> Result<(), FsError> {
        self.state().make_room(size, self.size_limit)
    }

    /// Grows the accounted size of the private copy under `key` to `new_end`,
    /// claiming room for the extra bytes first. Never shrinks.
    pub fn reserve_write(&self, key: &CacheKey, new_end: u64) -> Result<(), FsError> {
        let mut state = self.state();
        let Some(mut record) = state.records.get(key).filter(|r| new_end > r.size).cloned() else {
            return Ok(());
        };
        state.make_room(new_end - record.size, self.size_limit)?;
        record.size = new_end;
        state.put(key.clone(), record);
        Ok(())
    }

    /// Adds a reader to the shared copy under `key`.
    pub fn pin(&self, key: &CacheKey) -> Option<CachedFileRecord> {
        let mut state = self.state();
        let record = state.records.get_mut(key)?;
        record.reader_count += 1;
        Some(record.clone())
    }

    /// Removes a reader without any further bookkeeping.
    pub fn unpin(&self, key: &CacheKey) -> Option<u32> {
        let mut state = self.state();
        let record = state.records.get_mut(key)?;
        record.reader_count = record.reader_count.saturating_sub(1);
        Some(record.reader_count)
    }

    /// Removes a reader. When the last one leaves, the copy is evicted if a
    /// newer version of its path is known, otherwise it becomes the most
    /// recently used entry.
    pub fn release_reader(&self, key: &CacheKey) -> ReleaseOutcome {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(record) = state.records.get_mut(key) else {
            return ReleaseOutcome::Missing;
        };
        record.reader_count = record.reader_count.saturating_sub(1);
        if record.reader_count > 0 {
            return ReleaseOutcome::InUse(record.reader_count);
        }

        let version = record.version;
        let stale = state
            .versions
            .get(&record.normalized_input_path)
            .is_some_and(|&latest| version < latest);
        if stale {
            state.evict(key);
            ReleaseOutcome::Evicted
        } else {
            state.recency.put(key.clone(), ());
            ReleaseOutcome::Retained
        }
    }

    /// Evicts the cached copy of `path` if it predates `authoritative` and
    /// nobody is reading it.
    pub fn evict_stale(&self, path: &str, authoritative: i64) -> bool {
        let mut state = self.state();
        let Some(&cached) = state.versions.get(path) else {
            return false;
        };
        if cached >= authoritative {
            return false;
        }

        let key = CacheKey::shared(path, cached);
        let unused = state.records.get(&key).is_some_and(|r| r.reader_count == 0);
        if unused {
            tracing::debug!(path, cached, authoritative, "dropping stale version");
            state.evict(&key);
        }
        unused
    }

    pub fn latest_version(&self, path: &str) -> Option<i64> {
        self.state().versions.get(path).copied()
    }

    /// Records `version` as the freshest materialized version of `path`.
    pub fn record_version(&self, path: &str, version: i64) {
        let mut state = self.state();
        let latest = state.versions.entry(path.to_owned()).or_insert(version);
        if *latest < version {
            *latest = version;
        }
    }
}
