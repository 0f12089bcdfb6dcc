#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use afs_proxy::api_client::{Chunk, FileMetadata, OpenMode, RemoteStore};
use afs_proxy::error::{Errno, FsError};
use afs_proxy::fs::{Cache, Proxy};
use bytes::Bytes;

#[derive(Debug, Clone)]
struct MockFile {
    data: Vec<u8>,
    version: i64,
    is_dir: bool,
    /// Upload in progress, published by `mint_version`.
    staged: Option<Vec<u8>>,
}

/// In-memory store with small download chunks and switchable failures.
pub struct MockStore {
    files: Mutex<HashMap<String, MockFile>>,
    chunk_size: usize,
    clock: AtomicI64,
    pub fail_invalidate: AtomicBool,
    pub fail_uploads: AtomicBool,
    pub fail_downloads: AtomicBool,
    pub download_calls: AtomicUsize,
}

impl MockStore {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            chunk_size,
            clock: AtomicI64::new(1_000),
            fail_invalidate: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
            fail_downloads: AtomicBool::new(false),
            download_calls: AtomicUsize::new(0),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn normalize(path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }

    /// Stores `data` under `path` with a fresh version and returns it.
    pub fn put_file(&self, path: &str, data: &[u8]) -> i64 {
        let version = self.tick();
        self.files.lock().unwrap().insert(
            Self::normalize(path),
            MockFile {
                data: data.to_vec(),
                version,
                is_dir: false,
                staged: None,
            },
        );
        version
    }

    pub fn add_dir(&self, path: &str) {
        let version = self.tick();
        self.files.lock().unwrap().insert(
            Self::normalize(path),
            MockFile {
                data: Vec::new(),
                version,
                is_dir: true,
                staged: None,
            },
        );
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(&Self::normalize(path)).map(|f| f.data.clone())
    }

    pub fn version(&self, path: &str) -> Option<i64> {
        self.files.lock().unwrap().get(&Self::normalize(path)).map(|f| f.version)
    }

    pub fn downloads(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    fn refuse(path: &str, errno: Errno) -> FileMetadata {
        FileMetadata {
            error: Some(errno),
            is_dir: false,
            size: 0,
            last_modified: 0,
            normalized_path: path.to_string(),
        }
    }
}

impl RemoteStore for MockStore {
    async fn get_metadata(&self, path: &str, mode: OpenMode) -> Result<FileMetadata, FsError> {
        if path.split('/').any(|part| part == "..") {
            return Ok(Self::refuse(path, Errno::PermissionDenied));
        }
        let normalized = Self::normalize(path);
        let created = self.tick();
        let mut files = self.files.lock().unwrap();

        let existing_dir = files.get(&normalized).map(|file| file.is_dir);
        match (existing_dir, mode) {
            (Some(true), OpenMode::Read) => {}
            (Some(true), _) => return Ok(Self::refuse(path, Errno::IsDirectory)),
            (Some(_), OpenMode::CreateNew) => return Ok(Self::refuse(path, Errno::AlreadyExists)),
            (Some(_), _) => {}
            (None, OpenMode::Create | OpenMode::CreateNew) => {
                files.insert(
                    normalized.clone(),
                    MockFile {
                        data: Vec::new(),
                        version: created,
                        is_dir: false,
                        staged: None,
                    },
                );
            }
            (None, _) => return Ok(Self::refuse(path, Errno::NotFound)),
        }

        let file = &files[&normalized];
        Ok(FileMetadata {
            error: None,
            is_dir: file.is_dir,
            size: file.data.len() as u64,
            last_modified: file.version,
            normalized_path: normalized,
        })
    }

    async fn download_chunk(&self, path: &str, offset: u64) -> Result<Chunk, FsError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(FsError::Unavailable("download switched off".into()));
        }
        let files = self.files.lock().unwrap();
        let file = files.get(&Self::normalize(path)).ok_or(FsError::Store(Errno::NotFound))?;
        let start = offset as usize;
        if start >= file.data.len() {
            return Ok(Chunk::end_of_file(offset));
        }
        let end = (start + self.chunk_size).min(file.data.len());
        Ok(Chunk::new(offset, Bytes::copy_from_slice(&file.data[start..end])))
    }

    async fn upload_chunk(&self, path: &str, chunk: Chunk) -> Result<(), FsError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(FsError::Unavailable("upload switched off".into()));
        }
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&Self::normalize(path)).ok_or(FsError::Store(Errno::NotFound))?;
        let staged = file.staged.get_or_insert_with(Vec::new);
        let start = chunk.offset as usize;
        let end = start + chunk.data.len();
        if staged.len() < end {
            staged.resize(end, 0);
        }
        staged[start..end].copy_from_slice(&chunk.data);
        Ok(())
    }

    async fn invalidate_prior_version(&self, path: &str) -> Result<(), FsError> {
        if self.fail_invalidate.load(Ordering::SeqCst) {
            return Err(FsError::Unavailable("invalidate switched off".into()));
        }
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&Self::normalize(path)).ok_or(FsError::Store(Errno::NotFound))?;
        file.staged = Some(Vec::new());
        Ok(())
    }

    async fn mint_version(&self, path: &str) -> Result<i64, FsError> {
        let version = self.tick();
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&Self::normalize(path)).ok_or(FsError::Store(Errno::NotFound))?;
        if let Some(data) = file.staged.take() {
            file.data = data;
        }
        file.version = version;
        Ok(version)
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let normalized = Self::normalize(path);
        let mut files = self.files.lock().unwrap();
        match files.get(&normalized).map(|file| file.is_dir) {
            None => Err(FsError::Store(Errno::NotFound)),
            Some(true) => Err(FsError::Store(Errno::IsDirectory)),
            Some(false) => {
                files.remove(&normalized);
                Ok(())
            }
        }
    }
}

pub struct Harness {
    pub proxy: Arc<Proxy<MockStore>>,
    _cache_dir: tempfile::TempDir,
}

impl Harness {
    /// Download chunks of 4 bytes, upload chunks of 3.
    pub fn new(size_limit: u64) -> Self {
        let cache_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cache = Cache::new(cache_dir.path().to_path_buf(), size_limit);
        let proxy = Proxy::new(cache, MockStore::new(4)).with_upload_chunk_size(3);
        Self {
            proxy: Arc::new(proxy),
            _cache_dir: cache_dir,
        }
    }

    pub fn store(&self) -> &MockStore {
        self.proxy.store()
    }

    pub fn cache(&self) -> &Cache {
        self.proxy.cache()
    }
}
