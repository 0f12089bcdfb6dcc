//! This module defines the interface the proxy uses to reach the authoritative
//! store, and its HTTP implementation.
//!
//! The file handler only ever talks to a [`RemoteStore`]. [`HttpStore`] is the
//! production implementation built on `reqwest`; tests substitute their own.

use std::future::Future;

use bytes::Bytes;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Errno, FsError};

/// Header carrying the byte offset of a downloaded chunk.
pub const CHUNK_OFFSET_HEADER: &str = "x-chunk-offset";
/// Header carrying the chunk length, `-1` at end of file.
pub const CHUNK_SIZE_HEADER: &str = "x-chunk-size";

/// Mode requested by `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    Read,
    Write,
    Create,
    CreateNew,
}

/// Authoritative description of a path, as returned by the store.
///
/// This struct is deserialized directly from the store's JSON response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Set when the store refused the path for the requested mode.
    pub error: Option<Errno>,
    pub is_dir: bool,
    /// The size of the file in bytes.
    pub size: u64,
    /// Version stamp, in milliseconds.
    pub last_modified: i64,
    /// The store's canonical, root-relative spelling of the path.
    pub normalized_path: String,
}

/// A bounded byte range, the unit of bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    /// Number of bytes in `data`, or `-1` when the download reached end of file.
    pub size: i64,
    pub data: Bytes,
}

impl Chunk {
    pub fn new(offset: u64, data: Bytes) -> Self {
        Self {
            offset,
            size: data.len() as i64,
            data,
        }
    }

    pub fn end_of_file(offset: u64) -> Self {
        Self {
            offset,
            size: -1,
            data: Bytes::new(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.size < 0
    }
}

/// The calls the proxy makes on the store.
///
/// Failures to reach the store come back as [`FsError::Unavailable`]; error
/// codes the store itself reports come back as [`FsError::Store`] (or inside
/// [`FileMetadata::error`] for metadata requests).
pub trait RemoteStore: Send + Sync + 'static {
    fn get_metadata(
        &self,
        path: &str,
        mode: OpenMode,
    ) -> impl Future<Output = Result<FileMetadata, FsError>> + Send;

    fn download_chunk(
        &self,
        path: &str,
        offset: u64,
    ) -> impl Future<Output = Result<Chunk, FsError>> + Send;

    fn upload_chunk(
        &self,
        path: &str,
        chunk: Chunk,
    ) -> impl Future<Output = Result<(), FsError>> + Send;

    /// Discards the store's current content of `path` ahead of a re-upload.
    fn invalidate_prior_version(&self, path: &str) -> impl Future<Output = Result<(), FsError>> + Send;

    /// Asks the store to stamp `path` with a fresh version.
    fn mint_version(&self, path: &str) -> impl Future<Output = Result<i64, FsError>> + Send;

    fn unlink(&self, path: &str) -> impl Future<Output = Result<(), FsError>> + Send;
}

#[derive(Debug, Serialize)]
struct MetadataRequest<'a> {
    path: &'a str,
    mode: OpenMode,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: i64,
}

#[derive(Debug, Deserialize)]
struct UnlinkResponse {
    error: Option<Errno>,
}

/// [`RemoteStore`] over the store's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base: Url,
}

impl HttpStore {
    /// Creates a store client rooted at `base` (e.g. `http://127.0.0.1:8080/`).
    pub fn new(base: Url) -> Self {
        Self {
            client: Client::new(),
            base,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, route: &str) -> Result<Url, FsError> {
        self.base
            .join(route)
            .map_err(|e| FsError::Unavailable(format!("bad store url: {e}")))
    }

    /// Checks that the store answers on `/health`.
    pub async fn health(&self) -> Result<(), FsError> {
        self.client
            .get(self.endpoint("health")?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn chunk_header(response: &Response, name: &str) -> Result<i64, FsError> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| FsError::Unavailable(format!("store sent a chunk without a valid {name}")))
}

impl RemoteStore for HttpStore {
    /// Fetches metadata for `path`, letting the store validate it for `mode`.
    async fn get_metadata(&self, path: &str, mode: OpenMode) -> Result<FileMetadata, FsError> {
        let response = self
            .client
            .post(self.endpoint("metadata")?)
            .json(&MetadataRequest { path, mode })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<FileMetadata>().await?)
    }

    /// Fetches one chunk of `path` starting at `offset`.
    ///
    /// The chunk's offset and size travel in response headers; the body is
    /// the raw bytes.
    async fn download_chunk(&self, path: &str, offset: u64) -> Result<Chunk, FsError> {
        let response = self
            .client
            .get(self.endpoint("chunks")?)
            .query(&[("path", path)])
            .query(&[("offset", offset)])
            .send()
            .await?
            .error_for_status()?;

        let size = chunk_header(&response, CHUNK_SIZE_HEADER)?;
        let chunk_offset = chunk_header(&response, CHUNK_OFFSET_HEADER)? as u64;
        if size < 0 {
            return Ok(Chunk::end_of_file(chunk_offset));
        }

        let data = response.bytes().await?;
        Ok(Chunk::new(chunk_offset, data))
    }

    /// Uploads one chunk; the store writes it at `chunk.offset`.
    async fn upload_chunk(&self, path: &str, chunk: Chunk) -> Result<(), FsError> {
        self.client
            .put(self.endpoint("chunks")?)
            .query(&[("path", path)])
            .query(&[("offset", chunk.offset)])
            .body(chunk.data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn invalidate_prior_version(&self, path: &str) -> Result<(), FsError> {
        self.client
            .post(self.endpoint("invalidate")?)
            .query(&[("path", path)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn mint_version(&self, path: &str) -> Result<i64, FsError> {
        let response = self
            .client
            .post(self.endpoint("version")?)
            .query(&[("path", path)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<VersionResponse>().await?.version)
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let response = self
            .client
            .delete(self.endpoint("files")?)
            .query(&[("path", path)])
            .send()
            .await?
            .error_for_status()?;
        match response.json::<UnlinkResponse>().await?.error {
            Some(errno) => Err(FsError::Store(errno)),
            None => Ok(()),
        }
    }
}
