use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::store::{Errno, FileMetadata, OpenMode, Store, StoreError};

/// Header carrying the byte offset of a downloaded chunk.
pub const CHUNK_OFFSET_HEADER: &str = "x-chunk-offset";
/// Header carrying the chunk length, `-1` once the offset reached end of file.
pub const CHUNK_SIZE_HEADER: &str = "x-chunk-size";

pub type SharedStore = Arc<Store>;

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            StoreError::Escape(_) => StatusCode::FORBIDDEN,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::NotADirectory(_) | StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(%status, error = %self, "request failed");
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct MetadataRequest {
    pub path: String,
    pub mode: OpenMode,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: i64,
}

#[derive(Debug, Serialize)]
pub struct UnlinkResponse {
    pub error: Option<Errno>,
}

pub async fn health() -> &'static str {
    "OK"
}

// Metadata lookup, also where CREATE / CREATE_NEW materialize the file.
pub async fn get_metadata(
    State(store): State<SharedStore>,
    Json(request): Json<MetadataRequest>,
) -> Json<FileMetadata> {
    Json(store.metadata(&request.path, request.mode).await)
}

// Chunk download
pub async fn download_chunk(
    State(store): State<SharedStore>,
    Query(query): Query<ChunkQuery>,
) -> Result<Response, StoreError> {
    let chunk = store.read_chunk(&query.path, query.offset).await?;

    let mut headers = HeaderMap::new();
    headers.insert(CHUNK_OFFSET_HEADER, HeaderValue::from(chunk.offset));
    headers.insert(CHUNK_SIZE_HEADER, HeaderValue::from(chunk.size));
    Ok((headers, chunk.data).into_response())
}

// Chunk upload, written at the offset carried in the query.
pub async fn upload_chunk(
    State(store): State<SharedStore>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<StatusCode, StoreError> {
    store.write_chunk(&query.path, query.offset, &body).await?;
    Ok(StatusCode::OK)
}

pub async fn invalidate(
    State(store): State<SharedStore>,
    Query(query): Query<PathQuery>,
) -> Result<StatusCode, StoreError> {
    store.invalidate(&query.path).await?;
    Ok(StatusCode::OK)
}

pub async fn mint_version(
    State(store): State<SharedStore>,
    Query(query): Query<PathQuery>,
) -> Result<Json<VersionResponse>, StoreError> {
    let version = store.mint_version(&query.path).await?;
    Ok(Json(VersionResponse { version }))
}

// File deletion
pub async fn delete_file(
    State(store): State<SharedStore>,
    Query(query): Query<PathQuery>,
) -> Json<UnlinkResponse> {
    let error = store.unlink(&query.path).await.err();
    Json(UnlinkResponse { error })
}
