//! Authoritative store for the caching proxy.
//!
//! The store owns the real bytes. Proxies ask it for metadata and versions,
//! pull files down in chunks and push modified copies back the same way.

pub mod config;
pub mod handlers;
pub mod store;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use handlers::*;

/// Upper bound on an uploaded chunk body.
pub const MAX_UPLOAD_BODY: usize = 16 * 1024 * 1024;

/// Builds the application's routes around a shared store.
pub fn router(store: SharedStore) -> Router {
    Router::new()
        // A simple health check endpoint.
        .route("/health", get(health))
        .route("/metadata", post(get_metadata))
        // Chunked transfer in both directions.
        .route("/chunks", get(download_chunk).put(upload_chunk))
        // Write-back protocol: discard the old content, then stamp a new version.
        .route("/invalidate", post(invalidate))
        .route("/version", post(mint_version))
        .route("/files", axum::routing::delete(delete_file))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY))
        // Apply a logging layer to trace all HTTP requests.
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Serves the store on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    store: SharedStore,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
