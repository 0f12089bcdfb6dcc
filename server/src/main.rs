//! The main entry point for the store server.
//!
//! This binary parses the command line, sets up logging/tracing, opens the
//! store root and serves the routes built by [`afs_server::router`].

use std::process::ExitCode;
use std::sync::Arc;

use afs_server::config::ServerConfig;
use afs_server::store::Store;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let config = ServerConfig::parse();

    // Initialize the logging and tracing subscriber.
    // Uses `RUST_LOG` env var or defaults to "afs_server=debug,tower_http=debug".
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "afs_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = match Store::open(&config.root).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(root = %config.root.display(), error = %e, "invalid store root");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(root = %store.root().display(), "store opened");

    let listener = match tokio::net::TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.listen, error = %e, "could not bind");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            shutdown.cancel();
        }
    });

    tracing::debug!("listening on {}", config.listen);
    if let Err(e) = afs_server::serve(listener, store, shutdown).await {
        tracing::error!(error = %e, "server stopped with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
