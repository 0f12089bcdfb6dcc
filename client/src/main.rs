//! The main entry point for the caching proxy.
//!
//! This binary is responsible for:
//! 1. Loading the configuration from `config.toml` and the command line.
//! 2. Preparing the cache directory and checking that the store answers.
//! 3. Accepting client connections until ctrl-c.

use std::process::ExitCode;
use std::sync::Arc;

use afs_proxy::api_client::HttpStore;
use afs_proxy::config::{self, Cli};
use afs_proxy::fs::{Cache, Proxy};
use afs_proxy::gateway;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "afs_proxy=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 1. Configuration
    let config = config::load_config(&cli.config).apply(&cli);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }
    tracing::info!(?config, "configuration loaded");

    // 2. Cache directory and store
    let cache = match Cache::open(&config.cache_dir, config.cache_size_limit).await {
        Ok(cache) => cache,
        Err(e) => {
            tracing::error!(dir = %config.cache_dir.display(), error = %e, "unusable cache directory");
            return ExitCode::FAILURE;
        }
    };

    let store = match config.store_url() {
        Ok(url) => HttpStore::new(url),
        Err(e) => {
            tracing::error!(error = %e, "invalid store url");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = store.health().await {
        tracing::error!(store = %store.base(), error = %e, "store unreachable");
        return ExitCode::FAILURE;
    }

    let proxy = Arc::new(Proxy::new(cache, store).with_upload_chunk_size(config.upload_chunk_size));

    // 3. Serve clients
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

    if let Err(e) = gateway::serve(listener, proxy, shutdown).await {
        tracing::error!(error = %e, "gateway stopped with an error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
