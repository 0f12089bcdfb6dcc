use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::fs::DEFAULT_UPLOAD_CHUNK_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid store url '{url}': {source}")]
    StoreUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("upload chunk size must be at least one byte")]
    ZeroChunkSize,
}

/// Proxy settings, read from `config.toml`. Every field has a default so the
/// file may be partial or absent.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub store_url: String,
    pub cache_dir: PathBuf,
    /// In bytes.
    pub cache_size_limit: u64,
    pub listen: SocketAddr,
    pub upload_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: "http://127.0.0.1:8080/".to_string(),
            cache_dir: PathBuf::from("cache"),
            cache_size_limit: 64 * 1024 * 1024,
            listen: SocketAddr::from(([127, 0, 0, 1], 9090)),
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }
}

/// Command line of the proxy. Flags override the config file.
#[derive(Parser, Debug, Clone)]
#[command(name = "afs-proxy", about = "Caching proxy with open/close consistency")]
pub struct Cli {
    /// Path of the TOML config file.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Base URL of the store, e.g. http://127.0.0.1:8080/
    #[arg(long)]
    pub store: Option<String>,

    /// Directory holding cached copies. Created if missing.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Cache size limit in bytes.
    #[arg(long)]
    pub cache_size: Option<u64>,

    /// Address clients connect to.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Size of the chunks pushed to the store on close.
    #[arg(long)]
    pub chunk_size: Option<usize>,
}

impl Config {
    pub fn apply(mut self, cli: &Cli) -> Self {
        if let Some(store) = &cli.store {
            self.store_url = store.clone();
        }
        if let Some(dir) = &cli.cache_dir {
            self.cache_dir = dir.clone();
        }
        if let Some(size) = cli.cache_size {
            self.cache_size_limit = size;
        }
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if let Some(chunk) = cli.chunk_size {
            self.upload_chunk_size = chunk;
        }
        self
    }

    /// Parses the store URL. A trailing slash is added so relative routes
    /// join under it instead of replacing its last segment.
    pub fn store_url(&self) -> Result<Url, ConfigError> {
        let mut raw = self.store_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|source| ConfigError::StoreUrl {
            url: self.store_url.clone(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store_url()?;
        if self.upload_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        Ok(())
    }
}

/// Loads `path`, falling back to defaults (with a warning) when it is missing
/// or unreadable.
pub fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Config::default();
    }

    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config file, using defaults");
            return Config::default();
        }
    };

    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot parse config file, using defaults");
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "cache_size_limit = 100\nstore_url = \"http://store:8080\"\n").unwrap();

        let config = load_config(&path);
        assert_eq!(config.cache_size_limit, 100);
        assert_eq!(config.cache_dir, Config::default().cache_dir);
        assert_eq!(config.store_url().unwrap().as_str(), "http://store:8080/");
    }

    #[test]
    fn broken_or_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_config(&dir.path().join("absent.toml")), Config::default());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "cache_size_limit = \"lots\"").unwrap();
        assert_eq!(load_config(&path), Config::default());
    }

    #[test]
    fn flags_override_file() {
        let cli = Cli::parse_from(["afs-proxy", "--cache-size", "10", "--chunk-size", "0"]);
        let config = Config::default().apply(&cli);
        assert_eq!(config.cache_size_limit, 10);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChunkSize)));

        let bad = Config {
            store_url: "not a url".into(),
            ..Config::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::StoreUrl { .. })));
    }
}
