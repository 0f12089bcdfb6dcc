use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Command line of the store server.
#[derive(Parser, Debug, Clone)]
#[command(name = "afs-server", about = "Authoritative file store for the caching proxy")]
pub struct ServerConfig {
    /// Address the HTTP API listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Directory whose contents are served. Must already exist.
    #[arg(long, default_value = "data")]
    pub root: PathBuf,
}
