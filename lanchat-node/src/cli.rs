//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Peer-to-peer LAN text chat.
#[derive(Parser, Debug, Clone)]
#[command(name = "lanchat-node")]
#[command(version)]
pub struct Cli {
    /// Connect directly to a node at this address (host:port) instead of
    /// waiting for discovery.
    #[arg(long)]
    pub peer_address: Option<SocketAddr>,

    /// Config file (default: ~/.config/lanchat/config.toml, then /etc/lanchat/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}
