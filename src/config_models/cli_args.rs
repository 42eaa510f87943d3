use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Declarative specification of command-line arguments. Everything else the
/// node does is driven by operator commands on stdin; there is no
/// environment-variable or file configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay-node", about = "A Bitcoin block and transaction relay node")]
pub struct Args {
    /// Port serving blocks-only clients.
    #[arg(long, default_value = "8334")]
    pub blocks_port: u16,

    /// Port serving blocks+transactions clients.
    #[arg(long, default_value = "8335")]
    pub both_port: u16,

    /// Port serving relay-protocol clients.
    #[arg(long, default_value = "8336")]
    pub relay_port: u16,

    /// IP on which to listen for client connections.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_addr: IpAddr,

    /// Append-only log of first-seen blocks.
    #[arg(long, default_value = "blockrelay.log")]
    pub relay_log_path: PathBuf,
}
