pub mod config_models;
pub mod connect_to_peers;
pub mod header_chain;
pub mod main_loop;
pub mod models;
pub mod peer_loop;
pub mod peers;
pub mod pool;
pub mod rdns;
pub mod relay_log;
pub mod relay_peer;
pub mod trusted;
pub mod util_types;

#[cfg(test)]
pub(crate) mod tests;

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::config_models::cli_args::Args;
use crate::main_loop::MainLoopHandler;
use crate::models::state::NodeState;
use crate::models::state::TuiLogger;
use crate::relay_log::RelayLog;

/// Pause before any reconnection attempt: trusted validators, relay peers,
/// and outbound P2P peers all use the same discipline.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Bind the three listen sockets, assemble the relay engine, and run the
/// dispatcher until the operator quits. Only a bind or relay-log failure at
/// startup is fatal.
pub async fn initialize(args: Args) -> Result<()> {
    let blocks_listener = bind(args.listen_addr, args.blocks_port).await?;
    let both_listener = bind(args.listen_addr, args.both_port).await?;
    let relay_listener = bind(args.listen_addr, args.relay_port).await?;

    let logger = TuiLogger::default();
    let relay_log = RelayLog::open(&args.relay_log_path, logger.clone())?;
    let state = NodeState::new(relay_log, logger);
    state.spawn_pool_eviction_tasks();

    let command_rx = main_loop::spawn_stdin_reader();
    main_loop::spawn_status_printer(state.clone());

    info!(
        "Relay node up; listening on {} (blocks), {} (blocks+tx), {} (relay protocol)",
        args.blocks_port, args.both_port, args.relay_port
    );

    let main_loop_handler = MainLoopHandler::new(
        blocks_listener,
        both_listener,
        relay_listener,
        state,
        command_rx,
    );
    main_loop_handler.run().await
}

async fn bind(listen_addr: std::net::IpAddr, port: u16) -> Result<TcpListener> {
    TcpListener::bind((listen_addr, port)).await.with_context(|| {
        format!(
            "Failed to bind to local TCP port {}:{}. Is an instance of this program already running?",
            listen_addr, port
        )
    })
}
