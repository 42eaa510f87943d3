use std::io::BufRead;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use itertools::Itertools;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connect_to_peers::answer_peer_wrapper;
use crate::connect_to_peers::spawn_outbound_p2p_connection;
use crate::connect_to_peers::ClientMembership;
use crate::models::peer::own_subversion;
use crate::models::peer::HandshakeData;
use crate::models::state::NodeState;
use crate::relay_peer::answer_relay_client_wrapper;
use crate::relay_peer::spawn_relay_peer_connection;
use crate::trusted::TrustedPeer;

/// Outbound relay-protocol connections always go to this port.
pub const RELAY_PEER_PORT: u16 = 8336;

const STATUS_REDRAW_INTERVAL: Duration = Duration::from_millis(500);
const COMMAND_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum OperatorCommand {
    Quit,
    AddTrusted(String, u16),
    RemoveTrusted(String, u16),
    AddOutbound(String, u16),
    RemoveOutbound(String, u16),
    AddRelay(String),
    RemoveRelay(String),
}

/// Parse one operator input line. Only the shape is validated here: a
/// malformed or empty host still parses and is left for resolution to
/// reject, which is where "Unable to resolve host" comes from.
pub(crate) fn parse_command(line: &str) -> Result<OperatorCommand, &'static str> {
    if line == "q" {
        return Ok(OperatorCommand::Quit);
    }

    if line.starts_with("t ") || line.starts_with("t-") || line.starts_with("o ") || line.starts_with("o-")
    {
        let rest = &line[2..];
        let (host, port) = rest.rsplit_once(':').ok_or("Invalid argument")?;
        let port: u16 = port.parse().map_err(|_| "Invalid argument")?;
        let host = host.to_string();
        return Ok(match &line[..2] {
            "t " => OperatorCommand::AddTrusted(host, port),
            "t-" => OperatorCommand::RemoveTrusted(host, port),
            "o " => OperatorCommand::AddOutbound(host, port),
            _ => OperatorCommand::RemoveOutbound(host, port),
        });
    }

    if line.starts_with("r ") || line.starts_with("r-") {
        let host = &line[2..];
        return Ok(if line.starts_with("r ") {
            OperatorCommand::AddRelay(host.to_string())
        } else {
            OperatorCommand::RemoveRelay(host.to_string())
        });
    }

    Err("Invalid command")
}

/// Reads operator commands off stdin, one per line, for as long as the
/// process lives. Runs on its own thread since stdin is blocking.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    std::thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if command_tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })
        .expect("Failed to spawn operator input thread");
    command_rx
}

/// The dispatcher: owns the three listen sockets and the operator command
/// stream, and wires every accepted connection to its handler.
pub struct MainLoopHandler {
    blocks_listener: TcpListener,
    both_listener: TcpListener,
    relay_listener: TcpListener,
    state: NodeState,
    command_rx: mpsc::Receiver<String>,
}

impl MainLoopHandler {
    pub fn new(
        blocks_listener: TcpListener,
        both_listener: TcpListener,
        relay_listener: TcpListener,
        state: NodeState,
        command_rx: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            blocks_listener,
            both_listener,
            relay_listener,
            state,
            command_rx,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            select! {
                incoming = self.blocks_listener.accept() => {
                    self.accept_client(incoming, ClientMembership::BlocksOnly);
                }
                incoming = self.both_listener.accept() => {
                    self.accept_client(incoming, ClientMembership::BlocksAndTransactions);
                }
                incoming = self.relay_listener.accept() => {
                    match incoming {
                        Ok((stream, peer_address)) => {
                            tokio::spawn(answer_relay_client_wrapper(
                                stream,
                                self.state.clone(),
                                peer_address,
                            ));
                        }
                        Err(e) => warn!("Failed to accept relay client: {}", e),
                    }
                }
                Some(line) = self.command_rx.recv() => {
                    self.handle_command_line(&line).await;
                }
            }
        }
    }

    fn accept_client(
        &self,
        incoming: std::io::Result<(TcpStream, SocketAddr)>,
        membership: ClientMembership,
    ) {
        match incoming {
            Ok((stream, peer_address)) => {
                let state = self.state.clone();
                tokio::spawn(async move {
                    answer_peer_wrapper(
                        stream,
                        state,
                        peer_address,
                        membership,
                        HandshakeData::new(own_subversion()),
                    )
                    .await;
                });
            }
            Err(e) => warn!("Failed to accept client connection: {}", e),
        }
    }

    pub(crate) async fn handle_command_line(&self, line: &str) {
        let logger = &self.state.logger;
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(message) => {
                logger.log_line(message);
                return;
            }
        };

        match command {
            OperatorCommand::Quit => {
                println!("Quitting...");
                // State is in-memory only; nothing to tear down.
                std::process::exit(0);
            }
            OperatorCommand::AddTrusted(host, port) => {
                let Some(address) = resolve(&host, port).await else {
                    logger.log_line("Unable to resolve host");
                    return;
                };
                let already_known = self
                    .state
                    .trusted_peers
                    .lock()
                    .unwrap()
                    .contains_key(&address.ip());
                if already_known {
                    logger.log_line(format!("Already had trusted peer {address}"));
                } else {
                    TrustedPeer::add(&self.state, address);
                    logger.log_line(format!("Added trusted peer {address}"));
                }
            }
            OperatorCommand::RemoveTrusted(host, port) => {
                let Some(address) = resolve(&host, port).await else {
                    logger.log_line("Unable to resolve host");
                    return;
                };
                let connection = self
                    .state
                    .trusted_peers
                    .lock()
                    .unwrap()
                    .get(&address.ip())
                    .cloned();
                match connection {
                    None => logger.log_line(format!("Had no trusted connection to {address}")),
                    Some(connection) => {
                        connection.disconnect_permanently();
                        logger.log_line(format!("Removed trusted connection to {address}"));
                    }
                }
            }
            OperatorCommand::AddOutbound(host, port) => {
                let Some(address) = resolve(&host, port).await else {
                    logger.log_line("Unable to resolve host");
                    return;
                };
                if self.state.outbound_p2p_registry.is_known(&address) {
                    logger.log_line(format!("Already had outbound connection to {address}"));
                } else {
                    spawn_outbound_p2p_connection(self.state.clone(), address);
                    logger.log_line(format!("Added outbound connection to {address}"));
                }
            }
            OperatorCommand::RemoveOutbound(host, port) => {
                let Some(address) = resolve(&host, port).await else {
                    logger.log_line("Unable to resolve host");
                    return;
                };
                if !self.state.outbound_p2p_registry.is_known(&address) {
                    logger.log_line(format!("Had no outbound connection to {address}"));
                } else {
                    self.state.outbound_p2p_registry.mark_for_disconnect(address);
                    logger.log_line(format!(
                        "Will remove outbound connection to {address} after next disconnect"
                    ));
                }
            }
            OperatorCommand::AddRelay(host) => {
                let Some(address) = resolve(&host, RELAY_PEER_PORT).await else {
                    logger.log_line("Unable to resolve host");
                    return;
                };
                if self.state.relay_peer_registry.is_known(&address) {
                    logger.log_line(format!("Already had relay peer {address}"));
                } else {
                    spawn_relay_peer_connection(self.state.clone(), address);
                    logger.log_line(format!("Added trusted relay peer {address}"));
                }
            }
            OperatorCommand::RemoveRelay(host) => {
                let Some(address) = resolve(&host, RELAY_PEER_PORT).await else {
                    logger.log_line("Unable to resolve host");
                    return;
                };
                if !self.state.relay_peer_registry.is_known(&address) {
                    logger.log_line(format!("Had no relay peer {address}"));
                } else {
                    self.state.relay_peer_registry.mark_for_disconnect(address);
                    logger.log_line(format!(
                        "Will remove relay peer connection to {address} after next disconnect"
                    ));
                }
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addresses) => addresses.next(),
        Err(_) => None,
    }
}

/// Redraw the operator console at 2 Hz: drained log lines scroll away above
/// a panel that is repainted in place with ANSI cursor moves. Presentation
/// only; nothing here is load-bearing.
pub fn spawn_status_printer(state: NodeState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_REDRAW_INTERVAL);
        let mut panel_lines = 0usize;
        loop {
            interval.tick().await;
            panel_lines = print_status(&state, panel_lines);
        }
    })
}

fn print_status(state: &NodeState, previous_panel_lines: usize) -> usize {
    let mut output = String::new();
    if previous_panel_lines > 0 {
        // Up over the old panel, then clear to end of screen.
        output.push_str(&format!("\x1b[{previous_panel_lines}A\x1b[J"));
    }
    for line in state.logger.drain() {
        output.push_str(&line);
        output.push('\n');
    }

    let panel = render_status_panel(state);
    let panel_line_count = panel.lines().count();
    output.push_str(&panel);

    print!("{output}");
    std::io::stdout().flush().ok();
    panel_line_count
}

pub(crate) fn render_status_panel(state: &NodeState) -> String {
    let mut output = String::new();
    output.push('\n');

    let trusted: Vec<Arc<TrustedPeer>> = state
        .trusted_peers
        .lock()
        .unwrap()
        .values()
        .cloned()
        .collect();
    if trusted.is_empty() {
        output.push_str("No Trusted Nodes (no transaction relay)\n");
    } else {
        output.push_str("Trusted Nodes:\n");
        for peer in trusted.iter().sorted_by_key(|peer| peer.address()) {
            let status = match (peer.is_inbound_connected(), peer.is_outbound_connected()) {
                (true, true) => "fully connected",
                (true, false) => "inbound connection only",
                (false, true) => "outbound connection only",
                (false, false) => "not connected",
            };
            output.push_str(&format!("  {} {}\n", peer.address(), status));
        }
    }

    output.push('\n');
    let relay_client_ips = state.relay_clients.client_ips();
    let relay_connected = state.relay_peer_registry.connected_snapshot();
    let relay_waiting = state.relay_peer_registry.waiting_snapshot();
    let mut relay_node_peer_count = 0usize;
    if relay_connected.is_empty() && relay_waiting.is_empty() {
        output.push_str("No Relay Peers\n");
    } else {
        output.push_str("Relay Peers:\n");
        for peer in relay_connected.iter().sorted() {
            if relay_client_ips.contains(&peer.ip()) {
                output.push_str(&format!("  {} fully connected\n", peer.ip()));
                relay_node_peer_count += 1;
            } else {
                output.push_str(&format!("  {} connected outbound only\n", peer.ip()));
            }
        }
        for peer in relay_waiting.iter().sorted() {
            if relay_client_ips.contains(&peer.ip()) {
                output.push_str(&format!("  {} connected inbound only\n", peer.ip()));
                relay_node_peer_count += 1;
            } else {
                output.push_str(&format!("  {} not connected\n", peer.ip()));
            }
        }
    }

    output.push('\n');
    let outbound_connected = state.outbound_p2p_registry.connected_snapshot();
    let outbound_waiting = state.outbound_p2p_registry.waiting_snapshot();
    if outbound_connected.is_empty() && outbound_waiting.is_empty() {
        output.push_str("No Outbound Listeners\n");
    } else {
        output.push_str("Outbound Listeners:\n");
        for peer in outbound_connected.iter().sorted() {
            output.push_str(&format!("  {peer} connected\n"));
        }
        for peer in outbound_waiting.iter().sorted() {
            output.push_str(&format!("  {peer} not connected\n"));
        }
    }

    output.push('\n');
    let txn_client_count = state.txn_clients.size();
    let blocks_client_count = state.blocks_clients.size();
    output.push_str(&format!(
        "Connected block+transaction clients: {txn_client_count}\n"
    ));
    output.push_str(&format!(
        "Connected block-only clients: {}\n",
        blocks_client_count.saturating_sub(txn_client_count)
    ));
    output.push_str(&format!(
        "Connected relay clients: {}\n",
        relay_client_ips.len().saturating_sub(relay_node_peer_count)
    ));
    output.push_str(&format!(
        "Connected relay node peers: {relay_node_peer_count}\n"
    ));
    output.push_str(&format!(
        "Chain download at {}\n",
        state.header_chain.lock().unwrap().best_height()
    ));

    output.push('\n');
    output.push_str("Commands:\n");
    output.push_str("q        \t\tquit\n");
    output.push_str("t IP:port\t\tadd node IP:port as a trusted peer\n");
    output.push_str("t-IP:port\t\tremove node IP:port as a trusted peer\n");
    output.push_str("o IP:port\t\tadd node IP:port as an untrusted peer\n");
    output.push_str("o-IP:port\t\tremove node IP:port as an untrusted peer\n");
    output.push_str("r IP\t\t\tadd trusted relay node to relay from\n");
    output.push_str("r-IP\t\t\tremove trusted relay node to relay from\n");

    output
}
