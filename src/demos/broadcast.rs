//! Broadcast server: each line typed on stdin is sent to every connected
//! client. `exit` or end of input stops the server and closes all clients.

use super::registry::ConnectionRegistry;
use super::{closed_by, hex};
use crate::config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tcp_events::Server;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Maximum number of tracked clients
const MAX_CLIENTS: usize = 10000;

pub async fn run(config: &Config, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(ConnectionRegistry::new(MAX_CLIENTS));

    let server = Server::new(addr);
    server.set_exclusive_address_use(config.exclusive_address_use);

    let tracked = Arc::clone(&registry);
    server.start(move |handlers| {
        let joined = Arc::clone(&tracked);
        let left = Arc::clone(&tracked);
        handlers
            .on_accept(move |conn| {
                // Broadcasts are small and frequent
                if let Err(e) = conn.set_nodelay(true) {
                    warn!(peer = %conn, error = %e, "Failed to set TCP_NODELAY");
                }
                if joined.insert(conn.clone()).is_none() {
                    warn!(peer = %conn, "Client limit reached");
                    conn.close();
                    return;
                }
                info!(peer = %conn, clients = joined.len(), "Client joined");
            })
            .on_receive(|conn, data| {
                info!(peer = %conn, data = %hex(&data), "Received");
            })
            .on_close(move |conn, closed_by_client| {
                if closed_by_client {
                    left.remove(conn.id());
                }
                info!(peer = %conn, by = closed_by(closed_by_client), "Client left");
            })
            .on_error(|conn, e| {
                warn!(peer = %conn, error = %e, "Connection error");
            });
    })?;

    info!(address = %server, "Broadcast server started");
    info!("Type a line to send it to every client, 'exit' to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().eq_ignore_ascii_case("exit") {
            break;
        }
        if registry.is_empty() {
            info!("No clients connected");
            continue;
        }
        for client in registry.snapshot() {
            client.send_text_with(&line, |peer| debug!(peer = %peer, "Broadcast delivered"));
        }
    }

    server.stop();
    let clients = registry.drain();
    let count = clients.len();
    for client in clients {
        client.close();
    }

    info!(address = %server, clients = count, "Broadcast server stopped");

    Ok(())
}
