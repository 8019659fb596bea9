//! Echo server: every received chunk is written back to its sender.

use super::{closed_by, hex};
use crate::config::Config;
use std::net::SocketAddr;
use tcp_events::Server;
use tracing::{debug, info, warn};

pub async fn run(config: &Config, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(addr);
    server.set_exclusive_address_use(config.exclusive_address_use);

    let no_delay = config.no_delay;
    server.start(move |handlers| {
        handlers
            .on_accept(move |conn| {
                if no_delay {
                    if let Err(e) = conn.set_nodelay(true) {
                        warn!(peer = %conn, error = %e, "Failed to set TCP_NODELAY");
                    }
                }
                info!(peer = %conn, "Accepted");
            })
            .on_receive(|conn, data| {
                info!(peer = %conn, data = %hex(&data), "Received");
                conn.send_with(data, |peer| debug!(peer = %peer, "Send completed"));
            })
            .on_error(|conn, e| {
                warn!(peer = %conn, error = %e, "Connection error");
            })
            .on_close(|conn, closed_by_client| {
                info!(peer = %conn, by = closed_by(closed_by_client), "Closed");
            });
    })?;

    info!(address = %server, "Echo server started, press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;
    server.stop();

    Ok(())
}
