//! Client adapter: sends a greeting once connected and echoes back
//! whatever the server sends.

use super::{closed_by, hex};
use crate::config::Config;
use std::net::SocketAddr;
use tcp_events::Connection;
use tracing::{debug, info, warn};

pub async fn run(config: &Config, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let message = config.message.clone();
    let no_delay = config.no_delay;

    let conn = Connection::connect(addr, move |handlers| {
        handlers
            .on_accept(move |conn| {
                if no_delay {
                    if let Err(e) = conn.set_nodelay(true) {
                        warn!(error = %e, "Failed to set TCP_NODELAY");
                    }
                }
                info!(local = %conn.local_addr(), server = %conn, "Connected");
                conn.send_text_with(&message, |peer| debug!(peer = %peer, "Send completed"));
            })
            .on_receive(|conn, data| {
                info!(data = %hex(&data), "Received");
                conn.send_with(data, |peer| debug!(peer = %peer, "Send completed"));
            })
            .on_error(|_, e| {
                warn!(error = %e, "Connection error");
            })
            .on_close(|_, closed_by_client| {
                info!(by = closed_by(closed_by_client), "Closed");
            });
    })
    .await?;

    info!("Press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;
    conn.dispose();

    Ok(())
}
