//! tcp-events demo binary.
//!
//! Runs one of the demo programs on top of the library:
//! - `echo`: echo server
//! - `broadcast`: stdin lines sent to every connected client
//! - `client`: connects to a server and echoes what it receives
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod demos;

use config::{Config, Mode};
use std::net::{IpAddr, SocketAddr};
use tcp_events::ports::{self, AddressFamily};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        listen = %config.listen,
        port = ?config.port,
        workers = ?config.workers,
        exclusive_address_use = config.exclusive_address_use,
        no_delay = config.no_delay,
        "Starting tcp-events"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let ip: IpAddr = if config.listen.eq_ignore_ascii_case("local") {
        // First address of this host, for machines with several interfaces
        ports::local_addresses(AddressFamily::Ipv4)?
            .into_iter()
            .next()
            .ok_or("No local IPv4 address found")?
    } else {
        config.listen.parse()?
    };

    let port = match config.port {
        Some(port) => port,
        None => {
            let scope = Some(ip).filter(|ip| !ip.is_unspecified());
            let port = ports::free_port(1024, scope)?;
            info!(port, "Picked free port");
            port
        }
    };
    let addr = SocketAddr::new(ip, port);

    match config.mode {
        Mode::Echo => demos::echo::run(&config, addr).await,
        Mode::Broadcast => demos::broadcast::run(&config, addr).await,
        Mode::Client => demos::client::run(&config, addr).await,
    }
}
