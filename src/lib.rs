//! tcp-events: event-driven TCP networking.
//!
//! A [`Server`] accepts inbound connections and wraps each one in a
//! [`Connection`] that dispatches accept, receive, close and error events to
//! handlers installed by a configuration callback:
//!
//! ```no_run
//! use tcp_events::Server;
//!
//! # async fn run() -> tcp_events::Result<()> {
//! let server = Server::parse("127.0.0.1", 7000)?;
//! server.start(|handlers| {
//!     handlers.on_receive(|conn, data| {
//!         conn.send(data);
//!     });
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! Payloads are delivered exactly as read from the socket; there is no
//! message framing.

pub mod connection;
pub mod error;
pub mod ports;
pub mod server;
mod socket;

pub use connection::{Connection, ConnectionId, Handlers, SendHandle, SendStatus};
pub use error::{Error, Result};
pub use server::Server;
