//! Demo programs built on the library.
//!
//! - `echo`: echo server
//! - `broadcast`: server sending stdin lines to every client
//! - `client`: client adapter echoing what the server sends

pub mod broadcast;
pub mod client;
pub mod echo;
mod registry;

/// Format bytes as dash-separated uppercase hex, e.g. `65-63-68-6F`.
pub fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Which side initiated a close, for log output.
pub fn closed_by(closed_by_client: bool) -> &'static str {
    if closed_by_client {
        "remote"
    } else {
        "local"
    }
}
