//! Host port helpers: local address lookup, active TCP endpoints and free
//! port selection.
//!
//! These are stateless queries against the host and do not interact with
//! any [`Server`](crate::Server) or [`Connection`](crate::Connection).

use std::collections::HashSet;
use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Attempts made by [`free_port`] before giving up.
const FREE_PORT_ATTEMPTS: usize = 4096;

/// Address family filter for [`local_addresses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    fn matches(self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Ipv4 => ip.is_ipv4(),
            AddressFamily::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// IP addresses the host name resolves to, filtered by family.
pub fn local_addresses(family: AddressFamily) -> io::Result<Vec<IpAddr>> {
    let host = host_name()?;

    let mut seen = HashSet::new();
    let addrs = (host.as_str(), 0)
        .to_socket_addrs()?
        .map(|addr| addr.ip())
        .filter(|ip| family.matches(ip) && seen.insert(*ip))
        .collect();

    Ok(addrs)
}

fn host_name() -> io::Result<String> {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is valid for buf.len() bytes and gethostname writes at
    // most that many, including the terminator when it fits.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the last byte is never written, so the buffer is terminated.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

/// Local endpoints of every TCP listener and connection on the host,
/// without duplicates.
#[cfg(target_os = "linux")]
pub fn active_tcp_endpoints() -> io::Result<Vec<SocketAddr>> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();

    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let contents = match std::fs::read_to_string(table) {
            Ok(contents) => contents,
            // tcp6 is absent when IPv6 is disabled
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        for addr in contents.lines().skip(1).filter_map(parse_proc_net_line) {
            if seen.insert(addr) {
                endpoints.push(addr);
            }
        }
    }

    Ok(endpoints)
}

#[cfg(not(target_os = "linux"))]
pub fn active_tcp_endpoints() -> io::Result<Vec<SocketAddr>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Active TCP endpoint enumeration is only supported on Linux",
    ))
}

/// Pick a random port above `min` with no active TCP endpoint on `address`
/// (on any address when `None`).
pub fn free_port(min: u16, address: Option<IpAddr>) -> io::Result<u16> {
    let min = min.max(1);
    if min == u16::MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "No ports above 65535",
        ));
    }

    let used: HashSet<u16> = active_tcp_endpoints()?
        .into_iter()
        .filter(|ep| address.map_or(true, |ip| ep.ip() == ip))
        .map(|ep| ep.port())
        .filter(|port| *port >= min)
        .collect();

    pick_port(min, &used, || fastrand::u16(min + 1..=u16::MAX))
}

fn pick_port(
    min: u16,
    used: &HashSet<u16>,
    mut candidate: impl FnMut() -> u16,
) -> io::Result<u16> {
    for _ in 0..FREE_PORT_ATTEMPTS {
        let port = candidate();
        if port > min && !used.contains(&port) {
            return Ok(port);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("No free port found above {min}"),
    ))
}

/// Parse the local address column of a `/proc/net/tcp{,6}` row.
///
/// Addresses are hex dumps of the in-memory (network order) words printed
/// as host-order integers; the port is printed in host order.
fn parse_proc_net_line(line: &str) -> Option<SocketAddr> {
    let local = line.split_whitespace().nth(1)?;
    let (ip_hex, port_hex) = local.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match ip_hex.len() {
        8 => {
            let word = u32::from_str_radix(ip_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&ip_hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}
