//! Raw socket helpers built on socket2 and libc.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

/// Listen backlog for server sockets.
const BACKLOG: i32 = 1024;

/// Create a non-blocking TCP listener.
///
/// `SO_REUSEADDR` is always set so a restarted server can rebind over
/// sockets in TIME_WAIT. `SO_REUSEPORT` is only set when `exclusive` is false.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    exclusive: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_reuse_port(!exclusive)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Whether the socket prevents other sockets from sharing its port.
pub(crate) fn exclusive_address_use(socket: &Socket) -> io::Result<bool> {
    socket.reuse_port().map(|shared| !shared)
}

pub(crate) fn set_exclusive_address_use(socket: &Socket, exclusive: bool) -> io::Result<()> {
    socket.set_reuse_port(!exclusive)
}

/// Bytes received by the kernel and not yet read (`FIONREAD`).
pub(crate) fn available(socket: &Socket) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // FIONREAD writes a single c_int.
    let rc = unsafe {
        libc::ioctl(
            socket.as_raw_fd(),
            libc::FIONREAD,
            &mut count as *mut libc::c_int,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(count.max(0) as usize)
}
