//! TCP server accepting connections into event-dispatching [`Connection`]s.
//!
//! `start` binds the listener and spawns the accept loop on the current
//! tokio runtime, then returns. Every accepted socket becomes a
//! `Connection` configured by the callback passed to `start`.

use crate::connection::{Connection, Handlers};
use crate::error::{Error, Result};
use crate::socket;
use socket2::{SockRef, Socket};
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

type ConfigureFn = Arc<dyn Fn(&mut Handlers) + Send + Sync>;

/// State held while the accept loop is running.
struct Listening {
    local_addr: SocketAddr,
    /// Duplicate of the listening socket so `stop` can close it without
    /// waiting for the accept loop to be polled.
    socket: Socket,
    closing: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

/// Server instance
pub struct Server {
    endpoint: SocketAddr,
    exclusive_address_use: AtomicBool,
    listening: Mutex<Option<Listening>>,
}

impl Server {
    /// Create a server for the given local endpoint. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(endpoint: SocketAddr) -> Self {
        Server {
            endpoint,
            exclusive_address_use: AtomicBool::new(true),
            listening: Mutex::new(None),
        }
    }

    /// Create a server from an address and a port in 0-65535.
    pub fn from_ip(address: IpAddr, port: u32) -> Result<Self> {
        let port = u16::try_from(port).map_err(|_| Error::PortOutOfRange(port))?;
        Ok(Self::new(SocketAddr::new(address, port)))
    }

    /// Create a server from a textual IP address and a port.
    pub fn parse(address: &str, port: u32) -> Result<Self> {
        let ip: IpAddr = address
            .parse()
            .map_err(|e| Error::InvalidAddress(address.to_string(), e))?;
        Self::from_ip(ip, port)
    }

    /// Bind and start accepting connections.
    ///
    /// `configure` is called once per accepted connection, possibly from
    /// several tasks at once, to install that connection's handlers. Does
    /// nothing if the server is already running.
    pub fn start<F>(&self, configure: F) -> Result<()>
    where
        F: Fn(&mut Handlers) + Send + Sync + 'static,
    {
        let mut listening = lock(&self.listening);
        if listening.is_some() {
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let exclusive = self.exclusive_address_use();
        let std_listener = socket::bind_listener(self.endpoint, exclusive)
            .map_err(|e| Error::Bind(self.endpoint, e))?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|e| Error::Bind(self.endpoint, e))?;
        let socket = SockRef::from(&std_listener)
            .try_clone()
            .map_err(|e| Error::Bind(self.endpoint, e))?;

        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener).map_err(|e| Error::Bind(self.endpoint, e))?
        };

        let closing = Arc::new(AtomicBool::new(false));
        let (shutdown, shutdown_rx) = watch::channel(false);

        runtime.spawn(accept_loop(
            listener,
            Arc::new(configure),
            Arc::clone(&closing),
            shutdown_rx,
        ));

        info!(address = %local_addr, exclusive, "Server listening");

        *listening = Some(Listening {
            local_addr,
            socket,
            closing,
            shutdown,
        });

        Ok(())
    }

    /// Stop accepting connections and close the listener.
    ///
    /// Connections already accepted are left running. Safe to call on a
    /// server that was never started.
    pub fn stop(&self) {
        if let Some(listening) = lock(&self.listening).take() {
            listening.closing.store(true, Ordering::Release);
            // Unhashes the listener and wakes the pending accept
            if let Err(e) = listening.socket.shutdown(Shutdown::Both) {
                debug!(address = %listening.local_addr, error = %e, "Listener shutdown failed");
            }
            let _ = listening.shutdown.send(true);
            info!(address = %listening.local_addr, "Server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.listening).is_some()
    }

    /// Address the listener is bound to, or the configured endpoint when
    /// not running.
    pub fn local_addr(&self) -> SocketAddr {
        lock(&self.listening)
            .as_ref()
            .map_or(self.endpoint, |l| l.local_addr)
    }

    /// Run `f` against the listening socket.
    ///
    /// Fails with `NotConnected` while the server is not running.
    pub fn with_listener<R>(&self, f: impl FnOnce(&Socket) -> R) -> io::Result<R> {
        match lock(&self.listening).as_ref() {
            Some(listening) => Ok(f(&listening.socket)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub fn exclusive_address_use(&self) -> bool {
        self.exclusive_address_use.load(Ordering::Relaxed)
    }

    /// Takes effect the next time the server is started.
    pub fn set_exclusive_address_use(&self, exclusive: bool) {
        self.exclusive_address_use.store(exclusive, Ordering::Relaxed);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.local_addr())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("running", &self.is_running())
            .field("exclusive_address_use", &self.exclusive_address_use())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    configure: ConfigureFn,
    closing: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        if closing.load(Ordering::Acquire) {
            break;
        }

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "New connection");
                if let Err(e) = Connection::new(stream, |handlers| configure(handlers)) {
                    warn!(peer = %peer, error = %e, "Failed to set up connection");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    debug!("Accept loop finished");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
