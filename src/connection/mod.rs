//! Event-dispatching wrapper around a single established TCP stream.
//!
//! A `Connection` owns two tasks on the tokio runtime it was created on:
//!
//! - the receive loop, which reads into a fixed buffer sized to the socket's
//!   receive buffer and fires `on_receive` once per completed read, strictly
//!   in order;
//! - the send loop, which drains a queue of outgoing payloads in the order
//!   they were issued.
//!
//! Handlers run inline on those tasks. A slow `on_receive` delays the next
//! read of that connection only.
//!
//! The close sequence is shared by both directions and by local calls. It
//! runs once, guarded by the `closing` flag, and after it starts no further
//! `on_receive` or `on_error` events are dispatched.

mod handlers;

pub use handlers::Handlers;

use crate::error::{is_disconnect, Error, Result};
use crate::socket;
use bytes::Bytes;
use socket2::{SockRef, Socket};
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Receive buffer size used when the socket does not report `SO_RCVBUF`.
const DEFAULT_RECEIVE_BUFFER: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outcome of a queued send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// All bytes were written and the completion callback ran.
    Sent,
    /// The connection was closed before or while writing.
    Closed,
    /// The write failed; `on_error` was fired.
    Failed,
}

type SentFn = Box<dyn FnOnce(SocketAddr) + Send>;

struct SendRequest {
    data: Bytes,
    on_sent: Option<SentFn>,
    done: oneshot::Sender<SendStatus>,
}

/// Pending send returned by [`Connection::send`].
///
/// Dropping the handle does not cancel the send.
#[derive(Debug)]
pub struct SendHandle {
    rx: oneshot::Receiver<SendStatus>,
}

impl Future for SendHandle {
    type Output = SendStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|status| status.unwrap_or(SendStatus::Closed))
    }
}

struct Inner {
    id: ConnectionId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    handlers: Handlers,
    runtime: Handle,
    closing: AtomicBool,
    disposed: AtomicBool,
    /// Duplicate of the stream's socket for option queries and shutdown.
    socket: Mutex<Option<Socket>>,
    sender: Mutex<Option<mpsc::UnboundedSender<SendRequest>>>,
}

/// A single TCP connection dispatching events to its [`Handlers`].
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap an established stream.
    ///
    /// `configure` runs before any event fires, then `on_accept` is
    /// dispatched and the receive loop starts. Must be called from within a
    /// tokio runtime.
    pub fn new<F>(stream: TcpStream, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Handlers),
    {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let socket = SockRef::from(&stream).try_clone()?;

        let mut handlers = Handlers::default();
        configure(&mut handlers);

        let (sender, queue) = mpsc::unbounded_channel();
        let conn = Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                remote_addr,
                local_addr,
                handlers,
                runtime,
                closing: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                socket: Mutex::new(Some(socket)),
                sender: Mutex::new(Some(sender)),
            }),
        };

        debug!(conn = %conn.id(), peer = %remote_addr, "Connection established");

        if let Err(e) = handlers::guarded(|| (conn.inner.handlers.accept)(&conn)) {
            conn.dispatch_error(e);
        }

        let buffer = vec![0u8; receive_buffer_size(&stream)];
        let (reader, writer) = stream.into_split();

        conn.inner
            .runtime
            .spawn(receive_loop(conn.clone(), reader, buffer));
        conn.inner.runtime.spawn(send_loop(conn.clone(), writer, queue));

        Ok(conn)
    }

    /// Connect to `addr` and wrap the resulting stream.
    pub async fn connect<A, F>(addr: A, configure: F) -> Result<Self>
    where
        A: ToSocketAddrs,
        F: FnOnce(&mut Handlers),
    {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, configure)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Peer address captured when the connection was created.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Whether the socket is open and still has a peer.
    pub fn is_connected(&self) -> bool {
        !self.is_closing()
            && lock(&self.inner.socket)
                .as_ref()
                .is_some_and(|s| s.peer_addr().is_ok())
    }

    /// Bytes received by the kernel and not yet read.
    pub fn available(&self) -> io::Result<usize> {
        self.with_socket(socket::available)?
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.with_socket(Socket::nodelay)?
    }

    /// Disable (`true`) or enable Nagle's algorithm.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.with_socket(|s| s.set_nodelay(nodelay))?
    }

    pub fn exclusive_address_use(&self) -> io::Result<bool> {
        self.with_socket(socket::exclusive_address_use)?
    }

    pub fn set_exclusive_address_use(&self, exclusive: bool) -> io::Result<()> {
        self.with_socket(|s| socket::set_exclusive_address_use(s, exclusive))?
    }

    /// File descriptor referring to the underlying socket.
    pub fn raw_fd(&self) -> io::Result<RawFd> {
        self.with_socket(|s| s.as_raw_fd())
    }

    /// Run `f` against the underlying socket.
    ///
    /// Fails with `NotConnected` once the connection has been closed.
    pub fn with_socket<R>(&self, f: impl FnOnce(&Socket) -> R) -> io::Result<R> {
        match lock(&self.inner.socket).as_ref() {
            Some(socket) => Ok(f(socket)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Queue `data` for writing.
    pub fn send<B: Into<Bytes>>(&self, data: B) -> SendHandle {
        self.enqueue(data.into(), None)
    }

    /// Queue `data` for writing; `on_sent` receives the remote address once
    /// every byte has been written.
    pub fn send_with<B, F>(&self, data: B, on_sent: F) -> SendHandle
    where
        B: Into<Bytes>,
        F: FnOnce(SocketAddr) + Send + 'static,
    {
        self.enqueue(data.into(), Some(Box::new(on_sent)))
    }

    /// Queue `message` as UTF-8 bytes.
    pub fn send_text(&self, message: &str) -> SendHandle {
        self.send(Bytes::copy_from_slice(message.as_bytes()))
    }

    pub fn send_text_with<F>(&self, message: &str, on_sent: F) -> SendHandle
    where
        F: FnOnce(SocketAddr) + Send + 'static,
    {
        self.send_with(Bytes::copy_from_slice(message.as_bytes()), on_sent)
    }

    /// Close the connection locally. `on_close` fires with `false`.
    pub fn close(&self) {
        self.close_with(false);
    }

    /// Same as [`close`](Self::close), executed at most once.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            self.close_with(false);
        }
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    fn enqueue(&self, data: Bytes, on_sent: Option<SentFn>) -> SendHandle {
        let (done, rx) = oneshot::channel();
        let request = SendRequest {
            data,
            on_sent,
            done,
        };

        let queued = {
            let sender = lock(&self.inner.sender);
            match sender.as_ref() {
                Some(tx) => tx.send(request).is_ok(),
                None => false,
            }
        };

        if !queued {
            self.close_with(true);
        }

        SendHandle { rx }
    }

    /// Close sequence shared by local and remote closes.
    fn close_with(&self, closed_by_client: bool) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        lock(&self.inner.sender).take();
        if let Some(socket) = lock(&self.inner.socket).take() {
            let _ = socket.shutdown(Shutdown::Both);
        }

        debug!(
            conn = %self.id(),
            peer = %self.remote_addr(),
            closed_by_client,
            "Connection closed"
        );

        if let Err(e) = handlers::guarded(|| (self.inner.handlers.close)(self, closed_by_client)) {
            warn!(conn = %self.id(), error = %e, "Close handler failed");
        }
    }

    fn dispatch_error(&self, error: Error) {
        if self.is_closing() {
            trace!(conn = %self.id(), error = %error, "Error after close suppressed");
            return;
        }

        debug!(conn = %self.id(), error = %error, "Connection error");

        if let Err(e) = handlers::guarded(|| (self.inner.handlers.error)(self, &error)) {
            warn!(conn = %self.id(), error = %e, "Error handler failed");
        }
    }

    fn take_socket_error(&self) -> io::Result<Option<io::Error>> {
        self.with_socket(Socket::take_error)?
    }

    /// Decide whether another read may be issued.
    ///
    /// A fault pending on the socket when the read is issued ends the loop
    /// without re-arming, unlike a fault reported by a completed read.
    fn begin_receive(&self, pending: io::Result<Option<io::Error>>) -> bool {
        if self.is_closing() {
            return false;
        }

        let fault = match pending {
            Ok(None) => return true,
            Ok(Some(e)) | Err(e) => e,
        };

        if is_disconnect(&fault) {
            self.close_with(true);
        } else {
            self.dispatch_error(Error::Io(fault));
        }
        false
    }

    /// Handle a completed read. Returns whether the loop should re-arm.
    fn complete_receive(&self, result: io::Result<usize>, buffer: &[u8]) -> bool {
        if self.is_closing() {
            return false;
        }

        let n = match result {
            Ok(n) => n,
            Err(e) if is_disconnect(&e) => {
                trace!(conn = %self.id(), error = %e, "Read hit disconnect");
                0
            }
            Err(e) => {
                self.dispatch_error(Error::Io(e));
                return true;
            }
        };

        if n == 0 || !self.is_connected() {
            self.close_with(true);
            return false;
        }

        trace!(conn = %self.id(), bytes = n, "Received");

        // The shared buffer is overwritten by the next read
        let data = Bytes::copy_from_slice(&buffer[..n]);

        // A close from another task may have landed since the first check
        if self.is_closing() {
            return false;
        }

        if let Err(e) = handlers::guarded(|| (self.inner.handlers.receive)(self, data)) {
            self.dispatch_error(e);
        }

        true
    }

    async fn complete_send(
        &self,
        writer: &mut OwnedWriteHalf,
        data: Bytes,
        on_sent: Option<SentFn>,
    ) -> SendStatus {
        if self.is_closing() {
            return SendStatus::Closed;
        }

        let result = writer.write_all(&data).await;

        if !self.is_connected() {
            self.close_with(true);
            return SendStatus::Closed;
        }

        match result {
            Ok(()) => {
                trace!(conn = %self.id(), bytes = data.len(), "Sent");
                if let Some(on_sent) = on_sent {
                    let remote = self.remote_addr();
                    if let Err(e) = handlers::guarded(|| on_sent(remote)) {
                        self.dispatch_error(e);
                    }
                }
                SendStatus::Sent
            }
            Err(e) if is_disconnect(&e) => {
                self.close_with(true);
                SendStatus::Closed
            }
            Err(e) => {
                self.dispatch_error(Error::Io(e));
                SendStatus::Failed
            }
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.remote_addr)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("local_addr", &self.inner.local_addr)
            .field("closing", &self.is_closing())
            .finish()
    }
}

async fn receive_loop(conn: Connection, mut reader: OwnedReadHalf, mut buffer: Vec<u8>) {
    while conn.begin_receive(conn.take_socket_error()) {
        let result = reader.read(&mut buffer).await;
        if !conn.complete_receive(result, &buffer) {
            break;
        }
    }
    trace!(conn = %conn.id(), "Receive loop finished");
}

async fn send_loop(
    conn: Connection,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<SendRequest>,
) {
    while let Some(request) = queue.recv().await {
        let status = conn
            .complete_send(&mut writer, request.data, request.on_sent)
            .await;
        let _ = request.done.send(status);
    }
    trace!(conn = %conn.id(), "Send loop finished");
}

fn receive_buffer_size(stream: &TcpStream) -> usize {
    match SockRef::from(stream).recv_buffer_size() {
        Ok(size) if size > 0 => size,
        _ => DEFAULT_RECEIVE_BUFFER,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(200);

    #[derive(Debug, PartialEq)]
    enum Event {
        Accept,
        Receive(Bytes),
        Close(bool),
        Error(String),
    }

    fn recorder(tx: mpsc::UnboundedSender<Event>) -> impl FnOnce(&mut Handlers) {
        move |h| {
            let t = tx.clone();
            h.on_accept(move |_| {
                let _ = t.send(Event::Accept);
            });
            let t = tx.clone();
            h.on_receive(move |_, data| {
                let _ = t.send(Event::Receive(data));
            });
            let t = tx.clone();
            h.on_close(move |_, by_client| {
                let _ = t.send(Event::Close(by_client));
            });
            h.on_error(move |_, e| {
                let _ = tx.send(Event::Error(e.to_string()));
            });
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
        match timeout(QUIET, rx.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(event)) => panic!("unexpected event: {:?}", event),
        }
    }

    /// Collect `len` received bytes, in arrival order.
    async fn collect(rx: &mut mpsc::UnboundedReceiver<Event>, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            match next(rx).await {
                Event::Receive(data) => out.extend_from_slice(&data),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        out
    }

    async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .expect("timed out reading")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_accept_fires_first_with_snapshot() {
        let (client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let conn = Connection::new(server, recorder(tx)).unwrap();

        assert_eq!(next(&mut rx).await, Event::Accept);
        assert_eq!(conn.remote_addr(), client.local_addr().unwrap());
        assert_eq!(conn.local_addr(), client.peer_addr().unwrap());
        assert_eq!(conn.to_string(), client.local_addr().unwrap().to_string());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_configure_runs_before_accept() {
        let (_client, server) = pair().await;
        let seen = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&seen);
        let _conn = Connection::new(server, move |h| {
            h.on_accept(move |conn| {
                assert!(conn.is_connected());
                s.fetch_add(1, Ordering::SeqCst);
            });
        })
        .unwrap();

        // on_accept runs synchronously inside construction
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_reassembles_stream() {
        let (mut client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(7_919) {
            client.write_all(chunk).await.unwrap();
        }

        let received = collect(&mut rx, payload.len()).await;
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_remote_close() {
        let (client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        drop(client);

        assert_eq!(next(&mut rx).await, Event::Close(true));
        assert!(!conn.is_connected());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_local_close_is_idempotent() {
        let (mut client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        conn.close();
        assert_eq!(next(&mut rx).await, Event::Close(false));

        conn.close();
        conn.dispose();
        conn.dispose();

        // Peer sees EOF, and nothing it sends is delivered
        let mut buf = [0u8; 16];
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        let _ = client.write_all(b"late").await;

        assert!(!conn.is_connected());
        assert_err!(conn.nodelay());
        assert_err!(conn.available());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_dispose_closes_once() {
        let (_client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        conn.dispose();
        conn.dispose();
        conn.close();

        assert_eq!(next(&mut rx).await, Event::Close(false));
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_send_invokes_completion() {
        let (mut client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        let (sent_tx, sent_rx) = oneshot::channel();
        let status = conn
            .send_with(&b"hello"[..], move |addr| {
                let _ = sent_tx.send(addr);
            })
            .await;

        assert_eq!(status, SendStatus::Sent);
        assert_eq!(sent_rx.await.unwrap(), client.local_addr().unwrap());
        assert_eq!(read_exact(&mut client, 5).await, b"hello");
    }

    #[tokio::test]
    async fn test_send_text_encodes_utf8() {
        let (mut client, server) = pair().await;
        let conn = Connection::new(server, |_| {}).unwrap();

        let message = "héllo wörld";
        assert_eq!(conn.send_text(message).await, SendStatus::Sent);
        assert_eq!(
            read_exact(&mut client, message.len()).await,
            message.as_bytes()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sends_keep_issue_order() {
        let (mut client, server) = pair().await;
        let conn = Connection::new(server, |_| {}).unwrap();

        let mut expected = Vec::new();
        let mut handles = Vec::new();
        for i in 0..200u32 {
            let chunk = i.to_be_bytes().to_vec();
            expected.extend_from_slice(&chunk);
            handles.push(conn.send(chunk));
        }
        for handle in handles {
            assert_eq!(handle.await, SendStatus::Sent);
        }

        assert_eq!(read_exact(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_send_after_peer_disconnect_closes() {
        let (client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        drop(client);
        assert_eq!(next(&mut rx).await, Event::Close(true));

        let called = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&called);
        let status = conn
            .send_with(&b"anyone?"[..], move |_| c.store(true, Ordering::SeqCst))
            .await;

        assert_eq!(status, SendStatus::Closed);
        assert!(!called.load(Ordering::SeqCst));
        assert_quiet(&mut rx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_to_reset_peer_closes() {
        let (mut client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        // Park the receive loop in its handler so only the send path can
        // observe the reset
        let conn = Connection::new(server, move |h| {
            h.on_receive(move |_, _| {
                let _ = entered_tx.send(());
                let _ = lock(&release_rx).recv_timeout(WAIT);
            });
            h.on_close(move |_, by_client| {
                let _ = tx.send(Event::Close(by_client));
            });
        })
        .unwrap();

        client.write_all(b"x").await.unwrap();
        timeout(WAIT, entered_rx.recv()).await.unwrap().unwrap();

        SockRef::from(&client).set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&sent);
                conn.send_with(&b"late"[..], move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await, SendStatus::Closed);
        }

        assert_eq!(next(&mut rx).await, Event::Close(true));
        assert_eq!(sent.load(Ordering::SeqCst), 0);
        assert!(!conn.is_connected());

        let _ = release_tx.send(());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_receive_after_close_is_dropped() {
        let (_client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        conn.close();
        assert_eq!(next(&mut rx).await, Event::Close(false));

        // A read that completes after the close is not delivered
        assert!(!conn.complete_receive(Ok(3), b"abc"));
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_raw_fd() {
        let (_client, server) = pair().await;
        let conn = Connection::new(server, |_| {}).unwrap();

        let fd = assert_ok!(conn.raw_fd());
        assert!(fd >= 0);
        assert_eq!(conn.raw_fd().unwrap(), fd);

        conn.close();
        assert_err!(conn.raw_fd());
    }

    #[tokio::test]
    async fn test_send_after_local_close() {
        let (_client, server) = pair().await;
        let conn = Connection::new(server, |_| {}).unwrap();

        conn.close();
        assert_eq!(conn.send(&b"x"[..]).await, SendStatus::Closed);
    }

    #[tokio::test]
    async fn test_receive_handler_panic_keeps_loop_running() {
        let (mut client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = Arc::new(AtomicBool::new(true));

        let _conn = Connection::new(server, move |h| {
            let t = tx.clone();
            h.on_receive(move |_, data| {
                if first.swap(false, Ordering::SeqCst) {
                    panic!("handler fault");
                }
                let _ = t.send(Event::Receive(data));
            });
            h.on_error(move |_, e| {
                let _ = tx.send(Event::Error(e.to_string()));
            });
        })
        .unwrap();

        client.write_all(b"first").await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            Event::Error("Handler panicked: handler fault".to_string())
        );

        client.write_all(b"second").await.unwrap();
        assert_eq!(collect(&mut rx, 6).await, b"second");
    }

    #[tokio::test]
    async fn test_read_fault_asymmetry() {
        let (_client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        // A fault reported by a completed read re-arms the loop
        let fault = io::Error::new(io::ErrorKind::Other, "completion fault");
        assert!(conn.complete_receive(Err(fault), &[]));
        assert!(
            matches!(next(&mut rx).await, Event::Error(msg) if msg.contains("completion fault"))
        );

        // A fault found when issuing the read does not
        let fault = io::Error::new(io::ErrorKind::Other, "issue fault");
        assert!(!conn.begin_receive(Ok(Some(fault))));
        assert!(matches!(next(&mut rx).await, Event::Error(msg) if msg.contains("issue fault")));

        // Neither path closes the connection
        assert!(conn.is_connected());
        assert!(conn.begin_receive(Ok(None)));
    }

    #[tokio::test]
    async fn test_issue_time_disconnect_closes() {
        let (_client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(server, recorder(tx)).unwrap();
        assert_eq!(next(&mut rx).await, Event::Accept);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(!conn.begin_receive(Ok(Some(reset))));
        assert_eq!(next(&mut rx).await, Event::Close(true));
    }

    #[tokio::test]
    async fn test_socket_options() {
        let (_client, server) = pair().await;
        let conn = Connection::new(server, |_| {}).unwrap();

        assert_ok!(conn.set_nodelay(true));
        assert!(conn.nodelay().unwrap());
        assert_ok!(conn.set_nodelay(false));
        assert!(!conn.nodelay().unwrap());

        assert_ok!(conn.set_exclusive_address_use(false));
        assert!(!conn.exclusive_address_use().unwrap());
        assert_ok!(conn.set_exclusive_address_use(true));
        assert!(conn.exclusive_address_use().unwrap());

        assert_eq!(assert_ok!(conn.available()), 0);
        assert!(conn.with_socket(|s| s.peer_addr().is_ok()).unwrap());
    }

    #[tokio::test]
    async fn test_connect_client_side() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let conn = Connection::connect(addr, recorder(tx)).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        assert_eq!(next(&mut rx).await, Event::Accept);
        assert_eq!(conn.remote_addr(), addr);

        peer.write_all(b"ping").await.unwrap();
        assert_eq!(collect(&mut rx, 4).await, b"ping");
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let (_c1, s1) = pair().await;
        let (_c2, s2) = pair().await;
        let a = Connection::new(s1, |_| {}).unwrap();
        let b = Connection::new(s2, |_| {}).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert!(a.id().to_string().starts_with("conn-"));
    }
}
