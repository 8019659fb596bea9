//! Per-connection event slots.
//!
//! Handlers are installed once by the connection-configuration callback and
//! are read-only afterwards. A slot that was never set holds a no-op closure,
//! so dispatch sites never check for presence.

use super::Connection;
use crate::error::Error;
use bytes::Bytes;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

pub(crate) type AcceptFn = Box<dyn Fn(&Connection) + Send + Sync>;
pub(crate) type ReceiveFn = Box<dyn Fn(&Connection, Bytes) + Send + Sync>;
pub(crate) type CloseFn = Box<dyn Fn(&Connection, bool) + Send + Sync>;
pub(crate) type ErrorFn = Box<dyn Fn(&Connection, &Error) + Send + Sync>;

/// Event handlers for a single connection.
pub struct Handlers {
    pub(crate) accept: AcceptFn,
    pub(crate) receive: ReceiveFn,
    pub(crate) close: CloseFn,
    pub(crate) error: ErrorFn,
}

impl Handlers {
    /// Fired once, during construction, after all handlers are installed.
    pub fn on_accept<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.accept = Box::new(f);
        self
    }

    /// Fired for every completed read with exactly the bytes read.
    pub fn on_receive<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Connection, Bytes) + Send + Sync + 'static,
    {
        self.receive = Box::new(f);
        self
    }

    /// Fired exactly once. The flag is `true` when the peer closed the
    /// connection and `false` when it was closed locally.
    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Connection, bool) + Send + Sync + 'static,
    {
        self.close = Box::new(f);
        self
    }

    /// Fired for recoverable I/O faults and handler panics.
    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Connection, &Error) + Send + Sync + 'static,
    {
        self.error = Box::new(f);
        self
    }
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            accept: Box::new(|_| {}),
            receive: Box::new(|_, _| {}),
            close: Box::new(|_, _| {}),
            error: Box::new(|_, _| {}),
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// Run a caller-supplied closure, turning a panic into `Error::Handler`.
pub(crate) fn guarded<F: FnOnce()>(f: F) -> Result<(), Error> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| Error::Handler(panic_message(&*payload)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
