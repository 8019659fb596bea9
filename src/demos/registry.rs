//! Registry of live connections for the broadcast demo.
//!
//! Handlers run on many tasks at once, so the slab sits behind a mutex.

use slab::Slab;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tcp_events::{Connection, ConnectionId};

struct Tracked {
    connections: Slab<Connection>,
    keys: HashMap<ConnectionId, usize>,
}

/// Registry of tracked connections using slab allocation.
pub struct ConnectionRegistry {
    tracked: Mutex<Tracked>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            tracked: Mutex::new(Tracked {
                connections: Slab::with_capacity(max_connections),
                keys: HashMap::with_capacity(max_connections),
            }),
            max_connections,
        }
    }

    /// Track a connection.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&self, conn: Connection) -> Option<usize> {
        let mut tracked = self.lock();
        if tracked.connections.len() >= self.max_connections {
            return None;
        }
        let id = conn.id();
        let key = tracked.connections.insert(conn);
        tracked.keys.insert(id, key);
        Some(key)
    }

    /// Stop tracking the connection with the given id.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let mut tracked = self.lock();
        let key = tracked.keys.remove(&id)?;
        tracked.connections.try_remove(key)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    /// Clone out every tracked connection so callers can send without
    /// holding the lock.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.lock()
            .connections
            .iter()
            .map(|(_, conn)| conn.clone())
            .collect()
    }

    /// Remove and return every tracked connection.
    pub fn drain(&self) -> Vec<Connection> {
        let mut tracked = self.lock();
        tracked.keys.clear();
        tracked.connections.drain().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
