//! Caller-owned registry of connections.
//!
//! There is no global state: the registry is an ordinary value owned by
//! the application, mapping opaque handles to their managers, and it
//! drives all of them from one place.
use std::collections::HashMap;
use std::time::Instant;

use crate::sio::SocketManager;

/// Opaque handle to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

/// Maps connection handles to their managers.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: u64,
    connections: HashMap<u64, SocketManager>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    pub fn insert(&mut self, manager: SocketManager) -> ConnectionHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(id, manager);
        ConnectionHandle(id)
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&SocketManager> {
        self.connections.get(&handle.0)
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut SocketManager> {
        self.connections.get_mut(&handle.0)
    }

    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<SocketManager> {
        self.connections.remove(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drive every registered connection one pump cycle.
    pub fn tick_all(&mut self, now: Instant) {
        for manager in self.connections.values_mut() {
            manager.tick(now);
        }
    }
}
