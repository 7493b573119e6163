//! Registry of live connections.
//!
//! Connections live in a slab; the slot key doubles as the mio token. A
//! separate map indexes slots by OS socket handle, so handle values can be
//! sparse or large without growing the slot table.

use crate::runtime::connection::Connection;
use slab::Slab;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. The registry is the
/// sole owner of every connection; removing an entry hands it back to the
/// caller, and dropping it closes the socket and frees its buffers.
#[derive(Debug)]
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    by_handle: HashMap<RawFd, usize>,
    max_connections: usize,
}

impl<S: Read + Write> ConnectionRegistry<S> {
    /// Create a new registry with the given maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            by_handle: HashMap::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the slot key, or gives the connection back if the registry is
    /// at capacity or its handle is already registered.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.connections.len() >= self.max_connections
            || self.by_handle.contains_key(&conn.handle())
        {
            return Err(conn);
        }
        let handle = conn.handle();
        let key = self.connections.insert(conn);
        self.by_handle.insert(handle, key);
        Ok(key)
    }

    /// Get a mutable reference to a connection by slot key.
    pub fn get_mut(&mut self, key: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(key)
    }

    /// Slot key of the connection owning `handle`.
    pub fn key_of(&self, handle: RawFd) -> Option<usize> {
        self.by_handle.get(&handle).copied()
    }

    /// Look up a connection by its socket handle.
    pub fn get_by_handle(&self, handle: RawFd) -> Option<&Connection<S>> {
        self.key_of(handle).and_then(|key| self.connections.get(key))
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, key: usize) -> Option<Connection<S>> {
        let conn = self.connections.try_remove(key)?;
        self.by_handle.remove(&conn.handle());
        Some(conn)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
