//! Listening socket setup and connection acceptance.

use crate::runtime::connection::Connection;
use crate::runtime::registry::ConnectionRegistry;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

/// Token reserved for the listening socket. Slab keys never reach it.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Outcome of a single accept attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A connection was accepted and registered under this slot key.
    Accepted(usize),
    /// A connection was accepted but dropped (registry full or not
    /// registrable). More may be pending.
    Rejected,
    /// Nothing pending.
    Drained,
    /// Accept failed; logged, not fatal.
    Failed,
}

/// The listening socket, registered for readability.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Wrap an already bound and listening socket, forcing non-blocking mode.
    pub fn new(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            inner: TcpListener::from_std(listener),
        })
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.inner, LISTENER_TOKEN, Interest::READABLE)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept at most one pending connection.
    ///
    /// The accepted socket is non-blocking (mio sets it on accept). It enters
    /// the registry in Request state with empty buffers and is registered for
    /// readability under its slot key. No failure here is fatal.
    pub fn accept_one(
        &self,
        registry: &Registry,
        connections: &mut ConnectionRegistry<TcpStream>,
    ) -> AcceptOutcome {
        let (stream, peer) = loop {
            match self.inner.accept() {
                Ok(accepted) => break accepted,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return AcceptOutcome::Drained;
                }
                Err(e) => {
                    warn!(error = %e, "accept() error");
                    return AcceptOutcome::Failed;
                }
            }
        };

        let handle = stream.as_raw_fd();
        let key = match connections.insert(Connection::new(handle, stream)) {
            Ok(key) => key,
            Err(_) => {
                warn!(
                    conn = handle,
                    peer = %peer,
                    limit = connections.capacity(),
                    "Connection limit reached"
                );
                return AcceptOutcome::Rejected;
            }
        };

        let registered = match connections.get_mut(key) {
            Some(conn) => registry.register(conn.stream_mut(), Token(key), Interest::READABLE),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "connection not found")),
        };
        if let Err(e) = registered {
            warn!(conn = handle, error = %e, "Failed to register connection");
            connections.remove(key);
            return AcceptOutcome::Rejected;
        }

        debug!(conn = handle, key, peer = %peer, "Accepted connection");
        AcceptOutcome::Accepted(key)
    }
}

/// Create a bound, listening, non-blocking TCP socket with SO_REUSEADDR.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
