//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread owns the poll instance, the listener and every connection.
//! The readiness wait is the only call that blocks. mio readiness is
//! edge-triggered, so interest is re-registered whenever a connection flips
//! between Request and Response rather than rebuilt from scratch on every
//! iteration.
//!
//! Edge-triggered readiness is not repeated for work left behind. A
//! connection that yields after one reply is kept on a service list and
//! driven again on the next iteration, which then polls without blocking.
//! Likewise a failed accept leaves the listener marked ready so the backlog
//! is retried on every following iteration.

use crate::config::Config;
use crate::runtime::connection::{ConnState, IoStatus};
use crate::runtime::listener::{AcceptOutcome, Listener, LISTENER_TOKEN};
use crate::runtime::registry::ConnectionRegistry;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Single-threaded readiness loop serving every connection.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: Listener,
    connections: ConnectionRegistry<TcpStream>,
    timeout: Duration,
    /// Slot keys that yielded with work left, in the order they yielded.
    needs_service: Vec<usize>,
    /// Listener may still have queued connections.
    accept_pending: bool,
}

impl EventLoop {
    /// Take ownership of a bound, listening socket and register it.
    pub fn new(listener: std::net::TcpListener, config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = Listener::new(listener)?;
        listener.register(poll.registry())?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity.max(1)),
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            timeout: Duration::from_millis(config.poll_timeout_ms),
            needs_service: Vec::new(),
            accept_pending: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until the readiness wait fails.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            max_connections = self.connections.capacity(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Event loop started"
        );

        loop {
            self.run_once()?;
        }
    }

    /// One iteration: wait for readiness, drive ready connections, reap the
    /// ones that terminated, then accept new connections.
    ///
    /// Connections carried over from the previous iteration are driven
    /// first, then the ones reported ready, each at most once. Only a failed
    /// readiness wait is returned as an error.
    pub fn run_once(&mut self) -> io::Result<()> {
        let timeout = if self.needs_service.is_empty() {
            self.timeout
        } else {
            Duration::ZERO
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let registry = self.poll.registry();
        let mut ready = std::mem::take(&mut self.needs_service);
        let carried = ready.len();

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_pending = true,
                Token(key) => {
                    if !ready[..carried].contains(&key) {
                        ready.push(key);
                    }
                }
            }
        }

        for &key in &ready {
            if dispatch(registry, &mut self.connections, key) == IoStatus::Yielded {
                self.needs_service.push(key);
            }
        }

        if self.accept_pending {
            loop {
                match self.listener.accept_one(registry, &mut self.connections) {
                    AcceptOutcome::Accepted(_) | AcceptOutcome::Rejected => continue,
                    AcceptOutcome::Drained => {
                        self.accept_pending = false;
                        break;
                    }
                    // Still pending; retried next iteration
                    AcceptOutcome::Failed => break,
                }
            }
        }

        Ok(())
    }
}

/// Interest a connection needs in `state`.
///
/// Errors and hang-ups are always reported by mio and surface through the
/// next read or write.
fn interest_for(state: ConnState) -> Option<Interest> {
    match state {
        ConnState::Request => Some(Interest::READABLE),
        ConnState::Response => Some(Interest::WRITABLE),
        ConnState::Terminating(_) => None,
    }
}

/// Drive one ready connection and reap it if it terminated.
///
/// Returns [`IoStatus::Yielded`] only for a live connection that must be
/// driven again without waiting for readiness.
fn dispatch(
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    key: usize,
) -> IoStatus {
    // Already reaped
    let Some(conn) = connections.get_mut(key) else {
        return IoStatus::Parked;
    };

    let before = interest_for(conn.state());
    let status = conn.connection_io();

    let after = interest_for(conn.state());
    match after {
        None => {
            reap(registry, connections, key);
            return IoStatus::Parked;
        }
        Some(interest) if after != before => {
            if let Err(e) = registry.reregister(conn.stream_mut(), Token(key), interest) {
                warn!(conn = conn.handle(), error = %e, "Failed to update interest");
                reap(registry, connections, key);
                return IoStatus::Parked;
            }
        }
        Some(_) => {}
    }

    status
}

/// Deregister and drop a connection, closing its socket.
fn reap(registry: &Registry, connections: &mut ConnectionRegistry<TcpStream>, key: usize) {
    if let Some(mut conn) = connections.remove(key) {
        let _ = registry.deregister(conn.stream_mut());
        match conn.state() {
            ConnState::Terminating(reason) => {
                debug!(conn = conn.handle(), key, reason = %reason, "Connection closed")
            }
            state => debug!(conn = conn.handle(), key, state = ?state, "Connection closed"),
        }
    }
}
