//! Custom runtime for readiness-driven networking.
//!
//! Uses mio (epoll on Linux, kqueue on macOS) on a single thread:
//! - `EventLoop`: readiness wait and dispatch
//! - `Listener`: accepts connections into the registry
//! - `Connection`: per-connection request/response state machine
//! - `ConnectionRegistry`: owner of every live connection

mod buffer;
pub mod connection;
pub mod event_loop;
pub mod listener;
pub mod registry;
pub mod request;

pub use buffer::{ReadBuffer, WriteBuffer};
pub use connection::{CloseReason, ConnState, Connection, IoStatus};
pub use event_loop::EventLoop;
pub use listener::{create_listener, AcceptOutcome, Listener, LISTENER_TOKEN};
pub use registry::ConnectionRegistry;
pub use request::{process_echo, ProcessResult};

use crate::config::Config;
use std::io;
use std::net::SocketAddr;

/// Bind the configured address and serve until a fatal error.
///
/// Socket creation, bind, listen and readiness-wait failures are returned;
/// nothing else stops the loop.
pub fn run(config: &Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let listener = create_listener(addr, config.backlog)?;
    let mut event_loop = EventLoop::new(listener, config)?;
    event_loop.run()
}
