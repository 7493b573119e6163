//! framed-echo: a length-prefixed echo server
//!
//! Features:
//! - Single-threaded mio event loop (epoll/kqueue)
//! - Non-blocking accept, read and write with partial I/O handling
//! - Frames up to 4096 bytes, oversized frames close the connection
//! - Configuration via CLI arguments or TOML file

use framed_echo::config::Config;
use framed_echo::protocols::frame::MAX_PAYLOAD;
use framed_echo::runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        max_connections = config.max_connections,
        poll_timeout_ms = config.poll_timeout_ms,
        max_payload = MAX_PAYLOAD,
        "Starting framed-echo server"
    );

    if let Err(e) = runtime::run(&config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }
    Ok(())
}
