//! framed-echo: a single-threaded, readiness-driven TCP echo server.
//!
//! Clients send length-prefixed frames (4-byte little-endian length followed
//! by that many payload bytes, at most 4096) and receive the same frame back.
//! Many connections are multiplexed on one thread with non-blocking sockets.

pub mod config;
pub mod protocols;
pub mod runtime;
