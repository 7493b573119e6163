//! Length-prefixed frame protocol.
//!
//! Every message on the wire is a frame:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ Length (4B LE)   │ Payload (Length bytes)       │
//! └──────────────────┴──────────────────────────────┘
//!
//! Example:
//! Request:  05 00 00 00 68 65 6c 6c 6f    ("hello")
//! Response: 05 00 00 00 68 65 6c 6c 6f
//! ```
//!
//! `Length` must not exceed [`MAX_PAYLOAD`]. A larger prefix is a protocol
//! violation and the connection is closed without a reply. There is no close
//! frame; the peer ends the session by closing the TCP connection.

pub mod parser;

pub use parser::{decode, encode, Decoded, FrameError, FRAME_CAPACITY, HEADER_LEN, MAX_PAYLOAD};
