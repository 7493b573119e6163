//! Protocol implementations.
//!
//! - `frame`: length-prefixed binary framing used by the event loop

pub mod frame;
