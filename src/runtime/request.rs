//! Request processing for the event loop.
//!
//! Turns the bytes buffered on a connection into at most one reply frame.
//! Works on raw byte slices so the connection state machine can call it
//! straight from its read buffer into its write buffer.

use crate::protocols::frame::{self, Decoded, FrameError};

/// Result of processing a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Need more data to complete a frame.
    NeedData,
    /// One frame processed, reply written to the output buffer.
    Response {
        /// Bytes of the request frame (prefix + payload) to drop from input.
        consumed: usize,
        /// Bytes of the reply frame written to output.
        response_len: usize,
    },
    /// Protocol violation, connection should be closed.
    Error(FrameError),
}

/// Process one echo request from the front of `input`.
///
/// The reply frame carries the request payload unchanged. Only the first
/// complete frame is handled; anything after it stays in `input` for the
/// next call.
pub fn process_echo(input: &[u8], output: &mut [u8]) -> ProcessResult {
    let (payload, consumed) = match frame::decode(input) {
        Ok(Decoded::Frame { payload, consumed }) => (payload, consumed),
        Ok(Decoded::Incomplete) => return ProcessResult::NeedData,
        Err(e) => return ProcessResult::Error(e),
    };

    match frame::encode(payload, output) {
        Ok(response_len) => ProcessResult::Response {
            consumed,
            response_len,
        },
        Err(e) => ProcessResult::Error(e),
    }
}
