//! Frame codec.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted or produced, in either direction.
pub const MAX_PAYLOAD: usize = 4096;

/// Bytes needed to hold one maximal frame.
pub const FRAME_CAPACITY: usize = HEADER_LEN + MAX_PAYLOAD;

/// Codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The length prefix (or payload to encode) exceeds [`MAX_PAYLOAD`].
    #[error("payload too large ({len} bytes, max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// The destination cannot hold the encoded frame.
    #[error("buffer too small ({needed} bytes needed, {available} available)")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Result of decoding the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A full frame is buffered.
    Frame {
        /// The payload bytes, borrowed from the input.
        payload: &'a [u8],
        /// Bytes the frame occupies (prefix + payload).
        consumed: usize,
    },
    /// More bytes are needed before a frame can be extracted.
    Incomplete,
}

/// Decode one frame from the front of `input`.
///
/// Fewer than `HEADER_LEN + length` buffered bytes is `Incomplete`, not an
/// error. The length bound is checked as soon as the prefix is readable, so an
/// oversized frame is rejected without waiting for its payload.
pub fn decode(input: &[u8]) -> Result<Decoded<'_>, FrameError> {
    if input.len() < HEADER_LEN {
        return Ok(Decoded::Incomplete);
    }

    let len = (&input[..HEADER_LEN]).get_u32_le() as usize;
    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD,
        });
    }

    let consumed = HEADER_LEN + len;
    if input.len() < consumed {
        return Ok(Decoded::Incomplete);
    }

    Ok(Decoded::Frame {
        payload: &input[HEADER_LEN..consumed],
        consumed,
    })
}

/// Encode `payload` as a frame at the start of `output`.
///
/// Returns the number of bytes written. Prefix and payload are written
/// contiguously.
pub fn encode(payload: &[u8], output: &mut [u8]) -> Result<usize, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let needed = HEADER_LEN + payload.len();
    if output.len() < needed {
        return Err(FrameError::BufferTooSmall {
            needed,
            available: output.len(),
        });
    }

    let mut dst = &mut output[..needed];
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(needed)
}
