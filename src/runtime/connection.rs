//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its stream, a read buffer and a write buffer, and
//! moves between three states:
//!
//! ```text
//!             frame parsed, reply queued
//!   Request ─────────────────────────────▶ Response
//!      ▲                                      │
//!      └──────────── reply fully sent ────────┘
//!
//!   Request | Response ── EOF / I/O error / oversized frame ──▶ Terminating
//! ```
//!
//! Only one frame is in flight per connection: the next buffered frame is not
//! parsed until the reply to the current one has been flushed.

use crate::protocols::frame::{FrameError, FRAME_CAPACITY, HEADER_LEN};
use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use crate::runtime::request::{process_echo, ProcessResult};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use tracing::{info, warn};

/// Why a connection stopped being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed with no bytes pending.
    PeerClosed,
    /// Peer closed in the middle of a frame.
    Truncated,
    /// Peer violated the framing protocol.
    Protocol(FrameError),
    /// Read failed with something other than would-block.
    ReadFailed(io::ErrorKind),
    /// Write failed with something other than would-block.
    WriteFailed(io::ErrorKind),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed connection"),
            CloseReason::Truncated => write!(f, "peer closed connection mid-frame"),
            CloseReason::Protocol(e) => write!(f, "protocol violation: {}", e),
            CloseReason::ReadFailed(kind) => write!(f, "read failed: {}", kind),
            CloseReason::WriteFailed(kind) => write!(f, "write failed: {}", kind),
        }
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating bytes until a full frame is buffered.
    Request,
    /// Flushing the queued reply.
    Response,
    /// Final; the connection is reaped by the event loop.
    Terminating(CloseReason),
}

/// How a call to [`Connection::connection_io`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Waiting on the next readiness event, or terminating.
    Parked,
    /// A reply went out and more input may already be available.
    Yielded,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// OS socket handle, unique while the connection is open.
    handle: RawFd,
    stream: S,
    state: ConnState,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the initial Request state with empty
    /// buffers. `stream` must already be non-blocking.
    pub fn new(handle: RawFd, stream: S) -> Self {
        Self {
            handle,
            stream,
            state: ConnState::Request,
            read_buf: ReadBuffer::new(FRAME_CAPACITY),
            write_buf: WriteBuffer::new(FRAME_CAPACITY),
        }
    }

    pub fn handle(&self) -> RawFd {
        self.handle
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self.state, ConnState::Terminating(_))
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Drive the connection after a readiness notification.
    ///
    /// Does at most one request/response cycle: a freshly queued reply is
    /// flushed right away, but once a reply is fully sent the call yields
    /// instead of parsing the next buffered frame or reading again. A
    /// [`IoStatus::Yielded`] connection has work left that no new readiness
    /// event will announce, so the caller must drive it again.
    pub fn connection_io(&mut self) -> IoStatus {
        loop {
            match self.state {
                ConnState::Request => {
                    if !self.try_fill_buffer() {
                        return IoStatus::Parked;
                    }
                }
                ConnState::Response => {
                    return if self.try_flush_buffer() {
                        IoStatus::Yielded
                    } else {
                        IoStatus::Parked
                    };
                }
                ConnState::Terminating(_) => {
                    warn!(conn = self.handle, "I/O dispatched to terminating connection");
                    return IoStatus::Parked;
                }
            }
        }
    }

    /// Read until a reply is queued, the read would block, or the connection
    /// terminates.
    ///
    /// Returns `true` if the connection moved to Response.
    fn try_fill_buffer(&mut self) -> bool {
        // A frame may already be buffered behind the one just answered.
        if self.try_one_request() {
            return true;
        }

        while self.state == ConnState::Request {
            let spare = self.read_buf.spare_mut();
            if spare.is_empty() {
                // Unreachable: a full buffer always holds a complete frame.
                return false;
            }

            match self.stream.read(spare) {
                Ok(0) => {
                    self.on_eof();
                    return false;
                }
                Ok(n) => {
                    self.read_buf.advance(n);
                    if self.try_one_request() {
                        return true;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    warn!(conn = self.handle, error = %e, "read() error");
                    self.terminate(CloseReason::ReadFailed(e.kind()));
                    return false;
                }
            }
        }

        false
    }

    /// Parse one frame from the read buffer and queue its reply.
    ///
    /// Returns `true` if the connection moved to Response.
    fn try_one_request(&mut self) -> bool {
        match process_echo(self.read_buf.filled(), self.write_buf.reply_mut()) {
            ProcessResult::NeedData => false,
            ProcessResult::Response {
                consumed,
                response_len,
            } => {
                let payload = &self.read_buf.filled()[HEADER_LEN..consumed];
                info!(
                    conn = self.handle,
                    len = payload.len(),
                    payload = %String::from_utf8_lossy(payload),
                    "client says"
                );

                self.read_buf.consume(consumed);
                self.start_response(response_len);
                true
            }
            ProcessResult::Error(e) => {
                warn!(conn = self.handle, error = %e, "protocol violation");
                self.terminate(CloseReason::Protocol(e));
                false
            }
        }
    }

    /// Write until the reply is drained, the write would block, or the
    /// connection terminates.
    ///
    /// Returns `true` if the connection moved back to Request.
    fn try_flush_buffer(&mut self) -> bool {
        loop {
            if self.write_buf.is_drained() {
                self.start_request();
                return true;
            }

            match self.stream.write(self.write_buf.pending()) {
                Ok(0) => {
                    warn!(conn = self.handle, "write() returned 0");
                    self.terminate(CloseReason::WriteFailed(io::ErrorKind::WriteZero));
                    return false;
                }
                Ok(n) => self.write_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    warn!(conn = self.handle, error = %e, "write() error");
                    self.terminate(CloseReason::WriteFailed(e.kind()));
                    return false;
                }
            }
        }
    }

    fn on_eof(&mut self) {
        if self.read_buf.is_empty() {
            info!(conn = self.handle, "Peer closed connection");
            self.terminate(CloseReason::PeerClosed);
        } else {
            warn!(
                conn = self.handle,
                pending = self.read_buf.len(),
                "Peer closed connection mid-frame"
            );
            self.terminate(CloseReason::Truncated);
        }
    }

    /// Transition Request -> Response with `len` reply bytes queued.
    fn start_response(&mut self, len: usize) {
        debug_assert_eq!(self.state, ConnState::Request);
        self.write_buf.set_len(len);
        self.state = ConnState::Response;
    }

    /// Transition Response -> Request once the reply is drained.
    fn start_request(&mut self) {
        debug_assert_eq!(self.state, ConnState::Response);
        self.write_buf.clear();
        self.state = ConnState::Request;
    }

    /// Mark the connection for reaping. The first reason recorded wins.
    fn terminate(&mut self, reason: CloseReason) {
        if !self.is_terminating() {
            self.state = ConnState::Terminating(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::frame::{self, MAX_PAYLOAD};
    use std::collections::VecDeque;

    /// One scripted outcome for a `read` call.
    #[derive(Debug)]
    pub enum ReadStep {
        Data(Vec<u8>),
        WouldBlock,
        Interrupted,
        Eof,
        Fail(io::ErrorKind),
    }

    /// One scripted outcome for a `write` call.
    #[derive(Debug)]
    pub enum WriteStep {
        /// Accept at most this many bytes.
        Accept(usize),
        WouldBlock,
        Interrupted,
        Fail(io::ErrorKind),
    }

    /// In-memory stream with scripted short reads and writes.
    ///
    /// An exhausted read script would-block; an exhausted write script
    /// accepts everything.
    #[derive(Debug, Default)]
    pub struct MockStream {
        pub reads: VecDeque<ReadStep>,
        pub writes: VecDeque<WriteStep>,
        pub written: Vec<u8>,
    }

    impl MockStream {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn then_read(mut self, step: ReadStep) -> Self {
            self.reads.push_back(step);
            self
        }

        pub fn then_write(mut self, step: WriteStep) -> Self {
            self.writes.push_back(step);
            self
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None | Some(ReadStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
                Some(ReadStep::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
                Some(ReadStep::Fail(kind)) => Err(kind.into()),
                Some(ReadStep::Eof) => {
                    self.reads.push_front(ReadStep::Eof);
                    Ok(0)
                }
                Some(ReadStep::Data(mut data)) => {
                    let n = buf.len().min(data.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(ReadStep::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.writes.pop_front() {
                None => {
                    self.written.extend_from_slice(buf);
                    Ok(buf.len())
                }
                Some(WriteStep::Accept(limit)) => {
                    let n = buf.len().min(limit);
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(WriteStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
                Some(WriteStep::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
                Some(WriteStep::Fail(kind)) => Err(kind.into()),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; FRAME_CAPACITY];
        let n = frame::encode(payload, &mut out).unwrap();
        out.truncate(n);
        out
    }

    fn conn(stream: MockStream) -> Connection<MockStream> {
        Connection::new(7, stream)
    }

    #[test]
    fn test_single_frame_round_trip() {
        let mut c = conn(MockStream::new().then_read(ReadStep::Data(frame_bytes(b"hello"))));

        assert_eq!(c.connection_io(), IoStatus::Yielded);

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream.written, frame_bytes(b"hello"));
        assert!(c.read_buf.is_empty());
        assert_eq!(c.write_buf.len(), 0);
        assert_eq!(c.write_buf.sent(), 0);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let mut c = conn(MockStream::new().then_read(ReadStep::Data(vec![0, 0, 0, 0])));
        c.connection_io();
        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream.written, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_max_payload_round_trip() {
        let payload: Vec<u8> = (0..MAX_PAYLOAD).map(|i| (i % 251) as u8).collect();
        let mut c = conn(MockStream::new().then_read(ReadStep::Data(frame_bytes(&payload))));
        c.connection_io();
        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream.written, frame_bytes(&payload));
    }

    #[test]
    fn test_oversized_frame_terminates_without_reply() {
        let mut input = ((MAX_PAYLOAD + 1) as u32).to_le_bytes().to_vec();
        input.extend_from_slice(b"xyz");
        let mut c = conn(MockStream::new().then_read(ReadStep::Data(input)));

        c.connection_io();

        assert_eq!(
            c.state(),
            ConnState::Terminating(CloseReason::Protocol(FrameError::PayloadTooLarge {
                len: MAX_PAYLOAD + 1,
                max: MAX_PAYLOAD
            }))
        );
        assert!(c.stream.written.is_empty());
    }

    #[test]
    fn test_fragmented_frame_reassembly() {
        let stream = MockStream::new()
            .then_read(ReadStep::Data(vec![5, 0]))
            .then_read(ReadStep::WouldBlock)
            .then_read(ReadStep::Data(vec![0]))
            .then_read(ReadStep::WouldBlock)
            .then_read(ReadStep::Data(vec![0, b'h']))
            .then_read(ReadStep::WouldBlock)
            .then_read(ReadStep::Data(b"el".to_vec()))
            .then_read(ReadStep::WouldBlock)
            .then_read(ReadStep::Data(b"lo".to_vec()));
        let mut c = conn(stream);

        for expected in [2, 3, 5, 7] {
            c.connection_io();
            assert_eq!(c.state(), ConnState::Request);
            assert_eq!(c.read_buf.len(), expected);
            assert!(c.stream.written.is_empty());
        }

        c.connection_io();
        assert_eq!(c.state(), ConnState::Request);
        assert!(c.read_buf.is_empty());
        assert_eq!(c.stream.written, frame_bytes(b"hello"));
    }

    #[test]
    fn test_back_to_back_frames_answered_in_order() {
        let mut input = frame_bytes(b"first");
        input.extend_from_slice(&frame_bytes(b"second"));
        let mut c = conn(MockStream::new().then_read(ReadStep::Data(input)));

        // One reply per call; the second frame waits in the read buffer
        assert_eq!(c.connection_io(), IoStatus::Yielded);
        assert_eq!(c.stream.written, frame_bytes(b"first"));
        assert_eq!(c.read_buf.filled(), &frame_bytes(b"second")[..]);

        assert_eq!(c.connection_io(), IoStatus::Yielded);
        let mut expected = frame_bytes(b"first");
        expected.extend_from_slice(&frame_bytes(b"second"));
        assert_eq!(c.stream.written, expected);
        assert_eq!(c.state(), ConnState::Request);
        assert!(c.read_buf.is_empty());

        assert_eq!(c.connection_io(), IoStatus::Parked);
        assert_eq!(c.stream.written, expected);
    }

    #[test]
    fn test_pipelined_flood_answers_one_frame_per_call() {
        let mut input = Vec::new();
        for i in 0..100u8 {
            input.extend_from_slice(&frame_bytes(&[i]));
        }
        let mut c = conn(MockStream::new().then_read(ReadStep::Data(input)));

        for i in 0..100u8 {
            assert_eq!(c.connection_io(), IoStatus::Yielded);
            assert_eq!(c.stream.written.len(), (i as usize + 1) * (HEADER_LEN + 1));
            assert_eq!(c.stream.written[c.stream.written.len() - 1], i);
        }
        assert_eq!(c.connection_io(), IoStatus::Parked);
        assert_eq!(c.state(), ConnState::Request);
    }

    #[test]
    fn test_next_frame_waits_for_flush() {
        let mut input = frame_bytes(b"one");
        input.extend_from_slice(&frame_bytes(b"two"));
        let stream = MockStream::new()
            .then_read(ReadStep::Data(input))
            .then_write(WriteStep::WouldBlock);
        let mut c = conn(stream);

        assert_eq!(c.connection_io(), IoStatus::Parked);

        // First reply stuck; second frame still buffered and unparsed.
        assert_eq!(c.state(), ConnState::Response);
        assert!(c.stream.written.is_empty());
        assert_eq!(c.read_buf.filled(), &frame_bytes(b"two")[..]);
        assert_eq!(c.write_buf.pending(), &frame_bytes(b"one")[..]);

        assert_eq!(c.connection_io(), IoStatus::Yielded);
        assert_eq!(c.stream.written, frame_bytes(b"one"));
        assert_eq!(c.read_buf.filled(), &frame_bytes(b"two")[..]);

        assert_eq!(c.connection_io(), IoStatus::Yielded);
        let mut expected = frame_bytes(b"one");
        expected.extend_from_slice(&frame_bytes(b"two"));
        assert_eq!(c.stream.written, expected);
        assert_eq!(c.state(), ConnState::Request);
    }

    #[test]
    fn test_slow_consumer_partial_writes() {
        let reply = frame_bytes(b"slow");
        let mut stream = MockStream::new().then_read(ReadStep::Data(reply.clone()));
        for _ in 0..reply.len() {
            stream = stream.then_write(WriteStep::Accept(1)).then_write(WriteStep::WouldBlock);
        }
        let mut c = conn(stream);

        for sent in 1..reply.len() {
            c.connection_io();
            assert_eq!(c.state(), ConnState::Response);
            assert_eq!(c.write_buf.sent(), sent);
            assert_eq!(c.stream.written, &reply[..sent]);
        }

        // Last byte goes out; WouldBlock is left unconsumed behind it.
        c.connection_io();
        assert_eq!(c.stream.written, reply);
        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.write_buf.len(), 0);
        assert_eq!(c.write_buf.sent(), 0);
    }

    #[test]
    fn test_interrupted_io_is_retried() {
        let stream = MockStream::new()
            .then_read(ReadStep::Interrupted)
            .then_read(ReadStep::Data(frame_bytes(b"again")))
            .then_write(WriteStep::Interrupted);
        let mut c = conn(stream);

        c.connection_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream.written, frame_bytes(b"again"));
    }

    #[test]
    fn test_would_block_leaves_state_unchanged() {
        let mut c = conn(MockStream::new().then_read(ReadStep::WouldBlock));
        c.connection_io();
        assert_eq!(c.state(), ConnState::Request);
        assert!(c.read_buf.is_empty());
    }

    #[test]
    fn test_clean_close() {
        let mut c = conn(MockStream::new().then_read(ReadStep::Eof));
        c.connection_io();
        assert_eq!(c.state(), ConnState::Terminating(CloseReason::PeerClosed));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::PeerClosed.to_string(), "peer closed connection");
        assert_eq!(
            CloseReason::Truncated.to_string(),
            "peer closed connection mid-frame"
        );
        assert!(CloseReason::WriteFailed(io::ErrorKind::BrokenPipe)
            .to_string()
            .starts_with("write failed"));
    }

    #[test]
    fn test_close_after_complete_frame_is_clean() {
        let stream = MockStream::new()
            .then_read(ReadStep::Data(frame_bytes(b"bye")))
            .then_read(ReadStep::Eof);
        let mut c = conn(stream);

        assert_eq!(c.connection_io(), IoStatus::Yielded);
        assert_eq!(c.stream.written, frame_bytes(b"bye"));

        assert_eq!(c.connection_io(), IoStatus::Parked);
        assert_eq!(c.state(), ConnState::Terminating(CloseReason::PeerClosed));
    }

    #[test]
    fn test_close_mid_frame_is_truncation() {
        let stream = MockStream::new()
            .then_read(ReadStep::Data(vec![5, 0, 0, 0, b'h']))
            .then_read(ReadStep::Eof);
        let mut c = conn(stream);

        c.connection_io();

        assert_eq!(c.state(), ConnState::Terminating(CloseReason::Truncated));
        assert!(c.stream.written.is_empty());
    }

    #[test]
    fn test_read_error_terminates() {
        let stream = MockStream::new().then_read(ReadStep::Fail(io::ErrorKind::ConnectionReset));
        let mut c = conn(stream);
        c.connection_io();
        assert_eq!(
            c.state(),
            ConnState::Terminating(CloseReason::ReadFailed(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_write_error_terminates() {
        let stream = MockStream::new()
            .then_read(ReadStep::Data(frame_bytes(b"x")))
            .then_write(WriteStep::Accept(2))
            .then_write(WriteStep::Fail(io::ErrorKind::BrokenPipe));
        let mut c = conn(stream);

        c.connection_io();

        assert_eq!(
            c.state(),
            ConnState::Terminating(CloseReason::WriteFailed(io::ErrorKind::BrokenPipe))
        );
        assert_eq!(c.stream.written.len(), 2);
    }

    #[test]
    fn test_zero_length_write_terminates() {
        let stream = MockStream::new()
            .then_read(ReadStep::Data(frame_bytes(b"x")))
            .then_write(WriteStep::Accept(0));
        let mut c = conn(stream);
        c.connection_io();
        assert_eq!(
            c.state(),
            ConnState::Terminating(CloseReason::WriteFailed(io::ErrorKind::WriteZero))
        );
    }

    #[test]
    fn test_terminating_connection_is_not_driven() {
        let stream = MockStream::new()
            .then_read(ReadStep::Eof)
            .then_read(ReadStep::Data(frame_bytes(b"late")));
        let mut c = conn(stream);
        c.connection_io();
        assert!(c.is_terminating());

        c.connection_io();
        assert!(c.stream.written.is_empty());
        assert_eq!(c.state(), ConnState::Terminating(CloseReason::PeerClosed));
    }
}
