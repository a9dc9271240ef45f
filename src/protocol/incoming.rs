//! Incremental frame reader.
//!
//! [`IncomingMessage`] reconstructs one wire message from the byte-stream
//! fragments a non-blocking socket delivers across many readiness events.
//! Progress is checkpointed in plain byte counters, so the reader can be
//! re-driven after any partial read without re-reading or losing bytes:
//! `header_bytes_received` fills the 12-byte header, then
//! `body_bytes_received` advances toward `message_length`.
//!
//! Sink resolution is the owner's job. When the 12th header byte arrives,
//! [`IncomingMessage::advance`] hands the decoded header back as
//! [`Progress::HeaderReady`]; the owner either supplies a destination
//! [`Buffer`] or `None` to drain the body into nowhere (an unmatched or
//! invalid message). A header declaring more than [`MAX_RPC_LEN`] bytes
//! forces discard mode immediately: the capped body is drained so the
//! counters stay consistent, and the violation is reported once the
//! message completes so the owner can close the connection.

use std::io;

use tokio::net::TcpStream;

use super::wire_format::{WireHeader, HEADER_SIZE, MAX_RPC_LEN};
use crate::buffer::Buffer;
use crate::error::{Result, TransportError};

/// Size of the stack staging area body bytes pass through on their way
/// into the sink.
const READ_STAGING: usize = 8 * 1024;

/// Outcome of one [`IncomingMessage::advance`] call.
#[derive(Debug)]
pub enum Progress {
    /// The socket ran dry before the message completed; re-drive on the
    /// next readable event.
    Incomplete,
    /// The header just completed and no sink is bound yet. Call
    /// [`IncomingMessage::attach_sink`] before advancing again.
    HeaderReady(WireHeader),
    /// The full message has been deposited into the sink (or discarded).
    Complete,
}

/// Destination for the message body.
#[derive(Debug)]
enum Sink {
    /// Not yet decided; resolved by the owner after `HeaderReady`.
    Unresolved,
    /// Drain body bytes into nowhere.
    Discard,
    /// Append body bytes to this buffer.
    Fill(Buffer),
}

/// Reader state for one in-flight incoming message.
#[derive(Debug)]
pub struct IncomingMessage {
    header_buf: [u8; HEADER_SIZE],
    /// Bytes of the header received so far; `HEADER_SIZE` means the header
    /// is complete and `header` is populated.
    header_bytes_received: usize,
    /// Bytes of the body received so far, never exceeding `message_length`.
    body_bytes_received: usize,
    /// Body bytes this reader will consume: the declared length, capped at
    /// [`MAX_RPC_LEN`] for oversized headers.
    message_length: usize,
    header: Option<WireHeader>,
    sink: Sink,
    /// Set when the header declared a length above the cap. The message is
    /// drained to discard and the connection must be closed afterwards.
    oversized: bool,
}

impl IncomingMessage {
    /// Create a reader whose sink will be resolved after the header
    /// arrives (via [`Progress::HeaderReady`]).
    pub fn new() -> Self {
        Self {
            header_buf: [0u8; HEADER_SIZE],
            header_bytes_received: 0,
            body_bytes_received: 0,
            message_length: 0,
            header: None,
            sink: Sink::Unresolved,
            oversized: false,
        }
    }

    /// The decoded header, once complete.
    pub fn header(&self) -> Option<&WireHeader> {
        self.header.as_ref()
    }

    /// Whether the header declared a length above [`MAX_RPC_LEN`].
    pub fn is_oversized(&self) -> bool {
        self.oversized
    }

    /// Bind the body destination after `HeaderReady`. `None` drains the
    /// body into nowhere.
    pub fn attach_sink(&mut self, sink: Option<Buffer>) {
        self.sink = match sink {
            Some(buffer) => Sink::Fill(buffer),
            None => Sink::Discard,
        };
    }

    /// Drop the bound sink and drain the remainder of the body into
    /// nowhere. Used when the RPC this response belongs to is cancelled
    /// mid-read; the counters keep the stream framed.
    pub fn abandon_sink(&mut self) {
        self.sink = Sink::Discard;
    }

    /// Advance the reader with non-blocking reads on `stream`.
    ///
    /// Consumes at most one message's worth of bytes. `WouldBlock` maps to
    /// [`Progress::Incomplete`]; EOF at a message boundary maps to
    /// [`TransportError::PeerClosed`], EOF mid-message to an I/O error.
    pub fn advance(&mut self, stream: &TcpStream) -> Result<Progress> {
        while self.header_bytes_received < HEADER_SIZE {
            match stream.try_read(&mut self.header_buf[self.header_bytes_received..]) {
                Ok(0) => {
                    if self.header_bytes_received == 0 {
                        return Err(TransportError::PeerClosed);
                    }
                    return Err(unexpected_eof("connection closed mid-header"));
                }
                Ok(n) => {
                    self.header_bytes_received += n;
                    if self.header_bytes_received == HEADER_SIZE {
                        let header = WireHeader::decode(&self.header_buf)
                            .expect("staging buffer holds a full header");
                        self.header = Some(header);
                        self.message_length = header.capped_len() as usize;
                        if header.is_oversized() {
                            // Drain a bounded body so the counters stay
                            // consistent; the owner closes the connection
                            // once the message completes.
                            self.oversized = true;
                            self.sink = Sink::Discard;
                        } else if matches!(self.sink, Sink::Unresolved) {
                            return Ok(Progress::HeaderReady(header));
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Incomplete);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut staging = [0u8; READ_STAGING];
        while self.body_bytes_received < self.message_length {
            let want = READ_STAGING.min(self.message_length - self.body_bytes_received);
            match stream.try_read(&mut staging[..want]) {
                Ok(0) => return Err(unexpected_eof("connection closed mid-message")),
                Ok(n) => {
                    self.body_bytes_received += n;
                    if let Sink::Fill(buffer) = &mut self.sink {
                        buffer.append_slice(&staging[..n]);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Incomplete);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Progress::Complete)
    }

    /// Consume the reader after [`Progress::Complete`], yielding the
    /// header and the filled sink (`None` if the body was discarded).
    pub fn take(self) -> (WireHeader, Option<Buffer>) {
        let header = self.header.expect("take() called before the header completed");
        let payload = match self.sink {
            Sink::Fill(buffer) => Some(buffer),
            Sink::Unresolved | Sink::Discard => None,
        };
        (header, payload)
    }

    /// Build the protocol error describing an oversized header.
    pub fn oversize_violation(&self) -> TransportError {
        let len = self.header.map(|h| h.len).unwrap_or(0);
        TransportError::Protocol(format!(
            "peer declared a {len}-byte message, cap is {MAX_RPC_LEN}"
        ))
    }
}

impl Default for IncomingMessage {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected_eof(msg: &str) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, msg))
}
