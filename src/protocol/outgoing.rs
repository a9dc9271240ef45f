//! Outbound frame with partial-write resumption.
//!
//! One [`OutboundFrame`] carries everything needed to put a single RPC
//! message on the wire: the pre-encoded header, the chunked payload, and a
//! countdown of bytes still unsent. Each [`OutboundFrame::write_some`]
//! call gathers the unsent suffix into `IoSlice`s and issues one vectored
//! write, so a frame that straddles many writability events costs one
//! syscall per event regardless of how the payload is fragmented.

use std::io::{self, IoSlice};

use tokio::net::TcpStream;

use super::wire_format::{WireHeader, HEADER_SIZE};
use crate::buffer::Buffer;

/// A frame queued for transmission on one connection.
#[derive(Debug)]
pub struct OutboundFrame {
    nonce: u64,
    /// Pre-encoded header (12 bytes).
    header: [u8; HEADER_SIZE],
    payload: Buffer,
    total: usize,
    /// Trailing bytes of header + payload still to write; 0 means done.
    bytes_left: usize,
}

impl OutboundFrame {
    /// Build a frame for `payload` tagged with `nonce`.
    pub fn new(nonce: u64, payload: Buffer) -> Self {
        let header = WireHeader::new(nonce, payload.len() as u32).encode();
        let total = HEADER_SIZE + payload.len();
        Self {
            nonce,
            header,
            payload,
            total,
            bytes_left: total,
        }
    }

    /// Nonce carried in the frame header.
    #[inline]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Bytes still unsent.
    #[inline]
    pub fn bytes_left(&self) -> usize {
        self.bytes_left
    }

    /// Whether the final byte has been written.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.bytes_left == 0
    }

    /// Whether any byte of this frame has reached the wire. A frame that
    /// has started transmitting cannot be withdrawn without
    /// desynchronizing the stream.
    #[inline]
    pub fn started(&self) -> bool {
        self.bytes_left < self.total
    }

    /// Write as much of the unsent suffix as the socket will take.
    ///
    /// Returns the number of bytes still unsent; `WouldBlock` leaves the
    /// count unchanged so the caller can park until the next writability
    /// event. The wire position advances by exactly what the kernel
    /// reports.
    pub fn write_some(&mut self, stream: &TcpStream) -> io::Result<usize> {
        if self.bytes_left == 0 {
            return Ok(0);
        }

        let skip = self.total - self.bytes_left;
        let slices = self.remaining_slices(skip);
        match stream.try_write_vectored(&slices) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "vectored write accepted 0 bytes",
            )),
            Ok(n) => {
                self.bytes_left -= n;
                Ok(self.bytes_left)
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(self.bytes_left)
            }
            Err(e) => Err(e),
        }
    }

    /// Gather `IoSlice`s for everything past the first `skip` bytes of
    /// header + payload.
    fn remaining_slices(&self, skip: usize) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(1 + self.payload.chunks().len());
        let mut offset = 0;

        if skip < HEADER_SIZE {
            slices.push(IoSlice::new(&self.header[skip..]));
        }
        offset += HEADER_SIZE;

        for chunk in self.payload.chunks() {
            let end = offset + chunk.len();
            if skip < end {
                let start = skip.saturating_sub(offset);
                slices.push(IoSlice::new(&chunk[start..]));
            }
            offset = end;
        }

        slices
    }
}
