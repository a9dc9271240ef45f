//! Discontiguous payload container.
//!
//! RPC payloads are carried as an ordered sequence of [`Bytes`] chunks
//! rather than one contiguous allocation. Readers append chunks as bytes
//! arrive from the socket; writers iterate the chunks into `IoSlice`s for
//! vectored writes. The transport itself never flattens a payload; the
//! [`Buffer::to_bytes`] helper exists for callers (and tests) that need
//! contiguous access.

use bytes::{Bytes, BytesMut};

/// An ordered collection of byte chunks with a cached total length.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    chunks: Vec<Bytes>,
    len: usize,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer holding a copy of `data` as a single chunk.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }

    /// Create a buffer holding `chunk` without copying.
    pub fn from_bytes(chunk: Bytes) -> Self {
        let len = chunk.len();
        let chunks = if chunk.is_empty() { Vec::new() } else { vec![chunk] };
        Self { chunks, len }
    }

    /// Total number of payload bytes across all chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a chunk without copying. Empty chunks are ignored.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push(chunk);
    }

    /// Append a copy of `src` as a new chunk.
    pub fn append_slice(&mut self, src: &[u8]) {
        self.append(Bytes::copy_from_slice(src));
    }

    /// Iterate over the chunks in order.
    pub fn chunks(&self) -> std::slice::Iter<'_, Bytes> {
        self.chunks.iter()
    }

    /// Drop all chunks.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Flatten into a single contiguous `Bytes`.
    ///
    /// Cheap when the buffer holds zero or one chunk; otherwise copies.
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len);
                for chunk in &self.chunks {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            }
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Buffer::from_slice(data)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from_bytes(Bytes::from(data))
    }
}

impl From<Bytes> for Buffer {
    fn from(chunk: Bytes) -> Self {
        Buffer::from_bytes(chunk)
    }
}

// Content equality, independent of how the bytes are split into chunks.
impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        let lhs = self.chunks.iter().flat_map(|c| c.iter());
        let rhs = other.chunks.iter().flat_map(|c| c.iter());
        lhs.eq(rhs)
    }
}

impl Eq for Buffer {}

impl PartialEq<[u8]> for Buffer {
    fn eq(&self, other: &[u8]) -> bool {
        if self.len != other.len() {
            return false;
        }
        self.chunks.iter().flat_map(|c| c.iter()).eq(other.iter())
    }
}

impl PartialEq<&[u8]> for Buffer {
    fn eq(&self, other: &&[u8]) -> bool {
        self == *other
    }
}
