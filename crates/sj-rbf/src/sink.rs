use std::io;

use sj_types::Address64;

use crate::error::Result;
use crate::layout::{encode_frame, FrameStatus, FrameTag, FENCE, GENESIS_LEN};
use crate::source::RandomRead;

/// Append-only destination for RBF frames.
///
/// Implementations must satisfy these invariants:
/// - The stream begins with the genesis fence, so the first frame is
///   appended at address 4 and no frame ever has the null address.
/// - Frames are never rewritten; `tail` only grows between truncations.
/// - `flush` makes every frame appended so far durable according to the
///   sink's sync policy. Callers order writes across sinks with it.
pub trait FrameSink {
    /// Append one frame and return its address.
    fn append_frame(&mut self, tag: FrameTag, payload: &[u8], status: FrameStatus) -> Result<Address64>;

    /// Offset one past the last byte of the last appended frame.
    fn tail(&self) -> u64;

    /// Push buffered frames to stable storage.
    fn flush(&mut self) -> Result<()>;
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    fn append_frame(&mut self, tag: FrameTag, payload: &[u8], status: FrameStatus) -> Result<Address64> {
        (**self).append_frame(tag, payload, status)
    }

    fn tail(&self) -> u64 {
        (**self).tail()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// In-memory RBF stream.
///
/// Intended for tests and embedding. Holds exactly the bytes an [`RbfFile`]
/// would hold, so a scanner over [`RbfBuffer::as_bytes`] sees the same frames.
///
/// [`RbfFile`]: crate::file::RbfFile
#[derive(Clone, Debug)]
pub struct RbfBuffer {
    bytes: Vec<u8>,
}

impl RbfBuffer {
    /// Create a stream holding only the genesis fence.
    pub fn new() -> Self {
        Self {
            bytes: FENCE.to_vec(),
        }
    }

    /// Raw contents, genesis fence included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the buffer and return its raw contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Returns `true` if no frame has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == GENESIS_LEN
    }

    /// Drop everything past `len`, never cutting into the genesis fence.
    pub fn truncate(&mut self, len: u64) {
        let len = len.max(GENESIS_LEN) as usize;
        self.bytes.truncate(len);
    }

    /// Mutable access to the raw bytes, for corruption tests.
    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }
}

impl Default for RbfBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for RbfBuffer {
    fn append_frame(&mut self, tag: FrameTag, payload: &[u8], status: FrameStatus) -> Result<Address64> {
        let address = Address64::new(self.len());
        encode_frame(&mut self.bytes, tag, payload, status)?;
        Ok(address)
    }

    fn tail(&self) -> u64 {
        self.len()
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl RandomRead for RbfBuffer {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        RandomRead::read_at(&mut self.bytes.as_slice(), offset, buf)
    }
}
