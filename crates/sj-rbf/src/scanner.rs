use sj_types::Address64;
use tracing::{debug, warn};

use crate::error::{RbfError, Result};
use crate::layout::{
    decode_frame, frame_len, Codeword, FrameStatus, FrameTag, FENCE, FRAME_OVERHEAD,
    GENESIS_LEN, HEADER_LEN, MAX_PAYLOAD_LEN, TRAILER_LEN,
};
use crate::source::RandomRead;

/// One validated frame read back from a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RbfFrame {
    pub address: Address64,
    pub tag: FrameTag,
    pub status: FrameStatus,
    pub payload: Vec<u8>,
}

impl RbfFrame {
    /// Offset one past the frame's closing fence.
    pub fn end(&self) -> u64 {
        self.address.get() + frame_len(self.payload.len())
    }

    pub fn is_tombstone(&self) -> bool {
        self.status.is_tombstone()
    }
}

/// Reader over the first `len` bytes of an RBF stream.
///
/// The scanner never looks past `len`, so a reader created before further
/// appends keeps seeing the same frames.
pub struct RbfScanner<R> {
    source: R,
    len: u64,
    buf: Vec<u8>,
}

impl<R: RandomRead> RbfScanner<R> {
    pub fn new(source: R, len: u64) -> Self {
        Self {
            source,
            len,
            buf: Vec::new(),
        }
    }

    /// Readable length of the stream.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the stream holds no frames.
    pub fn is_empty(&self) -> bool {
        self.len <= GENESIS_LEN
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    /// Check that the stream begins with the genesis fence.
    pub fn verify_genesis(&mut self) -> Result<()> {
        let mut head = [0u8; 4];
        let got = if self.len >= GENESIS_LEN {
            self.source.read_full_at(0, &mut head)?
        } else {
            0
        };
        if got != head.len() || head != FENCE {
            return Err(RbfError::MissingGenesis);
        }
        Ok(())
    }

    /// Read and fully validate the frame starting at `address`.
    ///
    /// Unlike the reverse scan, every defect is surfaced: a bad address,
    /// a truncated or malformed frame, or a CRC mismatch.
    pub fn read_frame(&mut self, address: Address64) -> Result<RbfFrame> {
        let start = address.get();
        if address.is_null() || !address.is_aligned() || start < GENESIS_LEN {
            return Err(RbfError::InvalidAddress { address: start });
        }
        if start + FRAME_OVERHEAD as u64 > self.len {
            return Err(RbfError::AddressOutOfBounds {
                address: start,
                len: self.len,
            });
        }

        let mut header = [0u8; HEADER_LEN];
        if self.source.read_full_at(start, &mut header)? != HEADER_LEN {
            return Err(RbfError::framing(start, "truncated header"));
        }
        let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(RbfError::framing(
                start,
                format!("payload length {payload_len} exceeds limit"),
            ));
        }
        let extent = frame_len(payload_len);
        if start + extent > self.len {
            return Err(RbfError::framing(start, "frame extends past end of stream"));
        }

        self.frame_at(start, extent)
    }

    /// Lazily iterate frames from newest to oldest.
    ///
    /// Damaged regions (a torn tail, a corrupted frame) are stepped over in
    /// 4-byte strides until the next intact frame; only I/O errors are
    /// yielded, after which the iterator ends. Call again to restart.
    pub fn scan_reverse(&mut self) -> ScanReverse<'_, R> {
        let cursor = self.len - self.len % Address64::ALIGNMENT;
        ScanReverse {
            scanner: self,
            cursor,
            skipped: 0,
            done: false,
        }
    }

    /// Iterate frames from oldest to newest, stopping at the first defect.
    pub fn scan_forward(&mut self) -> ScanForward<'_, R> {
        ScanForward {
            scanner: self,
            cursor: GENESIS_LEN,
            done: false,
        }
    }

    fn frame_at(&mut self, start: u64, extent: u64) -> Result<RbfFrame> {
        self.buf.resize(extent as usize, 0);
        let got = self.source.read_full_at(start, &mut self.buf)?;
        if got as u64 != extent {
            return Err(RbfError::framing(start, "short read inside frame"));
        }
        let info = decode_frame(start, &self.buf)?;
        Ok(RbfFrame {
            address: Address64::new(start),
            tag: info.tag,
            status: info.status,
            payload: self.buf[HEADER_LEN..HEADER_LEN + info.payload_len].to_vec(),
        })
    }

    /// Try to decode the frame whose fence ends exactly at `end`.
    ///
    /// `Ok(None)` means the bytes there do not form an intact frame.
    fn frame_ending_at(&mut self, end: u64) -> Result<Option<RbfFrame>> {
        let mut trailer = [0u8; TRAILER_LEN];
        let trailer_at = end - TRAILER_LEN as u64;
        if self.source.read_full_at(trailer_at, &mut trailer)? != TRAILER_LEN {
            return Ok(None);
        }
        let Some(extent) = Codeword::parse(&trailer).and_then(|cw| cw.frame_len()) else {
            return Ok(None);
        };
        if extent > end - GENESIS_LEN {
            return Ok(None);
        }
        match self.frame_at(end - extent, extent) {
            Ok(frame) => Ok(Some(frame)),
            Err(RbfError::Io(e)) => Err(RbfError::Io(e)),
            Err(e) => {
                debug!(end, error = %e, "candidate frame rejected");
                Ok(None)
            }
        }
    }
}

/// Reverse iterator returned by [`RbfScanner::scan_reverse`].
pub struct ScanReverse<'a, R> {
    scanner: &'a mut RbfScanner<R>,
    cursor: u64,
    skipped: u64,
    done: bool,
}

impl<R> ScanReverse<'_, R> {
    fn report_skip(&mut self) {
        if self.skipped > 0 {
            warn!(
                at = self.cursor,
                skipped = self.skipped,
                "reverse scan stepped over damaged bytes"
            );
            self.skipped = 0;
        }
    }
}

impl<R: RandomRead> Iterator for ScanReverse<'_, R> {
    type Item = Result<RbfFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.cursor < GENESIS_LEN + FRAME_OVERHEAD as u64 {
                self.done = true;
                self.report_skip();
                break;
            }
            match self.scanner.frame_ending_at(self.cursor) {
                Ok(Some(frame)) => {
                    self.report_skip();
                    self.cursor = frame.address.get();
                    return Some(Ok(frame));
                }
                Ok(None) => {
                    self.cursor -= Address64::ALIGNMENT;
                    self.skipped += Address64::ALIGNMENT;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Forward iterator returned by [`RbfScanner::scan_forward`].
pub struct ScanForward<'a, R> {
    scanner: &'a mut RbfScanner<R>,
    cursor: u64,
    done: bool,
}

impl<R: RandomRead> Iterator for ScanForward<'_, R> {
    type Item = Result<RbfFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor >= self.scanner.len {
            return None;
        }
        match self.scanner.read_frame(Address64::new(self.cursor)) {
            Ok(frame) => {
                self.cursor = frame.end();
                Some(Ok(frame))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{FrameSink, RbfBuffer};

    fn sample() -> (RbfBuffer, Vec<Address64>) {
        let mut buffer = RbfBuffer::new();
        let addrs = vec![
            buffer.append_frame(FrameTag::new(1), b"one", FrameStatus::Valid).unwrap(),
            buffer.append_frame(FrameTag::new(2), b"", FrameStatus::Tombstone).unwrap(),
            buffer.append_frame(FrameTag::new(3), &[7u8; 40], FrameStatus::Valid).unwrap(),
        ];
        (buffer, addrs)
    }

    fn scanner(buffer: &RbfBuffer) -> RbfScanner<&[u8]> {
        RbfScanner::new(buffer.as_bytes(), buffer.len())
    }

    #[test]
    fn read_frame_returns_payload() {
        let (buffer, addrs) = sample();
        let mut scanner = scanner(&buffer);
        let frame = scanner.read_frame(addrs[0]).unwrap();
        assert_eq!(frame.tag, FrameTag::new(1));
        assert_eq!(frame.payload, b"one");
        assert_eq!(frame.end(), addrs[1].get());
        assert!(scanner.read_frame(addrs[1]).unwrap().is_tombstone());
    }

    #[test]
    fn read_frame_rejects_bad_addresses() {
        let (buffer, addrs) = sample();
        let mut scanner = scanner(&buffer);
        assert!(matches!(
            scanner.read_frame(Address64::NULL),
            Err(RbfError::InvalidAddress { address: 0 })
        ));
        assert!(matches!(
            scanner.read_frame(Address64::new(6)),
            Err(RbfError::InvalidAddress { .. })
        ));
        assert!(matches!(
            scanner.read_frame(Address64::new(buffer.len())),
            Err(RbfError::AddressOutOfBounds { .. })
        ));
        // Middle of a frame: the "header" read there is payload garbage.
        let inside = Address64::new(addrs[2].get() + 8);
        assert!(scanner.read_frame(inside).is_err());
    }

    #[test]
    fn read_frame_surfaces_crc_mismatch() {
        let (mut buffer, addrs) = sample();
        let at = addrs[2].get() as usize + HEADER_LEN + 5;
        buffer.bytes_mut()[at] ^= 0x55;
        let mut scanner = scanner(&buffer);
        assert!(matches!(
            scanner.read_frame(addrs[2]),
            Err(RbfError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn reverse_scan_yields_newest_first() {
        let (buffer, addrs) = sample();
        let mut scanner = scanner(&buffer);
        let frames: Vec<_> = scanner.scan_reverse().map(Result::unwrap).collect();
        let seen: Vec<_> = frames.iter().map(|f| f.address).collect();
        assert_eq!(seen, vec![addrs[2], addrs[1], addrs[0]]);
        assert!(frames[1].is_tombstone());
    }

    #[test]
    fn reverse_scan_is_restartable() {
        let (buffer, _) = sample();
        let mut scanner = scanner(&buffer);
        assert_eq!(scanner.scan_reverse().count(), 3);
        assert_eq!(scanner.scan_reverse().count(), 3);
    }

    #[test]
    fn reverse_scan_over_empty_stream() {
        let buffer = RbfBuffer::new();
        let mut scanner = scanner(&buffer);
        assert!(scanner.is_empty());
        assert_eq!(scanner.scan_reverse().count(), 0);
    }

    #[test]
    fn reverse_scan_skips_torn_tail() {
        let (mut buffer, addrs) = sample();
        // Half of a frame that never finished landing.
        let mut torn = Vec::new();
        crate::layout::encode_frame(&mut torn, FrameTag::new(9), b"lost", FrameStatus::Valid).unwrap();
        buffer.bytes_mut().extend_from_slice(&torn[..torn.len() / 2]);

        let mut scanner = scanner(&buffer);
        let seen: Vec<_> = scanner
            .scan_reverse()
            .map(|f| f.unwrap().address)
            .collect();
        assert_eq!(seen, vec![addrs[2], addrs[1], addrs[0]]);
    }

    #[test]
    fn reverse_scan_skips_corrupted_frame() {
        let (mut buffer, addrs) = sample();
        let at = addrs[2].get() as usize + HEADER_LEN;
        buffer.bytes_mut()[at] ^= 0xFF;

        let mut scanner = scanner(&buffer);
        let seen: Vec<_> = scanner
            .scan_reverse()
            .map(|f| f.unwrap().address)
            .collect();
        assert_eq!(seen, vec![addrs[1], addrs[0]]);
    }

    #[test]
    fn scanner_respects_snapshot_len() {
        let (mut buffer, addrs) = sample();
        let snapshot = addrs[2].get();
        buffer.append_frame(FrameTag::new(4), b"later", FrameStatus::Valid).unwrap();
        let mut scanner = RbfScanner::new(buffer.as_bytes(), snapshot);
        assert_eq!(scanner.scan_reverse().count(), 2);
        assert!(scanner.read_frame(addrs[2]).is_err());
    }

    #[test]
    fn forward_scan_visits_in_order() {
        let (buffer, addrs) = sample();
        let mut scanner = scanner(&buffer);
        let seen: Vec<_> = scanner
            .scan_forward()
            .map(|f| f.unwrap().address)
            .collect();
        assert_eq!(seen, addrs);
    }

    #[test]
    fn genesis_check() {
        let (buffer, _) = sample();
        assert!(scanner(&buffer).verify_genesis().is_ok());
        let foreign = b"NOPE".to_vec();
        let mut bad = RbfScanner::new(foreign.as_slice(), 4);
        assert!(matches!(bad.verify_genesis(), Err(RbfError::MissingGenesis)));
    }
}
