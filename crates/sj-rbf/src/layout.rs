//! On-disk frame layout.
//!
//! An RBF file is the 4-byte genesis fence followed by zero or more frames:
//!
//! ```text
//! [4 bytes: genesis fence "RBF1"]
//! frame := [FrameTag u32][PayloadLength u32]          header, 8 bytes
//!          [Payload][Padding 0..3, zero]               4-byte aligned
//!          [PayloadLength u32][FrameTag u32]           codeword, 16 bytes
//!          [CRC32C u32][Flags u32]
//!          [fence "RBF1"]                              4 bytes
//! ```
//!
//! All integers are little-endian. The header allows skipping forward; the
//! 20-byte trailer (codeword plus fence) allows walking backward from any
//! frame end without an index. The CRC covers the header, payload, padding,
//! the trailer's length and tag, and the flags word.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{RbfError, Result};

/// Fence written at offset 0 and after every frame.
pub const FENCE: [u8; 4] = *b"RBF1";

/// Length of a fence.
pub const FENCE_LEN: usize = 4;

/// Length of the genesis fence; also the address of the first frame.
pub const GENESIS_LEN: u64 = FENCE_LEN as u64;

/// Length of the frame header.
pub const HEADER_LEN: usize = 8;

/// Length of the trailer codeword (length, tag, CRC, flags).
pub const CODEWORD_LEN: usize = 16;

/// Bytes read when walking backward: codeword plus fence.
pub const TRAILER_LEN: usize = CODEWORD_LEN + FENCE_LEN;

/// Fixed bytes per frame excluding payload and padding.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;

/// Largest payload a single frame may carry (1 GiB).
pub const MAX_PAYLOAD_LEN: usize = 1 << 30;

const FLAG_TOMBSTONE: u32 = 0x0000_0001;

/// 32-bit frame tag.
///
/// The low 16 bits carry the record type and the high 16 bits the object
/// kind (meaningful for object-version records). The frame layer itself
/// treats the tag as opaque.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameTag(u32);

impl FrameTag {
    /// Wrap a raw tag value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Compose a tag from its record type and object kind.
    pub const fn from_parts(record_type: u16, kind: u16) -> Self {
        Self(((kind as u32) << 16) | record_type as u32)
    }

    /// The raw tag value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Low 16 bits.
    pub const fn record_type(self) -> u16 {
        self.0 as u16
    }

    /// High 16 bits.
    pub const fn kind(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl fmt::Debug for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameTag({:#010x})", self.0)
    }
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Logical status of a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameStatus {
    #[default]
    Valid,
    /// Logically deleted. Still physically present and still yielded by scans.
    Tombstone,
}

impl FrameStatus {
    /// Encode as the trailer flags word.
    pub const fn flags(self) -> u32 {
        match self {
            Self::Valid => 0,
            Self::Tombstone => FLAG_TOMBSTONE,
        }
    }

    /// Decode a flags word. Unknown bits are rejected.
    pub const fn from_flags(flags: u32) -> Option<Self> {
        match flags {
            0 => Some(Self::Valid),
            FLAG_TOMBSTONE => Some(Self::Tombstone),
            _ => None,
        }
    }

    pub fn is_tombstone(self) -> bool {
        self == Self::Tombstone
    }
}

/// Zero bytes needed after a payload of `payload_len` bytes.
pub const fn padding_len(payload_len: usize) -> usize {
    (4 - payload_len % 4) % 4
}

/// Total on-disk length of a frame carrying `payload_len` bytes.
pub const fn frame_len(payload_len: usize) -> u64 {
    (FRAME_OVERHEAD + payload_len + padding_len(payload_len)) as u64
}

fn checksum(covered: &[u8], flags: u32) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(covered), &flags.to_le_bytes())
}

/// Append one encoded frame to `out`. Returns the number of bytes written.
pub fn encode_frame(
    out: &mut Vec<u8>,
    tag: FrameTag,
    payload: &[u8],
    status: FrameStatus,
) -> Result<usize> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(RbfError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let start = out.len();
    let len = payload.len() as u32;
    let flags = status.flags();

    out.reserve(frame_len(payload.len()) as usize);
    out.put_u32_le(tag.get());
    out.put_u32_le(len);
    out.put_slice(payload);
    out.put_bytes(0, padding_len(payload.len()));
    out.put_u32_le(len);
    out.put_u32_le(tag.get());
    let crc = checksum(&out[start..], flags);
    out.put_u32_le(crc);
    out.put_u32_le(flags);
    out.put_slice(&FENCE);

    Ok(out.len() - start)
}

/// Trailer codeword parsed from the 20 bytes ending at a frame end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Codeword {
    pub payload_len: u32,
    pub tag: FrameTag,
    pub crc: u32,
    pub flags: u32,
}

impl Codeword {
    /// Parse a trailer. `None` if the slice is not a fenced trailer.
    pub fn parse(trailer: &[u8]) -> Option<Self> {
        if trailer.len() != TRAILER_LEN || trailer[CODEWORD_LEN..] != FENCE {
            return None;
        }
        let mut buf = &trailer[..CODEWORD_LEN];
        Some(Self {
            payload_len: buf.get_u32_le(),
            tag: FrameTag::new(buf.get_u32_le()),
            crc: buf.get_u32_le(),
            flags: buf.get_u32_le(),
        })
    }

    /// Extent of the frame this codeword closes, if plausible.
    pub fn frame_len(&self) -> Option<u64> {
        let len = self.payload_len as usize;
        (len <= MAX_PAYLOAD_LEN).then(|| frame_len(len))
    }
}

/// Fields of a fully validated frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameInfo {
    pub tag: FrameTag,
    pub status: FrameStatus,
    pub payload_len: usize,
}

/// Validate the complete bytes of one frame (header through fence).
pub(crate) fn decode_frame(address: u64, bytes: &[u8]) -> Result<FrameInfo> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(RbfError::framing(address, "shorter than the fixed frame overhead"));
    }
    let mut head = &bytes[..HEADER_LEN];
    let tag = FrameTag::new(head.get_u32_le());
    let payload_len = head.get_u32_le() as usize;
    if payload_len > MAX_PAYLOAD_LEN || frame_len(payload_len) != bytes.len() as u64 {
        return Err(RbfError::framing(
            address,
            format!("payload length {payload_len} does not match frame extent"),
        ));
    }

    let trailer_start = bytes.len() - TRAILER_LEN;
    let codeword = Codeword::parse(&bytes[trailer_start..])
        .ok_or_else(|| RbfError::framing(address, "missing frame fence"))?;
    if codeword.payload_len as usize != payload_len || codeword.tag != tag {
        return Err(RbfError::framing(address, "header and trailer disagree"));
    }
    if bytes[HEADER_LEN + payload_len..trailer_start]
        .iter()
        .any(|&b| b != 0)
    {
        return Err(RbfError::framing(address, "non-zero padding"));
    }
    let status = FrameStatus::from_flags(codeword.flags).ok_or_else(|| {
        RbfError::framing(address, format!("unknown flag bits {:#010x}", codeword.flags))
    })?;

    let actual = checksum(&bytes[..trailer_start + 8], codeword.flags);
    if actual != codeword.crc {
        return Err(RbfError::CrcMismatch {
            address,
            expected: codeword.crc,
            actual,
        });
    }

    Ok(FrameInfo {
        tag,
        status,
        payload_len,
    })
}
