use std::io;

/// Errors produced by the RBF frame layer.
#[derive(Debug, thiserror::Error)]
pub enum RbfError {
    /// I/O error while reading or appending frames.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The file does not begin with the genesis fence.
    #[error("missing genesis fence: file does not start with \"RBF1\"")]
    MissingGenesis,

    /// A frame address is null, misaligned, or inside the genesis fence.
    #[error("invalid frame address {address:#x}")]
    InvalidAddress { address: u64 },

    /// A frame address lies beyond the readable end of the file.
    #[error("frame address {address:#x} is beyond end of file ({len} bytes)")]
    AddressOutOfBounds { address: u64, len: u64 },

    /// The bytes at an address do not form a well-shaped frame.
    #[error("malformed frame at {address:#x}: {reason}")]
    Framing { address: u64, reason: String },

    /// The frame is well-shaped but its checksum does not match.
    #[error("CRC32C mismatch at {address:#x}: stored {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch {
        address: u64,
        expected: u32,
        actual: u32,
    },

    /// Payload exceeds the maximum frame payload length.
    #[error("payload of {len} bytes exceeds the frame limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// Truncation target is not a valid frame boundary.
    #[error("cannot truncate to {requested}: must be 4-byte aligned and within [4, {current}]")]
    InvalidTruncate { requested: u64, current: u64 },

    /// An earlier write or sync failed, so the file's true length is
    /// unknown. Reopen the file to recover.
    #[error("file is unusable after a failed write; reopen it")]
    Poisoned,

    /// Configuration values are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RbfError {
    pub(crate) fn framing(address: u64, reason: impl Into<String>) -> Self {
        Self::Framing {
            address,
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the RBF crate.
pub type Result<T> = std::result::Result<T, RbfError>;
