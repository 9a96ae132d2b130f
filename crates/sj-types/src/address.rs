use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// File offset of a frame inside an RBF file.
///
/// Used both as a frame address and as an object version pointer (Ptr64).
/// The value `0` is the null pointer: offset 0 always holds the file's
/// genesis fence, so no frame can start there. Every non-null address is
/// 4-byte aligned.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address64(u64);

impl Address64 {
    /// Alignment of every frame start.
    pub const ALIGNMENT: u64 = 4;

    /// The null address.
    pub const NULL: Self = Self(0);

    /// Wrap a raw offset without checking alignment.
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Wrap a raw offset, rejecting misaligned values.
    pub fn try_new(offset: u64) -> Result<Self, TypeError> {
        if offset % Self::ALIGNMENT != 0 {
            return Err(TypeError::MisalignedAddress(offset));
        }
        Ok(Self(offset))
    }

    /// The raw file offset.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the offset is 4-byte aligned.
    pub const fn is_aligned(self) -> bool {
        self.0 % Self::ALIGNMENT == 0
    }

    /// `None` for the null address, `Some(self)` otherwise.
    pub const fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Debug for Address64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Address64(null)")
        } else {
            write!(f, "Address64({:#x})", self.0)
        }
    }
}

impl fmt::Display for Address64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<Address64> for u64 {
    fn from(addr: Address64) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero() {
        assert!(Address64::NULL.is_null());
        assert!(Address64::default().is_null());
        assert_eq!(Address64::NULL.non_null(), None);
    }

    #[test]
    fn try_new_rejects_misaligned() {
        assert_eq!(
            Address64::try_new(6).unwrap_err(),
            TypeError::MisalignedAddress(6)
        );
        assert_eq!(Address64::try_new(8).unwrap().get(), 8);
    }

    #[test]
    fn alignment_check() {
        assert!(Address64::new(4).is_aligned());
        assert!(!Address64::new(5).is_aligned());
    }

    #[test]
    fn non_null_passes_through() {
        let addr = Address64::new(128);
        assert_eq!(addr.non_null(), Some(addr));
    }
}
