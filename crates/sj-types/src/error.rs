use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("unexpected end of input while decoding varuint after {consumed} bytes")]
    VarIntTruncated { consumed: usize },

    #[error("varuint overflows u64")]
    VarIntOverflow,

    #[error("non-canonical varuint: value {value} used {actual} bytes, expected {expected}")]
    VarIntNonCanonical {
        value: u64,
        actual: usize,
        expected: usize,
    },

    #[error("address {0:#018x} is not 4-byte aligned")]
    MisalignedAddress(u64),
}
