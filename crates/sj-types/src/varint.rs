//! Canonical base-128 varint codec (ULEB128) with ZigZag for signed values.
//!
//! Each byte carries 7 data bits, low group first; the high bit is set on
//! every byte except the last. Decoding is strict: truncated input, values
//! that overflow `u64`, and non-minimal encodings (such as `0x80 0x00` for
//! zero) are all rejected.

use crate::error::TypeError;

/// Maximum encoded length of a `u64`.
pub const MAX_VARUINT64_BYTES: usize = 10;

/// Number of bytes the canonical encoding of `value` occupies.
pub fn varuint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append the canonical encoding of `value` to `buf`. Returns bytes written.
pub fn encode_varuint(buf: &mut Vec<u8>, mut value: u64) -> usize {
    let start = buf.len();
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
    buf.len() - start
}

/// Decode a varuint from the front of `data`. Returns `(value, bytes_consumed)`.
///
/// Never reads past the end of `data`.
pub fn decode_varuint(data: &[u8]) -> Result<(u64, usize), TypeError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        let consumed = i + 1;
        if consumed == MAX_VARUINT64_BYTES && byte > 0x01 {
            return Err(TypeError::VarIntOverflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            let expected = varuint_len(value);
            if consumed != expected {
                return Err(TypeError::VarIntNonCanonical {
                    value,
                    actual: consumed,
                    expected,
                });
            }
            return Ok((value, consumed));
        }
        shift += 7;
        if consumed >= MAX_VARUINT64_BYTES {
            return Err(TypeError::VarIntOverflow);
        }
    }
    Err(TypeError::VarIntTruncated {
        consumed: data.len(),
    })
}

/// Map a signed value onto the unsigned line: 0, -1, 1, -2, 2, ...
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(encoded: u64) -> i64 {
    ((encoded >> 1) as i64) ^ -((encoded & 1) as i64)
}

/// Append the ZigZag varint encoding of a signed value.
pub fn encode_varint(buf: &mut Vec<u8>, value: i64) -> usize {
    encode_varuint(buf, zigzag_encode(value))
}

/// Decode a ZigZag varint. Returns `(value, bytes_consumed)`.
pub fn decode_varint(data: &[u8]) -> Result<(i64, usize), TypeError> {
    let (raw, consumed) = decode_varuint(data)?;
    Ok((zigzag_decode(raw), consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varuint_small() {
        let mut buf = Vec::new();
        assert_eq!(encode_varuint(&mut buf, 42), 1);
        assert_eq!(decode_varuint(&buf).unwrap(), (42, 1));
    }

    #[test]
    fn varuint_zero() {
        let mut buf = Vec::new();
        encode_varuint(&mut buf, 0);
        assert_eq!(buf, vec![0x00]);
        assert_eq!(decode_varuint(&buf).unwrap(), (0, 1));
    }

    #[test]
    fn varuint_boundary_128() {
        let mut buf = Vec::new();
        encode_varuint(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);
    }

    #[test]
    fn varuint_max_u64_takes_ten_bytes() {
        let mut buf = Vec::new();
        assert_eq!(encode_varuint(&mut buf, u64::MAX), MAX_VARUINT64_BYTES);
        assert_eq!(decode_varuint(&buf).unwrap(), (u64::MAX, 10));
        assert_eq!(varuint_len(u64::MAX), 10);
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let (value, consumed) = decode_varuint(&[0x05, 0xFF, 0xFF]).unwrap();
        assert_eq!((value, consumed), (5, 1));
    }

    #[test]
    fn decode_empty_is_truncated() {
        assert_eq!(
            decode_varuint(&[]).unwrap_err(),
            TypeError::VarIntTruncated { consumed: 0 }
        );
    }

    #[test]
    fn decode_dangling_continuation_is_truncated() {
        assert_eq!(
            decode_varuint(&[0x80]).unwrap_err(),
            TypeError::VarIntTruncated { consumed: 1 }
        );
    }

    #[test]
    fn decode_rejects_non_canonical() {
        let err = decode_varuint(&[0x80, 0x00]).unwrap_err();
        assert_eq!(
            err,
            TypeError::VarIntNonCanonical {
                value: 0,
                actual: 2,
                expected: 1
            }
        );
    }

    #[test]
    fn decode_rejects_overflowing_tenth_byte() {
        let mut data = vec![0xFF; 9];
        data.push(0x02);
        assert_eq!(decode_varuint(&data).unwrap_err(), TypeError::VarIntOverflow);
    }

    #[test]
    fn decode_rejects_eleven_bytes() {
        let mut data = vec![0xFF; 9];
        data.push(0x81);
        data.push(0x00);
        assert_eq!(decode_varuint(&data).unwrap_err(), TypeError::VarIntOverflow);
    }

    #[test]
    fn zigzag_mapping() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MIN)), i64::MIN);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MAX)), i64::MAX);
    }

    proptest! {
        #[test]
        fn varuint_roundtrip(value in any::<u64>()) {
            let mut buf = Vec::new();
            let written = encode_varuint(&mut buf, value);
            prop_assert_eq!(written, varuint_len(value));
            prop_assert_eq!(decode_varuint(&buf).unwrap(), (value, written));
        }

        #[test]
        fn varint_roundtrip(value in any::<i64>()) {
            let mut buf = Vec::new();
            let written = encode_varint(&mut buf, value);
            prop_assert_eq!(decode_varint(&buf).unwrap(), (value, written));
        }
    }
}
