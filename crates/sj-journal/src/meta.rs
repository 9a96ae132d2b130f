//! Commit-point record written to the meta file once per commit.
//!
//! Wire layout, fields in order:
//!
//! ```text
//! EpochSeq        varuint
//! RootObjectId    varuint
//! VersionIndexPtr u64 LE
//! DataTail        u64 LE
//! NextObjectId    varuint
//! ```
//!
//! The pointer and tail are fixed-width since they are large and change on
//! every commit; the rest are small and varint-encoded.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use sj_types::varint::{decode_varuint, encode_varuint, varuint_len};
use sj_types::{Address64, ObjectId};

use crate::error::{JournalError, MetaField, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaCommitRecord {
    /// Commit ordinal, starting at 1.
    pub epoch_seq: u64,
    pub root_object_id: ObjectId,
    /// Address of the newest version index record (null before any write).
    pub version_index_ptr: Address64,
    /// Data file length once this commit's records landed.
    pub data_tail: u64,
    /// Allocator position at commit time.
    pub next_object_id: ObjectId,
}

impl MetaCommitRecord {
    /// Encoded length in bytes.
    pub fn serialized_len(&self) -> usize {
        varuint_len(self.epoch_seq)
            + varuint_len(self.root_object_id.get())
            + 8
            + 8
            + varuint_len(self.next_object_id.get())
    }

    /// Append the encoding to `out`. Returns bytes written.
    pub fn write(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        encode_varuint(out, self.epoch_seq);
        encode_varuint(out, self.root_object_id.get());
        out.put_u64_le(self.version_index_ptr.get());
        out.put_u64_le(self.data_tail);
        encode_varuint(out, self.next_object_id.get());
        out.len() - start
    }

    /// Decode a record from the front of `data`. Returns `(record, consumed)`.
    ///
    /// Never reads past `data`; a short or invalid field fails with
    /// [`JournalError::MetaRecordTruncated`] naming that field.
    pub fn read(data: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0usize;
        let epoch_seq = read_varuint(data, &mut pos, MetaField::EpochSeq)?;
        let root_object_id = read_varuint(data, &mut pos, MetaField::RootObjectId)?;
        let version_index_ptr = read_u64(data, &mut pos, MetaField::VersionIndexPtr)?;
        let data_tail = read_u64(data, &mut pos, MetaField::DataTail)?;
        let next_object_id = read_varuint(data, &mut pos, MetaField::NextObjectId)?;

        let record = Self {
            epoch_seq,
            root_object_id: ObjectId::new(root_object_id),
            version_index_ptr: Address64::new(version_index_ptr),
            data_tail,
            next_object_id: ObjectId::new(next_object_id),
        };
        Ok((record, pos))
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        self.write(&mut out);
        out
    }
}

fn read_varuint(data: &[u8], pos: &mut usize, field: MetaField) -> Result<u64> {
    let (value, consumed) =
        decode_varuint(&data[*pos..]).map_err(|e| JournalError::MetaRecordTruncated {
            field,
            source: Some(e),
        })?;
    *pos += consumed;
    Ok(value)
}

fn read_u64(data: &[u8], pos: &mut usize, field: MetaField) -> Result<u64> {
    let bytes: [u8; 8] = data
        .get(*pos..*pos + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or(JournalError::MetaRecordTruncated {
            field,
            source: None,
        })?;
    *pos += 8;
    Ok(u64::from_le_bytes(bytes))
}
