//! Typed record streams over RBF.
//!
//! The data file carries object-version records:
//!
//! ```text
//! payload := [PrevVersionPtr u64 LE][DiffPayload ...]
//! ```
//!
//! `PrevVersionPtr` links each version to the one before it (null for a
//! base version), forming a backward chain per object. The meta file
//! carries one [`MetaCommitRecord`] per commit.

use bytes::BufMut;
use sj_rbf::{FrameSink, FrameStatus, FrameTag, RandomRead, RbfFrame, RbfScanner, ScanReverse};
use sj_types::Address64;
use tracing::{debug, warn};

use crate::error::{JournalError, Result};
use crate::meta::MetaCommitRecord;
use crate::tags::{self, DICT_VERSION, META_COMMIT};

/// One decoded object-version record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectVersionRecord {
    pub address: Address64,
    pub tag: FrameTag,
    /// Previous version of the same object; null for a base version.
    pub prev_version: Address64,
    pub diff: Vec<u8>,
}

impl ObjectVersionRecord {
    /// Smallest valid payload: just the previous-version pointer.
    pub const MIN_PAYLOAD_LEN: usize = 8;

    pub fn is_base(&self) -> bool {
        self.prev_version.is_null()
    }

    fn from_frame(frame: RbfFrame) -> Result<Self> {
        if !tags::is_object_version(frame.tag) {
            return Err(JournalError::MalformedRecord {
                address: frame.address,
                reason: format!("frame tag {} is not an object version", frame.tag),
            });
        }
        if frame.payload.len() < Self::MIN_PAYLOAD_LEN {
            return Err(JournalError::MalformedRecord {
                address: frame.address,
                reason: format!("payload of {} bytes has no version pointer", frame.payload.len()),
            });
        }
        let mut prev = [0u8; 8];
        prev.copy_from_slice(&frame.payload[..8]);
        let prev_version = Address64::try_new(u64::from_le_bytes(prev))?;
        let mut diff = frame.payload;
        diff.drain(..Self::MIN_PAYLOAD_LEN);
        Ok(Self {
            address: frame.address,
            tag: frame.tag,
            prev_version,
            diff,
        })
    }
}

/// Appends object-version records to a data stream.
pub struct DataRecordWriter<S> {
    sink: S,
    payload: Vec<u8>,
}

impl<S: FrameSink> DataRecordWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            payload: Vec::new(),
        }
    }

    /// Append a version record for any object-version tag.
    pub fn append_version(
        &mut self,
        tag: FrameTag,
        prev_version: Address64,
        diff: &[u8],
    ) -> Result<Address64> {
        self.payload.clear();
        self.payload.put_u64_le(prev_version.get());
        self.payload.extend_from_slice(diff);
        let address = self.sink.append_frame(tag, &self.payload, FrameStatus::Valid)?;
        debug!(%address, %tag, %prev_version, diff_len = diff.len(), "version record appended");
        Ok(address)
    }

    pub fn append_dict_version(&mut self, prev_version: Address64, diff: &[u8]) -> Result<Address64> {
        self.append_version(DICT_VERSION, prev_version, diff)
    }

    pub fn tail(&self) -> u64 {
        self.sink.tail()
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.sink.flush()?)
    }

    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

/// Reads object-version records from a data stream.
pub struct DataRecordReader<R> {
    scanner: RbfScanner<R>,
}

impl<R: RandomRead> DataRecordReader<R> {
    pub fn new(source: R, len: u64) -> Self {
        Self {
            scanner: RbfScanner::new(source, len),
        }
    }

    /// Read and validate the record at `address`.
    pub fn read_version(&mut self, address: Address64) -> Result<ObjectVersionRecord> {
        let frame = self.scanner.read_frame(address)?;
        ObjectVersionRecord::from_frame(frame)
    }

    /// Follow the chain starting at `head`, newest record first.
    ///
    /// Every link must point strictly backward in the file, which also
    /// guarantees the walk terminates.
    pub fn read_chain(&mut self, head: Address64) -> Result<Vec<ObjectVersionRecord>> {
        let mut chain = Vec::new();
        let mut next = head;
        while !next.is_null() {
            let record = self.read_version(next)?;
            if !record.prev_version.is_null() && record.prev_version >= record.address {
                return Err(JournalError::MalformedRecord {
                    address: record.address,
                    reason: format!(
                        "previous version {} does not precede the record",
                        record.prev_version
                    ),
                });
            }
            next = record.prev_version;
            chain.push(record);
        }
        Ok(chain)
    }

    /// Object-version records from newest to oldest. Frames that are not
    /// version records, or whose payload is unusable, are skipped.
    pub fn scan_reverse(&mut self) -> DataScan<'_, R> {
        DataScan {
            frames: self.scanner.scan_reverse(),
        }
    }

    pub fn into_inner(self) -> R {
        self.scanner.into_inner()
    }
}

/// Iterator returned by [`DataRecordReader::scan_reverse`].
pub struct DataScan<'a, R> {
    frames: ScanReverse<'a, R>,
}

impl<R: RandomRead> Iterator for DataScan<'_, R> {
    type Item = Result<ObjectVersionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = match self.frames.next()? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e.into())),
            };
            let address = frame.address;
            match ObjectVersionRecord::from_frame(frame) {
                Ok(record) => return Some(Ok(record)),
                Err(e) => debug!(%address, error = %e, "non-version frame skipped"),
            }
        }
    }
}

/// A meta commit record located in the meta stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaRecordEntry {
    pub address: Address64,
    /// Offset one past the frame's closing fence.
    pub end: u64,
    pub status: FrameStatus,
    pub record: MetaCommitRecord,
}

impl MetaRecordEntry {
    fn from_frame(frame: &RbfFrame) -> Result<Self> {
        if frame.tag != META_COMMIT {
            return Err(JournalError::UnexpectedFrameTag {
                address: frame.address,
                expected: META_COMMIT,
                actual: frame.tag,
            });
        }
        let (record, _) = MetaCommitRecord::read(&frame.payload)?;
        Ok(Self {
            address: frame.address,
            end: frame.end(),
            status: frame.status,
            record,
        })
    }
}

/// Appends meta commit records.
pub struct MetaRecordWriter<S> {
    sink: S,
    payload: Vec<u8>,
}

impl<S: FrameSink> MetaRecordWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            payload: Vec::new(),
        }
    }

    pub fn append_commit(&mut self, record: &MetaCommitRecord) -> Result<Address64> {
        self.payload.clear();
        record.write(&mut self.payload);
        let address = self.sink.append_frame(META_COMMIT, &self.payload, FrameStatus::Valid)?;
        debug!(
            %address,
            epoch_seq = record.epoch_seq,
            data_tail = record.data_tail,
            "meta commit record appended"
        );
        Ok(address)
    }

    pub fn tail(&self) -> u64 {
        self.sink.tail()
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.sink.flush()?)
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

/// Reads meta commit records.
pub struct MetaRecordReader<R> {
    scanner: RbfScanner<R>,
}

impl<R: RandomRead> MetaRecordReader<R> {
    pub fn new(source: R, len: u64) -> Self {
        Self {
            scanner: RbfScanner::new(source, len),
        }
    }

    /// Read the meta record at `address`, surfacing every defect.
    pub fn try_read_at(&mut self, address: Address64) -> Result<MetaRecordEntry> {
        let frame = self.scanner.read_frame(address)?;
        MetaRecordEntry::from_frame(&frame)
    }

    /// Meta records from newest to oldest, tombstones included. Foreign
    /// frames and unparsable records are skipped with a warning.
    pub fn scan_reverse(&mut self) -> MetaScan<'_, R> {
        MetaScan {
            frames: self.scanner.scan_reverse(),
        }
    }
}

/// Iterator returned by [`MetaRecordReader::scan_reverse`].
pub struct MetaScan<'a, R> {
    frames: ScanReverse<'a, R>,
}

impl<R: RandomRead> Iterator for MetaScan<'_, R> {
    type Item = Result<MetaRecordEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = match self.frames.next()? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e.into())),
            };
            match MetaRecordEntry::from_frame(&frame) {
                Ok(entry) => return Some(Ok(entry)),
                Err(e) => warn!(address = %frame.address, error = %e, "meta frame skipped"),
            }
        }
    }
}
