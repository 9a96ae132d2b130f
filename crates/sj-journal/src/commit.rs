use sj_types::{Address64, ObjectId};

use crate::meta::MetaCommitRecord;

/// A version record written during the prepare phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WrittenRecord {
    pub object_id: ObjectId,
    pub address: Address64,
}

/// Outcome of the prepare phase of a commit.
///
/// Carries everything the meta record needs and the list of records the
/// prepare phase appended, in write order. The version index record, when
/// present, is last and belongs to [`ObjectId::VERSION_INDEX`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitContext {
    epoch_seq: u64,
    root_object_id: ObjectId,
    data_tail: u64,
    version_index_ptr: Address64,
    written: Vec<WrittenRecord>,
    /// Identifies the prepare call that produced this context.
    ticket: u64,
}

impl CommitContext {
    pub(crate) fn new(
        epoch_seq: u64,
        root_object_id: ObjectId,
        version_index_ptr: Address64,
        data_tail: u64,
    ) -> Self {
        Self {
            epoch_seq,
            root_object_id,
            data_tail,
            version_index_ptr,
            written: Vec::new(),
            ticket: 0,
        }
    }

    /// Epoch this commit will establish.
    pub fn epoch_seq(&self) -> u64 {
        self.epoch_seq
    }

    pub fn root_object_id(&self) -> ObjectId {
        self.root_object_id
    }

    /// Data stream length after the last written record.
    pub fn data_tail(&self) -> u64 {
        self.data_tail
    }

    /// Version index address after this commit.
    pub fn version_index_ptr(&self) -> Address64 {
        self.version_index_ptr
    }

    pub fn written_records(&self) -> &[WrittenRecord] {
        &self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    /// Whether a record for `id` was written.
    pub fn wrote(&self, id: ObjectId) -> bool {
        self.written.iter().any(|r| r.object_id == id)
    }

    pub(crate) fn record_object(&mut self, object_id: ObjectId, address: Address64) {
        self.written.push(WrittenRecord { object_id, address });
    }

    pub(crate) fn record_version_index(&mut self, address: Address64) {
        self.record_object(ObjectId::VERSION_INDEX, address);
        self.version_index_ptr = address;
    }

    pub(crate) fn set_data_tail(&mut self, data_tail: u64) {
        self.data_tail = data_tail;
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }

    pub(crate) fn set_ticket(&mut self, ticket: u64) {
        self.ticket = ticket;
    }

    /// The meta record that makes this commit durable.
    pub fn build_meta_record(&self, next_object_id: ObjectId) -> MetaCommitRecord {
        MetaCommitRecord {
            epoch_seq: self.epoch_seq,
            root_object_id: self.root_object_id,
            version_index_ptr: self.version_index_ptr,
            data_tail: self.data_tail,
            next_object_id,
        }
    }
}
