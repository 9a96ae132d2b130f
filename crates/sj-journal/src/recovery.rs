//! Commit-point selection at open time.
//!
//! The newest meta record whose `data_tail` fits inside the data file is
//! the recovery point. A meta record can outrun the data file when the meta
//! write reached disk but the data flush did not; such records are skipped.

use serde::{Deserialize, Serialize};
use sj_types::{Address64, ObjectId};
use tracing::{debug, warn};

use crate::meta::MetaCommitRecord;

/// State recovered from the newest usable commit point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    /// Zero when no commit was found.
    pub epoch_seq: u64,
    pub root_object_id: ObjectId,
    pub next_object_id: ObjectId,
    pub version_index_ptr: Address64,
    pub data_tail: u64,
    /// The data file extends past `data_tail` and should be cut back.
    pub was_truncated: bool,
    /// Data file size before truncation; zero unless `was_truncated`.
    pub original_data_size: u64,
}

impl RecoveryInfo {
    /// Nothing recovered: a fresh journal.
    pub const EMPTY: Self = Self {
        epoch_seq: 0,
        root_object_id: ObjectId::new(0),
        next_object_id: ObjectId::FIRST_USER,
        version_index_ptr: Address64::NULL,
        data_tail: 0,
        was_truncated: false,
        original_data_size: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.epoch_seq == 0
    }

    fn from_record(record: &MetaCommitRecord, actual_data_size: u64) -> Self {
        let was_truncated = actual_data_size > record.data_tail;
        Self {
            epoch_seq: record.epoch_seq,
            root_object_id: record.root_object_id,
            next_object_id: record.next_object_id,
            version_index_ptr: record.version_index_ptr,
            data_tail: record.data_tail,
            was_truncated,
            original_data_size: if was_truncated { actual_data_size } else { 0 },
        }
    }
}

impl Default for RecoveryInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Picks the recovery point from a set of meta records.
pub struct WorkspaceRecovery;

impl WorkspaceRecovery {
    /// `records` are in commit order, oldest first.
    pub fn recover(records: &[MetaCommitRecord], actual_data_size: u64) -> RecoveryInfo {
        Self::recover_newest_first(records.iter().rev().copied(), actual_data_size)
    }

    /// Like [`recover`](Self::recover), for records already newest first,
    /// as a reverse scan of the meta file yields them.
    pub fn recover_newest_first(
        records: impl IntoIterator<Item = MetaCommitRecord>,
        actual_data_size: u64,
    ) -> RecoveryInfo {
        let mut skipped = 0usize;
        for record in records {
            if Self::is_record_valid(&record, actual_data_size) {
                if skipped > 0 {
                    warn!(
                        skipped,
                        epoch_seq = record.epoch_seq,
                        "meta records ahead of the data file were discarded"
                    );
                }
                let info = RecoveryInfo::from_record(&record, actual_data_size);
                debug!(
                    epoch_seq = info.epoch_seq,
                    data_tail = info.data_tail,
                    was_truncated = info.was_truncated,
                    "recovery point selected"
                );
                return info;
            }
            skipped += 1;
        }
        if skipped > 0 {
            warn!(skipped, "no meta record fits the data file");
        }
        RecoveryInfo::EMPTY
    }

    /// A record is usable when its data tail lies within the data file.
    pub fn is_record_valid(record: &MetaCommitRecord, actual_data_size: u64) -> bool {
        record.data_tail <= actual_data_size
    }
}
