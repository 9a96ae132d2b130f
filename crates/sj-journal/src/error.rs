use std::fmt;
use std::io;

use sj_rbf::{FrameTag, RbfError};
use sj_types::{Address64, ObjectId, TypeError};

/// Field of a [`MetaCommitRecord`](crate::meta::MetaCommitRecord), in wire order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaField {
    EpochSeq,
    RootObjectId,
    VersionIndexPtr,
    DataTail,
    NextObjectId,
}

impl fmt::Display for MetaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EpochSeq => "EpochSeq",
            Self::RootObjectId => "RootObjectId",
            Self::VersionIndexPtr => "VersionIndexPtr",
            Self::DataTail => "DataTail",
            Self::NextObjectId => "NextObjectId",
        };
        f.write_str(name)
    }
}

/// Errors produced by the journal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Frame-layer failure (I/O, framing, CRC).
    #[error("rbf error: {0}")]
    Rbf(#[from] RbfError),

    /// Primitive decoding failure.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// I/O error outside the frame layer.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An id in the reserved range was supplied where a user id is required.
    #[error("object id {0} is reserved (ids 0..=15 belong to system objects)")]
    ReservedObjectId(u64),

    /// Every allocatable object id has been handed out.
    #[error("object id space exhausted")]
    ObjectIdExhausted,

    /// No version of the object exists.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// The object was discarded before its first commit.
    #[error("object {0} is detached")]
    ObjectDetached(ObjectId),

    /// A typed load found an object of a different payload type.
    #[error("object {id} is a {actual}, not a {expected}")]
    ObjectTypeMismatch {
        id: ObjectId,
        expected: &'static str,
        actual: &'static str,
    },

    /// The object is borrowed elsewhere while the workspace needs it.
    #[error("object {0} is borrowed elsewhere")]
    ObjectBusy(ObjectId),

    /// A second live instance was offered for an id already tracked.
    #[error("object {0} is already tracked by another live instance")]
    IdentityConflict(ObjectId),

    /// A meta commit record field could not be read.
    #[error("meta commit record truncated or invalid at {field}")]
    MetaRecordTruncated {
        field: MetaField,
        #[source]
        source: Option<TypeError>,
    },

    /// A frame carries a tag other than the one the reader expects.
    #[error("unexpected frame tag {actual} at {address}, expected {expected}")]
    UnexpectedFrameTag {
        address: Address64,
        expected: FrameTag,
        actual: FrameTag,
    },

    /// A record payload is structurally invalid.
    #[error("malformed record at {address}: {reason}")]
    MalformedRecord { address: Address64, reason: String },

    /// A diff payload is structurally invalid.
    #[error("malformed diff: {0}")]
    MalformedDiff(String),

    /// Diff keys must be strictly ascending.
    #[error("diff key {key} does not follow {previous}")]
    DiffKeyOrder { previous: u64, key: u64 },

    /// No payload type is registered for a version record's tag.
    #[error("no payload type registered for frame tag {0}")]
    UnknownPayloadTag(FrameTag),

    /// A commit context was completed out of order.
    #[error("commit context for epoch {context} does not follow epoch {current}")]
    StaleCommitContext { context: u64, current: u64 },

    /// Configuration could not be parsed or is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias used throughout the journal crate.
pub type Result<T> = std::result::Result<T, JournalError>;
