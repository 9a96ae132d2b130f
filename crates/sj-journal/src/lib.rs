//! StateJournal: an embedded, append-only durable object store.
//!
//! Durable objects live in memory as ordinary Rust values. Each commit
//! appends one version record per changed object to the data file, then
//! one meta record describing the commit point to the meta file. Opening a
//! journal walks the meta file backwards to the newest commit whose data
//! made it to disk and discards everything after it.
//!
//! # Architecture
//!
//! - [`Journal`]: owns the two RBF files and the [`Workspace`] over them
//! - [`Workspace`]: identity map, dirty set, id allocation, two-phase commit
//! - [`DurableDict`]: change-tracking dictionary keyed by `u64`
//! - [`VersionIndex`]: maps each object to the address of its newest version
//! - [`WorkspaceRecovery`]: picks the recovery point from meta records

pub mod commit;
pub mod config;
pub mod dict;
pub mod error;
pub mod identity;
pub mod journal;
pub mod loader;
pub mod meta;
pub mod object;
pub mod records;
pub mod recovery;
pub mod tags;
pub mod version_index;
pub mod workspace;

pub use commit::{CommitContext, WrittenRecord};
pub use config::JournalConfig;
pub use dict::{DictValue, DurableDict};
pub use error::{JournalError, MetaField, Result};
pub use identity::{DirtySet, IdentityMap};
pub use journal::Journal;
pub use loader::{DataFileLoader, PayloadRegistry};
pub use meta::MetaCommitRecord;
pub use object::{DirtyHook, DurableObject, ObjectHandle, VersionedPayload};
pub use records::{
    DataRecordReader, DataRecordWriter, MetaRecordEntry, MetaRecordReader, MetaRecordWriter,
    ObjectVersionRecord,
};
pub use recovery::{RecoveryInfo, WorkspaceRecovery};
pub use version_index::VersionIndex;
pub use workspace::{ObjectLoader, Workspace};
