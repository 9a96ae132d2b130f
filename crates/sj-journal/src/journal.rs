//! File-backed journal: a data file, a meta file, and the workspace over
//! them.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use sj_rbf::layout::GENESIS_LEN;
use sj_rbf::{RbfFile, ReadCache};
use sj_types::ObjectId;
use tracing::{debug, warn};

use crate::commit::CommitContext;
use crate::config::JournalConfig;
use crate::error::Result;
use crate::loader::{DataFileLoader, PayloadRegistry};
use crate::object::VersionedPayload;
use crate::recovery::{RecoveryInfo, WorkspaceRecovery};
use crate::records::{DataRecordReader, DataRecordWriter, MetaRecordReader, MetaRecordWriter};
use crate::version_index::VersionIndex;
use crate::workspace::Workspace;

/// An open journal directory.
///
/// Opening recovers the newest commit point whose data is fully on disk
/// and, unless disabled in [`JournalConfig`], cuts both files back to it.
pub struct Journal {
    dir: PathBuf,
    config: JournalConfig,
    data: RbfFile,
    meta: RbfFile,
    workspace: Workspace,
    recovery: RecoveryInfo,
}

impl Journal {
    /// Open or create the journal in `dir` with the default payload types.
    pub fn open(dir: &Path, config: JournalConfig) -> Result<Self> {
        Self::open_with_registry(dir, config, PayloadRegistry::default())
    }

    /// Open or create the journal in `dir`, loading objects through
    /// `registry`.
    pub fn open_with_registry(
        dir: &Path,
        config: JournalConfig,
        registry: PayloadRegistry,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(dir)?;

        let mut data = RbfFile::open(&dir.join(&config.data_file_name), config.rbf.clone())?;
        let mut meta = RbfFile::open(&dir.join(&config.meta_file_name), config.rbf.clone())?;

        let (recovery, meta_end) = recover_from_meta(&mut meta, &config, data.len())?;

        if config.truncate_on_recover {
            if meta_end < meta.len() {
                warn!(from = meta.len(), to = meta_end, "discarding meta records past the recovery point");
                meta.truncate(meta_end)?;
            }
            let data_end = recovery.data_tail.max(GENESIS_LEN);
            if data_end < data.len() {
                warn!(
                    from = data.len(),
                    to = data_end,
                    epoch_seq = recovery.epoch_seq,
                    "discarding uncommitted data"
                );
                data.truncate(data_end)?;
            }
        }

        let version_index = if recovery.version_index_ptr.is_null() {
            VersionIndex::new()
        } else {
            let len = data.len();
            let cache = ReadCache::new(data.source()?, &config.cache)?;
            let mut reader = DataRecordReader::new(cache, len);
            let chain = reader.read_chain(recovery.version_index_ptr)?;
            let diffs: Vec<&[u8]> = chain.iter().rev().map(|r| r.diff.as_slice()).collect();
            VersionIndex::from_version_chain(&diffs)?
        };

        let loader = DataFileLoader::open(data.path(), config.cache.clone(), registry)?;
        let workspace = Workspace::from_recovery(&recovery, version_index).with_loader(loader);

        debug!(
            dir = %dir.display(),
            epoch_seq = recovery.epoch_seq,
            objects = workspace.version_index().count(),
            next_object_id = %workspace.next_object_id(),
            "journal opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            data,
            meta,
            workspace,
            recovery,
        })
    }

    /// Commit every pending change.
    ///
    /// Version records are flushed before the meta record is appended, and
    /// the meta record is flushed before objects are marked clean.
    pub fn commit(&mut self) -> Result<CommitContext> {
        let mut data = DataRecordWriter::new(&mut self.data);
        let mut meta = MetaRecordWriter::new(&mut self.meta);
        self.workspace.commit(&mut data, &mut meta)
    }

    /// Create a new object; it is written by the next commit that finds it
    /// changed.
    pub fn create_object<T: VersionedPayload>(&mut self) -> Result<Rc<RefCell<T>>> {
        self.workspace.create_object()
    }

    pub fn load_object<T: VersionedPayload>(&mut self, id: ObjectId) -> Result<Rc<RefCell<T>>> {
        self.workspace.load_object(id)
    }

    /// What was recovered when the journal was opened.
    pub fn recovery_info(&self) -> &RecoveryInfo {
        &self.recovery
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn data_len(&self) -> u64 {
        self.data.len()
    }

    pub fn meta_len(&self) -> u64 {
        self.meta.len()
    }
}

/// Reverse-scan the meta file and pick the recovery point.
///
/// Returns the recovery info and the end of the chosen meta frame, or the
/// genesis length when nothing was recovered. Tombstoned records are never
/// chosen.
fn recover_from_meta(
    meta: &mut RbfFile,
    config: &JournalConfig,
    data_len: u64,
) -> Result<(RecoveryInfo, u64)> {
    let len = meta.len();
    let cache = ReadCache::new(meta.source()?, &config.cache)?;
    let mut reader = MetaRecordReader::new(cache, len);

    // recovery stops pulling at the record it picks, so the last end seen
    // belongs to that record
    let mut last_end = GENESIS_LEN;
    let mut scan_error = None;
    let records = reader
        .scan_reverse()
        .map_while(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                scan_error = Some(e);
                None
            }
        })
        .filter(|entry| !entry.status.is_tombstone())
        .inspect(|entry| last_end = entry.end)
        .map(|entry| entry.record);
    let recovery = WorkspaceRecovery::recover_newest_first(records, data_len);

    if let Some(e) = scan_error {
        return Err(e);
    }
    let meta_end = if recovery.is_empty() { GENESIS_LEN } else { last_end };
    Ok((recovery, meta_end))
}
