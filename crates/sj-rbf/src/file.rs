use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sj_types::Address64;
use tracing::{debug, warn};

use crate::error::{RbfError, Result};
use crate::layout::{encode_frame, FrameStatus, FrameTag, FENCE, GENESIS_LEN};
use crate::scanner::RbfScanner;
use crate::sink::FrameSink;
use crate::source::RandomRead;

/// Flush/sync strategy for an RBF file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every appended frame.
    EveryWrite,
    /// `fsync` on every explicit flush (once per commit step).
    #[default]
    OnFlush,
    /// Rely on OS page-cache buffering (fastest, least durable).
    OsDefault,
}

/// Configuration for an RBF file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbfConfig {
    /// Sync strategy.
    pub sync_mode: SyncMode,
}

/// File-backed, append-only RBF stream.
///
/// Frames are staged in a `BufWriter` and reach the file on [`flush`]. On
/// open, an empty file receives the genesis fence; an existing file must
/// start with it. A tail that is not 4-byte aligned can only be the torn
/// remains of an interrupted append and is trimmed back to alignment.
///
/// A failed write, flush or sync poisons the file: the bytes handed to the
/// OS may or may not have landed, so every later append, flush and
/// truncate returns [`RbfError::Poisoned`] until the file is reopened.
///
/// [`flush`]: FrameSink::flush
pub struct RbfFile {
    path: PathBuf,
    writer: BufWriter<File>,
    tail: u64,
    config: RbfConfig,
    scratch: Vec<u8>,
    poisoned: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl RbfFile {
    /// Open (or create) an RBF file at the given path.
    pub fn open(path: &Path, config: RbfConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut len = file.metadata()?.len();
        let mut head = [0u8; FENCE.len()];
        let got = (&file).read_full_at(0, &mut head)?;
        if head[..got] != FENCE[..got] {
            return Err(RbfError::MissingGenesis);
        }
        if got < FENCE.len() {
            // Empty, or a genesis fence torn mid-write.
            file.set_len(0)?;
            (&file).write_all(&FENCE)?;
            file.sync_all()?;
            len = GENESIS_LEN;
            debug!(path = %path.display(), "RBF genesis written");
        } else if len % Address64::ALIGNMENT != 0 {
            let aligned = len - len % Address64::ALIGNMENT;
            warn!(
                path = %path.display(),
                len,
                aligned,
                "unaligned RBF tail; trimming torn bytes"
            );
            file.set_len(aligned)?;
            len = aligned;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            tail: len,
            config,
            scratch: Vec::new(),
            poisoned: false,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Path to the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length in bytes, buffered frames included.
    pub fn len(&self) -> u64 {
        self.tail
    }

    /// Returns `true` if the file holds no frames.
    pub fn is_empty(&self) -> bool {
        self.tail == GENESIS_LEN
    }

    /// Cut the file back to `len` bytes.
    ///
    /// `len` must be 4-byte aligned and lie between the genesis fence and the
    /// current tail. Callers pass a known frame boundary, such as the data
    /// tail of the last valid commit.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.ensure_usable()?;
        if len % Address64::ALIGNMENT != 0 || len < GENESIS_LEN || len > self.tail {
            return Err(RbfError::InvalidTruncate {
                requested: len,
                current: self.tail,
            });
        }
        let result = self.writer.flush();
        self.poison_on_err(result)?;
        let result = self.writer.get_ref().set_len(len);
        self.poison_on_err(result)?;
        if self.config.sync_mode != SyncMode::OsDefault {
            let result = self.sync_to_disk();
            self.poison_on_err(result)?;
        }
        debug!(path = %self.path.display(), from = self.tail, to = len, "RBF truncated");
        self.tail = len;
        Ok(())
    }

    /// Flushed, positional read access to the file.
    pub fn source(&mut self) -> Result<&File> {
        let result = self.writer.flush();
        self.poison_on_err(result)?;
        Ok(self.writer.get_ref())
    }

    /// Returns `true` once a failed write has made the file unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(RbfError::Poisoned);
        }
        Ok(())
    }

    fn poison_on_err<T>(&mut self, result: io::Result<T>) -> Result<T> {
        result.map_err(|e| {
            if !self.poisoned {
                warn!(path = %self.path.display(), tail = self.tail, error = %e, "RBF file poisoned");
            }
            self.poisoned = true;
            RbfError::Io(e)
        })
    }

    fn sync_to_disk(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.writer.get_ref().sync_all()
    }

    /// A scanner over everything appended so far.
    pub fn scanner(&mut self) -> Result<RbfScanner<&File>> {
        let len = self.tail;
        Ok(RbfScanner::new(self.source()?, len))
    }
}

impl FrameSink for RbfFile {
    fn append_frame(&mut self, tag: FrameTag, payload: &[u8], status: FrameStatus) -> Result<Address64> {
        self.ensure_usable()?;
        self.scratch.clear();
        let written = encode_frame(&mut self.scratch, tag, payload, status)?;
        let result = self.writer.write_all(&self.scratch);
        self.poison_on_err(result)?;

        // The frame is handed over; a failed sync below cannot take it back.
        let address = Address64::new(self.tail);
        self.tail += written as u64;

        if self.config.sync_mode == SyncMode::EveryWrite {
            let result = self.sync_to_disk();
            self.poison_on_err(result)?;
        }
        debug!(address = address.get(), len = payload.len(), tag = %tag, "RBF append");
        Ok(address)
    }

    fn tail(&self) -> u64 {
        self.tail
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let result = if self.config.sync_mode == SyncMode::OsDefault {
            self.writer.flush()
        } else {
            self.sync_to_disk()
        };
        self.poison_on_err(result)
    }
}
