//! Loading objects from the data file.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;

use sj_rbf::{FrameTag, ReadCache, ReadCacheConfig};
use sj_types::{Address64, ObjectId};
use tracing::debug;

use crate::dict::DurableDict;
use crate::error::{JournalError, Result};
use crate::object::{ObjectHandle, VersionedPayload};
use crate::records::DataRecordReader;
use crate::workspace::ObjectLoader;

type RehydrateFn = fn(ObjectId, &[&[u8]]) -> Result<ObjectHandle>;

fn rehydrate_as<T: VersionedPayload>(id: ObjectId, diffs: &[&[u8]]) -> Result<ObjectHandle> {
    Ok(ObjectHandle::new(T::rehydrate(id, diffs)?))
}

/// Maps version-record frame tags to the payload type that rebuilds them.
///
/// The default registry maps the dictionary tag to `DurableDict<i64>`.
/// Registering another type for the same tag replaces it.
#[derive(Clone)]
pub struct PayloadRegistry {
    entries: HashMap<FrameTag, (RehydrateFn, &'static str)>,
}

impl PayloadRegistry {
    /// A registry with no payload types.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register<T: VersionedPayload>(&mut self) -> &mut Self {
        self.entries
            .insert(T::FRAME_TAG, (rehydrate_as::<T> as RehydrateFn, std::any::type_name::<T>()));
        self
    }

    pub fn contains(&self, tag: FrameTag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Rebuild object `id` from diffs, base version first.
    pub fn rehydrate(&self, id: ObjectId, tag: FrameTag, diffs: &[&[u8]]) -> Result<ObjectHandle> {
        let (rehydrate, _) = self
            .entries
            .get(&tag)
            .ok_or(JournalError::UnknownPayloadTag(tag))?;
        rehydrate(id, diffs)
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<DurableDict<i64>>();
        registry
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(tag, (_, name))| (tag, name)))
            .finish()
    }
}

/// [`ObjectLoader`] that replays version chains from a data file.
///
/// Each load reads through a fresh [`ReadCache`]; the file only grows, so
/// nothing read earlier can go stale, but a cache is never kept across
/// appends.
pub struct DataFileLoader {
    file: File,
    cache: ReadCacheConfig,
    registry: PayloadRegistry,
}

impl DataFileLoader {
    /// Open `path` read-only.
    pub fn open(path: &Path, cache: ReadCacheConfig, registry: PayloadRegistry) -> Result<Self> {
        cache
            .validate()
            .map_err(|e| JournalError::InvalidConfig(e.to_string()))?;
        let file = File::open(path)?;
        Ok(Self {
            file,
            cache,
            registry,
        })
    }

    pub fn registry(&self) -> &PayloadRegistry {
        &self.registry
    }

    /// Read the chain at `head` and rebuild the object.
    pub fn load_chain(&self, id: ObjectId, head: Address64) -> Result<ObjectHandle> {
        let len = self.file.metadata()?.len();
        let cache = ReadCache::new(&self.file, &self.cache)?;
        let mut reader = DataRecordReader::new(cache, len);
        let chain = reader.read_chain(head)?;

        let Some(newest) = chain.first() else {
            return Err(JournalError::ObjectNotFound(id));
        };
        if let Some(stray) = chain.iter().find(|r| r.tag != newest.tag) {
            return Err(JournalError::MalformedRecord {
                address: stray.address,
                reason: format!(
                    "version tag {} differs from the newest version's {}",
                    stray.tag, newest.tag
                ),
            });
        }

        let diffs: Vec<&[u8]> = chain.iter().rev().map(|r| r.diff.as_slice()).collect();
        let handle = self.registry.rehydrate(id, newest.tag, &diffs)?;
        debug!(%id, %head, versions = chain.len(), "object rehydrated");
        Ok(handle)
    }
}

impl ObjectLoader for DataFileLoader {
    fn load(&mut self, id: ObjectId, version: Option<Address64>) -> Result<ObjectHandle> {
        let head = version.ok_or(JournalError::ObjectNotFound(id))?;
        self.load_chain(id, head)
    }
}

impl fmt::Debug for DataFileLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFileLoader")
            .field("cache", &self.cache)
            .field("registry", &self.registry)
            .finish()
    }
}
