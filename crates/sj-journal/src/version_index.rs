use std::collections::BTreeMap;

use sj_rbf::FrameTag;
use sj_types::{Address64, DurableObjectState, ObjectId};

use crate::dict::DurableDict;
use crate::error::Result;
use crate::object::DurableObject;
use crate::tags::DICT_VERSION;

/// Map from object id to the address of that object's newest version
/// record, itself stored as a durable dictionary under object id 0.
///
/// Pointers staged by a commit in progress can be rolled back as a group,
/// so an abandoned commit never leaves a pointer to a record no meta
/// record covers.
#[derive(Debug)]
pub struct VersionIndex {
    dict: DurableDict<Option<Address64>>,
    /// Working-map entries as they were before each staged pointer, oldest
    /// first. `None` means the key was absent.
    staged: Vec<(u64, Option<Option<Address64>>)>,
}

impl VersionIndex {
    pub const FRAME_TAG: FrameTag = DICT_VERSION;

    /// An empty, never-committed index.
    pub fn new() -> Self {
        Self::wrap(DurableDict::new(ObjectId::VERSION_INDEX))
    }

    /// Rebuild the index from its version chain, base version first.
    pub fn from_version_chain(diffs: &[&[u8]]) -> Result<Self> {
        Ok(Self::wrap(DurableDict::from_version_chain(
            ObjectId::VERSION_INDEX,
            diffs,
        )?))
    }

    /// A clean index holding exactly `entries`.
    pub fn from_entries(entries: impl IntoIterator<Item = (ObjectId, Address64)>) -> Self {
        let map: BTreeMap<u64, Option<Address64>> = entries
            .into_iter()
            .map(|(id, ptr)| (id.get(), ptr.non_null()))
            .collect();
        Self::wrap(DurableDict::from_committed(ObjectId::VERSION_INDEX, map))
    }

    fn wrap(dict: DurableDict<Option<Address64>>) -> Self {
        Self {
            dict,
            staged: Vec::new(),
        }
    }

    /// Newest version address of `id`, or `None` if absent or null.
    pub fn try_get_object_version_ptr(&self, id: ObjectId) -> Option<Address64> {
        self.dict.current().get(&id.get()).copied().flatten()
    }

    /// Point `id` at `ptr`. A null pointer is stored as an explicit null.
    pub fn set_object_version_ptr(&mut self, id: ObjectId, ptr: Address64) -> Result<()> {
        self.dict.set(id.get(), ptr.non_null())
    }

    /// Like [`set_object_version_ptr`](Self::set_object_version_ptr), but
    /// undone by [`rollback_staged`](Self::rollback_staged).
    pub(crate) fn stage_object_version_ptr(&mut self, id: ObjectId, ptr: Address64) -> Result<()> {
        let key = id.get();
        let before = self.dict.current().get(&key).copied();
        self.dict.set(key, ptr.non_null())?;
        self.staged.push((key, before));
        Ok(())
    }

    /// Whether pointers staged by an unfinished commit are outstanding.
    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Restore every entry staged since the last successful commit.
    pub fn rollback_staged(&mut self) -> Result<()> {
        while let Some((key, before)) = self.staged.pop() {
            match before {
                Some(value) => self.dict.set(key, value)?,
                None => {
                    self.dict.remove(key)?;
                }
            }
        }
        Ok(())
    }

    /// One past the largest known id, never below the first user id.
    pub fn compute_next_object_id(&self) -> ObjectId {
        let max = self
            .dict
            .current()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(ObjectId::LAST_RESERVED.get());
        ObjectId::new(max.saturating_add(1))
    }

    /// Number of ids with a non-null pointer.
    pub fn count(&self) -> usize {
        self.dict.current().values().filter(|ptr| ptr.is_some()).count()
    }

    /// Ids with a non-null pointer, ascending.
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.dict
            .current()
            .iter()
            .filter(|(_, ptr)| ptr.is_some())
            .map(|(id, _)| ObjectId::new(*id))
    }
}

impl DurableObject for VersionIndex {
    fn object_id(&self) -> ObjectId {
        ObjectId::VERSION_INDEX
    }

    fn state(&self) -> DurableObjectState {
        self.dict.state()
    }

    fn has_changes(&self) -> bool {
        self.dict.has_changes()
    }

    fn frame_tag(&self) -> FrameTag {
        Self::FRAME_TAG
    }

    fn write_pending_diff(&self, out: &mut Vec<u8>) -> Result<()> {
        self.dict.write_pending_diff(out)
    }

    fn on_commit_succeeded(&mut self) {
        self.staged.clear();
        self.dict.on_commit_succeeded();
    }

    fn discard_changes(&mut self) {
        self.staged.clear();
        // The index has no detached state; a never-committed index just
        // drops back to empty.
        if self.dict.state() == DurableObjectState::TransientDirty {
            self.dict = DurableDict::new(ObjectId::VERSION_INDEX);
        } else {
            self.dict.discard_changes();
        }
    }
}

impl Default for VersionIndex {
    fn default() -> Self {
        Self::new()
    }
}
