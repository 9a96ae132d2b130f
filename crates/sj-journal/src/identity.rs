//! Identity map and dirty set.
//!
//! The identity map holds weak handles so it never keeps an object alive;
//! the dirty set holds strong handles so unsaved changes survive until the
//! next commit even if the caller drops every reference.

use std::collections::{BTreeMap, HashMap};

use sj_types::ObjectId;
use tracing::debug;

use crate::error::{JournalError, Result};
use crate::object::{ObjectHandle, WeakHandle};

/// Weak `ObjectId -> object` cache guaranteeing one live instance per id.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectId, WeakHandle>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle`. Re-adding the same instance is a no-op; a different
    /// live instance for the same id is rejected.
    pub fn add(&mut self, handle: &ObjectHandle) -> Result<()> {
        if let Some(live) = self.entries.get(&handle.id()).and_then(WeakHandle::upgrade) {
            if live.ptr_eq(handle) {
                return Ok(());
            }
            return Err(JournalError::IdentityConflict(handle.id()));
        }
        self.insert(handle);
        Ok(())
    }

    /// Track `handle`, replacing whatever was recorded for its id.
    pub(crate) fn insert(&mut self, handle: &ObjectHandle) {
        self.entries.insert(handle.id(), handle.downgrade());
    }

    /// The live instance for `id`. A dead entry is dropped on the way.
    pub fn try_get(&mut self, id: ObjectId) -> Option<ObjectHandle> {
        let handle = self.entries.get(&id)?.upgrade();
        if handle.is_none() {
            self.entries.remove(&id);
        }
        handle
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Drop entries whose object is gone. Returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.is_alive());
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "identity map cleaned");
        }
        removed
    }

    /// Number of entries, dead ones included until cleaned up.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn live_handles(&self) -> Vec<ObjectHandle> {
        self.entries.values().filter_map(WeakHandle::upgrade).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Strong set of dirty objects, iterated in ascending id order.
#[derive(Default)]
pub struct DirtySet {
    entries: BTreeMap<ObjectId, ObjectHandle>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn add(&mut self, handle: ObjectHandle) {
        self.entries.entry(handle.id()).or_insert(handle);
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectHandle> + '_ {
        self.entries.values()
    }

    /// Snapshot of the current members, ascending by id.
    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.entries.values().cloned().collect()
    }
}

/// Identity map plus dirty set, shared between a workspace and the hooks
/// of the objects it tracks.
#[derive(Default)]
pub(crate) struct Tracker {
    pub(crate) identity: IdentityMap,
    pub(crate) dirty: DirtySet,
}

impl Tracker {
    /// Move a live tracked object into the dirty set.
    pub(crate) fn promote(&mut self, id: ObjectId) {
        if let Some(handle) = self.identity.try_get(id) {
            self.dirty.add(handle);
        }
    }

    /// Add every live dirty object the dirty set is missing. Objects that
    /// are mutably borrowed right now are skipped.
    pub(crate) fn sweep_live_dirty(&mut self) {
        for handle in self.identity.live_handles() {
            if self.dirty.contains(handle.id()) {
                continue;
            }
            let dirty = handle
                .try_borrow()
                .map(|object| object.state().is_dirty())
                .unwrap_or(false);
            if dirty {
                self.dirty.add(handle);
            }
        }
    }
}
