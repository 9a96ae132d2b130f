//! Durable object contract and shared handles.
//!
//! Objects live behind `Rc<RefCell<_>>` so the workspace, the identity map,
//! and callers can share one instance per id within a session. The
//! workspace holds objects through type-erased [`ObjectHandle`]s; typed
//! access goes through [`ObjectHandle::downcast`].

use std::any::{type_name, Any};
use std::cell::{BorrowError, BorrowMutError, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use sj_rbf::FrameTag;
use sj_types::{DurableObjectState, ObjectId};

use crate::error::Result;
use crate::identity::Tracker;

/// An object the workspace can persist as a chain of version records.
pub trait DurableObject: 'static {
    fn object_id(&self) -> ObjectId;

    fn state(&self) -> DurableObjectState;

    /// Whether a non-empty diff is pending. Always `false` once detached.
    fn has_changes(&self) -> bool;

    /// Tag of the version records this object writes.
    fn frame_tag(&self) -> FrameTag;

    /// Append the pending diff to `out`. Must not change object state, so a
    /// failed commit leaves the object exactly as it was.
    fn write_pending_diff(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Fold pending changes into the committed view and become clean.
    fn on_commit_succeeded(&mut self);

    /// Drop pending changes. A never-committed object becomes detached.
    fn discard_changes(&mut self);

    /// Receive the hook used to report the clean-to-dirty transition.
    fn attach(&mut self, hook: DirtyHook) {
        let _ = hook;
    }
}

/// A durable object type that can be created fresh or rebuilt from its
/// version chain.
pub trait VersionedPayload: DurableObject + Sized {
    const FRAME_TAG: FrameTag;

    /// A new, never-committed instance.
    fn create(id: ObjectId) -> Self;

    /// Rebuild a clean instance from its diffs, base version first.
    fn rehydrate(id: ObjectId, diffs: &[&[u8]]) -> Result<Self>;
}

/// Back-channel from an object to the workspace that tracks it.
///
/// Holds only a weak reference, so an object outliving its workspace
/// notifies nothing.
#[derive(Clone, Default)]
pub struct DirtyHook {
    tracker: Weak<RefCell<Tracker>>,
}

impl DirtyHook {
    pub(crate) fn new(tracker: &Rc<RefCell<Tracker>>) -> Self {
        Self {
            tracker: Rc::downgrade(tracker),
        }
    }

    /// Report that `id` went from clean to dirty.
    ///
    /// If the tracker is busy the notification is dropped; the commit path
    /// sweeps live dirty objects before writing.
    pub fn notify(&self, id: ObjectId) {
        if let Some(tracker) = self.tracker.upgrade() {
            if let Ok(mut tracker) = tracker.try_borrow_mut() {
                tracker.promote(id);
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.tracker.strong_count() > 0
    }
}

impl fmt::Debug for DirtyHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirtyHook")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Strong, type-erased reference to a shared durable object.
#[derive(Clone)]
pub struct ObjectHandle {
    id: ObjectId,
    type_name: &'static str,
    object: Rc<RefCell<dyn DurableObject>>,
    any: Rc<dyn Any>,
}

impl ObjectHandle {
    pub fn new<T: DurableObject>(object: T) -> Self {
        Self::from_shared(Rc::new(RefCell::new(object)))
    }

    /// Wrap an already shared object without copying it.
    pub fn from_shared<T: DurableObject>(shared: Rc<RefCell<T>>) -> Self {
        let id = shared.borrow().object_id();
        let object: Rc<RefCell<dyn DurableObject>> = shared.clone();
        Self {
            id,
            type_name: type_name::<T>(),
            object,
            any: shared,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Name of the concrete payload type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn borrow(&self) -> Ref<'_, dyn DurableObject> {
        self.object.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, dyn DurableObject> {
        self.object.borrow_mut()
    }

    pub fn try_borrow(&self) -> std::result::Result<Ref<'_, dyn DurableObject>, BorrowError> {
        self.object.try_borrow()
    }

    pub fn try_borrow_mut(
        &self,
    ) -> std::result::Result<RefMut<'_, dyn DurableObject>, BorrowMutError> {
        self.object.try_borrow_mut()
    }

    /// Typed view of the shared object, or `None` if it is not a `T`.
    pub fn downcast<T: DurableObject>(&self) -> Option<Rc<RefCell<T>>> {
        self.any.clone().downcast::<RefCell<T>>().ok()
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::as_ptr(&self.any).cast::<()>() == Rc::as_ptr(&other.any).cast::<()>()
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            id: self.id,
            type_name: self.type_name,
            object: Rc::downgrade(&self.object),
            any: Rc::downgrade(&self.any),
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .finish()
    }
}

/// Weak counterpart of [`ObjectHandle`]; does not keep the object alive.
#[derive(Clone)]
pub(crate) struct WeakHandle {
    id: ObjectId,
    type_name: &'static str,
    object: Weak<RefCell<dyn DurableObject>>,
    any: Weak<dyn Any>,
}

impl WeakHandle {
    pub(crate) fn upgrade(&self) -> Option<ObjectHandle> {
        Some(ObjectHandle {
            id: self.id,
            type_name: self.type_name,
            object: self.object.upgrade()?,
            any: self.any.upgrade()?,
        })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.object.strong_count() > 0
    }
}
