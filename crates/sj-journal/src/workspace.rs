//! The workspace: object identity, dirty tracking, and two-phase commit.
//!
//! A commit runs in two phases. [`Workspace::prepare_commit`] appends one
//! version record per changed object and then the version index record,
//! without touching object state. [`Workspace::complete`] runs after the
//! meta record is durable and folds every pending change into the committed
//! view. [`Workspace::commit`] performs both with the required flushes in
//! between. A prepared commit that will not be completed is undone with
//! [`Workspace::abort_commit`]; the next prepare does this implicitly.

use std::any::type_name;
use std::cell::{RefCell, RefMut};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use sj_rbf::FrameSink;
use sj_types::{Address64, DurableObjectState, ObjectId};
use tracing::debug;

use crate::commit::CommitContext;
use crate::error::{JournalError, Result};
use crate::identity::Tracker;
use crate::object::{DirtyHook, DurableObject, ObjectHandle, VersionedPayload};
use crate::recovery::RecoveryInfo;
use crate::records::{DataRecordWriter, MetaRecordWriter};
use crate::version_index::VersionIndex;

/// Source of objects that are not yet in the identity map.
///
/// `version` is the object's newest version pointer from the version index,
/// if one is known. Closures of the form `FnMut(ObjectId) -> Result<_>`
/// implement this trait and ignore the pointer.
pub trait ObjectLoader {
    fn load(&mut self, id: ObjectId, version: Option<Address64>) -> Result<ObjectHandle>;
}

impl<F> ObjectLoader for F
where
    F: FnMut(ObjectId) -> Result<ObjectHandle>,
{
    fn load(&mut self, id: ObjectId, _version: Option<Address64>) -> Result<ObjectHandle> {
        self(id)
    }
}

pub struct Workspace {
    tracker: Rc<RefCell<Tracker>>,
    loader: Option<Box<dyn ObjectLoader>>,
    version_index: VersionIndex,
    next_object_id: ObjectId,
    epoch_seq: u64,
    data_tail: u64,
    version_index_ptr: Address64,
    root_object_id: ObjectId,
    /// Ticket of the outstanding prepared commit.
    prepared: Option<u64>,
    prepare_count: u64,
}

impl Workspace {
    /// An empty workspace allocating from the first user id.
    pub fn new() -> Self {
        Self::seeded(ObjectId::FIRST_USER, VersionIndex::new())
    }

    /// An empty workspace allocating from `next_object_id`.
    ///
    /// Fails for reserved ids and for [`ObjectId::MAX`], which is never
    /// allocated.
    pub fn with_next_object_id(next_object_id: u64) -> Result<Self> {
        let id = ObjectId::new(next_object_id);
        if id.is_reserved() {
            return Err(JournalError::ReservedObjectId(next_object_id));
        }
        if id == ObjectId::MAX {
            return Err(JournalError::ObjectIdExhausted);
        }
        Ok(Self::seeded(id, VersionIndex::new()))
    }

    /// Resume from a recovered commit point.
    ///
    /// The allocator restarts at the larger of the recorded next id and the
    /// one derived from `version_index`, so an id is never handed out twice
    /// even if the two disagree. If that is [`ObjectId::MAX`], creating
    /// objects fails with [`JournalError::ObjectIdExhausted`].
    pub fn from_recovery(info: &RecoveryInfo, version_index: VersionIndex) -> Self {
        let next = info
            .next_object_id
            .max(version_index.compute_next_object_id())
            .max(ObjectId::FIRST_USER);
        let mut workspace = Self::seeded(next, version_index);
        workspace.epoch_seq = info.epoch_seq;
        workspace.data_tail = info.data_tail;
        workspace.version_index_ptr = info.version_index_ptr;
        workspace.root_object_id = info.root_object_id;
        workspace
    }

    fn seeded(next_object_id: ObjectId, version_index: VersionIndex) -> Self {
        Self {
            tracker: Rc::new(RefCell::new(Tracker::default())),
            loader: None,
            version_index,
            next_object_id,
            epoch_seq: 0,
            data_tail: 0,
            version_index_ptr: Address64::NULL,
            root_object_id: ObjectId::default(),
            prepared: None,
            prepare_count: 0,
        }
    }

    /// Install the loader consulted on identity-map misses.
    pub fn with_loader(mut self, loader: impl ObjectLoader + 'static) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub fn set_loader(&mut self, loader: impl ObjectLoader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    /// Allocate an id and create a new, never-committed object.
    ///
    /// Fails only once the id space is used up.
    pub fn create_object<T: VersionedPayload>(&mut self) -> Result<Rc<RefCell<T>>> {
        let id = self.next_object_id;
        self.next_object_id = id.checked_next().ok_or(JournalError::ObjectIdExhausted)?;

        let mut object = T::create(id);
        object.attach(DirtyHook::new(&self.tracker));
        let shared = Rc::new(RefCell::new(object));
        let handle = ObjectHandle::from_shared(shared.clone());

        let mut tracker = self.tracker.borrow_mut();
        tracker.identity.insert(&handle);
        tracker.dirty.add(handle);
        debug!(%id, payload = type_name::<T>(), "object created");
        Ok(shared)
    }

    /// Load `id` as a `T`, returning the tracked instance if there is one.
    pub fn load_object<T: VersionedPayload>(&mut self, id: ObjectId) -> Result<Rc<RefCell<T>>> {
        let handle = self.load_handle(id)?;
        handle
            .downcast::<T>()
            .ok_or_else(|| JournalError::ObjectTypeMismatch {
                id,
                expected: type_name::<T>(),
                actual: handle.type_name(),
            })
    }

    /// Untyped form of [`load_object`](Self::load_object).
    ///
    /// A miss goes to the loader; its error is returned as is. A loaded
    /// object joins the identity map but not the dirty set.
    pub fn load_handle(&mut self, id: ObjectId) -> Result<ObjectHandle> {
        if id.is_reserved() {
            return Err(JournalError::ReservedObjectId(id.get()));
        }
        if let Some(handle) = self.tracker.borrow_mut().identity.try_get(id) {
            return Ok(handle);
        }

        let loader = self
            .loader
            .as_mut()
            .ok_or(JournalError::ObjectNotFound(id))?;
        let version = self.version_index.try_get_object_version_ptr(id);
        let handle = loader.load(id, version)?;
        if handle.id() != id {
            return Err(JournalError::MalformedRecord {
                address: version.unwrap_or(Address64::NULL),
                reason: format!("loader returned object {} for {}", handle.id(), id),
            });
        }

        handle
            .try_borrow_mut()
            .map_err(|_| JournalError::ObjectBusy(id))?
            .attach(DirtyHook::new(&self.tracker));
        self.tracker.borrow_mut().identity.add(&handle)?;
        debug!(%id, "object loaded");
        Ok(handle)
    }

    /// Write the pending changes of every dirty object to `data`.
    ///
    /// Object state is left untouched; call [`complete`](Self::complete)
    /// once the matching meta record is durable, or
    /// [`abort_commit`](Self::abort_commit) if it will not be written.
    /// Objects must not be borrowed or mutated in between.
    ///
    /// Every dirty object is borrowed exclusively before anything is
    /// written, so a busy object fails the commit up front. On any error
    /// the version index is restored; records already appended stay in the
    /// data stream unreferenced.
    pub fn prepare_commit<S: FrameSink>(
        &mut self,
        data: &mut DataRecordWriter<S>,
    ) -> Result<CommitContext> {
        self.abort_commit()?;

        let epoch_seq = self.epoch_seq + 1;
        let dirty = {
            let mut tracker = self.tracker.borrow_mut();
            tracker.sweep_live_dirty();
            tracker.dirty.handles()
        };
        let mut objects = Vec::with_capacity(dirty.len());
        for handle in &dirty {
            let object = handle
                .try_borrow_mut()
                .map_err(|_| JournalError::ObjectBusy(handle.id()))?;
            objects.push((handle.id(), object));
        }

        let mut context =
            CommitContext::new(epoch_seq, self.root_object_id, self.version_index_ptr, data.tail());
        if let Err(e) = self.write_records(&objects, data, &mut context) {
            self.version_index.rollback_staged()?;
            return Err(e);
        }

        self.prepare_count += 1;
        context.set_ticket(self.prepare_count);
        self.prepared = Some(self.prepare_count);
        debug!(
            epoch_seq,
            dirty = dirty.len(),
            records = context.written_records().len(),
            data_tail = context.data_tail(),
            "commit prepared"
        );
        Ok(context)
    }

    fn write_records<S: FrameSink>(
        &mut self,
        objects: &[(ObjectId, RefMut<'_, dyn DurableObject>)],
        data: &mut DataRecordWriter<S>,
        context: &mut CommitContext,
    ) -> Result<()> {
        let mut diff = Vec::new();
        for (id, object) in objects {
            let id = *id;
            if object.state().is_detached() || !object.has_changes() {
                continue;
            }
            diff.clear();
            object.write_pending_diff(&mut diff)?;
            let prev = self
                .version_index
                .try_get_object_version_ptr(id)
                .unwrap_or(Address64::NULL);
            let address = data.append_version(object.frame_tag(), prev, &diff)?;
            self.version_index.stage_object_version_ptr(id, address)?;
            context.record_object(id, address);
        }

        if self.version_index.has_changes() {
            diff.clear();
            self.version_index.write_pending_diff(&mut diff)?;
            let address =
                data.append_version(VersionIndex::FRAME_TAG, self.version_index_ptr, &diff)?;
            context.record_version_index(address);
        }
        context.set_data_tail(data.tail());
        Ok(())
    }

    /// Undo the version index changes of a prepared commit that will not be
    /// completed. Does nothing if no commit is outstanding.
    pub fn abort_commit(&mut self) -> Result<()> {
        if self.prepared.take().is_some() || self.version_index.has_staged() {
            self.version_index.rollback_staged()?;
            debug!(epoch_seq = self.epoch_seq, "prepared commit abandoned");
        }
        Ok(())
    }

    /// Finalize a prepared commit after its meta record is durable.
    ///
    /// Objects that wrote nothing and were never committed stay transient
    /// and stay dirty; everything else becomes clean and leaves the dirty
    /// set.
    pub fn complete(&mut self, context: &CommitContext) -> Result<()> {
        if context.epoch_seq() != self.epoch_seq + 1 || self.prepared != Some(context.ticket()) {
            return Err(JournalError::StaleCommitContext {
                context: context.epoch_seq(),
                current: self.epoch_seq,
            });
        }

        let handles = self.tracker.borrow().dirty.handles();
        let mut objects = Vec::with_capacity(handles.len());
        for handle in &handles {
            let object = handle
                .try_borrow_mut()
                .map_err(|_| JournalError::ObjectBusy(handle.id()))?;
            objects.push((handle.id(), object));
        }

        let written: HashSet<ObjectId> =
            context.written_records().iter().map(|r| r.object_id).collect();
        let mut retained = Vec::new();
        for (id, mut object) in objects {
            if object.state() == DurableObjectState::TransientDirty && !written.contains(&id) {
                retained.push(id);
                continue;
            }
            object.on_commit_succeeded();
        }

        {
            let mut tracker = self.tracker.borrow_mut();
            for handle in &handles {
                if !retained.contains(&handle.id()) {
                    tracker.dirty.remove(handle.id());
                }
            }
        }

        self.version_index.on_commit_succeeded();
        self.prepared = None;
        self.epoch_seq = context.epoch_seq();
        self.data_tail = context.data_tail();
        self.version_index_ptr = context.version_index_ptr();
        debug!(
            epoch_seq = self.epoch_seq,
            data_tail = self.data_tail,
            version_index_ptr = %self.version_index_ptr,
            "commit completed"
        );
        Ok(())
    }

    /// Prepare, make the data durable, append and flush the meta record,
    /// then complete.
    ///
    /// If writing either stream fails the prepared commit is aborted and
    /// the workspace stays at its current epoch. Once the meta record is
    /// flushed nothing can fail.
    pub fn commit<D: FrameSink, M: FrameSink>(
        &mut self,
        data: &mut DataRecordWriter<D>,
        meta: &mut MetaRecordWriter<M>,
    ) -> Result<CommitContext> {
        let context = self.prepare_commit(data)?;
        let record = context.build_meta_record(self.next_object_id);
        let persisted = data
            .flush()
            .and_then(|()| meta.append_commit(&record))
            .and_then(|_| meta.flush());
        if let Err(e) = persisted {
            self.abort_commit()?;
            return Err(e);
        }
        self.complete(&context)?;
        Ok(context)
    }

    /// Newest committed or staged version address of `id`.
    pub fn try_get_version_ptr(&self, id: ObjectId) -> Option<Address64> {
        self.version_index.try_get_object_version_ptr(id)
    }

    pub fn next_object_id(&self) -> ObjectId {
        self.next_object_id
    }

    /// Identity map entries, including ones whose object has been dropped
    /// but not yet cleaned up.
    pub fn cached_count(&self) -> usize {
        self.tracker.borrow().identity.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.tracker.borrow().dirty.len()
    }

    /// Ordinal of the last completed commit; zero before the first.
    pub fn epoch_seq(&self) -> u64 {
        self.epoch_seq
    }

    pub fn data_tail(&self) -> u64 {
        self.data_tail
    }

    pub fn version_index_ptr(&self) -> Address64 {
        self.version_index_ptr
    }

    pub fn root_object_id(&self) -> ObjectId {
        self.root_object_id
    }

    /// Record `id` as the root object in subsequent commits.
    pub fn set_root_object(&mut self, id: ObjectId) {
        self.root_object_id = id;
    }

    pub fn version_index(&self) -> &VersionIndex {
        &self.version_index
    }

    /// Drop identity map entries whose objects are gone.
    pub fn cleanup(&mut self) -> usize {
        self.tracker.borrow_mut().identity.cleanup()
    }

    /// Release every strong reference to dirty objects. Uncommitted changes
    /// held only by the workspace are lost. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        let mut tracker = self.tracker.borrow_mut();
        if !tracker.dirty.is_empty() {
            debug!(dropped = tracker.dirty.len(), "workspace disposed with dirty objects");
        }
        tracker.dirty.clear();
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("epoch_seq", &self.epoch_seq)
            .field("next_object_id", &self.next_object_id)
            .field("data_tail", &self.data_tail)
            .field("version_index_ptr", &self.version_index_ptr)
            .field("cached", &self.cached_count())
            .field("dirty", &self.dirty_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::DurableDict;
    use crate::meta::MetaCommitRecord;
    use crate::records::{DataRecordReader, MetaRecordReader};
    use sj_rbf::{FrameStatus, FrameTag, RbfBuffer, RbfError};
    use std::cell::Cell;
    use std::io;

    type Dict = DurableDict<i64>;

    fn writer() -> DataRecordWriter<RbfBuffer> {
        DataRecordWriter::new(RbfBuffer::new())
    }

    /// In-memory sink that refuses appends once `appends_left` reaches
    /// zero, and every flush while `fail_flush` is set.
    #[derive(Default)]
    struct FlakySink {
        inner: RbfBuffer,
        appends_left: Option<usize>,
        fail_flush: bool,
    }

    impl FrameSink for FlakySink {
        fn append_frame(
            &mut self,
            tag: FrameTag,
            payload: &[u8],
            status: FrameStatus,
        ) -> sj_rbf::Result<Address64> {
            match self.appends_left {
                Some(0) => return Err(RbfError::Io(io::Error::other("append refused"))),
                Some(ref mut left) => *left -= 1,
                None => {}
            }
            self.inner.append_frame(tag, payload, status)
        }

        fn tail(&self) -> u64 {
            self.inner.tail()
        }

        fn flush(&mut self) -> sj_rbf::Result<()> {
            if self.fail_flush {
                return Err(RbfError::Io(io::Error::other("flush refused")));
            }
            self.inner.flush()
        }
    }

    #[test]
    fn ids_are_allocated_sequentially() {
        let mut ws = Workspace::with_next_object_id(100).unwrap();
        let ids: Vec<u64> = (0..3)
            .map(|_| ws.create_object::<Dict>().unwrap().borrow().object_id().get())
            .collect();
        assert_eq!(ids, vec![100, 101, 102]);
        assert_eq!(ws.next_object_id(), ObjectId::new(103));
    }

    #[test]
    fn reserved_next_id_is_rejected() {
        for raw in [0, 1, 15] {
            assert!(matches!(
                Workspace::with_next_object_id(raw),
                Err(JournalError::ReservedObjectId(r)) if r == raw
            ));
        }
        for raw in [16, 100] {
            let ws = Workspace::with_next_object_id(raw).unwrap();
            assert_eq!(ws.next_object_id(), ObjectId::new(raw));
        }
        assert_eq!(Workspace::new().next_object_id(), ObjectId::FIRST_USER);
    }

    #[test]
    fn created_objects_are_cached_and_dirty() {
        let mut ws = Workspace::new();
        let objects: Vec<_> = (0..3).map(|_| ws.create_object::<Dict>().unwrap()).collect();
        assert_eq!(ws.cached_count(), 3);
        assert_eq!(ws.dirty_count(), 3);
        assert_eq!(objects[0].borrow().state(), DurableObjectState::TransientDirty);

        ws.dispose();
        assert_eq!(ws.dirty_count(), 0);
        ws.dispose();
        assert_eq!(ws.dirty_count(), 0);
    }

    #[test]
    fn load_after_create_returns_same_instance() {
        let mut ws = Workspace::new();
        let created = ws.create_object::<Dict>().unwrap();
        let id = created.borrow().object_id();
        let loaded = ws.load_object::<Dict>(id).unwrap();
        assert!(Rc::ptr_eq(&created, &loaded));
        assert!(Rc::ptr_eq(&loaded, &ws.load_object::<Dict>(id).unwrap()));
    }

    #[test]
    fn typed_load_of_wrong_payload_fails() {
        let mut ws = Workspace::new();
        let id = ws.create_object::<Dict>().unwrap().borrow().object_id();
        let _keep = ws.load_handle(id).unwrap();
        assert!(matches!(
            ws.load_object::<DurableDict<Option<i64>>>(id),
            Err(JournalError::ObjectTypeMismatch { .. })
        ));
    }

    #[test]
    fn loader_hits_are_cached_but_not_dirty() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let mut ws = Workspace::new().with_loader(move |id: ObjectId| -> Result<ObjectHandle> {
            counter.set(counter.get() + 1);
            Ok(ObjectHandle::new(Dict::from_committed(id, Default::default())))
        });

        let first = ws.load_object::<Dict>(ObjectId::new(42)).unwrap();
        assert_eq!(ws.cached_count(), 1);
        assert_eq!(ws.dirty_count(), 0);
        assert_eq!(first.borrow().state(), DurableObjectState::Clean);

        let second = ws.load_object::<Dict>(ObjectId::new(42)).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn loader_error_is_returned_unchanged() {
        let mut ws = Workspace::new().with_loader(|id: ObjectId| -> Result<ObjectHandle> {
            Err(JournalError::MalformedDiff(format!("custom failure for {id}")))
        });
        match ws.load_object::<Dict>(ObjectId::new(99)) {
            Err(JournalError::MalformedDiff(msg)) => assert_eq!(msg, "custom failure for 99"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(ws.cached_count(), 0);
    }

    #[test]
    fn load_without_loader_is_not_found() {
        let mut ws = Workspace::new();
        assert!(matches!(
            ws.load_object::<Dict>(ObjectId::new(77)),
            Err(JournalError::ObjectNotFound(id)) if id == ObjectId::new(77)
        ));
        assert!(matches!(
            ws.load_handle(ObjectId::VERSION_INDEX),
            Err(JournalError::ReservedObjectId(0))
        ));
    }

    #[test]
    fn prepare_on_empty_workspace_writes_nothing() {
        let mut ws = Workspace::new();
        let mut data = writer();
        let ctx = ws.prepare_commit(&mut data).unwrap();
        assert_eq!(ctx.epoch_seq(), 1);
        assert!(ctx.written_records().is_empty());
        assert_eq!(data.tail(), 4);
    }

    #[test]
    fn prepare_skips_unmutated_objects() {
        let mut ws = Workspace::new();
        let _dict = ws.create_object::<Dict>().unwrap();
        let ctx = ws.prepare_commit(&mut writer()).unwrap();
        assert!(ctx.written_records().is_empty());
    }

    #[test]
    fn prepare_writes_object_then_index() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        dict.borrow_mut().set(1, 42).unwrap();

        let mut data = writer();
        let ctx = ws.prepare_commit(&mut data).unwrap();
        let records = ctx.written_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].object_id, ObjectId::new(16));
        assert_eq!(records[1].object_id, ObjectId::VERSION_INDEX);
        assert!(ctx.data_tail() > 0);
        assert!(!ctx.version_index_ptr().is_null());
        assert_eq!(ctx.version_index_ptr(), records[1].address);
        assert_eq!(ctx.data_tail(), data.tail());

        // prepare leaves object state alone
        assert_eq!(dict.borrow().state(), DurableObjectState::TransientDirty);
        assert_eq!(ws.dirty_count(), 1);
        assert_eq!(ws.epoch_seq(), 0);
    }

    #[test]
    fn prepare_with_two_objects_writes_three_records() {
        let mut ws = Workspace::new();
        let a = ws.create_object::<Dict>().unwrap();
        let b = ws.create_object::<Dict>().unwrap();
        a.borrow_mut().set(1, 1).unwrap();
        b.borrow_mut().set(2, 2).unwrap();

        let ctx = ws.prepare_commit(&mut writer()).unwrap();
        let ids: Vec<ObjectId> = ctx.written_records().iter().map(|r| r.object_id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&a.borrow().object_id()));
        assert!(ids.contains(&b.borrow().object_id()));
        assert!(ids.contains(&ObjectId::VERSION_INDEX));
    }

    #[test]
    fn commit_finalizes_objects_and_advances_epoch() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        let idle = ws.create_object::<Dict>().unwrap();
        dict.borrow_mut().set(1, 42).unwrap();

        let mut data = writer();
        let mut meta = MetaRecordWriter::new(RbfBuffer::new());
        let ctx = ws.commit(&mut data, &mut meta).unwrap();

        assert_eq!(ws.epoch_seq(), 1);
        assert_eq!(ws.data_tail(), data.tail());
        assert_eq!(ws.version_index_ptr(), ctx.version_index_ptr());
        assert_eq!(dict.borrow().state(), DurableObjectState::Clean);
        assert_eq!(idle.borrow().state(), DurableObjectState::TransientDirty);
        assert_eq!(ws.dirty_count(), 1);

        let id = dict.borrow().object_id();
        let ptr = ws.try_get_version_ptr(id).unwrap();
        let buffer = data.into_inner();
        let mut reader = DataRecordReader::new(buffer.as_bytes(), buffer.len());
        let record = reader.read_version(ptr).unwrap();
        assert!(record.is_base());
        assert_eq!(record.diff, vec![1, 1, 1, 84]);

        let meta = meta.into_inner();
        let mut reader = MetaRecordReader::new(meta.as_bytes(), meta.len());
        let entry = reader.scan_reverse().next().unwrap().unwrap();
        assert_eq!(
            entry.record,
            MetaCommitRecord {
                epoch_seq: 1,
                root_object_id: ObjectId::default(),
                version_index_ptr: ctx.version_index_ptr(),
                data_tail: ctx.data_tail(),
                next_object_id: ObjectId::new(18),
            }
        );
    }

    #[test]
    fn empty_commit_still_advances_epoch() {
        let mut ws = Workspace::new();
        let mut data = writer();
        let mut meta = MetaRecordWriter::new(RbfBuffer::new());
        ws.commit(&mut data, &mut meta).unwrap();
        ws.commit(&mut data, &mut meta).unwrap();
        assert_eq!(ws.epoch_seq(), 2);
        assert!(ws.version_index_ptr().is_null());
        assert!(meta.tail() > 4);
    }

    #[test]
    fn second_version_links_to_first() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        let id = dict.borrow().object_id();
        let mut data = writer();
        let mut meta = MetaRecordWriter::new(RbfBuffer::new());

        dict.borrow_mut().set(1, 1).unwrap();
        let first = ws.commit(&mut data, &mut meta).unwrap();
        let v1 = ws.try_get_version_ptr(id).unwrap();

        dict.borrow_mut().set(2, 2).unwrap();
        assert_eq!(dict.borrow().state(), DurableObjectState::PersistentDirty);
        assert_eq!(ws.dirty_count(), 1);
        ws.commit(&mut data, &mut meta).unwrap();
        let v2 = ws.try_get_version_ptr(id).unwrap();

        let buffer = data.into_inner();
        let mut reader = DataRecordReader::new(buffer.as_bytes(), buffer.len());
        let chain = reader.read_chain(v2).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].address, v1);

        let index_chain = reader.read_chain(ws.version_index_ptr()).unwrap();
        assert_eq!(index_chain.len(), 2);
        assert_eq!(index_chain[1].address, first.version_index_ptr());
    }

    #[test]
    fn mutation_of_dropped_loaded_object_is_committed() {
        let mut ws = Workspace::new().with_loader(|id: ObjectId| -> Result<ObjectHandle> {
            Ok(ObjectHandle::new(Dict::from_committed(id, Default::default())))
        });
        {
            let dict = ws.load_object::<Dict>(ObjectId::new(30)).unwrap();
            dict.borrow_mut().set(5, 5).unwrap();
        }
        assert_eq!(ws.dirty_count(), 1);

        let ctx = ws.prepare_commit(&mut writer()).unwrap();
        assert!(ctx.wrote(ObjectId::new(30)));
    }

    #[test]
    fn sweep_catches_objects_mutated_while_tracker_was_busy() {
        let mut ws = Workspace::new().with_loader(|id: ObjectId| -> Result<ObjectHandle> {
            Ok(ObjectHandle::new(Dict::from_committed(id, Default::default())))
        });
        let dict = ws.load_object::<Dict>(ObjectId::new(30)).unwrap();
        {
            let _busy = ws.tracker.borrow_mut();
            dict.borrow_mut().set(1, 1).unwrap();
        }
        assert_eq!(ws.dirty_count(), 0);
        let ctx = ws.prepare_commit(&mut writer()).unwrap();
        assert!(ctx.wrote(ObjectId::new(30)));
        assert_eq!(ws.dirty_count(), 1);
    }

    #[test]
    fn discarded_transient_object_is_skipped_and_released() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        dict.borrow_mut().set(1, 1).unwrap();
        dict.borrow_mut().discard_changes();
        assert_eq!(dict.borrow().state(), DurableObjectState::Detached);

        let mut data = writer();
        let mut meta = MetaRecordWriter::new(RbfBuffer::new());
        let ctx = ws.commit(&mut data, &mut meta).unwrap();
        assert!(ctx.written_records().is_empty());
        assert_eq!(ws.dirty_count(), 0);
        // the id is not reused
        assert_eq!(ws.create_object::<Dict>().unwrap().borrow().object_id(), ObjectId::new(17));
    }

    #[test]
    fn reverted_change_commits_nothing_and_becomes_clean() {
        let mut ws = Workspace::new().with_loader(|id: ObjectId| -> Result<ObjectHandle> {
            let entries = [(1, 10)].into_iter().collect();
            Ok(ObjectHandle::new(Dict::from_committed(id, entries)))
        });
        let dict = ws.load_object::<Dict>(ObjectId::new(20)).unwrap();
        dict.borrow_mut().set(1, 11).unwrap();
        dict.borrow_mut().set(1, 10).unwrap();

        let mut meta = MetaRecordWriter::new(RbfBuffer::new());
        let ctx = ws.commit(&mut writer(), &mut meta).unwrap();
        assert!(ctx.written_records().is_empty());
        assert_eq!(dict.borrow().state(), DurableObjectState::Clean);
        assert_eq!(ws.dirty_count(), 0);
    }

    #[test]
    fn stale_context_is_rejected() {
        let mut ws = Workspace::new();
        let mut data = writer();
        let ctx = ws.prepare_commit(&mut data).unwrap();
        ws.complete(&ctx).unwrap();
        assert!(matches!(
            ws.complete(&ctx),
            Err(JournalError::StaleCommitContext { context: 1, current: 1 })
        ));
    }

    #[test]
    fn busy_object_fails_prepare() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        dict.borrow_mut().set(1, 1).unwrap();
        let _guard = dict.borrow_mut();
        assert!(matches!(
            ws.prepare_commit(&mut writer()),
            Err(JournalError::ObjectBusy(_))
        ));
    }

    #[test]
    fn shared_borrow_fails_commit_before_writing() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        dict.borrow_mut().set(1, 1).unwrap();
        let mut data = writer();
        let mut meta = MetaRecordWriter::new(RbfBuffer::new());
        {
            let _reading = dict.borrow();
            assert!(matches!(
                ws.commit(&mut data, &mut meta),
                Err(JournalError::ObjectBusy(id)) if id == ObjectId::new(16)
            ));
        }
        assert_eq!(data.tail(), 4);
        assert_eq!(meta.tail(), 4);
        assert_eq!(ws.epoch_seq(), 0);
        assert!(!ws.version_index().has_changes());

        ws.commit(&mut data, &mut meta).unwrap();
        dict.borrow_mut().set(2, 2).unwrap();
        ws.commit(&mut data, &mut meta).unwrap();

        let meta = meta.into_inner();
        let mut reader = MetaRecordReader::new(meta.as_bytes(), meta.len());
        let epochs: Vec<u64> = reader
            .scan_reverse()
            .map(|entry| entry.unwrap().record.epoch_seq)
            .collect();
        assert_eq!(epochs, vec![2, 1]);
    }

    #[test]
    fn failed_append_restores_version_pointers() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        let id = dict.borrow().object_id();
        let mut sink = FlakySink::default();
        let mut meta = MetaRecordWriter::new(RbfBuffer::new());

        dict.borrow_mut().set(1, 10).unwrap();
        ws.commit(&mut DataRecordWriter::new(&mut sink), &mut meta).unwrap();
        let committed = ws.try_get_version_ptr(id);
        assert!(committed.is_some());

        // object record goes through, index record does not
        dict.borrow_mut().set(1, 99).unwrap();
        sink.appends_left = Some(1);
        assert!(matches!(
            ws.commit(&mut DataRecordWriter::new(&mut sink), &mut meta),
            Err(JournalError::Rbf(RbfError::Io(_)))
        ));
        assert_eq!(ws.try_get_version_ptr(id), committed);
        assert!(!ws.version_index().has_changes());
        assert!(!ws.version_index().has_staged());
        assert_eq!(ws.epoch_seq(), 1);

        sink.appends_left = None;
        dict.borrow_mut().set(1, 10).unwrap();
        let ctx = ws.commit(&mut DataRecordWriter::new(&mut sink), &mut meta).unwrap();
        assert!(ctx.written_records().is_empty());
        assert_eq!(ws.try_get_version_ptr(id), committed);
        assert_eq!(ws.epoch_seq(), 2);
    }

    #[test]
    fn failed_meta_flush_leaves_epoch_unchanged() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        let id = dict.borrow().object_id();
        dict.borrow_mut().set(1, 1).unwrap();
        let mut data = writer();
        let mut meta_sink = FlakySink {
            fail_flush: true,
            ..Default::default()
        };

        assert!(matches!(
            ws.commit(&mut data, &mut MetaRecordWriter::new(&mut meta_sink)),
            Err(JournalError::Rbf(RbfError::Io(_)))
        ));
        assert_eq!(ws.epoch_seq(), 0);
        assert_eq!(ws.try_get_version_ptr(id), None);
        assert!(!ws.version_index().has_changes());
        assert_eq!(dict.borrow().state(), DurableObjectState::TransientDirty);

        meta_sink.fail_flush = false;
        let ctx = ws
            .commit(&mut data, &mut MetaRecordWriter::new(&mut meta_sink))
            .unwrap();
        assert_eq!(ctx.epoch_seq(), 1);
        assert_eq!(ws.epoch_seq(), 1);
        assert_eq!(ws.try_get_version_ptr(id), Some(ctx.written_records()[0].address));
    }

    #[test]
    fn aborted_prepare_restores_index() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        let id = dict.borrow().object_id();
        dict.borrow_mut().set(1, 1).unwrap();

        let ctx = ws.prepare_commit(&mut writer()).unwrap();
        assert!(ws.try_get_version_ptr(id).is_some());
        ws.abort_commit().unwrap();
        assert_eq!(ws.try_get_version_ptr(id), None);
        assert!(!ws.version_index().has_changes());
        assert!(matches!(
            ws.complete(&ctx),
            Err(JournalError::StaleCommitContext { context: 1, current: 0 })
        ));
        assert_eq!(dict.borrow().state(), DurableObjectState::TransientDirty);
    }

    #[test]
    fn superseded_prepare_cannot_complete() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        let id = dict.borrow().object_id();
        dict.borrow_mut().set(1, 1).unwrap();

        let mut data = writer();
        let first = ws.prepare_commit(&mut data).unwrap();
        let second = ws.prepare_commit(&mut data).unwrap();
        assert!(matches!(
            ws.complete(&first),
            Err(JournalError::StaleCommitContext { context: 1, current: 0 })
        ));
        ws.complete(&second).unwrap();
        assert_eq!(ws.epoch_seq(), 1);
        assert_eq!(ws.try_get_version_ptr(id), Some(second.written_records()[0].address));

        let buffer = data.into_inner();
        let mut reader = DataRecordReader::new(buffer.as_bytes(), buffer.len());
        assert!(reader.read_version(ws.try_get_version_ptr(id).unwrap()).unwrap().is_base());
    }

    #[test]
    fn exhausted_id_space_fails_creation() {
        assert!(matches!(
            Workspace::with_next_object_id(u64::MAX),
            Err(JournalError::ObjectIdExhausted)
        ));

        let info = RecoveryInfo {
            next_object_id: ObjectId::new(u64::MAX - 1),
            ..RecoveryInfo::EMPTY
        };
        let mut ws = Workspace::from_recovery(&info, VersionIndex::new());
        let last = ws.create_object::<Dict>().unwrap();
        assert_eq!(last.borrow().object_id(), ObjectId::new(u64::MAX - 1));
        assert_eq!(ws.next_object_id(), ObjectId::MAX);
        for _ in 0..2 {
            assert!(matches!(
                ws.create_object::<Dict>(),
                Err(JournalError::ObjectIdExhausted)
            ));
        }
        assert_eq!(ws.cached_count(), 1);
        assert_eq!(ws.dirty_count(), 1);
    }

    #[test]
    fn recovery_state_is_restored() {
        let info = RecoveryInfo {
            epoch_seq: 5,
            next_object_id: ObjectId::new(100),
            version_index_ptr: Address64::new(0x5000),
            data_tail: 0x10000,
            ..RecoveryInfo::EMPTY
        };
        let ws = Workspace::from_recovery(&info, VersionIndex::new());
        assert_eq!(ws.epoch_seq(), 5);
        assert_eq!(ws.next_object_id(), ObjectId::new(100));
        assert_eq!(ws.data_tail(), 0x10000);
        assert_eq!(ws.version_index_ptr(), Address64::new(0x5000));
    }

    #[test]
    fn empty_recovery_matches_new_workspace() {
        let ws = Workspace::from_recovery(&RecoveryInfo::EMPTY, VersionIndex::new());
        assert_eq!(ws.epoch_seq(), 0);
        assert_eq!(ws.next_object_id(), ObjectId::new(16));
        assert_eq!(ws.data_tail(), 0);
        assert!(ws.version_index_ptr().is_null());
    }

    #[test]
    fn recovered_workspace_continues_allocation_and_epochs() {
        let info = RecoveryInfo {
            epoch_seq: 10,
            next_object_id: ObjectId::new(200),
            ..RecoveryInfo::EMPTY
        };
        let mut ws = Workspace::from_recovery(&info, VersionIndex::new());
        let dict = ws.create_object::<Dict>().unwrap();
        assert_eq!(dict.borrow().object_id(), ObjectId::new(200));
        assert_eq!(ws.next_object_id(), ObjectId::new(201));

        dict.borrow_mut().set(1, 42).unwrap();
        let mut meta = MetaRecordWriter::new(RbfBuffer::new());
        ws.commit(&mut writer(), &mut meta).unwrap();
        assert_eq!(ws.epoch_seq(), 11);
    }

    #[test]
    fn version_index_raises_next_id() {
        let index = VersionIndex::from_entries([(ObjectId::new(300), Address64::new(4))]);
        let info = RecoveryInfo {
            epoch_seq: 1,
            next_object_id: ObjectId::new(50),
            ..RecoveryInfo::EMPTY
        };
        let ws = Workspace::from_recovery(&info, index);
        assert_eq!(ws.next_object_id(), ObjectId::new(301));
    }

    #[test]
    fn root_object_is_carried_into_commits() {
        let mut ws = Workspace::new();
        let dict = ws.create_object::<Dict>().unwrap();
        let id = dict.borrow().object_id();
        ws.set_root_object(id);
        let ctx = ws.prepare_commit(&mut writer()).unwrap();
        assert_eq!(ctx.root_object_id(), id);
        assert_eq!(ctx.build_meta_record(ws.next_object_id()).root_object_id, id);
    }

    #[test]
    fn cleanup_drops_dead_entries() {
        let mut ws = Workspace::new().with_loader(|id: ObjectId| -> Result<ObjectHandle> {
            Ok(ObjectHandle::new(Dict::from_committed(id, Default::default())))
        });
        ws.load_object::<Dict>(ObjectId::new(20)).unwrap();
        ws.load_object::<Dict>(ObjectId::new(21)).unwrap();
        assert_eq!(ws.cached_count(), 2);
        assert_eq!(ws.cleanup(), 2);
        assert_eq!(ws.cached_count(), 0);
    }
}
