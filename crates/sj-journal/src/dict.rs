//! Durable dictionary keyed by `u64`.
//!
//! A dictionary keeps two maps: `committed`, the state as of the last
//! successful commit, and `current`, the working state. `dirty_keys` holds
//! exactly the keys whose presence or value differs between the two, so the
//! pending diff is always minimal and setting a key back to its committed
//! value cancels the change.
//!
//! # Diff format
//!
//! ```text
//! count  varuint
//! count × { key varuint, op u8, [value] }     keys strictly ascending
//! op: 0 = tombstone (no value), 1 = upsert (value follows)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use sj_rbf::FrameTag;
use sj_types::varint::{decode_varint, decode_varuint, encode_varint, encode_varuint};
use sj_types::{Address64, DurableObjectState, ObjectId};

use crate::error::{JournalError, Result};
use crate::object::{DirtyHook, DurableObject, VersionedPayload};
use crate::tags::DICT_VERSION;

const OP_TOMBSTONE: u8 = 0;
const OP_UPSERT: u8 = 1;

/// A value type storable in a [`DurableDict`].
pub trait DictValue: Clone + PartialEq + Debug + 'static {
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode from the front of `data`. Returns `(value, consumed)`.
    fn decode(data: &[u8]) -> Result<(Self, usize)>;
}

/// ZigZag varint.
impl DictValue for i64 {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_varint(out, *self);
    }

    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        Ok(decode_varint(data)?)
    }
}

/// Presence byte (0 or 1), then a ZigZag varint when present.
impl DictValue for Option<i64> {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            None => out.push(0),
            Some(value) => {
                out.push(1);
                encode_varint(out, *value);
            }
        }
    }

    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        match data.first() {
            Some(0) => Ok((None, 1)),
            Some(1) => {
                let (value, consumed) = decode_varint(&data[1..])?;
                Ok((Some(value), consumed + 1))
            }
            Some(other) => Err(JournalError::MalformedDiff(format!(
                "invalid presence byte {other:#04x}"
            ))),
            None => Err(JournalError::MalformedDiff(
                "missing presence byte".to_string(),
            )),
        }
    }
}

/// Fixed 8-byte little-endian address; zero encodes `None`.
impl DictValue for Option<Address64> {
    fn encode(&self, out: &mut Vec<u8>) {
        let raw = self.map_or(0, Address64::get);
        out.extend_from_slice(&raw.to_le_bytes());
    }

    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let bytes: [u8; 8] = data
            .get(..8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| JournalError::MalformedDiff("truncated address value".to_string()))?;
        let raw = u64::from_le_bytes(bytes);
        let value = if raw == 0 {
            None
        } else {
            Some(Address64::try_new(raw)?)
        };
        Ok((value, 8))
    }
}

/// Apply one encoded diff to `map`.
pub fn apply_diff<V: DictValue>(map: &mut BTreeMap<u64, V>, diff: &[u8]) -> Result<()> {
    let (count, mut pos) = decode_varuint(diff)?;
    let mut previous: Option<u64> = None;

    for _ in 0..count {
        let (key, consumed) = decode_varuint(&diff[pos..])?;
        pos += consumed;
        if let Some(previous) = previous {
            if key <= previous {
                return Err(JournalError::DiffKeyOrder { previous, key });
            }
        }
        previous = Some(key);

        let op = *diff
            .get(pos)
            .ok_or_else(|| JournalError::MalformedDiff(format!("missing op for key {key}")))?;
        pos += 1;
        match op {
            OP_TOMBSTONE => {
                map.remove(&key);
            }
            OP_UPSERT => {
                let (value, consumed) = V::decode(&diff[pos..])?;
                pos += consumed;
                map.insert(key, value);
            }
            other => {
                return Err(JournalError::MalformedDiff(format!(
                    "unknown op {other:#04x} for key {key}"
                )))
            }
        }
    }

    if pos != diff.len() {
        return Err(JournalError::MalformedDiff(format!(
            "{} trailing bytes",
            diff.len() - pos
        )));
    }
    Ok(())
}

/// Dictionary of `u64` keys to `V` values with change tracking.
pub struct DurableDict<V> {
    id: ObjectId,
    state: DurableObjectState,
    committed: BTreeMap<u64, V>,
    current: BTreeMap<u64, V>,
    dirty_keys: BTreeSet<u64>,
    hook: DirtyHook,
}

impl<V: DictValue> DurableDict<V> {
    /// An empty, never-committed dictionary.
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            state: DurableObjectState::TransientDirty,
            committed: BTreeMap::new(),
            current: BTreeMap::new(),
            dirty_keys: BTreeSet::new(),
            hook: DirtyHook::default(),
        }
    }

    /// A clean dictionary whose committed state is `entries`.
    pub fn from_committed(id: ObjectId, entries: BTreeMap<u64, V>) -> Self {
        Self {
            id,
            state: DurableObjectState::Clean,
            current: entries.clone(),
            committed: entries,
            dirty_keys: BTreeSet::new(),
            hook: DirtyHook::default(),
        }
    }

    /// Replay diffs, base version first, into a clean dictionary.
    pub fn from_version_chain(id: ObjectId, diffs: &[&[u8]]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for diff in diffs {
            apply_diff(&mut entries, diff)?;
        }
        Ok(Self::from_committed(id, entries))
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.state.is_detached() {
            return Err(JournalError::ObjectDetached(self.id));
        }
        Ok(())
    }

    pub fn get(&self, key: u64) -> Result<Option<&V>> {
        self.ensure_attached()?;
        Ok(self.current.get(&key))
    }

    pub fn contains_key(&self, key: u64) -> Result<bool> {
        self.ensure_attached()?;
        Ok(self.current.contains_key(&key))
    }

    pub fn len(&self) -> Result<usize> {
        self.ensure_attached()?;
        Ok(self.current.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.ensure_attached()?;
        Ok(self.current.is_empty())
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> Result<impl Iterator<Item = u64> + '_> {
        self.ensure_attached()?;
        Ok(self.current.keys().copied())
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> Result<impl Iterator<Item = (u64, &V)> + '_> {
        self.ensure_attached()?;
        Ok(self.current.iter().map(|(k, v)| (*k, v)))
    }

    /// Insert or overwrite `key`.
    pub fn set(&mut self, key: u64, value: V) -> Result<()> {
        self.ensure_attached()?;
        self.current.insert(key, value);
        self.track(key);
        Ok(())
    }

    /// Remove `key`, returning its previous value.
    pub fn remove(&mut self, key: u64) -> Result<Option<V>> {
        self.ensure_attached()?;
        let removed = self.current.remove(&key);
        if removed.is_some() {
            self.track(key);
        }
        Ok(removed)
    }

    /// Number of keys whose working value differs from the committed one.
    pub fn dirty_key_count(&self) -> usize {
        self.dirty_keys.len()
    }

    pub(crate) fn current(&self) -> &BTreeMap<u64, V> {
        &self.current
    }

    fn track(&mut self, key: u64) {
        let differs = match (self.current.get(&key), self.committed.get(&key)) {
            (Some(now), Some(then)) => now != then,
            (None, None) => false,
            _ => true,
        };
        if differs {
            self.dirty_keys.insert(key);
        } else {
            self.dirty_keys.remove(&key);
        }

        // Only the first divergence from a clean state is reported.
        if !self.dirty_keys.is_empty() && self.state == DurableObjectState::Clean {
            self.state = DurableObjectState::PersistentDirty;
            self.hook.notify(self.id);
        }
    }

    fn encode_diff(&self, out: &mut Vec<u8>) {
        encode_varuint(out, self.dirty_keys.len() as u64);
        for &key in &self.dirty_keys {
            encode_varuint(out, key);
            match self.current.get(&key) {
                Some(value) => {
                    out.push(OP_UPSERT);
                    value.encode(out);
                }
                None => out.push(OP_TOMBSTONE),
            }
        }
    }
}

impl<V: DictValue> DurableObject for DurableDict<V> {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn state(&self) -> DurableObjectState {
        self.state
    }

    fn has_changes(&self) -> bool {
        !self.state.is_detached() && !self.dirty_keys.is_empty()
    }

    fn frame_tag(&self) -> FrameTag {
        DICT_VERSION
    }

    fn write_pending_diff(&self, out: &mut Vec<u8>) -> Result<()> {
        self.ensure_attached()?;
        self.encode_diff(out);
        Ok(())
    }

    fn on_commit_succeeded(&mut self) {
        if self.state.is_detached() {
            return;
        }
        if !self.dirty_keys.is_empty() {
            self.committed = self.current.clone();
            self.dirty_keys.clear();
        }
        self.state = DurableObjectState::Clean;
    }

    fn discard_changes(&mut self) {
        match self.state {
            DurableObjectState::Clean | DurableObjectState::Detached => {}
            DurableObjectState::PersistentDirty => {
                self.current = self.committed.clone();
                self.dirty_keys.clear();
                self.state = DurableObjectState::Clean;
            }
            DurableObjectState::TransientDirty => {
                self.current.clear();
                self.committed.clear();
                self.dirty_keys.clear();
                self.state = DurableObjectState::Detached;
            }
        }
    }

    fn attach(&mut self, hook: DirtyHook) {
        self.hook = hook;
    }
}

impl<V: DictValue> VersionedPayload for DurableDict<V> {
    const FRAME_TAG: FrameTag = DICT_VERSION;

    fn create(id: ObjectId) -> Self {
        Self::new(id)
    }

    fn rehydrate(id: ObjectId, diffs: &[&[u8]]) -> Result<Self> {
        Self::from_version_chain(id, diffs)
    }
}

impl<V: Debug> Debug for DurableDict<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableDict")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("len", &self.current.len())
            .field("dirty_keys", &self.dirty_keys.len())
            .finish()
    }
}
