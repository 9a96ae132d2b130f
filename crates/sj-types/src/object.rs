use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a durable object within one journal.
///
/// Ids `0..=15` are reserved for well-known system objects; only `0`
/// (the version index) is currently assigned. User objects are allocated
/// monotonically from [`ObjectId::FIRST_USER`] and ids are never reused,
/// not even when the object they named is discarded before its first commit.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Well-known id of the version index.
    pub const VERSION_INDEX: Self = Self(0);

    /// Largest id in the reserved range.
    pub const LAST_RESERVED: Self = Self(15);

    /// First id handed out to user objects.
    pub const FIRST_USER: Self = Self(16);

    /// Largest representable id. It is never handed out; an allocator
    /// positioned here has exhausted the id space.
    pub const MAX: Self = Self(u64::MAX);

    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` if this id falls in the reserved well-known range.
    pub const fn is_reserved(self) -> bool {
        self.0 <= Self::LAST_RESERVED.0
    }

    /// The id following this one, or `None` at [`ObjectId::MAX`].
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ObjectId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<ObjectId> for u64 {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}
