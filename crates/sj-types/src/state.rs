use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a durable object.
///
/// ```text
/// create ──► TransientDirty ──commit──► Clean ◄──load
///                 │                    │   ▲
///              discard              mutate │ commit / discard
///                 ▼                    ▼   │
///              Detached          PersistentDirty
/// ```
///
/// `Detached` is terminal: a never-committed object has nothing to roll
/// back to, so discarding it severs it from the journal for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DurableObjectState {
    /// In sync with its last committed version.
    Clean = 0,
    /// Committed at least once and modified since.
    PersistentDirty = 1,
    /// Created in this session and never committed.
    TransientDirty = 2,
    /// Discarded before its first commit; all semantic access fails.
    Detached = 3,
}

impl DurableObjectState {
    /// Returns `true` for either dirty state.
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::PersistentDirty | Self::TransientDirty)
    }

    /// Returns `true` for the terminal detached state.
    pub fn is_detached(self) -> bool {
        self == Self::Detached
    }
}

impl fmt::Display for DurableObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Clean => "clean",
            Self::PersistentDirty => "persistent-dirty",
            Self::TransientDirty => "transient-dirty",
            Self::Detached => "detached",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_are_stable() {
        assert_eq!(DurableObjectState::Clean as u8, 0);
        assert_eq!(DurableObjectState::PersistentDirty as u8, 1);
        assert_eq!(DurableObjectState::TransientDirty as u8, 2);
        assert_eq!(DurableObjectState::Detached as u8, 3);
    }

    #[test]
    fn dirty_predicate() {
        assert!(!DurableObjectState::Clean.is_dirty());
        assert!(DurableObjectState::PersistentDirty.is_dirty());
        assert!(DurableObjectState::TransientDirty.is_dirty());
        assert!(!DurableObjectState::Detached.is_dirty());
        assert!(DurableObjectState::Detached.is_detached());
    }
}
