//! Frame tags used by the journal's two record streams.
//!
//! The low 16 bits of a tag name the record type; for object-version
//! records the high 16 bits name the payload kind.

use sj_rbf::FrameTag;

/// Record types (low 16 bits).
pub mod record_type {
    pub const OBJECT_VERSION: u16 = 1;
    pub const META_COMMIT: u16 = 2;
}

/// Payload kinds of object-version records (high 16 bits).
pub mod object_kind {
    pub const DICT: u16 = 1;
}

/// Version record of a dictionary payload.
pub const DICT_VERSION: FrameTag =
    FrameTag::from_parts(record_type::OBJECT_VERSION, object_kind::DICT);

/// Meta commit record.
pub const META_COMMIT: FrameTag = FrameTag::from_parts(record_type::META_COMMIT, 0);

pub fn is_object_version(tag: FrameTag) -> bool {
    tag.record_type() == record_type::OBJECT_VERSION
}
