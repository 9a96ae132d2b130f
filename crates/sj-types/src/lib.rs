//! Foundation types for StateJournal.
//!
//! This crate provides the identity, pointer, and encoding primitives shared
//! by the RBF frame layer and the journal itself. Every other StateJournal
//! crate depends on `sj-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`]: Monotonic durable-object identifier (0–15 reserved)
//! - [`Address64`]: 4-byte aligned file offset of a frame (0 = null)
//! - [`DurableObjectState`]: Lifecycle state of a durable object
//! - [`varint`]: Canonical base-128 varint and ZigZag codec

pub mod address;
pub mod error;
pub mod object;
pub mod state;
pub mod varint;

pub use address::Address64;
pub use error::TypeError;
pub use object::ObjectId;
pub use state::DurableObjectState;
