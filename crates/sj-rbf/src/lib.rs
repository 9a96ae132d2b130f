//! Reversible binary framing (RBF) for StateJournal.
//!
//! An RBF stream is an append-only sequence of self-describing frames. Each
//! frame carries its length in both a header and a trailer, so the stream
//! can be walked forward from the genesis fence or backward from any frame
//! end without an index. Every frame is guarded by its own CRC32C.
//!
//! # Architecture
//!
//! - [`FrameSink`]: append side, implemented by [`RbfFile`] and [`RbfBuffer`]
//! - [`RandomRead`]: positional, non-owning read side
//! - [`RbfScanner`]: validated random reads and the tolerant reverse scan
//! - [`ReadCache`]: reverse-tuned page cache layered under a scanner

pub mod cache;
pub mod error;
pub mod file;
pub mod layout;
pub mod scanner;
pub mod sink;
pub mod source;

pub use cache::{CacheStats, ReadCache, ReadCacheConfig};
pub use error::{RbfError, Result};
pub use file::{RbfConfig, RbfFile, SyncMode};
pub use layout::{FrameStatus, FrameTag};
pub use scanner::{RbfFrame, RbfScanner, ScanForward, ScanReverse};
pub use sink::{FrameSink, RbfBuffer};
pub use source::RandomRead;
