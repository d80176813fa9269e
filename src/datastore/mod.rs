//! Per-array on-disk space allocation.
//!
//! Each array owns one data file managed as a buddy system: every block is
//! a power of two in size and aligned to its size. Free blocks live in an
//! in-memory free-list that is persisted next to the data file as
//! `<guid>.data.fl`. Before the first change after a flush the persisted
//! free-list is overwritten with an empty one, so after a crash the store
//! falls back to treating every written byte as allocated.

mod bucket;
mod flusher;
mod freelist;
mod header;
mod registry;
mod store;

pub use bucket::{Buckets, FreelistBucket};
pub use flusher::{DataStoreFlusher, FlushQueue};
pub use freelist::Freelist;
pub use header::{ChunkHeader, FREE_MARKER, HEADER_SIZE, USED_MARKER};
pub use registry::{DataStoreInfo, DataStores, DATA_SUFFIX};
pub use store::{DataStore, DataStoreSizes, FREELIST_SUFFIX};

/// Identifier of a data store, usually the id of the array it belongs to.
pub type Guid = u64;
