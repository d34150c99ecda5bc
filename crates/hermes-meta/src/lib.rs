//! The Hermes metadata directory.
//!
//! Three sharded namespaces (bucket, vbucket, blob) map user-visible
//! names to packed 64-bit ids. The shard that owns a name is a
//! deterministic hash of the name, so any node can find the owner without
//! coordination; when the owner is the caller, the `local_*` form of an
//! operation mutates shared memory directly, otherwise the same-named
//! remote procedure runs on the owner with identical behavior.
//!
//! Layered bottom-up:
//!
//! * [`storage`] — the intra-node half: arena-resident hash maps, the
//!   buffer-id-list heap, and the bucket/vbucket info tables.
//! * [`manager`] — the public directory operations with the uniform
//!   local/remote switch, plus blob put/get orchestration and the swap
//!   fallback.
//! * [`sysview`] — per-node and global views of bytes available per
//!   device, reconciled periodically.

pub mod manager;
pub mod storage;
pub mod sysview;

pub use manager::MetadataManager;
pub use storage::{MapKind, MetaStorage};
pub use sysview::SystemViewState;
