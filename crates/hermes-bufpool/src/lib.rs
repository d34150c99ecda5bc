//! The Hermes buffer pool.
//!
//! A pool owns, inside the shared-memory segment, one header per
//! allocatable unit across every buffering tier, plus per-tier per-slab
//! free lists of those headers. Allocation pops headers under the pool's
//! ticket mutex with all-or-nothing semantics; release pushes them back
//! and credits the capacity counters that feed the system view state.
//! Buffer data lives either in the segment (RAM tiers) or in per-slab
//! files under the tier's mount point.
//!
//! Requests that target another node's devices are forwarded over the
//! buffer service with identical semantics, and blobs that no tier can
//! absorb spill to the per-node swap file.

pub mod io;
pub mod pool;
pub mod swap;
pub mod tier;

pub use io::{get_buffers, read_blob_from_buffers, release_buffers, write_blob_to_buffers};
pub use pool::{BufferPool, MAX_SLABS, MAX_TIERS};
pub use swap::{read_swap_blob, SwapManager};
pub use tier::local_node_targets;
