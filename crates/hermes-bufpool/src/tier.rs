//! Tier descriptors and placement targets.

use hermes_common::TargetId;
use std::sync::atomic::AtomicU64;

/// Read-mostly descriptor of one buffering tier, resident in shared
/// memory. Created at pool initialization; only `remaining_space` mutates
/// afterwards.
#[repr(C)]
pub struct TierShared {
    /// Total bytes the tier may buffer.
    pub capacity: u64,
    /// Bytes currently free, across all slab classes.
    pub remaining_space: AtomicU64,
    /// Segment offset of the tier's data base. Zero for file-backed tiers,
    /// whose headers instead carry offsets into their slab files.
    pub data_offset: u64,
    /// Theoretical bandwidth in MiB/s.
    pub bandwidth_mbps: f32,
    /// Theoretical latency in microseconds.
    pub latency_us: f32,
    /// Index of this tier in the pool's tier array.
    pub id: u32,
    /// Non-zero when the tier is byte-addressable shared memory.
    pub is_ram: u32,
    /// Non-zero when the backing files were preallocated with
    /// `posix_fallocate`.
    pub has_fallocate: u32,
    pub(crate) _pad: u32,
}

impl TierShared {
    #[must_use]
    pub fn is_ram(&self) -> bool {
        self.is_ram != 0
    }
}

/// One placement target per local device. Placement policies consult this
/// set, usually joined with the neighbors' targets.
#[must_use]
pub fn local_node_targets(node_id: u32, num_devices: usize) -> Vec<TargetId> {
    (0..num_devices as u32)
        .map(|device| TargetId::new(node_id, device))
        .collect()
}
