//! System view state: per-device bytes-available accounting.
//!
//! Every node keeps a local snapshot; exactly one designated node keeps
//! the authoritative global aggregate. Allocation and release accumulate
//! signed per-device adjustments in the buffer pool; a periodic tick
//! drains them (exchange with zero) and applies the delta vector to the
//! global state, locally or over rpc. Reads of the global state are
//! therefore stale by at most one interval plus one round trip, and
//! placement policies must tolerate that.

use crate::storage::MetaStorage;
use hermes_bufpool::{BufferPool, MAX_TIERS};
use hermes_common::{Error, Result};
use hermes_proto::metadata as proto;
use hermes_rpc::RpcContext;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Snapshot of bytes available per device, resident in shared memory.
#[repr(C)]
pub struct SystemViewState {
    num_devices: u32,
    _pad: u32,
    bytes_available: [AtomicU64; MAX_TIERS],
}

impl SystemViewState {
    /// Initialize a state in place from the per-device capacities.
    ///
    /// # Safety
    ///
    /// `ptr` must point at writable memory big enough for `Self`.
    pub(crate) unsafe fn init_at(ptr: *mut Self, capacities: &[u64]) {
        (*ptr).num_devices = capacities.len() as u32;
        (*ptr)._pad = 0;
        for (i, slot) in (*ptr).bytes_available.iter_mut().enumerate() {
            *slot = AtomicU64::new(capacities.get(i).copied().unwrap_or(0));
        }
    }

    /// Number of devices tracked.
    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.num_devices as usize
    }

    /// Bytes available on one device.
    #[must_use]
    pub fn bytes_available(&self, device: usize) -> u64 {
        self.bytes_available[device].load(Ordering::Acquire)
    }

    /// Overwrite one device's availability (local snapshot refresh).
    pub fn set(&self, device: usize, bytes: u64) {
        self.bytes_available[device].store(bytes, Ordering::Release);
    }

    /// Apply a signed adjustment to one device.
    pub fn adjust(&self, device: usize, delta: i64) {
        if delta >= 0 {
            self.bytes_available[device].fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.bytes_available[device].fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
        }
    }

    /// All tracked devices' availability, in device order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u64> {
        (0..self.num_devices()).map(|d| self.bytes_available(d)).collect()
    }
}

/// Refresh this node's local snapshot from the pool's live counters.
pub fn refresh_local_view(storage: &MetaStorage, pool: &BufferPool) {
    let view = storage.local_sysview();
    for device in 0..pool.num_devices() {
        view.set(device, pool.remaining_capacity(device as u32));
    }
}

/// Apply a drained adjustment vector to the global state. Only meaningful
/// on the global node.
pub fn local_update_global_sysview(storage: &MetaStorage, adjustments: &[i64]) -> Result<()> {
    let global = storage
        .global_sysview()
        .ok_or_else(|| Error::storage("this node does not hold the global system view"))?;
    for (device, &delta) in adjustments.iter().enumerate() {
        if delta != 0 {
            global.adjust(device, delta);
            debug!(device, delta, "global view adjusted");
        }
    }
    Ok(())
}

/// One reconciliation tick: drain this node's capacity adjustments and
/// push any non-zero delta vector to the global node. Also refreshes the
/// local snapshot.
pub async fn update_global_sysview(
    storage: &MetaStorage,
    pool: &BufferPool,
    rpc: &RpcContext,
) -> Result<()> {
    refresh_local_view(storage, pool);

    let adjustments = pool.take_capacity_adjustments();
    if adjustments.iter().all(|&delta| delta == 0) {
        return Ok(());
    }

    let target = storage.global_sysview_node();
    if rpc.is_local(target) {
        local_update_global_sysview(storage, &adjustments)
    } else {
        let mut client = rpc.metadata(target).await?;
        client
            .update_global_system_view_state(proto::AdjustmentsRequest { adjustments })
            .await
            .map_err(|status| rpc.failed(target, status))?;
        Ok(())
    }
}

/// Read the authoritative per-device availability, wherever it lives.
pub async fn global_device_capacities(
    storage: &MetaStorage,
    rpc: &RpcContext,
) -> Result<Vec<u64>> {
    let target = storage.global_sysview_node();
    if rpc.is_local(target) {
        Ok(storage
            .global_sysview()
            .ok_or_else(|| Error::storage("this node does not hold the global system view"))?
            .to_vec())
    } else {
        let mut client = rpc.metadata(target).await?;
        Ok(client
            .get_global_device_capacities(proto::Empty {})
            .await
            .map_err(|status| rpc.failed(target, status))?
            .into_inner()
            .bytes_available)
    }
}
