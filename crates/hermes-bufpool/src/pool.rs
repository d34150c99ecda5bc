//! Buffer pool layout, initialization and free-list management.
//!
//! Terminology:
//!   block  - the smallest unit of a tier, `block_size` bytes.
//!   buffer - 1 or more blocks; the allocation unit handed to clients.
//!   slab   - all buffers of one size class within a tier.
//!
//! The pool root struct, the tier array, the header array and the RAM
//! buffer data all live in the buffer-pool region of the shared segment
//! and are addressed by offset. A single pool-wide ticket mutex guards
//! every free list and the allocation accounting.

use crate::tier::TierShared;
use bytes::Bytes;
use hermes_common::{BufferId, Config, Error, Result, SchemaEntry, TierConfig};
use hermes_shmem::{Region, Segment, TicketGuard, TicketMutex};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hard cap on tiers per node; the pool root embeds fixed arrays of this
/// size.
pub const MAX_TIERS: usize = 8;

/// Hard cap on slab classes per tier.
pub const MAX_SLABS: usize = 8;

/// Metadata for one allocatable buffer, resident in shared memory.
///
/// For a RAM tier one header exists per *block* so that buffers can later
/// be split and merged; only the lead header of each buffer carries a
/// non-zero capacity and participates in a free list. For file-backed
/// tiers one header exists per buffer.
#[repr(C)]
pub struct BufferHeader {
    /// The packed id of this buffer.
    pub id: u64,
    /// Next free buffer in this slab's free list; guarded by the pool
    /// mutex.
    pub next_free: u64,
    /// RAM: segment offset of the data. File: byte offset into the slab
    /// file.
    pub data_offset: u64,
    /// Bytes of real data currently buffered here.
    pub used: AtomicU32,
    /// Total bytes this buffer can hold. Zero for dormant block headers.
    pub capacity: u32,
    /// Tier this buffer belongs to.
    pub tier_id: u32,
    /// Non-zero while the buffer is allocated to a blob.
    pub in_use: AtomicU32,
    /// Spin flag serializing I/O against the buffer organizer.
    pub locked: AtomicU32,
    pub(crate) _pad: u32,
}

impl BufferHeader {
    fn lock_io(&self) {
        while self
            .locked
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock_io(&self) {
        self.locked.store(0, Ordering::Release);
    }
}

/// The pool root, resident in shared memory.
#[repr(C)]
pub struct PoolShared {
    /// Guards every free list, the free-list accounting and `in_use`
    /// transitions.
    mutex: TicketMutex,
    num_tiers: u32,
    total_headers: u32,
    /// Segment offset of the `BufferHeader` array.
    headers_offset: u64,
    /// Segment offset of the `TierShared` array.
    tiers_offset: u64,
    /// Segment offset of the free-list head array, `MAX_SLABS` heads per
    /// tier, each a packed `BufferId` (zero = empty).
    free_lists_offset: u64,
    /// Segment offset of the per-device signed capacity-adjustment
    /// counters consumed by the system-view reconciliation.
    adjustments_offset: u64,
    num_slabs: [u32; MAX_TIERS],
    block_sizes: [u32; MAX_TIERS],
    num_headers: [u32; MAX_TIERS],
    slab_unit_sizes: [[u32; MAX_SLABS]; MAX_TIERS],
    slab_buffer_sizes: [[u64; MAX_SLABS]; MAX_TIERS],
}

/// Process-side handle to the shared pool.
pub struct BufferPool {
    segment: Arc<Segment>,
    root: u64,
    node_id: u32,
    /// One buffering file per (tier, slab); `None` for RAM tiers.
    files: Vec<Vec<Option<File>>>,
}

fn slab_file_path(tier: &TierConfig, tier_id: usize, slab: usize) -> PathBuf {
    PathBuf::from(&tier.mount_point).join(format!("hermes_tier{tier_id}_slab{slab}.dat"))
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, capacity: u64) -> bool {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, capacity as libc::off_t) };
    rc == 0
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &File, _capacity: u64) -> bool {
    false
}

impl BufferPool {
    /// Lay the pool out in the segment's buffer-pool region and open the
    /// buffering files. Called once, by the node that created the segment.
    pub fn init(segment: Arc<Segment>, config: &Config) -> Result<Self> {
        if config.tiers.len() > MAX_TIERS {
            return Err(Error::config(format!(
                "{} tiers exceeds the maximum of {MAX_TIERS}",
                config.tiers.len()
            )));
        }
        for (t, tier) in config.tiers.iter().enumerate() {
            if tier.num_slabs() > MAX_SLABS {
                return Err(Error::config(format!(
                    "tier {t} has {} slab classes, maximum is {MAX_SLABS}",
                    tier.num_slabs()
                )));
            }
        }

        let arena = segment.arena(Region::BufferPool);
        let root = arena.alloc_array::<PoolShared>(1)?;

        // Count buffers and headers per tier before laying anything out.
        let mut buffers_per_slab = [[0u64; MAX_SLABS]; MAX_TIERS];
        let mut headers_per_tier = [0u32; MAX_TIERS];
        for (t, tier) in config.tiers.iter().enumerate() {
            let mut blocks = 0u64;
            let mut buffers = 0u64;
            for s in 0..tier.num_slabs() {
                let buffer_size = tier.slab_buffer_size(s);
                let share =
                    (tier.capacity as f64 * f64::from(tier.desired_slab_percentages[s])) as u64;
                let count = share / buffer_size;
                buffers_per_slab[t][s] = count;
                blocks += count * u64::from(tier.slab_unit_sizes[s]);
                buffers += count;
            }
            headers_per_tier[t] = if tier.is_ram() {
                blocks as u32
            } else {
                buffers as u32
            };
        }
        let total_headers: u32 = headers_per_tier.iter().sum();

        let headers_offset = arena.alloc_array::<BufferHeader>(total_headers as usize)?;
        let tiers_offset = arena.alloc_array::<TierShared>(config.tiers.len())?;
        let free_lists_offset = arena.alloc_array::<u64>(config.tiers.len() * MAX_SLABS)?;
        let adjustments_offset = arena.alloc_array::<AtomicI64>(config.tiers.len())?;

        let shared = unsafe { &mut *segment.ptr_at::<PoolShared>(root) };
        shared.mutex.reset();
        shared.num_tiers = config.tiers.len() as u32;
        shared.total_headers = total_headers;
        shared.headers_offset = headers_offset;
        shared.tiers_offset = tiers_offset;
        shared.free_lists_offset = free_lists_offset;
        shared.adjustments_offset = adjustments_offset;
        for (t, tier) in config.tiers.iter().enumerate() {
            shared.num_slabs[t] = tier.num_slabs() as u32;
            shared.block_sizes[t] = tier.block_size;
            shared.num_headers[t] = headers_per_tier[t];
            for s in 0..tier.num_slabs() {
                shared.slab_unit_sizes[t][s] = tier.slab_unit_sizes[s];
                shared.slab_buffer_sizes[t][s] = tier.slab_buffer_size(s);
            }
        }

        let mut pool = Self {
            segment: segment.clone(),
            root,
            node_id: config.node_id,
            files: Vec::new(),
        };

        // Lay out headers, thread the free lists, open buffering files.
        let mut header_cursor = 0u32;
        let mut files = Vec::with_capacity(config.tiers.len());
        for (t, tier) in config.tiers.iter().enumerate() {
            let usable: u64 = (0..tier.num_slabs())
                .map(|s| buffers_per_slab[t][s] * tier.slab_buffer_size(s))
                .sum();
            if usable < tier.capacity {
                debug!(
                    tier = t,
                    configured = tier.capacity,
                    usable,
                    "slab rounding trims tier capacity"
                );
            }

            let data_offset = if tier.is_ram() {
                pool.segment.arena(Region::BufferPool).alloc(usable, 4096)?
            } else {
                0
            };

            let tier_shared = unsafe {
                &mut *pool
                    .segment
                    .ptr_at::<TierShared>(tiers_offset + (t * std::mem::size_of::<TierShared>()) as u64)
            };
            *tier_shared = TierShared {
                capacity: usable,
                remaining_space: std::sync::atomic::AtomicU64::new(usable),
                data_offset,
                bandwidth_mbps: tier.bandwidth_mbps,
                latency_us: tier.latency_us,
                id: t as u32,
                is_ram: u32::from(tier.is_ram()),
                has_fallocate: 0,
                _pad: 0,
            };

            let mut tier_files: Vec<Option<File>> =
                (0..tier.num_slabs()).map(|_| None).collect();
            let mut ram_data_cursor = 0u64;
            for s in 0..tier.num_slabs() {
                let buffer_size = tier.slab_buffer_size(s);
                let unit = tier.slab_unit_sizes[s];
                let slab_bytes = buffers_per_slab[t][s] * buffer_size;

                if !tier.is_ram() {
                    let path = slab_file_path(tier, t, s);
                    let file = OpenOptions::new()
                        .create(true)
                        .truncate(true)
                        .read(true)
                        .write(true)
                        .open(&path)?;
                    if preallocate(&file, slab_bytes) {
                        tier_shared.has_fallocate = 1;
                    } else {
                        warn!(path = %path.display(), "posix_fallocate unavailable, file will grow on demand");
                    }
                    tier_files[s] = Some(file);
                }

                let mut head = 0u64;
                let mut file_cursor = 0u64;
                for _ in 0..buffers_per_slab[t][s] {
                    let lead = header_cursor;
                    let lead_data = if tier.is_ram() {
                        data_offset + ram_data_cursor
                    } else {
                        file_cursor
                    };
                    let id = BufferId::new(config.node_id, lead);
                    pool.write_header(
                        lead,
                        BufferHeader {
                            id: id.to_bits(),
                            next_free: head,
                            data_offset: lead_data,
                            used: AtomicU32::new(0),
                            capacity: buffer_size as u32,
                            tier_id: t as u32,
                            in_use: AtomicU32::new(0),
                            locked: AtomicU32::new(0),
                            _pad: 0,
                        },
                    );
                    head = id.to_bits();
                    header_cursor += 1;

                    if tier.is_ram() {
                        // Dormant headers for the trailing blocks of this
                        // buffer; they exist for future split/merge.
                        for block in 1..unit {
                            let idx = header_cursor;
                            pool.write_header(
                                idx,
                                BufferHeader {
                                    id: BufferId::new(config.node_id, idx).to_bits(),
                                    next_free: 0,
                                    data_offset: data_offset
                                        + ram_data_cursor
                                        + u64::from(block) * u64::from(tier.block_size),
                                    used: AtomicU32::new(0),
                                    capacity: 0,
                                    tier_id: t as u32,
                                    in_use: AtomicU32::new(0),
                                    locked: AtomicU32::new(0),
                                    _pad: 0,
                                },
                            );
                            header_cursor += 1;
                        }
                        ram_data_cursor += buffer_size;
                    } else {
                        file_cursor += buffer_size;
                    }
                }
                pool.set_free_head(t, s, head);
            }
            files.push(tier_files);
        }
        debug_assert_eq!(header_cursor, total_headers);

        pool.files = files;
        segment.set_buffer_pool_root(root);
        info!(
            node_id = config.node_id,
            tiers = config.tiers.len(),
            total_headers,
            "initialized buffer pool"
        );
        Ok(pool)
    }

    /// Attach to a pool some other process initialized in `segment`.
    pub fn attach(segment: Arc<Segment>, config: &Config) -> Result<Self> {
        let root = segment.buffer_pool_root();
        if root == 0 {
            return Err(Error::storage("segment has no initialized buffer pool"));
        }

        let mut files = Vec::with_capacity(config.tiers.len());
        for (t, tier) in config.tiers.iter().enumerate() {
            let mut tier_files: Vec<Option<File>> =
                (0..tier.num_slabs()).map(|_| None).collect();
            if !tier.is_ram() {
                for (s, slot) in tier_files.iter_mut().enumerate() {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(slab_file_path(tier, t, s))?;
                    *slot = Some(file);
                }
            }
            files.push(tier_files);
        }

        Ok(Self {
            segment,
            root,
            node_id: config.node_id,
            files,
        })
    }

    /// The node this pool belongs to.
    #[must_use]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// The segment this pool lives in.
    #[must_use]
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Number of devices (tiers) on this node.
    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.shared().num_tiers as usize
    }

    fn shared(&self) -> &PoolShared {
        unsafe { self.segment.ref_at::<PoolShared>(self.root) }
    }

    fn write_header(&self, index: u32, header: BufferHeader) {
        let offset = self.shared().headers_offset
            + u64::from(index) * std::mem::size_of::<BufferHeader>() as u64;
        unsafe { self.segment.ptr_at::<BufferHeader>(offset).write(header) };
    }

    fn header(&self, index: u32) -> Result<&BufferHeader> {
        let shared = self.shared();
        if index >= shared.total_headers {
            return Err(Error::storage(format!(
                "buffer header index {index} out of range"
            )));
        }
        let offset =
            shared.headers_offset + u64::from(index) * std::mem::size_of::<BufferHeader>() as u64;
        Ok(unsafe { self.segment.ref_at::<BufferHeader>(offset) })
    }

    /// Header for a buffer id owned by this node.
    pub fn header_for(&self, id: BufferId) -> Result<&BufferHeader> {
        if id.node_id() != self.node_id {
            return Err(Error::storage(format!(
                "buffer {id:?} is not owned by node {}",
                self.node_id
            )));
        }
        self.header(id.header_index())
    }

    fn tier(&self, tier_id: u32) -> &TierShared {
        debug_assert!(tier_id < self.shared().num_tiers);
        let offset = self.shared().tiers_offset
            + u64::from(tier_id) * std::mem::size_of::<TierShared>() as u64;
        unsafe { self.segment.ref_at::<TierShared>(offset) }
    }

    fn free_head_ptr(&self, tier: usize, slab: usize) -> *mut u64 {
        let offset =
            self.shared().free_lists_offset + ((tier * MAX_SLABS + slab) * 8) as u64;
        unsafe { self.segment.ptr_at::<u64>(offset) }
    }

    fn set_free_head(&self, tier: usize, slab: usize, head: u64) {
        unsafe { self.free_head_ptr(tier, slab).write(head) };
    }

    fn adjustment(&self, device: usize) -> &AtomicI64 {
        let offset = self.shared().adjustments_offset
            + (device * std::mem::size_of::<AtomicI64>()) as u64;
        unsafe { self.segment.ref_at::<AtomicI64>(offset) }
    }

    /// Smallest slab class whose buffers cover `bytes` in one piece; the
    /// largest class when none does.
    fn choose_slab(&self, tier: usize, bytes: u64) -> usize {
        let shared = self.shared();
        let num_slabs = shared.num_slabs[tier] as usize;
        for s in 0..num_slabs {
            if shared.slab_buffer_sizes[tier][s] >= bytes {
                return s;
            }
        }
        num_slabs - 1
    }

    fn slab_for_capacity(&self, tier: usize, capacity: u64) -> Result<usize> {
        let shared = self.shared();
        for s in 0..shared.num_slabs[tier] as usize {
            if shared.slab_buffer_sizes[tier][s] == capacity {
                return Ok(s);
            }
        }
        Err(Error::storage(format!(
            "no slab in tier {tier} has buffer size {capacity}"
        )))
    }

    fn pop_free(&self, tier: usize, slab: usize, _guard: &TicketGuard<'_>) -> Option<BufferId> {
        let head_ptr = self.free_head_ptr(tier, slab);
        let head = unsafe { head_ptr.read() };
        let id = BufferId::from_bits(head);
        if id.is_null() {
            return None;
        }
        let header = self
            .header(id.header_index())
            .expect("free list references a valid header");
        unsafe { head_ptr.write(header.next_free) };
        header.in_use.store(1, Ordering::Release);
        header.used.store(0, Ordering::Release);
        Some(id)
    }

    fn push_free(&self, id: BufferId, _guard: &TicketGuard<'_>) -> Result<u64> {
        let shared = self.shared();
        if id.header_index() >= shared.total_headers {
            return Err(Error::storage(format!(
                "buffer header index {} out of range",
                id.header_index()
            )));
        }
        let header_ptr = unsafe {
            self.segment.ptr_at::<BufferHeader>(
                shared.headers_offset
                    + u64::from(id.header_index()) * std::mem::size_of::<BufferHeader>() as u64,
            )
        };
        let (tier, capacity) = unsafe {
            (
                (*header_ptr).tier_id as usize,
                u64::from((*header_ptr).capacity),
            )
        };
        let slab = self.slab_for_capacity(tier, capacity)?;
        let head_ptr = self.free_head_ptr(tier, slab);
        unsafe {
            (*header_ptr).next_free = head_ptr.read();
            head_ptr.write(id.to_bits());
            (*header_ptr).in_use.store(0, Ordering::Release);
            (*header_ptr).used.store(0, Ordering::Release);
        }
        Ok(capacity)
    }

    /// Satisfy the local slices of a placement schema. All-or-nothing: on
    /// any shortfall every provisionally taken buffer returns to its free
    /// list and `PoolExhausted` is reported.
    pub fn local_get_buffers(&self, entries: &[SchemaEntry]) -> Result<Vec<BufferId>> {
        for entry in entries {
            let device = entry.target.device_id() as usize;
            if device >= self.num_devices() {
                return Err(Error::storage(format!(
                    "device {device} does not exist on node {}",
                    self.node_id
                )));
            }
        }

        let guard = self.shared().mutex.lock();
        let mut acquired: Vec<BufferId> = Vec::new();

        for entry in entries {
            let tier = entry.target.device_id() as usize;
            let mut remaining = entry.bytes;
            while remaining > 0 {
                let preferred = self.choose_slab(tier, remaining);
                let num_slabs = self.shared().num_slabs[tier] as usize;
                let mut taken = None;
                for slab in preferred..num_slabs {
                    if let Some(id) = self.pop_free(tier, slab, &guard) {
                        taken = Some(id);
                        break;
                    }
                }
                match taken {
                    Some(id) => {
                        let capacity = u64::from(
                            self.header(id.header_index())
                                .expect("just popped")
                                .capacity,
                        );
                        acquired.push(id);
                        remaining = remaining.saturating_sub(capacity);
                    }
                    None => {
                        for id in acquired {
                            let _ = self.push_free(id, &guard);
                        }
                        return Err(Error::PoolExhausted);
                    }
                }
            }
        }

        // Commit the accounting only once the whole schema is satisfied.
        for id in &acquired {
            let header = self.header(id.header_index()).expect("acquired header");
            let capacity = u64::from(header.capacity);
            self.tier(header.tier_id)
                .remaining_space
                .fetch_sub(capacity, Ordering::AcqRel);
            self.adjustment(header.tier_id as usize)
                .fetch_sub(capacity as i64, Ordering::AcqRel);
        }
        drop(guard);
        Ok(acquired)
    }

    /// Return buffers to their free lists. Data in them is abandoned.
    pub fn local_release_buffers(&self, ids: &[BufferId]) -> Result<()> {
        let guard = self.shared().mutex.lock();
        for &id in ids {
            let tier_id = self.header_for(id)?.tier_id;
            let capacity = self.push_free(id, &guard)?;
            self.tier(tier_id)
                .remaining_space
                .fetch_add(capacity, Ordering::AcqRel);
            self.adjustment(tier_id as usize)
                .fetch_add(capacity as i64, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Bytes of real data currently held by a local buffer.
    pub fn local_buffer_size(&self, id: BufferId) -> Result<u64> {
        Ok(u64::from(self.header_for(id)?.used.load(Ordering::Acquire)))
    }

    /// Write into a local buffer, up to its capacity. Returns the bytes
    /// consumed.
    pub fn local_write_buffer(&self, id: BufferId, data: &[u8]) -> Result<u64> {
        let header = self.header_for(id)?;
        let n = data.len().min(header.capacity as usize);
        let tier = self.tier(header.tier_id);

        header.lock_io();
        let result = if tier.is_ram() {
            self.segment.write_bytes(header.data_offset, &data[..n]);
            Ok(())
        } else {
            self.slab_file(header).and_then(|file| {
                file.write_all_at(&data[..n], header.data_offset)
                    .map_err(Error::from)
            })
        };
        if result.is_ok() {
            header.used.store(n as u32, Ordering::Release);
        }
        header.unlock_io();
        result.map(|()| n as u64)
    }

    /// Read the used bytes of a local buffer.
    pub fn local_read_buffer(&self, id: BufferId) -> Result<Bytes> {
        let header = self.header_for(id)?;
        let tier = self.tier(header.tier_id);

        header.lock_io();
        let n = header.used.load(Ordering::Acquire) as usize;
        let mut out = vec![0u8; n];
        let result = if tier.is_ram() {
            self.segment.read_bytes(header.data_offset, &mut out);
            Ok(())
        } else {
            self.slab_file(header).and_then(|file| {
                file.read_exact_at(&mut out, header.data_offset)
                    .map_err(Error::from)
            })
        };
        header.unlock_io();
        result.map(|()| Bytes::from(out))
    }

    fn slab_file(&self, header: &BufferHeader) -> Result<&File> {
        let tier = header.tier_id as usize;
        let slab = self.slab_for_capacity(tier, u64::from(header.capacity))?;
        self.files[tier][slab]
            .as_ref()
            .ok_or_else(|| Error::storage(format!("tier {tier} has no backing file")))
    }

    /// Remaining free bytes on a local device.
    #[must_use]
    pub fn remaining_capacity(&self, device: u32) -> u64 {
        self.tier(device).remaining_space.load(Ordering::Acquire)
    }

    /// Effective capacity of every local device, in device order.
    #[must_use]
    pub fn device_capacities(&self) -> Vec<u64> {
        (0..self.shared().num_tiers)
            .map(|t| self.tier(t).capacity)
            .collect()
    }

    /// Atomically drain the per-device capacity adjustments accumulated
    /// since the last drain, for the system-view reconciliation push.
    #[must_use]
    pub fn take_capacity_adjustments(&self) -> Vec<i64> {
        (0..self.num_devices())
            .map(|d| self.adjustment(d).swap(0, Ordering::AcqRel))
            .collect()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("node_id", &self.node_id)
            .field("num_devices", &self.num_devices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_common::{MemoryConfig, TargetId};

    fn ram_config(capacity: u64) -> Config {
        let mut config = Config::default();
        config.tiers = vec![TierConfig {
            capacity,
            block_size: 1024,
            slab_unit_sizes: vec![1, 4],
            desired_slab_percentages: vec![0.5, 0.5],
            bandwidth_mbps: 6000.0,
            latency_us: 0.1,
            mount_point: String::new(),
        }];
        config
    }

    fn test_pool(dir: &tempfile::TempDir, config: &Config) -> BufferPool {
        let segment = Arc::new(
            Segment::create(
                dir.path().join("pool.hermes"),
                32 * 1024 * 1024,
                &MemoryConfig::default(),
            )
            .unwrap(),
        );
        BufferPool::init(segment, config).unwrap()
    }

    fn entry(device: u32, bytes: u64) -> SchemaEntry {
        SchemaEntry::new(TargetId::new(1, device), bytes)
    }

    #[test]
    fn test_capacity_conservation() {
        let dir = tempfile::tempdir().unwrap();
        let config = ram_config(64 * 1024);
        let pool = test_pool(&dir, &config);

        let total = pool.device_capacities()[0];
        assert_eq!(pool.remaining_capacity(0), total);

        let ids = pool.local_get_buffers(&[entry(0, 3000)]).unwrap();
        let allocated: u64 = ids
            .iter()
            .map(|&id| u64::from(pool.header_for(id).unwrap().capacity))
            .sum();
        assert_eq!(pool.remaining_capacity(0), total - allocated);

        pool.local_release_buffers(&ids).unwrap();
        assert_eq!(pool.remaining_capacity(0), total);
    }

    #[test]
    fn test_all_or_nothing_rollback() {
        let dir = tempfile::tempdir().unwrap();
        // 8 KiB tier: 4 one-block buffers + 1 four-block buffer.
        let config = ram_config(8 * 1024);
        let pool = test_pool(&dir, &config);
        let before = pool.remaining_capacity(0);

        // Far more than the tier holds: must fail and leave the free
        // lists untouched.
        let err = pool.local_get_buffers(&[entry(0, 1024 * 1024)]).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));
        assert_eq!(pool.remaining_capacity(0), before);

        // The tier still satisfies a request it can hold.
        let ids = pool.local_get_buffers(&[entry(0, 4096)]).unwrap();
        assert!(!ids.is_empty());
    }

    #[test]
    fn test_zero_byte_request_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &ram_config(16 * 1024));

        let ids = pool.local_get_buffers(&[entry(0, 0)]).unwrap();
        assert!(ids.is_empty());
        let ids = pool.local_get_buffers(&[]).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_prefers_single_covering_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &ram_config(64 * 1024));

        // 3000 bytes fit a single 4-block (4096 B) buffer.
        let ids = pool.local_get_buffers(&[entry(0, 3000)]).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(pool.header_for(ids[0]).unwrap().capacity, 4096);
    }

    #[test]
    fn test_falls_to_larger_class_when_small_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &ram_config(16 * 1024));
        // 8 KiB in 1-block buffers (8 of them), 8 KiB in 4-block (2).

        // Drain the 1-block slab.
        let mut small = Vec::new();
        for _ in 0..8 {
            small.extend(pool.local_get_buffers(&[entry(0, 1)]).unwrap());
        }
        assert!(small.iter().all(|&id| {
            pool.header_for(id).unwrap().capacity == 1024
        }));

        // The next 1-byte request must fall up to the 4-block slab.
        let ids = pool.local_get_buffers(&[entry(0, 1)]).unwrap();
        assert_eq!(pool.header_for(ids[0]).unwrap().capacity, 4096);
    }

    #[test]
    fn test_ram_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &ram_config(64 * 1024));

        let ids = pool.local_get_buffers(&[entry(0, 1000)]).unwrap();
        let id = ids[0];
        let written = pool.local_write_buffer(id, b"buffered bytes").unwrap();
        assert_eq!(written, 14);
        assert_eq!(pool.local_buffer_size(id).unwrap(), 14);
        assert_eq!(&pool.local_read_buffer(id).unwrap()[..], b"buffered bytes");
    }

    #[test]
    fn test_file_tier_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.tiers = vec![TierConfig {
            capacity: 64 * 1024,
            block_size: 1024,
            slab_unit_sizes: vec![1, 4],
            desired_slab_percentages: vec![0.5, 0.5],
            bandwidth_mbps: 300.0,
            latency_us: 100.0,
            mount_point: dir.path().to_string_lossy().into_owned(),
        }];
        let pool = test_pool(&dir, &config);

        let ids = pool.local_get_buffers(&[entry(0, 2048)]).unwrap();
        let payload = vec![0xAB; 2048];
        let mut offset = 0;
        for &id in &ids {
            let n = pool.local_write_buffer(id, &payload[offset..]).unwrap();
            offset += n as usize;
        }
        assert_eq!(offset, 2048);

        let mut back = Vec::new();
        for &id in &ids {
            back.extend_from_slice(&pool.local_read_buffer(id).unwrap());
        }
        assert_eq!(back, payload);
    }

    #[test]
    fn test_adjustments_drain_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &ram_config(64 * 1024));

        let ids = pool.local_get_buffers(&[entry(0, 5000)]).unwrap();
        let taken: i64 = ids
            .iter()
            .map(|&id| i64::from(pool.header_for(id).unwrap().capacity))
            .sum();

        let adjustments = pool.take_capacity_adjustments();
        assert_eq!(adjustments[0], -taken);
        // A second drain sees nothing new.
        assert_eq!(pool.take_capacity_adjustments()[0], 0);

        pool.local_release_buffers(&ids).unwrap();
        assert_eq!(pool.take_capacity_adjustments()[0], taken);
    }

    #[test]
    fn test_attach_sees_initialized_pool() {
        let dir = tempfile::tempdir().unwrap();
        let config = ram_config(64 * 1024);
        let path = dir.path().join("pool.hermes");
        let segment = Arc::new(
            Segment::create(&path, 32 * 1024 * 1024, &MemoryConfig::default()).unwrap(),
        );
        let pool = BufferPool::init(segment, &config).unwrap();

        let ids = pool.local_get_buffers(&[entry(0, 100)]).unwrap();
        pool.local_write_buffer(ids[0], b"visible to attachers").unwrap();

        // A second mapping of the same segment sees the same pool state.
        let attached_segment = Arc::new(Segment::open(&path).unwrap());
        let attached = BufferPool::attach(attached_segment, &config).unwrap();
        assert_eq!(attached.device_capacities(), pool.device_capacities());
        assert_eq!(
            &attached.local_read_buffer(ids[0]).unwrap()[..],
            b"visible to attachers"
        );
    }

    #[test]
    fn test_header_invariant_free_plus_used_is_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &ram_config(32 * 1024));
        let configured = pool.device_capacities()[0];

        let ids = pool.local_get_buffers(&[entry(0, 6000)]).unwrap();

        let shared = pool.shared();
        let mut free = 0u64;
        let mut in_use = 0u64;
        for index in 0..shared.total_headers {
            let header = pool.header(index).unwrap();
            if header.capacity == 0 {
                continue; // dormant block header
            }
            if header.in_use.load(Ordering::Acquire) != 0 {
                in_use += u64::from(header.capacity);
            } else {
                free += u64::from(header.capacity);
            }
        }
        assert_eq!(free + in_use, configured);
        drop(ids);
    }
}
