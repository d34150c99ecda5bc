//! Intra-node metadata storage, resident in the segment's metadata region.
//!
//! Three fixed-capacity hash maps (bucket, vbucket, blob) with linear
//! probing map name strings to 64-bit ids; the blob map also supports
//! reverse value-to-key lookup for name recovery. Beside the maps live
//! the bucket and vbucket info tables with their intrusive free-slot
//! lists, and a small heap of buffer-id-list blocks with a first-fit free
//! list so released lists are recycled.
//!
//! Lock order where both are needed: bucket/vbucket mutex before the heap
//! mutex. Map mutexes nest inside either.

use crate::sysview::SystemViewState;
use hermes_common::{BlobId, BucketId, BufferId, Config, Error, Result, VBucketId};
use hermes_shmem::{Region, Segment, TicketGuard, TicketMutex};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Process-wide seed for the storage maps and the shard hash; set once at
/// init and recorded in shared memory.
pub const MAP_SEED: u32 = 0x4E58_E5DF;

/// Marks a deleted map slot; probing continues past it, insertion reuses
/// it.
const TOMBSTONE: u64 = u64::MAX;

/// The three per-node directory namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapKind {
    Bucket = 0,
    VBucket = 1,
    Blob = 2,
}

#[repr(C)]
struct MapShared {
    mutex: TicketMutex,
    capacity: u32,
    len: AtomicU32,
    /// Segment offset of the `[MapEntry; capacity]` array.
    entries_offset: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MapEntry {
    /// Segment offset of the length-prefixed key bytes; 0 = empty slot,
    /// `TOMBSTONE` = deleted slot.
    key_offset: u64,
    value: u64,
}

/// Reference to a growable id list stored in the heap.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdListRef {
    /// Heap-relative offset of the backing block; 0 = no block yet.
    pub offset: u32,
    /// Live entries.
    pub length: u32,
    /// Slots in the backing block.
    pub capacity: u32,
    _pad: u32,
}

/// Per-bucket bookkeeping, one fixed slot per possible bucket.
#[repr(C)]
pub struct BucketInfo {
    /// Intrusive free-slot link, as packed `BucketId` bits.
    next_free: u64,
    blobs: IdListRef,
    ref_count: AtomicI32,
    active: AtomicU32,
}

/// Per-vbucket bookkeeping; vbuckets additionally carry trait slots.
#[repr(C)]
pub struct VBucketInfo {
    next_free: u64,
    blobs: IdListRef,
    traits: [u64; hermes_common::MAX_TRAITS_PER_VBUCKET],
    ref_count: AtomicI32,
    active: AtomicU32,
}

/// The metadata root, resident in shared memory.
#[repr(C)]
pub struct MetaShared {
    map_seed: u32,
    num_devices: u32,
    maps: [MapShared; 3],
    bucket_mutex: TicketMutex,
    vbucket_mutex: TicketMutex,
    heap_mutex: TicketMutex,
    bucket_info_offset: u64,
    vbucket_info_offset: u64,
    max_buckets: u32,
    max_vbuckets: u32,
    num_buckets: AtomicU32,
    num_vbuckets: AtomicU32,
    first_free_bucket: AtomicU64,
    first_free_vbucket: AtomicU64,
    /// Heap-relative offset of the first free heap block; 0 = none.
    heap_free_head: AtomicU64,
    local_sysview_offset: u64,
    global_sysview_offset: u64,
    global_sysview_node: u32,
    _pad: u32,
}

/// Process-side handle to the node's metadata storage.
pub struct MetaStorage {
    segment: Arc<Segment>,
    root: u64,
    node_id: u32,
}

impl MetaStorage {
    /// Lay the metadata structures out in the segment. `device_capacities`
    /// seeds the system view state(s); the global state is created only on
    /// the designated global node.
    pub fn init(
        segment: Arc<Segment>,
        config: &Config,
        device_capacities: &[u64],
    ) -> Result<Self> {
        let arena = segment.arena(Region::Metadata);
        let root = arena.alloc_array::<MetaShared>(1)?;

        let max_buckets = config.directory.max_buckets_per_node;
        let max_vbuckets = config.directory.max_vbuckets_per_node;
        let max_blobs = config.directory.max_blobs_per_node;

        // Double capacity keeps linear probing short of pathological.
        let map_capacities = [max_buckets * 2, max_vbuckets * 2, max_blobs * 2];
        let mut entries_offsets = [0u64; 3];
        for (i, capacity) in map_capacities.iter().enumerate() {
            entries_offsets[i] = arena.alloc_array::<MapEntry>(*capacity as usize)?;
        }

        let bucket_info_offset = arena.alloc_array::<BucketInfo>(max_buckets as usize)?;
        let vbucket_info_offset = arena.alloc_array::<VBucketInfo>(max_vbuckets as usize)?;

        let local_sysview_offset = arena.alloc_array::<SystemViewState>(1)?;
        unsafe {
            SystemViewState::init_at(
                segment.ptr_at::<SystemViewState>(local_sysview_offset),
                device_capacities,
            );
        }
        let global_sysview_offset = if config.node_id == hermes_common::GLOBAL_SYSTEM_VIEW_NODE {
            let offset = arena.alloc_array::<SystemViewState>(1)?;
            unsafe {
                SystemViewState::init_at(
                    segment.ptr_at::<SystemViewState>(offset),
                    device_capacities,
                );
            }
            offset
        } else {
            0
        };

        let shared = unsafe { &mut *segment.ptr_at::<MetaShared>(root) };
        shared.map_seed = MAP_SEED;
        shared.num_devices = device_capacities.len() as u32;
        for (i, map) in shared.maps.iter_mut().enumerate() {
            map.mutex.reset();
            map.capacity = map_capacities[i];
            map.len = AtomicU32::new(0);
            map.entries_offset = entries_offsets[i];
        }
        shared.bucket_mutex.reset();
        shared.vbucket_mutex.reset();
        shared.heap_mutex.reset();
        shared.bucket_info_offset = bucket_info_offset;
        shared.vbucket_info_offset = vbucket_info_offset;
        shared.max_buckets = max_buckets;
        shared.max_vbuckets = max_vbuckets;
        shared.num_buckets = AtomicU32::new(0);
        shared.num_vbuckets = AtomicU32::new(0);
        shared.heap_free_head = AtomicU64::new(0);
        shared.local_sysview_offset = local_sysview_offset;
        shared.global_sysview_offset = global_sysview_offset;
        shared.global_sysview_node = hermes_common::GLOBAL_SYSTEM_VIEW_NODE;
        shared.first_free_bucket = AtomicU64::new(BucketId::new(config.node_id, 0).to_bits());
        shared.first_free_vbucket = AtomicU64::new(VBucketId::new(config.node_id, 0).to_bits());
        let _ = shared;

        let storage = Self {
            segment: segment.clone(),
            root,
            node_id: config.node_id,
        };

        // Thread the free-slot chains: slot i links to slot i + 1, the
        // last slot terminates with the null id.
        for i in 0..max_buckets {
            let next = if i + 1 == max_buckets {
                0
            } else {
                BucketId::new(config.node_id, i + 1).to_bits()
            };
            unsafe {
                let info = storage.bucket_info_ptr(i);
                (*info).next_free = next;
                (*info).blobs = IdListRef::default();
                (*info).ref_count = AtomicI32::new(0);
                (*info).active = AtomicU32::new(0);
            }
        }
        for i in 0..max_vbuckets {
            let next = if i + 1 == max_vbuckets {
                0
            } else {
                VBucketId::new(config.node_id, i + 1).to_bits()
            };
            unsafe {
                let info = storage.vbucket_info_ptr(i);
                (*info).next_free = next;
                (*info).blobs = IdListRef::default();
                (*info).traits = [0; hermes_common::MAX_TRAITS_PER_VBUCKET];
                (*info).ref_count = AtomicI32::new(0);
                (*info).active = AtomicU32::new(0);
            }
        }

        segment.set_metadata_root(root);
        info!(
            node_id = config.node_id,
            max_buckets, max_vbuckets, max_blobs, "initialized metadata storage"
        );
        Ok(storage)
    }

    /// Attach to metadata some other process initialized in `segment`.
    pub fn attach(segment: Arc<Segment>, node_id: u32) -> Result<Self> {
        let root = segment.metadata_root();
        if root == 0 {
            return Err(Error::storage("segment has no initialized metadata"));
        }
        Ok(Self {
            segment,
            root,
            node_id,
        })
    }

    fn shared(&self) -> &MetaShared {
        unsafe { self.segment.ref_at::<MetaShared>(self.root) }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Number of devices recorded at init.
    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.shared().num_devices as usize
    }

    /// The node holding the authoritative global system view.
    #[must_use]
    pub fn global_sysview_node(&self) -> u32 {
        self.shared().global_sysview_node
    }

    /// The shard (node id) that owns `name`.
    #[must_use]
    pub fn shard_for(&self, name: &str, num_nodes: u32) -> u32 {
        let hash = crc32c::crc32c_append(self.shared().map_seed, name.as_bytes());
        hash % num_nodes + 1
    }

    // ------------------------------------------------------------------
    // Directory maps
    // ------------------------------------------------------------------

    fn map(&self, kind: MapKind) -> &MapShared {
        &self.shared().maps[kind as usize]
    }

    fn entry_ptr(&self, map: &MapShared, slot: u32) -> *mut MapEntry {
        debug_assert!(slot < map.capacity);
        unsafe {
            self.segment.ptr_at::<MapEntry>(
                map.entries_offset + u64::from(slot) * std::mem::size_of::<MapEntry>() as u64,
            )
        }
    }

    fn hash_slot(&self, map: &MapShared, key: &[u8]) -> u32 {
        crc32c::crc32c_append(self.shared().map_seed, key) % map.capacity
    }

    unsafe fn key_matches(&self, key_offset: u64, key: &[u8]) -> bool {
        let len = self.segment.ptr_at::<u32>(key_offset).read() as usize;
        if len != key.len() {
            return false;
        }
        let stored = std::slice::from_raw_parts(self.segment.ptr_at::<u8>(key_offset + 4), len);
        stored == key
    }

    unsafe fn read_key(&self, key_offset: u64) -> String {
        let len = self.segment.ptr_at::<u32>(key_offset).read() as usize;
        let mut bytes = vec![0u8; len];
        self.segment.read_bytes(key_offset + 4, &mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Insert or overwrite `key -> value` in the local shard of `kind`.
    pub fn local_put(&self, key: &str, value: u64, kind: MapKind) -> Result<()> {
        let map = self.map(kind);
        let _guard = map.mutex.lock();
        let key_bytes = key.as_bytes();
        let start = self.hash_slot(map, key_bytes);

        let mut first_reusable: Option<u32> = None;
        for probe in 0..map.capacity {
            let slot = (start + probe) % map.capacity;
            let entry = self.entry_ptr(map, slot);
            let key_offset = unsafe { (*entry).key_offset };
            if key_offset == 0 {
                let slot = first_reusable.unwrap_or(slot);
                return self.write_entry(map, slot, key_bytes, value);
            }
            if key_offset == TOMBSTONE {
                if first_reusable.is_none() {
                    first_reusable = Some(slot);
                }
                continue;
            }
            if unsafe { self.key_matches(key_offset, key_bytes) } {
                unsafe { (*entry).value = value };
                return Ok(());
            }
        }
        if let Some(slot) = first_reusable {
            return self.write_entry(map, slot, key_bytes, value);
        }
        Err(Error::MapFull(match kind {
            MapKind::Bucket => "bucket",
            MapKind::VBucket => "vbucket",
            MapKind::Blob => "blob",
        }))
    }

    fn write_entry(&self, map: &MapShared, slot: u32, key: &[u8], value: u64) -> Result<()> {
        let arena = self.segment.arena(Region::Metadata);
        let key_offset = arena.alloc(4 + key.len() as u64, 8)?;
        unsafe {
            self.segment
                .ptr_at::<u32>(key_offset)
                .write(key.len() as u32)
        };
        self.segment.write_bytes(key_offset + 4, key);

        let entry = self.entry_ptr(map, slot);
        unsafe {
            (*entry).value = value;
            (*entry).key_offset = key_offset;
        }
        map.len.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Look `key` up in the local shard of `kind`; 0 when absent.
    #[must_use]
    pub fn local_get(&self, key: &str, kind: MapKind) -> u64 {
        let map = self.map(kind);
        let _guard = map.mutex.lock();
        let key_bytes = key.as_bytes();
        let start = self.hash_slot(map, key_bytes);

        for probe in 0..map.capacity {
            let slot = (start + probe) % map.capacity;
            let entry = self.entry_ptr(map, slot);
            let key_offset = unsafe { (*entry).key_offset };
            if key_offset == 0 {
                return 0;
            }
            if key_offset == TOMBSTONE {
                continue;
            }
            if unsafe { self.key_matches(key_offset, key_bytes) } {
                return unsafe { (*entry).value };
            }
        }
        0
    }

    /// Remove `key` from the local shard of `kind`. Removing an absent key
    /// is a no-op.
    pub fn local_delete(&self, key: &str, kind: MapKind) {
        let map = self.map(kind);
        let _guard = map.mutex.lock();
        let key_bytes = key.as_bytes();
        let start = self.hash_slot(map, key_bytes);

        for probe in 0..map.capacity {
            let slot = (start + probe) % map.capacity;
            let entry = self.entry_ptr(map, slot);
            let key_offset = unsafe { (*entry).key_offset };
            if key_offset == 0 {
                return;
            }
            if key_offset == TOMBSTONE {
                continue;
            }
            if unsafe { self.key_matches(key_offset, key_bytes) } {
                // The key bytes stay in the arena; only the slot is
                // recycled.
                unsafe {
                    (*entry).key_offset = TOMBSTONE;
                    (*entry).value = 0;
                }
                map.len.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }

    /// Recover the key that maps to `value`, scanning the fixed table.
    /// Used by the blob map to turn a `BlobId` back into its internal
    /// name.
    #[must_use]
    pub fn local_reverse_get(&self, value: u64, kind: MapKind) -> Option<String> {
        let map = self.map(kind);
        let _guard = map.mutex.lock();

        for slot in 0..map.capacity {
            let entry = self.entry_ptr(map, slot);
            let key_offset = unsafe { (*entry).key_offset };
            if key_offset == 0 || key_offset == TOMBSTONE {
                continue;
            }
            if unsafe { (*entry).value } == value {
                return Some(unsafe { self.read_key(key_offset) });
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Buffer-id-list heap
    // ------------------------------------------------------------------
    //
    // Block layout: [capacity: u32][length: u32][slots: u64 * capacity].
    // Offsets handed out are relative to the metadata root so they fit the
    // 32-bit low half of a BlobId. A freed block keeps its capacity and
    // threads the free list through its first slot.

    fn heap_seg(&self, rel: u32) -> u64 {
        self.root + u64::from(rel)
    }

    fn heap_rel(&self, seg: u64) -> u32 {
        debug_assert!(seg > self.root && seg - self.root <= u64::from(u32::MAX));
        (seg - self.root) as u32
    }

    unsafe fn block_capacity(&self, rel: u32) -> u32 {
        self.segment.ptr_at::<u32>(self.heap_seg(rel)).read()
    }

    unsafe fn block_len_ptr(&self, rel: u32) -> *mut u32 {
        self.segment.ptr_at::<u32>(self.heap_seg(rel) + 4)
    }

    unsafe fn block_slot_ptr(&self, rel: u32, slot: u32) -> *mut u64 {
        self.segment
            .ptr_at::<u64>(self.heap_seg(rel) + 8 + u64::from(slot) * 8)
    }

    fn heap_alloc_block(&self, slots: u32, _guard: &TicketGuard<'_>) -> Result<u32> {
        // Even an empty list gets one slot; the free chain threads
        // through slot 0 of released blocks.
        let slots = slots.max(1);
        let shared = self.shared();

        // First fit over the free chain.
        let mut prev: u32 = 0;
        let mut cursor = shared.heap_free_head.load(Ordering::Acquire) as u32;
        while cursor != 0 {
            let capacity = unsafe { self.block_capacity(cursor) };
            let next = unsafe { self.block_slot_ptr(cursor, 0).read() } as u32;
            if capacity >= slots {
                if prev == 0 {
                    shared
                        .heap_free_head
                        .store(u64::from(next), Ordering::Release);
                } else {
                    unsafe { self.block_slot_ptr(prev, 0).write(u64::from(next)) };
                }
                unsafe { self.block_len_ptr(cursor).write(0) };
                return Ok(cursor);
            }
            prev = cursor;
            cursor = next;
        }

        let arena = self.segment.arena(Region::Metadata);
        let seg = arena.alloc(8 + u64::from(slots) * 8, 8)?;
        unsafe {
            self.segment.ptr_at::<u32>(seg).write(slots);
            self.segment.ptr_at::<u32>(seg + 4).write(0);
        }
        Ok(self.heap_rel(seg))
    }

    fn heap_free_block(&self, rel: u32, _guard: &TicketGuard<'_>) {
        let shared = self.shared();
        let head = shared.heap_free_head.load(Ordering::Acquire);
        unsafe {
            self.block_len_ptr(rel).write(0);
            self.block_slot_ptr(rel, 0).write(head);
        }
        shared
            .heap_free_head
            .store(u64::from(rel), Ordering::Release);
    }

    /// Store a buffer-id list, returning its heap-relative offset for
    /// embedding in a `BlobId`.
    pub fn alloc_buffer_id_list(&self, ids: &[BufferId]) -> Result<u32> {
        let guard = self.shared().heap_mutex.lock();
        let rel = self.heap_alloc_block(ids.len() as u32, &guard)?;
        unsafe {
            self.block_len_ptr(rel).write(ids.len() as u32);
            for (i, id) in ids.iter().enumerate() {
                self.block_slot_ptr(rel, i as u32).write(id.to_bits());
            }
        }
        Ok(rel)
    }

    /// Read back the list at `rel`.
    pub fn buffer_id_list(&self, rel: u32) -> Result<Vec<BufferId>> {
        if rel == 0 {
            return Err(Error::storage("null buffer-id-list offset"));
        }
        let _guard = self.shared().heap_mutex.lock();
        let len = unsafe { self.block_len_ptr(rel).read() };
        let mut ids = Vec::with_capacity(len as usize);
        for i in 0..len {
            ids.push(BufferId::from_bits(unsafe {
                self.block_slot_ptr(rel, i).read()
            }));
        }
        Ok(ids)
    }

    /// Release the list at `rel` back to the heap free chain.
    pub fn free_buffer_id_list(&self, rel: u32) -> Result<()> {
        if rel == 0 {
            return Err(Error::storage("null buffer-id-list offset"));
        }
        let guard = self.shared().heap_mutex.lock();
        self.heap_free_block(rel, &guard);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bucket slots
    // ------------------------------------------------------------------

    fn bucket_info_ptr(&self, index: u32) -> *mut BucketInfo {
        debug_assert!(index < self.shared().max_buckets);
        unsafe {
            self.segment.ptr_at::<BucketInfo>(
                self.shared().bucket_info_offset
                    + u64::from(index) * std::mem::size_of::<BucketInfo>() as u64,
            )
        }
    }

    fn vbucket_info_ptr(&self, index: u32) -> *mut VBucketInfo {
        debug_assert!(index < self.shared().max_vbuckets);
        unsafe {
            self.segment.ptr_at::<VBucketInfo>(
                self.shared().vbucket_info_offset
                    + u64::from(index) * std::mem::size_of::<VBucketInfo>() as u64,
            )
        }
    }

    /// Guards bucket slot transitions and bucket blob lists.
    #[must_use]
    pub fn bucket_mutex(&self) -> &TicketMutex {
        &self.shared().bucket_mutex
    }

    /// Guards vbucket slot transitions and vbucket blob lists.
    #[must_use]
    pub fn vbucket_mutex(&self) -> &TicketMutex {
        &self.shared().vbucket_mutex
    }

    /// Take the next free bucket slot, activating it with refcount 1.
    /// Caller holds the bucket mutex.
    pub fn acquire_bucket_slot(&self, _guard: &TicketGuard<'_>) -> Result<BucketId> {
        let shared = self.shared();
        if shared.num_buckets.load(Ordering::Acquire) >= shared.max_buckets {
            return Err(Error::SlotExhausted("bucket"));
        }
        let id = BucketId::from_bits(shared.first_free_bucket.load(Ordering::Acquire));
        if id.is_null() {
            return Err(Error::SlotExhausted("bucket"));
        }
        let info = self.bucket_info_ptr(id.index());
        unsafe {
            shared
                .first_free_bucket
                .store((*info).next_free, Ordering::Release);
            (*info).next_free = 0;
            (*info).blobs = IdListRef::default();
            (*info).ref_count.store(1, Ordering::Release);
            (*info).active.store(1, Ordering::Release);
        }
        shared.num_buckets.fetch_add(1, Ordering::AcqRel);
        Ok(id)
    }

    /// Return a bucket slot to the free chain. Caller holds the bucket
    /// mutex and has already emptied the blob list.
    pub fn release_bucket_slot(&self, id: BucketId, _guard: &TicketGuard<'_>) {
        let shared = self.shared();
        let info = self.bucket_info_ptr(id.index());
        unsafe {
            if (*info).blobs.offset != 0 {
                let heap_guard = shared.heap_mutex.lock();
                self.heap_free_block((*info).blobs.offset, &heap_guard);
            }
            (*info).blobs = IdListRef::default();
            (*info).active.store(0, Ordering::Release);
            (*info).ref_count.store(0, Ordering::Release);
            (*info).next_free = shared.first_free_bucket.load(Ordering::Acquire);
        }
        shared
            .first_free_bucket
            .store(id.to_bits(), Ordering::Release);
        shared.num_buckets.fetch_sub(1, Ordering::AcqRel);
    }

    /// Index of the slot at the head of the free bucket chain, if any.
    #[must_use]
    pub fn first_free_bucket_index(&self) -> Option<u32> {
        let id = BucketId::from_bits(self.shared().first_free_bucket.load(Ordering::Acquire));
        (!id.is_null()).then(|| id.index())
    }

    /// Current refcount of a local bucket.
    #[must_use]
    pub fn bucket_ref_count(&self, id: BucketId) -> i32 {
        unsafe { (*self.bucket_info_ptr(id.index())).ref_count.load(Ordering::Acquire) }
    }

    pub fn incr_bucket_refcount(&self, id: BucketId) {
        unsafe {
            (*self.bucket_info_ptr(id.index()))
                .ref_count
                .fetch_add(1, Ordering::AcqRel)
        };
    }

    pub fn decr_bucket_refcount(&self, id: BucketId) {
        let previous = unsafe {
            (*self.bucket_info_ptr(id.index()))
                .ref_count
                .fetch_sub(1, Ordering::AcqRel)
        };
        debug_assert!(previous > 0, "bucket refcount underflow");
    }

    #[must_use]
    pub fn vbucket_ref_count(&self, id: VBucketId) -> i32 {
        unsafe {
            (*self.vbucket_info_ptr(id.index()))
                .ref_count
                .load(Ordering::Acquire)
        }
    }

    pub fn incr_vbucket_refcount(&self, id: VBucketId) {
        unsafe {
            (*self.vbucket_info_ptr(id.index()))
                .ref_count
                .fetch_add(1, Ordering::AcqRel)
        };
    }

    pub fn decr_vbucket_refcount(&self, id: VBucketId) {
        let previous = unsafe {
            (*self.vbucket_info_ptr(id.index()))
                .ref_count
                .fetch_sub(1, Ordering::AcqRel)
        };
        debug_assert!(previous > 0, "vbucket refcount underflow");
    }

    /// Take the next free vbucket slot, activating it with refcount 1.
    /// Caller holds the vbucket mutex.
    pub fn acquire_vbucket_slot(&self, _guard: &TicketGuard<'_>) -> Result<VBucketId> {
        let shared = self.shared();
        if shared.num_vbuckets.load(Ordering::Acquire) >= shared.max_vbuckets {
            return Err(Error::SlotExhausted("vbucket"));
        }
        let id = VBucketId::from_bits(shared.first_free_vbucket.load(Ordering::Acquire));
        if id.is_null() {
            return Err(Error::SlotExhausted("vbucket"));
        }
        let info = self.vbucket_info_ptr(id.index());
        unsafe {
            shared
                .first_free_vbucket
                .store((*info).next_free, Ordering::Release);
            (*info).next_free = 0;
            (*info).blobs = IdListRef::default();
            (*info).traits = [0; hermes_common::MAX_TRAITS_PER_VBUCKET];
            (*info).ref_count.store(1, Ordering::Release);
            (*info).active.store(1, Ordering::Release);
        }
        shared.num_vbuckets.fetch_add(1, Ordering::AcqRel);
        Ok(id)
    }

    /// Return a vbucket slot to the free chain. Caller holds the vbucket
    /// mutex.
    pub fn release_vbucket_slot(&self, id: VBucketId, _guard: &TicketGuard<'_>) {
        let shared = self.shared();
        let info = self.vbucket_info_ptr(id.index());
        unsafe {
            if (*info).blobs.offset != 0 {
                let heap_guard = shared.heap_mutex.lock();
                self.heap_free_block((*info).blobs.offset, &heap_guard);
            }
            (*info).blobs = IdListRef::default();
            (*info).active.store(0, Ordering::Release);
            (*info).ref_count.store(0, Ordering::Release);
            (*info).next_free = shared.first_free_vbucket.load(Ordering::Acquire);
        }
        shared
            .first_free_vbucket
            .store(id.to_bits(), Ordering::Release);
        shared.num_vbuckets.fetch_sub(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // Blob lists
    // ------------------------------------------------------------------

    unsafe fn idlist_append(&self, list: *mut IdListRef, id_bits: u64) -> Result<()> {
        let current = *list;
        if current.offset == 0 || current.length == current.capacity {
            let new_capacity = if current.capacity == 0 {
                8
            } else {
                current.capacity * 2
            };
            let heap_guard = self.shared().heap_mutex.lock();
            let new_block = self.heap_alloc_block(new_capacity, &heap_guard)?;
            for i in 0..current.length {
                let value = self.block_slot_ptr(current.offset, i).read();
                self.block_slot_ptr(new_block, i).write(value);
            }
            self.block_len_ptr(new_block).write(current.length);
            if current.offset != 0 {
                self.heap_free_block(current.offset, &heap_guard);
            }
            (*list).offset = new_block;
            // A recycled block may be larger than requested.
            (*list).capacity = self.block_capacity(new_block);
        }
        let slot = (*list).length;
        self.block_slot_ptr((*list).offset, slot).write(id_bits);
        self.block_len_ptr((*list).offset).write(slot + 1);
        (*list).length = slot + 1;
        Ok(())
    }

    unsafe fn idlist_remove(&self, list: *mut IdListRef, id_bits: u64) -> bool {
        let length = (*list).length;
        for i in 0..length {
            if self.block_slot_ptr((*list).offset, i).read() == id_bits {
                // Swap-remove keeps the list dense; blob order within a
                // bucket is not meaningful.
                let last = self.block_slot_ptr((*list).offset, length - 1).read();
                self.block_slot_ptr((*list).offset, i).write(last);
                (*list).length = length - 1;
                self.block_len_ptr((*list).offset).write(length - 1);
                return true;
            }
        }
        false
    }

    unsafe fn idlist_collect(&self, list: *const IdListRef) -> Vec<u64> {
        let length = (*list).length;
        let mut out = Vec::with_capacity(length as usize);
        for i in 0..length {
            out.push(self.block_slot_ptr((*list).offset, i).read());
        }
        out
    }

    /// Append a blob id to a local bucket's blob list.
    pub fn append_blob_to_bucket(&self, bucket: BucketId, blob: BlobId) -> Result<()> {
        let _guard = self.shared().bucket_mutex.lock();
        let info = self.bucket_info_ptr(bucket.index());
        unsafe { self.idlist_append(std::ptr::addr_of_mut!((*info).blobs), blob.to_bits()) }
    }

    /// Remove a blob id from a local bucket's blob list. Returns whether
    /// it was present.
    pub fn remove_blob_from_bucket(&self, bucket: BucketId, blob: BlobId) -> bool {
        let _guard = self.shared().bucket_mutex.lock();
        let info = self.bucket_info_ptr(bucket.index());
        unsafe { self.idlist_remove(std::ptr::addr_of_mut!((*info).blobs), blob.to_bits()) }
    }

    /// All blob ids registered in a local bucket.
    #[must_use]
    pub fn bucket_blob_ids(&self, bucket: BucketId) -> Vec<BlobId> {
        let _guard = self.shared().bucket_mutex.lock();
        let info = self.bucket_info_ptr(bucket.index());
        unsafe { self.idlist_collect(std::ptr::addr_of!((*info).blobs)) }
            .into_iter()
            .map(BlobId::from_bits)
            .collect()
    }

    /// Membership test against a local bucket's blob list.
    #[must_use]
    pub fn bucket_contains_blob(&self, bucket: BucketId, blob: BlobId) -> bool {
        let _guard = self.shared().bucket_mutex.lock();
        let info = self.bucket_info_ptr(bucket.index());
        unsafe { self.idlist_collect(std::ptr::addr_of!((*info).blobs)) }
            .contains(&blob.to_bits())
    }

    /// Append a blob id to a local vbucket's link list.
    pub fn append_blob_to_vbucket(&self, vbucket: VBucketId, blob: BlobId) -> Result<()> {
        let _guard = self.shared().vbucket_mutex.lock();
        let info = self.vbucket_info_ptr(vbucket.index());
        unsafe { self.idlist_append(std::ptr::addr_of_mut!((*info).blobs), blob.to_bits()) }
    }

    /// Remove a blob id from a local vbucket's link list.
    pub fn remove_blob_from_vbucket(&self, vbucket: VBucketId, blob: BlobId) -> bool {
        let _guard = self.shared().vbucket_mutex.lock();
        let info = self.vbucket_info_ptr(vbucket.index());
        unsafe { self.idlist_remove(std::ptr::addr_of_mut!((*info).blobs), blob.to_bits()) }
    }

    // ------------------------------------------------------------------
    // System view state
    // ------------------------------------------------------------------

    /// This node's local snapshot of bytes available per device.
    #[must_use]
    pub fn local_sysview(&self) -> &SystemViewState {
        unsafe {
            self.segment
                .ref_at::<SystemViewState>(self.shared().local_sysview_offset)
        }
    }

    /// The authoritative global view; present only on the global node.
    #[must_use]
    pub fn global_sysview(&self) -> Option<&SystemViewState> {
        let offset = self.shared().global_sysview_offset;
        if offset == 0 {
            return None;
        }
        Some(unsafe { self.segment.ref_at::<SystemViewState>(offset) })
    }
}

impl std::fmt::Debug for MetaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStorage")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Default for IdListRef {
    fn default() -> Self {
        Self {
            offset: 0,
            length: 0,
            capacity: 0,
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_common::MemoryConfig;

    fn test_storage(dir: &tempfile::TempDir) -> MetaStorage {
        let segment = Arc::new(
            Segment::create(
                dir.path().join("meta.hermes"),
                32 * 1024 * 1024,
                &MemoryConfig::default(),
            )
            .unwrap(),
        );
        let config = Config::default();
        MetaStorage::init(segment, &config, &[64 * 1024]).unwrap()
    }

    #[test]
    fn test_map_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);

        assert_eq!(storage.local_get("alpha", MapKind::Bucket), 0);
        storage.local_put("alpha", 42, MapKind::Bucket).unwrap();
        assert_eq!(storage.local_get("alpha", MapKind::Bucket), 42);

        // The three namespaces are independent.
        assert_eq!(storage.local_get("alpha", MapKind::Blob), 0);

        storage.local_delete("alpha", MapKind::Bucket);
        assert_eq!(storage.local_get("alpha", MapKind::Bucket), 0);
    }

    #[test]
    fn test_map_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);

        storage.local_put("k", 1, MapKind::Blob).unwrap();
        storage.local_put("k", 2, MapKind::Blob).unwrap();
        assert_eq!(storage.local_get("k", MapKind::Blob), 2);
    }

    #[test]
    fn test_reverse_get_blob_name() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);

        storage.local_put("internalname", 77, MapKind::Blob).unwrap();
        assert_eq!(
            storage.local_reverse_get(77, MapKind::Blob).as_deref(),
            Some("internalname")
        );
        assert!(storage.local_reverse_get(78, MapKind::Blob).is_none());
    }

    #[test]
    fn test_delete_does_not_break_probe_chains() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);

        // Insert enough keys that some collide, delete half, and verify
        // the remainder still resolve past the tombstones.
        for i in 0..100 {
            storage
                .local_put(&format!("key{i}"), i + 1, MapKind::Blob)
                .unwrap();
        }
        for i in (0..100).step_by(2) {
            storage.local_delete(&format!("key{i}"), MapKind::Blob);
        }
        for i in 0..100u64 {
            let expected = if i % 2 == 0 { 0 } else { i + 1 };
            assert_eq!(storage.local_get(&format!("key{i}"), MapKind::Blob), expected);
        }
    }

    #[test]
    fn test_buffer_id_list_roundtrip_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);

        let ids: Vec<BufferId> = (0..5).map(|i| BufferId::new(1, i)).collect();
        let rel = storage.alloc_buffer_id_list(&ids).unwrap();
        assert_eq!(storage.buffer_id_list(rel).unwrap(), ids);

        storage.free_buffer_id_list(rel).unwrap();

        // A same-size allocation reuses the freed block.
        let again = storage.alloc_buffer_id_list(&ids).unwrap();
        assert_eq!(again, rel);
        assert_eq!(storage.buffer_id_list(again).unwrap(), ids);
    }

    #[test]
    fn test_bucket_slot_chain() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);

        let guard = storage.bucket_mutex().lock();
        let first = storage.acquire_bucket_slot(&guard).unwrap();
        let second = storage.acquire_bucket_slot(&guard).unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert_eq!(storage.bucket_ref_count(first), 1);

        storage.release_bucket_slot(first, &guard);
        // The released slot returns to the head of the chain.
        assert_eq!(storage.first_free_bucket_index(), Some(first.index()));
        let third = storage.acquire_bucket_slot(&guard).unwrap();
        assert_eq!(third.index(), first.index());
        drop(guard);
    }

    #[test]
    fn test_bucket_slot_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Arc::new(
            Segment::create(
                dir.path().join("meta.hermes"),
                32 * 1024 * 1024,
                &MemoryConfig::default(),
            )
            .unwrap(),
        );
        let mut config = Config::default();
        config.directory.max_buckets_per_node = 2;
        let storage = MetaStorage::init(segment, &config, &[1024]).unwrap();

        let guard = storage.bucket_mutex().lock();
        storage.acquire_bucket_slot(&guard).unwrap();
        storage.acquire_bucket_slot(&guard).unwrap();
        let err = storage.acquire_bucket_slot(&guard).unwrap_err();
        assert!(matches!(err, Error::SlotExhausted("bucket")));
        drop(guard);
    }

    #[test]
    fn test_bucket_blob_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);

        let bucket = {
            let guard = storage.bucket_mutex().lock();
            storage.acquire_bucket_slot(&guard).unwrap()
        };

        let blobs: Vec<BlobId> = (1..=20).map(|i| BlobId::new(1, i)).collect();
        for &blob in &blobs {
            storage.append_blob_to_bucket(bucket, blob).unwrap();
        }
        assert_eq!(storage.bucket_blob_ids(bucket).len(), 20);
        assert!(storage.bucket_contains_blob(bucket, blobs[7]));

        assert!(storage.remove_blob_from_bucket(bucket, blobs[7]));
        assert!(!storage.bucket_contains_blob(bucket, blobs[7]));
        assert!(!storage.remove_blob_from_bucket(bucket, blobs[7]));
        assert_eq!(storage.bucket_blob_ids(bucket).len(), 19);
    }

    #[test]
    fn test_attach_sees_initialized_maps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.hermes");
        let segment = Arc::new(
            Segment::create(&path, 32 * 1024 * 1024, &MemoryConfig::default()).unwrap(),
        );
        let config = Config::default();
        let storage = MetaStorage::init(segment, &config, &[4096]).unwrap();
        storage.local_put("seen", 9, MapKind::Bucket).unwrap();

        let attached_segment = Arc::new(Segment::open(&path).unwrap());
        let attached = MetaStorage::attach(attached_segment, config.node_id).unwrap();
        assert_eq!(attached.local_get("seen", MapKind::Bucket), 9);
        assert_eq!(attached.num_devices(), 1);
    }

    #[test]
    fn test_shard_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);

        let a = storage.shard_for("some-name", 4);
        let b = storage.shard_for("some-name", 4);
        assert_eq!(a, b);
        assert!((1..=4).contains(&a));
    }

    #[test]
    fn test_sysview_created_on_global_node() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(&dir);
        // Default config is node 1, which is the global node.
        assert!(storage.global_sysview().is_some());
        assert_eq!(storage.local_sysview().bytes_available(0), 64 * 1024);
    }
}
