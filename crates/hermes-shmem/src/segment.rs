//! The shared-memory segment: one file-backed mapping per buffer pool.
//!
//! Segment layout:
//! ```text
//! +--------------------+  offset 0
//! |   SegmentHeader    |  4 KiB - magic, version, region table, roots
//! +--------------------+
//! |  Buffer pool region|  buffer_pool_percent - pool struct, headers, data
//! +--------------------+
//! |  Metadata region   |  metadata_percent - maps, info tables, id lists
//! +--------------------+
//! |  Transfer window   |  transfer_window_percent - inter-tier scratch
//! +--------------------+
//! |  Transient region  |  transient_percent - per-call scoped scratch
//! +--------------------+
//! ```
//!
//! Multiple pools may coexist on one machine, each under its own segment
//! name; cooperating processes attach by name and address everything
//! inside by offset.

use crate::arena::Arena;
use hermes_common::{Error, MemoryConfig, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Magic number identifying a Hermes segment.
pub const MAGIC: u32 = 0x4852_4D53; // "HRMS"

/// Current segment format version.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the segment header block.
pub const HEADER_SIZE: u64 = 4096;

/// Region alignment; regions start on page boundaries.
const REGION_ALIGN: u64 = 4096;

const NUM_REGIONS: usize = 4;

/// The carved-up regions of a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    BufferPool = 0,
    Metadata = 1,
    TransferWindow = 2,
    Transient = 3,
}

impl Region {
    fn advice(self) -> &'static str {
        match self {
            Region::BufferPool => "buffer_pool_memory_percent",
            Region::Metadata => "metadata_memory_percent",
            Region::TransferWindow => "transfer_window_memory_percent",
            Region::Transient => "transient_memory_percent",
        }
    }
}

/// Fixed header at the base of every segment.
#[repr(C)]
pub struct SegmentHeader {
    magic: u32,
    version: u32,
    capacity: u64,
    region_offsets: [u64; NUM_REGIONS],
    region_sizes: [u64; NUM_REGIONS],
    /// Segment offset of the buffer-pool root struct; written once by pool
    /// initialization, read by every attacher.
    buffer_pool_root: AtomicU64,
    /// Segment offset of the metadata-manager root struct.
    metadata_root: AtomicU64,
}

/// A mapped shared-memory segment.
pub struct Segment {
    mmap: MmapMut,
    path: PathBuf,
}

// The segment is shared across threads (and processes); all interior
// mutation is funneled through in-region atomics and ticket mutexes.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

impl Segment {
    /// Create and initialize a segment of `capacity` bytes at `path`,
    /// carving regions per `memory`. The creator is the Hermes core; other
    /// processes attach with [`Segment::open`].
    pub fn create(path: impl AsRef<Path>, capacity: u64, memory: &MemoryConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if capacity <= HEADER_SIZE + NUM_REGIONS as u64 * REGION_ALIGN {
            return Err(Error::config(format!(
                "segment capacity {capacity} too small"
            )));
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(capacity)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let usable = capacity - HEADER_SIZE;
        let fractions = [
            memory.buffer_pool_percent,
            memory.metadata_percent,
            memory.transfer_window_percent,
            memory.transient_percent,
        ];

        let mut region_offsets = [0u64; NUM_REGIONS];
        let mut region_sizes = [0u64; NUM_REGIONS];
        let mut cursor = HEADER_SIZE;
        for (i, fraction) in fractions.iter().enumerate() {
            let size = if i == NUM_REGIONS - 1 {
                // Last region absorbs alignment rounding.
                capacity - cursor
            } else {
                align_up((usable as f64 * f64::from(*fraction)) as u64, REGION_ALIGN)
            };
            region_offsets[i] = cursor;
            region_sizes[i] = size;
            cursor += size;
        }
        if cursor > capacity {
            return Err(Error::config(
                "memory percentages overflow the segment capacity",
            ));
        }

        let header = SegmentHeader {
            magic: MAGIC,
            version: FORMAT_VERSION,
            capacity,
            region_offsets,
            region_sizes,
            buffer_pool_root: AtomicU64::new(0),
            metadata_root: AtomicU64::new(0),
        };
        unsafe {
            mmap.as_mut_ptr().cast::<SegmentHeader>().write(header);
        }

        let segment = Self { mmap, path };
        for (i, region) in [
            Region::BufferPool,
            Region::Metadata,
            Region::TransferWindow,
            Region::Transient,
        ]
        .into_iter()
        .enumerate()
        {
            unsafe {
                Arena::init_region(
                    segment.base(),
                    region_offsets[i],
                    region_sizes[i],
                    region.advice(),
                );
            }
        }

        info!(
            path = %segment.path.display(),
            capacity,
            "created shared-memory segment"
        );
        Ok(segment)
    }

    /// Attach to an existing segment.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let segment = Self { mmap, path };
        let header = segment.header();
        if header.magic != MAGIC {
            return Err(Error::storage("not a Hermes segment: bad magic"));
        }
        if header.version != FORMAT_VERSION {
            return Err(Error::storage(format!(
                "unsupported segment version {}",
                header.version
            )));
        }
        if header.capacity != segment.mmap.len() as u64 {
            return Err(Error::storage("segment size does not match its header"));
        }
        Ok(segment)
    }

    /// Base address of the mapping in this process.
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.mmap.as_ptr().cast_mut()
    }

    /// Total segment capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.header().capacity
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*self.base().cast::<SegmentHeader>() }
    }

    /// The arena of `region`.
    #[must_use]
    pub fn arena(&self, region: Region) -> Arena<'_> {
        let header = self.header();
        unsafe {
            Arena::attach(
                self.base(),
                header.region_offsets[region as usize],
                region.advice(),
            )
        }
    }

    /// Size of `region` in bytes.
    #[must_use]
    pub fn region_size(&self, region: Region) -> u64 {
        self.header().region_sizes[region as usize]
    }

    /// Record where the buffer-pool root struct was laid out.
    pub fn set_buffer_pool_root(&self, offset: u64) {
        self.header()
            .buffer_pool_root
            .store(offset, Ordering::Release);
    }

    /// Segment offset of the buffer-pool root struct; zero until pool init.
    #[must_use]
    pub fn buffer_pool_root(&self) -> u64 {
        self.header().buffer_pool_root.load(Ordering::Acquire)
    }

    /// Record where the metadata-manager root struct was laid out.
    pub fn set_metadata_root(&self, offset: u64) {
        self.header().metadata_root.store(offset, Ordering::Release);
    }

    /// Segment offset of the metadata-manager root struct; zero until
    /// metadata init.
    #[must_use]
    pub fn metadata_root(&self) -> u64 {
        self.header().metadata_root.load(Ordering::Acquire)
    }

    /// Typed pointer at a segment offset.
    ///
    /// # Safety
    ///
    /// `offset` must point at a properly initialized, properly aligned `T`
    /// inside the segment, and the caller must uphold the aliasing rules
    /// for the returned pointer.
    #[must_use]
    pub unsafe fn ptr_at<T>(&self, offset: u64) -> *mut T {
        debug_assert!(offset + std::mem::size_of::<T>() as u64 <= self.capacity());
        self.base().add(offset as usize).cast::<T>()
    }

    /// Shared reference to a `T` at a segment offset.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::ptr_at`]; additionally no exclusive
    /// reference to the same bytes may exist.
    #[must_use]
    pub unsafe fn ref_at<T>(&self, offset: u64) -> &T {
        &*self.ptr_at::<T>(offset)
    }

    /// Copy bytes out of the segment.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) {
        assert!(offset + out.len() as u64 <= self.capacity());
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    /// Copy bytes into the segment.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        assert!(offset + data.len() as u64 <= self.capacity());
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base().add(offset as usize),
                data.len(),
            );
        }
    }
}
