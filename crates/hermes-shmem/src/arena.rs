//! Offset-based bump allocation inside a segment region.

use hermes_common::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimum alignment of every arena allocation.
pub const MIN_ALIGN: u64 = 8;

/// Lives at the start of each region. The bump offset is an atomic so that
/// any attached process can allocate; freeing individual allocations is not
/// supported.
#[repr(C)]
pub struct ArenaHeader {
    capacity: u64,
    used: AtomicU64,
}

/// Accessor for one region's arena. Allocations return offsets relative to
/// the *segment* base, which is the only currency that may be stored back
/// into shared memory.
pub struct Arena<'a> {
    segment_base: *mut u8,
    region_offset: u64,
    header: &'a ArenaHeader,
    /// Configuration knob named in the exhaustion message.
    advice: &'static str,
}

// The raw base pointer refers to a mapping that outlives the borrow; all
// mutation of the header goes through atomics.
unsafe impl Send for Arena<'_> {}
unsafe impl Sync for Arena<'_> {}

const HEADER_SIZE: u64 = std::mem::size_of::<ArenaHeader>() as u64;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

impl<'a> Arena<'a> {
    /// Write a fresh header for the region and return its arena.
    ///
    /// # Safety
    ///
    /// `segment_base + region_offset` must point at `region_size` writable
    /// bytes that no other process is concurrently initializing.
    pub(crate) unsafe fn init_region(
        segment_base: *mut u8,
        region_offset: u64,
        region_size: u64,
        advice: &'static str,
    ) -> Self {
        let header_ptr = segment_base
            .add(region_offset as usize)
            .cast::<ArenaHeader>();
        header_ptr.write(ArenaHeader {
            capacity: region_size - HEADER_SIZE,
            used: AtomicU64::new(0),
        });
        Self::attach(segment_base, region_offset, advice)
    }

    /// Attach to an already-initialized region.
    ///
    /// # Safety
    ///
    /// The region at `segment_base + region_offset` must have been
    /// initialized by [`Self::init_region`] in some process.
    pub(crate) unsafe fn attach(
        segment_base: *mut u8,
        region_offset: u64,
        advice: &'static str,
    ) -> Self {
        let header = &*segment_base
            .add(region_offset as usize)
            .cast::<ArenaHeader>();
        Self {
            segment_base,
            region_offset,
            header,
            advice,
        }
    }

    /// Allocate `size` bytes aligned to `align`, returning the segment
    /// offset. The arena cannot recover from exhaustion.
    pub fn alloc(&self, size: u64, align: u64) -> Result<u64> {
        let align = align.max(MIN_ALIGN);
        loop {
            let used = self.header.used.load(Ordering::Acquire);
            let start = align_up(used, align);
            let end = start.checked_add(size).ok_or_else(|| self.exhausted())?;
            if end > self.header.capacity {
                return Err(self.exhausted());
            }
            if self
                .header
                .used
                .compare_exchange_weak(used, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(self.region_offset + HEADER_SIZE + start);
            }
        }
    }

    /// Allocate space for `count` values of `T`, zero-initialized.
    pub fn alloc_array<T>(&self, count: usize) -> Result<u64> {
        let size = (std::mem::size_of::<T>() * count) as u64;
        let align = std::mem::align_of::<T>() as u64;
        let offset = self.alloc(size, align)?;
        // Fresh segment pages are already zero, but a scoped reuse of the
        // transient region may hand back dirty bytes.
        unsafe {
            std::ptr::write_bytes(self.segment_base.add(offset as usize), 0, size as usize);
        }
        Ok(offset)
    }

    /// Bytes allocated so far.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.header.used.load(Ordering::Acquire)
    }

    /// Usable capacity of the region, excluding the header.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    /// Open a scratch window: every allocation made until the returned
    /// guard drops is reclaimed at once. Scopes must not be interleaved by
    /// concurrent callers; the transient region is per-call scratch.
    #[must_use]
    pub fn begin_scope(&self) -> ScopedTemp<'_> {
        ScopedTemp {
            header: self.header,
            saved: self.header.used.load(Ordering::Acquire),
        }
    }

    fn exhausted(&self) -> Error {
        Error::ArenaExhausted {
            region: self.region_name(),
            advice: self.advice,
        }
    }

    fn region_name(&self) -> &'static str {
        match self.advice {
            "metadata_memory_percent" => "metadata",
            "transient_memory_percent" => "transient",
            "transfer_window_memory_percent" => "transfer window",
            _ => "buffer pool",
        }
    }
}

impl std::fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("region_offset", &self.region_offset)
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Restores the bump offset on drop, releasing everything allocated inside
/// the scope.
pub struct ScopedTemp<'a> {
    header: &'a ArenaHeader,
    saved: u64,
}

impl Drop for ScopedTemp<'_> {
    fn drop(&mut self) {
        self.header.used.store(self.saved, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(buf: &mut [u8]) -> Arena<'_> {
        unsafe {
            Arena::init_region(
                buf.as_mut_ptr(),
                0,
                buf.len() as u64,
                "metadata_memory_percent",
            )
        }
    }

    #[test]
    fn test_bump_monotonic() {
        let mut buf = vec![0u8; 4096];
        let arena = region(&mut buf);

        let a = arena.alloc(100, 8).unwrap();
        let b = arena.alloc(100, 8).unwrap();
        assert!(b >= a + 100);
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
    }

    #[test]
    fn test_alignment_honored() {
        let mut buf = vec![0u8; 4096];
        let arena = region(&mut buf);

        arena.alloc(3, 8).unwrap();
        let aligned = arena.alloc(64, 64).unwrap();
        assert_eq!(aligned % 64, 0);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut buf = vec![0u8; 256];
        let arena = region(&mut buf);

        assert!(arena.alloc(128, 8).is_ok());
        let err = arena.alloc(4096, 8).unwrap_err();
        assert!(err.to_string().contains("metadata_memory_percent"));
    }

    #[test]
    fn test_scope_restores_offset() {
        let mut buf = vec![0u8; 4096];
        let arena = region(&mut buf);

        let before = arena.used();
        {
            let _scope = arena.begin_scope();
            arena.alloc(512, 8).unwrap();
            assert!(arena.used() > before);
        }
        assert_eq!(arena.used(), before);
    }

    #[test]
    fn test_concurrent_allocations_disjoint() {
        let mut buf = vec![0u8; 1 << 20];
        let arena = region(&mut buf);

        let offsets = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut local = Vec::new();
                    for _ in 0..100 {
                        local.push(arena.alloc(64, 8).unwrap());
                    }
                    offsets.lock().unwrap().extend(local);
                });
            }
        });

        let mut offsets = offsets.into_inner().unwrap();
        offsets.sort_unstable();
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= 64, "allocations overlap");
        }
    }
}
