// =============================================================================
// Pelican — Physical Memory Manager (Bitmap Frame Allocator)
// =============================================================================
//
// The PMM tracks which physical page frames (4 KiB each) are free or in use.
// It uses a bitmap: one bit per frame.
//
// BITMAP LAYOUT:
//   bit = 1 → frame is USED (allocated, or reserved for the bitmap itself)
//   bit = 0 → frame is FREE (available for allocation)
//
//   Bit 0 of byte 0 corresponds to the first frame in the managed region.
//   Bit 7 of byte 0 corresponds to the eighth frame, and so on.
//
// INITIALIZATION:
//   The caller (the boot collaborator, having parsed the Limine memory map
//   or similar) hands us a single contiguous physical range to manage via
//   `init(base, size)`. We do not parse memory maps ourselves — that keeps
//   this module testable on the host with a plain byte buffer standing in
//   for physical RAM.
//
//   The bitmap itself is carved out of the front of the managed range and
//   marked used, so it never hands its own storage out as a frame.
//
// ALLOCATION STRATEGY:
//   Single frame: linear scan using u64-at-a-time reads for a 64x speedup.
//   Contiguous N: linear scan for N consecutive zero bits.
//   The `search_start` cursor avoids re-scanning already-allocated regions.
//
// THREAD SAFETY:
//   The global PMM state is protected by a SpinLock. All public functions
//   acquire the lock before accessing the bitmap.
//
// =============================================================================

use core::fmt;
use core::ptr;

use crate::kprintln;
use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::sync::spinlock::SpinLock;

// =============================================================================
// Public types
// =============================================================================

/// Snapshot of physical memory usage statistics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    /// Total number of physical frames tracked by the bitmap.
    pub total_frames: usize,

    /// Number of frames currently marked as used.
    pub used_frames: usize,

    /// Number of frames currently marked as free.
    pub free_frames: usize,

    /// Size of the bitmap itself, in bytes.
    pub bitmap_bytes: usize,
}

/// Failure modes for PMM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No frame satisfies the request; the bitmap has no clear bits left
    /// (or no run of `count` consecutive clear bits, for contiguous alloc).
    OutOfMemory,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmmError::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

// =============================================================================
// Global PMM state
// =============================================================================

/// The global physical memory manager, protected by a ticket spinlock.
///
/// `None` before `init()` is called. All public functions panic if the
/// PMM is not yet initialized — that is a programmer error (boot ordering),
/// not a runtime condition a caller can recover from.
static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

// =============================================================================
// Bitmap Allocator internals
// =============================================================================

/// The bitmap-based physical frame allocator.
///
/// Holds a pointer to the bitmap (accessed through HHDM), its size, and
/// usage counters. Not exposed publicly — all access goes through the
/// module-level functions, which hold the spinlock.
struct BitmapAllocator {
    /// Virtual address of the bitmap, accessed through HHDM.
    bitmap: *mut u8,

    /// Size of the bitmap in bytes.
    bitmap_bytes: usize,

    /// Physical base of the managed region. Frame indices are relative to
    /// this address.
    base: PhysAddr,

    /// Total number of physical frames tracked (`size / PAGE_SIZE`).
    total_frames: usize,

    /// Number of frames currently marked as used.
    used_frames: usize,

    /// Optimization: start the next allocation scan from this frame index.
    /// Updated after each alloc/free to avoid rescanning known-used regions.
    search_start: usize,
}

// SAFETY: The bitmap pointer is only dereferenced while holding the PMM spinlock.
// No other code accesses the bitmap concurrently.
unsafe impl Send for BitmapAllocator {}

impl BitmapAllocator {
    /// Builds a bitmap allocator over `[base, base + size)`.
    ///
    /// The bitmap is placed at the very front of the range and its own
    /// frames, plus frame 0 of the managed range (a conventional null-safety
    /// reservation), are marked used before returning.
    fn new(base: PhysAddr, size: u64) -> Self {
        let total_frames = (size / PAGE_SIZE) as usize;
        let bitmap_bytes = (total_frames + 7) / 8;
        let bitmap_frame_count = (bitmap_bytes + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;

        kprintln!(
            "[pmm] managing {} frames ({} MiB) from {}, bitmap = {} bytes ({} pages)",
            total_frames,
            size / 1024 / 1024,
            base,
            bitmap_bytes,
            bitmap_frame_count,
        );

        let bitmap = base.to_virt().as_mut_ptr::<u8>();

        // SAFETY: `bitmap` points to `bitmap_bytes` bytes of memory within
        // the caller-supplied range, mapped through HHDM, with no other
        // writer yet active (single-core boot, lock not released).
        unsafe {
            ptr::write_bytes(bitmap, 0x00, bitmap_bytes);
        }

        let mut used_frames = 0usize;
        for frame in 0..bitmap_frame_count {
            used_frames += set_bit(bitmap, frame);
        }
        // Frame 0 of the managed range is conventionally reserved so an
        // allocation never returns an address that looks like a null
        // physical address.
        used_frames += set_bit(bitmap, 0);

        kprintln!(
            "[pmm] free: {} frames, used: {} frames",
            total_frames - used_frames,
            used_frames,
        );

        Self {
            bitmap,
            bitmap_bytes,
            base,
            total_frames,
            used_frames,
            search_start: 0,
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocates a single physical frame.
    ///
    /// Scans the bitmap using u64-at-a-time reads: if all 64 bits in a
    /// word are 1, the entire chunk is used and we skip ahead by 64 frames.
    fn alloc_frame(&mut self) -> Result<PhysAddr, PmmError> {
        let total_chunks = (self.total_frames + 63) / 64;
        if total_chunks == 0 {
            return Err(PmmError::OutOfMemory);
        }
        let start_chunk = self.search_start / 64;
        let bitmap_u64 = self.bitmap as *const u64;

        for i in 0..total_chunks {
            let chunk_idx = (start_chunk + i) % total_chunks;
            // SAFETY: the bitmap is page-aligned and rounded up to whole
            // pages, so an 8-byte read starting at any chunk boundary stays
            // within the allocated bitmap storage.
            let chunk = unsafe { *bitmap_u64.add(chunk_idx) };

            if chunk == u64::MAX {
                continue;
            }

            let bit_in_chunk = (!chunk).trailing_zeros() as usize;
            let frame_idx = chunk_idx * 64 + bit_in_chunk;

            if frame_idx >= self.total_frames {
                continue;
            }

            // SAFETY: frame_idx < total_frames, so byte_idx < bitmap_bytes.
            unsafe {
                let byte = &mut *self.bitmap.add(frame_idx / 8);
                *byte |= 1 << (frame_idx % 8);
            }

            self.used_frames += 1;
            self.search_start = frame_idx + 1;

            return Ok(self.base + frame_idx as u64 * PAGE_SIZE);
        }

        Err(PmmError::OutOfMemory)
    }

    /// Frees a previously allocated physical frame.
    ///
    /// A frame outside the managed range, or a frame not currently marked
    /// allocated, is a silent no-op — this allocator never panics on a
    /// bad free, by design.
    fn free_frame(&mut self, addr: PhysAddr) {
        if addr.as_u64() < self.base.as_u64() {
            return;
        }
        let offset = addr.as_u64() - self.base.as_u64();
        if offset % PAGE_SIZE != 0 {
            return;
        }
        let frame_idx = (offset / PAGE_SIZE) as usize;
        if frame_idx >= self.total_frames {
            return;
        }

        let byte_idx = frame_idx / 8;
        let bit_mask = 1u8 << (frame_idx % 8);

        // SAFETY: frame_idx < total_frames, so byte_idx < bitmap_bytes.
        unsafe {
            let byte = &mut *self.bitmap.add(byte_idx);
            if *byte & bit_mask == 0 {
                // Already free — idempotent no-op.
                return;
            }
            *byte &= !bit_mask;
        }

        self.used_frames -= 1;

        if frame_idx < self.search_start {
            self.search_start = frame_idx;
        }
    }

    /// Allocates `count` physically contiguous frames.
    ///
    /// Linear scan for `count` consecutive zero bits. Not the fastest
    /// approach, but contiguous allocation is rare (heap init, DMA buffers).
    fn alloc_contiguous(&mut self, count: usize) -> Result<PhysAddr, PmmError> {
        if count == 0 {
            return Err(PmmError::OutOfMemory);
        }
        if count == 1 {
            return self.alloc_frame();
        }

        let mut run_start: usize = 0;
        let mut run_length: usize = 0;

        for frame in 0..self.total_frames {
            if is_frame_free(self.bitmap, frame) {
                if run_length == 0 {
                    run_start = frame;
                }
                run_length += 1;

                if run_length >= count {
                    for f in run_start..run_start + count {
                        // SAFETY: f < total_frames throughout this loop.
                        unsafe {
                            let byte = &mut *self.bitmap.add(f / 8);
                            *byte |= 1 << (f % 8);
                        }
                    }
                    self.used_frames += count;
                    return Ok(self.base + run_start as u64 * PAGE_SIZE);
                }
            } else {
                run_length = 0;
            }
        }

        Err(PmmError::OutOfMemory)
    }

    /// Returns a snapshot of current physical memory statistics.
    fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: self.total_frames - self.used_frames,
            bitmap_bytes: self.bitmap_bytes,
        }
    }

    /// Allocates a single frame and zeros its contents.
    ///
    /// Used for page table allocation — page tables must be zeroed (every
    /// entry non-present) before use.
    fn alloc_frame_zeroed(&mut self) -> Result<PhysAddr, PmmError> {
        let frame = self.alloc_frame()?;
        // SAFETY: the frame is valid physical memory accessible via HHDM,
        // and nothing else references it yet.
        unsafe {
            ptr::write_bytes(frame.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        Ok(frame)
    }
}

// =============================================================================
// Bitmap manipulation helpers
// =============================================================================

/// Sets bit `frame` in the bitmap (marks frame as used).
///
/// Returns 1 if the bit was previously clear, 0 if it was already set,
/// so callers can correctly adjust `used_frames`.
#[inline]
fn set_bit(bitmap: *mut u8, frame: usize) -> usize {
    let byte_idx = frame / 8;
    let bit_mask = 1u8 << (frame % 8);
    unsafe {
        let byte = &mut *bitmap.add(byte_idx);
        if *byte & bit_mask == 0 {
            *byte |= bit_mask;
            1
        } else {
            0
        }
    }
}

/// Returns `true` if the given frame is free (bit is 0).
#[inline]
fn is_frame_free(bitmap: *const u8, frame: usize) -> bool {
    let byte_idx = frame / 8;
    let bit_mask = 1u8 << (frame % 8);
    unsafe { *bitmap.add(byte_idx) & bit_mask == 0 }
}

// =============================================================================
// Public API — module-level functions that acquire the spinlock
// =============================================================================

/// Initializes the physical memory manager over `[base, base + size)`.
///
/// Must be called exactly once during early boot, after the HHDM offset is
/// known and before any other memory subsystem touches physical frames.
///
/// # Panics
/// If called more than once.
pub fn init(base: PhysAddr, size: u64) {
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM: init called more than once");
    *pmm = Some(BitmapAllocator::new(base, size));
}

/// Allocates a single 4 KiB physical frame.
///
/// The returned address is page-aligned. The frame contents are
/// **uninitialized** — use `alloc_frame_zeroed()` if you need zeroed memory.
///
/// # Panics
/// If the PMM is not initialized.
pub fn alloc_frame() -> Result<PhysAddr, PmmError> {
    PMM.lock()
        .as_mut()
        .expect("PMM: not initialized — call pmm::init() first")
        .alloc_frame()
}

/// Allocates a single 4 KiB physical frame, zeroed.
///
/// # Panics
/// If the PMM is not initialized.
pub fn alloc_frame_zeroed() -> Result<PhysAddr, PmmError> {
    PMM.lock()
        .as_mut()
        .expect("PMM: not initialized — call pmm::init() first")
        .alloc_frame_zeroed()
}

/// Frees a previously allocated physical frame.
///
/// Freeing a frame outside the managed range, or one not currently
/// allocated, is a silent no-op.
///
/// # Panics
/// If the PMM is not initialized.
pub fn free_frame(addr: PhysAddr) {
    PMM.lock()
        .as_mut()
        .expect("PMM: not initialized — call pmm::init() first")
        .free_frame(addr);
}

/// Allocates `count` physically contiguous frames.
///
/// # Panics
/// If the PMM is not initialized.
pub fn alloc_contiguous(count: usize) -> Result<PhysAddr, PmmError> {
    PMM.lock()
        .as_mut()
        .expect("PMM: not initialized — call pmm::init() first")
        .alloc_contiguous(count)
}

/// Returns a snapshot of current physical memory statistics.
///
/// # Panics
/// If the PMM is not initialized.
pub fn stats() -> MemoryStats {
    PMM.lock()
        .as_ref()
        .expect("PMM: not initialized — call pmm::init() first")
        .stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// Host-backed stand-in for physical memory: a heap buffer whose start
    /// we pretend is physical address zero plus an offset, with HHDM set
    /// to identity (offset 0) so `PhysAddr::to_virt()` round-trips onto it.
    fn with_fresh_pmm(total_frames: usize, f: impl FnOnce()) {
        let size = total_frames as u64 * PAGE_SIZE;
        let mut backing = vec![0u8; size as usize];
        let base = backing.as_mut_ptr() as u64;
        unsafe { crate::memory::address::init_hhdm(0) };
        // Re-initialize PMM fresh for this test by directly constructing
        // a BitmapAllocator and swapping it into the global slot.
        let mut guard = PMM.lock();
        *guard = Some(BitmapAllocator::new(PhysAddr::new(base), size));
        drop(guard);
        f();
    }

    #[test]
    fn conservation_across_alloc_free() {
        with_fresh_pmm(256, || {
            let before = stats().free_frames;
            let mut taken = vec![];
            for _ in 0..10 {
                taken.push(alloc_frame().unwrap());
            }
            assert_eq!(stats().free_frames, before - 10);
            for f in taken {
                free_frame(f);
            }
            assert_eq!(stats().free_frames, before);
        });
    }

    #[test]
    fn free_is_idempotent_and_tolerates_out_of_range() {
        with_fresh_pmm(64, || {
            let f = alloc_frame().unwrap();
            free_frame(f);
            let before = stats().free_frames;
            free_frame(f); // double free: silent no-op
            assert_eq!(stats().free_frames, before);

            let bogus = PhysAddr::new(f.as_u64() + 1_000_000_000);
            free_frame(bogus); // out of range: silent no-op
            assert_eq!(stats().free_frames, before);
        });
    }

    #[test]
    fn out_of_memory_reports_cleanly() {
        with_fresh_pmm(8, || {
            let mut count = 0;
            while alloc_frame().is_ok() {
                count += 1;
                if count > 1000 {
                    panic!("allocator never reported OutOfMemory");
                }
            }
            assert_eq!(alloc_frame(), Err(PmmError::OutOfMemory));
        });
    }

    #[test]
    fn contiguous_allocation_is_actually_contiguous() {
        with_fresh_pmm(64, || {
            let base = alloc_contiguous(4).unwrap();
            for i in 0..4u64 {
                free_frame(base + i * PAGE_SIZE);
            }
        });
    }
}
