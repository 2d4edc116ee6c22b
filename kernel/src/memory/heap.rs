// =============================================================================
// Pelican — Kernel Heap Allocator
// =============================================================================
//
// Dynamic memory allocation for the kernel, enabling use of Rust's `alloc`
// crate (Box, Vec, String, Arc, VecDeque, ...) — the process table,
// scheduler ready queue, and IPC registries are all ordinary `alloc`
// collections layered on top of this allocator.
//
// DESIGN: linked-list free-list allocator
// ========================================
//
// The heap is a contiguous region of virtual memory (HHDM-mapped physical
// pages allocated from the PMM). Within this region, a linked list of free
// blocks tracks available memory, kept sorted by address so adjacent free
// blocks can be coalesced on every free.
//
//   +----------+     +--------------+     +-----------+
//   | FreeBlock| --> |  FreeBlock   | --> | FreeBlock  | --> null
//   | size: 64 |     | size: 4096   |     | size: 128  |
//   +----------+     +--------------+     +-----------+
//
// ALLOCATION ALGORITHM (first-fit):
//   1. Walk the free list looking for a block large enough.
//   2. Compute padding so the returned pointer is aligned.
//   3. Split: if the block is larger than needed on either side of the
//      alignment gap, return the excess to the free list (only when the
//      remainder is at least MIN_BLOCK_SIZE — otherwise it would be too
//      small to ever hold a FreeBlock header).
//   4. Return the aligned pointer.
//
// DEALLOCATION ALGORITHM:
//   1. Insert the freed region back into the free list (sorted by address).
//   2. Coalesce with both the successor and predecessor if adjacent — the
//      list being address-ordered makes both checks a single pointer
//      comparison, and doing both is what actually keeps "no two adjacent
//      free blocks" true after every free, not just the forward half.
//
// HEAP SIZING:
//   Initial heap: 256 KiB (64 contiguous physical pages via PMM). Enough
//   for kernel data structures during early boot; growth can be added
//   later by mapping additional pages and widening the free list.
//
// THREAD SAFETY:
//   The allocator is wrapped in a SpinLock. `GlobalAlloc::alloc/dealloc`
//   acquire the lock before touching the free list.
//
// =============================================================================

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::kprintln;
use crate::memory::address::PAGE_SIZE;
use crate::memory::pmm;
use crate::sync::spinlock::SpinLock;

// =============================================================================
// Configuration
// =============================================================================

/// Number of physical pages allocated for the initial kernel heap.
/// 64 pages x 4 KiB = 256 KiB.
const INITIAL_HEAP_PAGES: usize = 64;

/// Minimum block size: must be at least `size_of::<FreeBlock>()` so every
/// free region can hold the linked-list node header.
const MIN_BLOCK_SIZE: usize = core::mem::size_of::<FreeBlock>();

/// Every allocation is rounded up to this boundary, matching the 16-byte
/// alignment callers are promised regardless of what they asked for.
const ALLOC_ALIGN: usize = 16;

/// Rounds a requested size up to the next `ALLOC_ALIGN`-byte multiple,
/// then floors it at `MIN_BLOCK_SIZE` so every carved block can still
/// hold a `FreeBlock` header once freed.
const fn rounded_request_size(size: usize) -> usize {
    let rounded = (size + (ALLOC_ALIGN - 1)) & !(ALLOC_ALIGN - 1);
    if rounded < MIN_BLOCK_SIZE { MIN_BLOCK_SIZE } else { rounded }
}

// =============================================================================
// Free block node
// =============================================================================

/// Header stored at the beginning of each free block in the heap.
#[repr(C)]
struct FreeBlock {
    /// Total size of this free block in bytes, including this header.
    size: usize,
    /// Pointer to the next free block, or null if this is the last one.
    next: *mut FreeBlock,
}

// =============================================================================
// Heap internals
// =============================================================================

/// Internal heap state: a sorted linked list of free blocks.
struct Heap {
    /// Head of the free list (sorted by address, lowest first).
    free_list: *mut FreeBlock,
    /// Start of the heap region (bounds checking).
    heap_start: usize,
    /// End of the heap region (exclusive).
    heap_end: usize,
    /// Total bytes currently allocated, for statistics.
    allocated_bytes: usize,
    /// Total heap size in bytes.
    total_bytes: usize,
}

// SAFETY: heap pointers are only touched while holding the SpinLock.
unsafe impl Send for Heap {}

impl Heap {
    /// An uninitialized heap; `init()` must run before use.
    const fn new() -> Self {
        Self {
            free_list: ptr::null_mut(),
            heap_start: 0,
            heap_end: 0,
            allocated_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Initializes the heap with a single free block spanning the region.
    fn init(&mut self, start: usize, size: usize) {
        assert!(size >= MIN_BLOCK_SIZE, "Heap region too small");
        assert!(
            start % core::mem::align_of::<FreeBlock>() == 0,
            "Heap start must be aligned to FreeBlock alignment"
        );

        self.heap_start = start;
        self.heap_end = start + size;
        self.total_bytes = size;
        self.allocated_bytes = 0;

        let block = start as *mut FreeBlock;
        unsafe {
            (*block).size = size;
            (*block).next = ptr::null_mut();
        }
        self.free_list = block;
    }

    /// First-fit allocation: walks the free list for the first block that
    /// can satisfy `layout` once alignment padding is accounted for.
    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let size = rounded_request_size(layout.size());
        let align = layout.align().max(ALLOC_ALIGN);

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut current = self.free_list;

        while !current.is_null() {
            let block_start = current as usize;
            let block_size = unsafe { (*current).size };
            let block_end = block_start + block_size;

            let alloc_start = align_up(block_start, align);
            let alloc_end = alloc_start + size;

            if alloc_end <= block_end {
                let next = unsafe { (*current).next };
                if prev.is_null() {
                    self.free_list = next;
                } else {
                    unsafe {
                        (*prev).next = next;
                    }
                }

                let front_gap = alloc_start - block_start;
                if front_gap >= MIN_BLOCK_SIZE {
                    self.insert_free_block(block_start, front_gap);
                }

                let back_gap = block_end - alloc_end;
                if back_gap >= MIN_BLOCK_SIZE {
                    self.insert_free_block(alloc_end, back_gap);
                }

                self.allocated_bytes += size;
                return alloc_start as *mut u8;
            }

            prev = current;
            current = unsafe { (*current).next };
        }

        ptr::null_mut()
    }

    /// Returns previously allocated memory to the free list, coalescing
    /// with whichever neighbors turn out to be adjacent.
    fn dealloc(&mut self, ptr: *mut u8, layout: Layout) {
        let addr = ptr as usize;
        let size = rounded_request_size(layout.size());

        debug_assert!(
            addr >= self.heap_start && addr + size <= self.heap_end,
            "Heap: dealloc address outside heap bounds"
        );

        self.allocated_bytes -= size;
        self.insert_free_block(addr, size);
    }

    /// Inserts a free region into the free list in address order, then
    /// coalesces with the successor and predecessor if either is adjacent.
    fn insert_free_block(&mut self, addr: usize, size: usize) {
        debug_assert!(size >= MIN_BLOCK_SIZE);

        let new_block = addr as *mut FreeBlock;

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut current = self.free_list;

        while !current.is_null() && (current as usize) < addr {
            prev = current;
            current = unsafe { (*current).next };
        }

        unsafe {
            (*new_block).size = size;
            (*new_block).next = current;
        }

        if prev.is_null() {
            self.free_list = new_block;
        } else {
            unsafe {
                (*prev).next = new_block;
            }
        }

        // Coalesce with successor: if the new block ends exactly where the
        // next one starts, absorb it.
        if !current.is_null() {
            let new_end = addr + unsafe { (*new_block).size };
            if new_end == current as usize {
                unsafe {
                    (*new_block).size += (*current).size;
                    (*new_block).next = (*current).next;
                }
            }
        }

        // Coalesce with predecessor: if it ends exactly where the new block
        // starts, absorb the new block into it. Both checks must run on
        // every free — a list that is merely address-ordered does not by
        // itself rule out an adjacent predecessor.
        if !prev.is_null() {
            let prev_end = prev as usize + unsafe { (*prev).size };
            if prev_end == addr {
                unsafe {
                    (*prev).size += (*new_block).size;
                    (*prev).next = (*new_block).next;
                }
            }
        }
    }
}

// =============================================================================
// Global allocator
// =============================================================================

/// The kernel's global heap allocator: a `Heap` behind a `SpinLock`, to
/// satisfy `GlobalAlloc`'s `Sync` requirement.
pub struct KernelAllocator {
    inner: SpinLock<Heap>,
}

impl KernelAllocator {
    /// An uninitialized allocator; `init()` must run before any allocation.
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(Heap::new()),
        }
    }
}

// SAFETY: the SpinLock ensures exclusive access to the Heap internals.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.lock().dealloc(ptr, layout)
    }
}

/// The global kernel heap allocator instance. Rust's `alloc` crate (Box,
/// Vec, String, ...) uses this for all dynamic allocation in the kernel.
#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator::new();

// =============================================================================
// Initialization
// =============================================================================

/// Initializes the kernel heap by allocating contiguous physical pages from
/// the PMM and creating a free-list allocator over them.
///
/// # Prerequisites
/// PMM must be initialized (`pmm::init()`), and the HHDM offset must be set
/// (`address::init_hhdm()`).
///
/// # Panics
/// If the PMM cannot supply enough contiguous frames.
#[cfg(not(test))]
pub fn init() {
    let heap_size = INITIAL_HEAP_PAGES * PAGE_SIZE as usize;

    let heap_phys = pmm::alloc_contiguous(INITIAL_HEAP_PAGES)
        .expect("Heap: failed to allocate contiguous physical pages for kernel heap");

    let heap_virt = heap_phys.to_virt().as_u64() as usize;

    kprintln!(
        "[heap] allocated {} KiB at phys {} / virt {:#018X}",
        heap_size / 1024,
        heap_phys,
        heap_virt,
    );

    ALLOCATOR.inner.lock().init(heap_virt, heap_size);

    kprintln!("[heap] kernel heap ready ({} KiB)", heap_size / 1024);
}

/// Returns the number of bytes currently allocated from the kernel heap.
#[cfg(not(test))]
pub fn allocated_bytes() -> usize {
    ALLOCATOR.inner.lock().allocated_bytes
}

/// Returns the total size of the kernel heap in bytes.
#[cfg(not(test))]
pub fn total_bytes() -> usize {
    ALLOCATOR.inner.lock().total_bytes
}

// =============================================================================
// Alignment helper
// =============================================================================

/// Aligns `value` up to the nearest multiple of `align` (a power of two).
#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// =============================================================================
// OOM handler
// =============================================================================

/// Called by the `alloc` crate when an allocation fails. In a kernel, OOM
/// is fatal — there is no swap, no process to ask to free memory.
#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!(
        "kernel heap allocation failed: size={}, align={}",
        layout.size(),
        layout.align()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn fresh_heap(size: usize) -> (Heap, Vec<u8>) {
        let mut backing = alloc_std_backing(size);
        let start = backing.as_mut_ptr() as usize;
        let mut heap = Heap::new();
        heap.init(start, size);
        (heap, backing)
    }

    // A std-heap-backed byte buffer used only as backing storage for the
    // `Heap` under test — the allocator under test never touches the real
    // `#[global_allocator]`.
    fn alloc_std_backing(size: usize) -> Vec<u8> {
        alloc::vec![0u8; size]
    }

    #[test]
    fn single_block_spans_whole_region_after_full_round_trip() {
        let (mut heap, _backing) = fresh_heap(4096);
        let layout = Layout::from_size_align(64, 16).unwrap();
        let a = heap.alloc(layout);
        let b = heap.alloc(layout);
        assert!(!a.is_null() && !b.is_null());
        heap.dealloc(b, layout);
        heap.dealloc(a, layout);

        // After freeing everything, the free list must have collapsed back
        // to a single block spanning the whole heap.
        assert!(!heap.free_list.is_null());
        unsafe {
            assert_eq!((*heap.free_list).size, 4096);
            assert!((*heap.free_list).next.is_null());
        }
    }

    #[test]
    fn allocations_never_overlap() {
        let (mut heap, _backing) = fresh_heap(4096);
        let layout = Layout::from_size_align(100, 8).unwrap();
        let mut ptrs = alloc::vec::Vec::new();
        for _ in 0..8 {
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            ptrs.push(p as usize);
        }
        ptrs.sort_unstable();
        for w in ptrs.windows(2) {
            assert!(w[1] >= w[0] + 100);
        }
    }

    #[test]
    fn out_of_space_returns_null() {
        let (mut heap, _backing) = fresh_heap(64);
        let big = Layout::from_size_align(4096, 16).unwrap();
        assert!(heap.alloc(big).is_null());
    }
}
