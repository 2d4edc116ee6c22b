// =============================================================================
// Pelican — Memory Subsystem
// =============================================================================
//
// Layered bottom to top:
//
//   address.rs — PhysAddr/VirtAddr newtypes (type safety for addresses)
//   pmm.rs      — Physical Memory Manager (bitmap allocator for frames)
//   vmm.rs      — Virtual Memory Manager (page table operations)
//   heap.rs      — Kernel heap allocator (Box, Vec, etc.)
//
// =============================================================================

pub mod address;
pub mod heap;
pub mod pmm;
pub mod vmm;

use address::PhysAddr;

/// Brings up the whole memory subsystem in the only order that works: the
/// HHDM offset before any physical-to-virtual translation, the PMM before
/// anything that allocates frames, the VMM root before anything that maps
/// pages, and the heap last since it needs both a frame source and a place
/// to map them.
///
/// # Safety
/// Must be called exactly once, very early in boot, with `hhdm_offset`
/// fresh from the bootstrap collaborator's parsed boot response.
#[cfg(not(test))]
pub unsafe fn init(hhdm_offset: u64, phys_base: PhysAddr, phys_size: u64) {
    unsafe { address::init_hhdm(hhdm_offset) };
    pmm::init(phys_base, phys_size);
    vmm::init();
    heap::init();
}
