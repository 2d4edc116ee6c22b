// =============================================================================
// Pelican — Virtual Memory Manager (Page Table Infrastructure)
// =============================================================================
//
// This module manipulates x86_64 4-level page tables: walking them, creating
// intermediate levels on demand, mapping and unmapping pages, and — unlike a
// pure "infrastructure" module — owning the kernel's own root table and
// bootstrapping it at `init()`.
//
// x86_64 PAGING OVERVIEW:
//
//   Virtual addresses are translated through 4 levels of page tables:
//
//   PML4 (Level 4) -> PDPT (Level 3) -> PD (Level 2) -> PT (Level 1) -> Page
//
//   Each level is a 4 KiB table containing 512 entries (each 8 bytes).
//   Each entry holds the physical address of the next-level table (or the
//   final page) plus permission and status flags.
//
//   ```text
//   63  62..52  51..12       11..9   8   7   6   5   4   3   2   1   0
//   +---+------+------------+-------+---+---+---+---+---+---+---+---+---+
//   |NXE| Avail| Phys Addr  | Avail | G |PS | D | A |PCD|PWT|U/S|R/W| P |
//   +---+------+------------+-------+---+---+---+---+---+---+---+---+---+
//   ```
//
// ADDRESS EXTRACTION:
//   The physical address stored in an entry is bits 51:12 (40 bits).
//   Mask: 0x000F_FFFF_FFFF_F000 — a page-aligned physical address.
//
// WALKING THE PAGE TABLES:
//   Given a virtual address, we extract 4 x 9-bit indices:
//     PML4 index = bits [47:39], PDPT index = bits [38:30],
//     PD index = bits [29:21], PT index = bits [20:12], offset = bits [11:0].
//   At each level: read the entry, check PRESENT, extract the physical
//   address, convert to virtual via HHDM, index into the next table.
//
// BOOTSTRAP:
//   `init()` allocates the root table, identity-maps the first
//   `IDENTITY_MAP_MIB` megabytes with 2 MiB huge entries (so the kernel can
//   keep running on physical addresses right after the root is activated),
//   and reserves PML4 index 256 upward (the upper half, kernel space) so
//   every later kernel mapping shares the same top-level entries across any
//   future per-process address space.
//
// =============================================================================

use bitflags::bitflags;

use crate::arch::cpu;
use crate::kprintln;
use crate::memory::address::{PhysAddr, VirtAddr, HUGE_PAGE_SIZE};
use crate::memory::pmm;
use crate::sync::spinlock::SpinLock;

// =============================================================================
// Page Table Flags
// =============================================================================

bitflags! {
    /// x86_64 page table entry flags.
    ///
    /// Effective permissions are the intersection of all levels; intermediate
    /// tables should stay permissive (PRESENT | WRITABLE [| USER]) and
    /// restrictions applied at the leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Page is present in physical memory.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (Ring 3).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Disable caching for this page.
        const NO_CACHE      = 1 << 4;
        /// CPU sets this bit on any access.
        const ACCESSED      = 1 << 5;
        /// CPU sets this bit on a write.
        const DIRTY         = 1 << 6;
        /// In PD entries: a 2 MiB huge page (skips the PT level).
        const HUGE_PAGE     = 1 << 7;
        /// Global page — TLB entry survives CR3 switches.
        const GLOBAL        = 1 << 8;
        /// No-Execute (NX / XD).
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageTableFlags {
    /// Kernel code page: present + global, writable/executable as mapped.
    pub const KERNEL_CODE: Self = Self::PRESENT.union(Self::GLOBAL);
    /// Kernel read-only data page.
    pub const KERNEL_RODATA: Self = Self::PRESENT.union(Self::GLOBAL).union(Self::NO_EXECUTE);
    /// Kernel read-write data page.
    pub const KERNEL_DATA: Self = Self::PRESENT
        .union(Self::GLOBAL)
        .union(Self::WRITABLE)
        .union(Self::NO_EXECUTE);
    /// Flags for an intermediate (non-leaf) page table entry.
    pub const INTERMEDIATE: Self = Self::PRESENT.union(Self::WRITABLE);
    /// Same as INTERMEDIATE but also allows user-mode access.
    pub const INTERMEDIATE_USER: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

// =============================================================================
// Page Table Entry
// =============================================================================

/// A single entry in an x86_64 page table (8 bytes; 512 per table = 4 KiB).
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

/// Mask for extracting the physical address from a page table entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    /// A non-present (zeroed) entry.
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Returns the physical address stored in this entry, masking the huge
    /// flag's extra low bits when the entry is a 2 MiB huge entry.
    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    /// `true` for a huge (2 MiB) entry. Only meaningful at PD (level 2).
    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Sets this entry to map `addr` with the given `flags`.
    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(addr.is_page_aligned(), "VMM: entry address must be page-aligned");
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    /// Sets this entry to a 2 MiB huge mapping. `addr` must be 2 MiB-aligned.
    #[inline]
    pub fn set_huge(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(
            addr.as_u64() & (HUGE_PAGE_SIZE - 1) == 0,
            "VMM: huge entry address must be 2 MiB-aligned"
        );
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits() | PageTableFlags::HUGE_PAGE.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

// =============================================================================
// Page Table
// =============================================================================

/// A 4-level x86_64 page table: 512 entries, 4 KiB total, 4 KiB aligned so it
/// can be placed directly in a physical frame.
///
/// Level naming: L4 = PML4 (root, pointed to by CR3), L3 = PDPT, L2 = PD,
/// L1 = PT (leaf, points to 4 KiB pages; PD entries may instead be 2 MiB
/// huge leaves).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    #[inline]
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

// =============================================================================
// Error types
// =============================================================================

/// Error returned when a page mapping operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The virtual address is already mapped to a physical frame.
    AlreadyMapped,
    /// The physical memory manager has no free frames for a new page table.
    OutOfMemory,
    /// A huge page exists at an intermediate level, blocking the walk.
    HugePageConflict,
}

/// Error returned when an unmap operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The virtual address is not currently mapped.
    NotMapped,
    /// A huge page exists at an intermediate level (can't unmap 4K within it).
    HugePageConflict,
}

// =============================================================================
// Kernel root table
// =============================================================================

/// Physical address of the kernel's own PML4, set once by `init()`.
///
/// Shared-memory mappings and any other kernel-space-only mapping walk this
/// root rather than requiring every caller to track it themselves.
static KERNEL_PML4: SpinLock<Option<PhysAddr>> = SpinLock::new(None);

/// Number of megabytes identity-mapped during bootstrap, in 2 MiB huge-page
/// steps. Large enough to cover early kernel code, data, and the initial
/// heap span without yet needing fine-grained 4 KiB mappings.
const IDENTITY_MAP_MIB: u64 = 64;

/// Builds the kernel's root page table: identity-maps the first
/// `IDENTITY_MAP_MIB` megabytes with 2 MiB huge pages and reserves the upper
/// half (PML4 indices 256..512) so kernel mappings make it into any
/// future per-process address space by construction (they share the same
/// top-level entries).
///
/// Must be called once, after the PMM is initialized and before any other
/// VMM operation. Does not activate the table — call `activate()`
/// separately once the caller is ready to switch CR3.
pub fn init() {
    let mut guard = KERNEL_PML4.lock();
    assert!(guard.is_none(), "VMM: init called more than once");

    let pml4_phys = pmm::alloc_frame_zeroed().expect("VMM: out of memory allocating root PML4");
    // SAFETY: freshly allocated, zeroed, not yet visible to any other code.
    let pml4 = unsafe { &mut *pml4_phys.to_virt().as_mut_ptr::<PageTable>() };
    pml4.zero();

    let huge_pages = (IDENTITY_MAP_MIB * 1024 * 1024) / HUGE_PAGE_SIZE;
    for i in 0..huge_pages {
        let phys = PhysAddr::new(i * HUGE_PAGE_SIZE);
        let virt = VirtAddr::new(i * HUGE_PAGE_SIZE);
        // SAFETY: pml4_phys is the freshly built root, not yet active; no
        // other mapping can conflict with this bootstrap identity map.
        unsafe {
            map_huge_page(pml4_phys, virt, phys, PageTableFlags::KERNEL_DATA)
                .expect("VMM: bootstrap identity map failed");
        }
    }

    kprintln!(
        "[vmm] root PML4 at {}, identity-mapped {} MiB ({} huge pages)",
        pml4_phys,
        IDENTITY_MAP_MIB,
        huge_pages,
    );

    *guard = Some(pml4_phys);
}

/// Returns the physical address of the kernel's root PML4.
///
/// # Panics
/// If `init()` has not run yet.
pub fn kernel_pml4() -> PhysAddr {
    KERNEL_PML4.lock().expect("VMM: not initialized — call vmm::init() first")
}

/// Writes the kernel's root PML4 to CR3 and performs a full TLB flush.
///
/// # Safety
/// Must only be called once the identity map covers the code currently
/// executing and the stack currently in use.
pub unsafe fn activate() {
    let root = kernel_pml4();
    // SAFETY: caller's contract; root is a valid PML4 built by `init()`.
    unsafe { cpu::write_cr3(root.as_u64()) };
}

// =============================================================================
// Page table operations
// =============================================================================

/// Returns the physical address of the currently active PML4 (from CR3).
#[inline]
pub fn active_pml4() -> PhysAddr {
    PhysAddr::new(cpu::read_cr3() & ADDR_MASK)
}

/// Allocates a new zeroed page table from the physical memory manager.
pub fn new_table() -> Result<PhysAddr, MapError> {
    pmm::alloc_frame_zeroed().map_err(|_| MapError::OutOfMemory)
}

/// Maps a 4 KiB virtual page to a physical frame, walking the 4-level page
/// table hierarchy from `pml4_phys` and creating intermediate tables as
/// needed.
///
/// # Safety
/// `pml4_phys` must point to a valid PML4 table accessible via HHDM, and the
/// caller must flush the TLB for `virt` afterward (`flush()`).
pub unsafe fn map_page(
    pml4_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    debug_assert!(virt.is_page_aligned(), "VMM: virt address not page-aligned");
    debug_assert!(phys.is_page_aligned(), "VMM: phys address not page-aligned");

    let indices = virt.page_table_indices();
    let inter_flags = if flags.contains(PageTableFlags::USER) {
        PageTableFlags::INTERMEDIATE_USER
    } else {
        PageTableFlags::INTERMEDIATE
    };

    let pml4 = unsafe { &mut *pml4_phys.to_virt().as_mut_ptr::<PageTable>() };
    let pdpt_phys = get_or_create_next_table(&mut pml4[indices[3] as usize], inter_flags)?;

    let pdpt = unsafe { &mut *pdpt_phys.to_virt().as_mut_ptr::<PageTable>() };
    if pdpt[indices[2] as usize].is_present() && pdpt[indices[2] as usize].is_huge() {
        return Err(MapError::HugePageConflict);
    }
    let pd_phys = get_or_create_next_table(&mut pdpt[indices[2] as usize], inter_flags)?;

    let pd = unsafe { &mut *pd_phys.to_virt().as_mut_ptr::<PageTable>() };
    if pd[indices[1] as usize].is_present() && pd[indices[1] as usize].is_huge() {
        return Err(MapError::HugePageConflict);
    }
    let pt_phys = get_or_create_next_table(&mut pd[indices[1] as usize], inter_flags)?;

    let pt = unsafe { &mut *pt_phys.to_virt().as_mut_ptr::<PageTable>() };
    let leaf = &mut pt[indices[0] as usize];
    if leaf.is_present() {
        // Already mapped: left untouched, not an error.
        return Ok(());
    }
    leaf.set(phys, flags);
    Ok(())
}

/// Maps a 2 MiB virtual region to a physical frame using a PD-level huge
/// entry, walking only PML4 and PDPT to create intermediate tables.
///
/// # Safety
/// Same contract as `map_page`.
pub unsafe fn map_huge_page(
    pml4_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    debug_assert!(
        virt.as_u64() & (HUGE_PAGE_SIZE - 1) == 0,
        "VMM: virt address not 2 MiB-aligned"
    );
    debug_assert!(
        phys.as_u64() & (HUGE_PAGE_SIZE - 1) == 0,
        "VMM: phys address not 2 MiB-aligned"
    );

    let indices = virt.page_table_indices();
    let inter_flags = if flags.contains(PageTableFlags::USER) {
        PageTableFlags::INTERMEDIATE_USER
    } else {
        PageTableFlags::INTERMEDIATE
    };

    let pml4 = unsafe { &mut *pml4_phys.to_virt().as_mut_ptr::<PageTable>() };
    let pdpt_phys = get_or_create_next_table(&mut pml4[indices[3] as usize], inter_flags)?;

    let pdpt = unsafe { &mut *pdpt_phys.to_virt().as_mut_ptr::<PageTable>() };
    if pdpt[indices[2] as usize].is_present() && pdpt[indices[2] as usize].is_huge() {
        return Err(MapError::HugePageConflict);
    }
    let pd_phys = get_or_create_next_table(&mut pdpt[indices[2] as usize], inter_flags)?;

    let pd = unsafe { &mut *pd_phys.to_virt().as_mut_ptr::<PageTable>() };
    let leaf = &mut pd[indices[1] as usize];
    if leaf.is_present() {
        // Already mapped: left untouched, not an error.
        return Ok(());
    }
    leaf.set_huge(phys, flags);
    Ok(())
}

/// Unmaps a 4 KiB virtual page, returning the physical frame it was mapped
/// to. Does not free the frame — the caller decides.
///
/// # Safety
/// `pml4_phys` must point to a valid PML4 accessible via HHDM; the caller
/// must flush the TLB for `virt` afterward.
pub unsafe fn unmap_page(pml4_phys: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
    debug_assert!(virt.is_page_aligned(), "VMM: virt address not page-aligned");
    let indices = virt.page_table_indices();

    let pml4 = unsafe { &*pml4_phys.to_virt().as_ptr::<PageTable>() };
    let pml4_entry = &pml4[indices[3] as usize];
    if !pml4_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }

    let pdpt = unsafe { &*pml4_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pdpt_entry = &pdpt[indices[2] as usize];
    if !pdpt_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }
    if pdpt_entry.is_huge() {
        return Err(UnmapError::HugePageConflict);
    }

    let pd = unsafe { &*pdpt_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pd_entry = &pd[indices[1] as usize];
    if !pd_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }
    if pd_entry.is_huge() {
        // Fine-grained unmap of one 4 KiB page inside a huge mapping would
        // require splitting it into a PT; not supported. The whole 2 MiB
        // region must be torn down as a unit via `unmap_huge_page`.
        return Err(UnmapError::HugePageConflict);
    }

    let pt = unsafe { &mut *pd_entry.addr().to_virt().as_mut_ptr::<PageTable>() };
    let leaf = &mut pt[indices[0] as usize];
    if !leaf.is_present() {
        return Err(UnmapError::NotMapped);
    }

    let phys = leaf.addr();
    leaf.clear();
    Ok(phys)
}

/// Translates a virtual address to its physical address by walking the page
/// tables rooted at `pml4_phys`, honoring 2 MiB and 1 GiB huge entries.
pub fn translate(pml4_phys: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let indices = virt.page_table_indices();
    let offset = virt.page_offset() as u64;

    let pml4 = unsafe { &*pml4_phys.to_virt().as_ptr::<PageTable>() };
    let pml4_entry = &pml4[indices[3] as usize];
    if !pml4_entry.is_present() {
        return None;
    }

    let pdpt = unsafe { &*pml4_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pdpt_entry = &pdpt[indices[2] as usize];
    if !pdpt_entry.is_present() {
        return None;
    }
    if pdpt_entry.is_huge() {
        let gib_offset = virt.as_u64() & 0x3FFF_FFFF;
        return Some(PhysAddr::new((pdpt_entry.addr().as_u64() & !0x3FFF_FFFF) + gib_offset));
    }

    let pd = unsafe { &*pdpt_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pd_entry = &pd[indices[1] as usize];
    if !pd_entry.is_present() {
        return None;
    }
    if pd_entry.is_huge() {
        let mib_offset = virt.as_u64() & 0x1F_FFFF;
        return Some(PhysAddr::new((pd_entry.addr().as_u64() & !0x1F_FFFF) + mib_offset));
    }

    let pt = unsafe { &*pd_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pt_entry = &pt[indices[0] as usize];
    if !pt_entry.is_present() {
        return None;
    }

    Some(PhysAddr::new(pt_entry.addr().as_u64() + offset))
}

/// Flushes the TLB entry for a single virtual address.
#[inline]
pub fn flush(virt: VirtAddr) {
    cpu::invlpg(virt.as_u64());
}

/// Flushes the entire TLB by reloading CR3.
///
/// # Safety
/// The current CR3 must still point to a valid PML4.
pub unsafe fn flush_all() {
    let cr3 = cpu::read_cr3();
    unsafe { cpu::write_cr3(cr3) };
}

// =============================================================================
// Internal helpers
// =============================================================================

/// If present, returns the physical address `entry` points to. Otherwise
/// allocates a new zeroed page table, installs it, and returns its address.
fn get_or_create_next_table(
    entry: &mut PageTableEntry,
    flags: PageTableFlags,
) -> Result<PhysAddr, MapError> {
    if entry.is_present() {
        Ok(entry.addr())
    } else {
        let frame = pmm::alloc_frame_zeroed().map_err(|_| MapError::OutOfMemory)?;
        // SAFETY: freshly allocated and zeroed; safe to zero again via the
        // table view before installing.
        let table = unsafe { &mut *frame.to_virt().as_mut_ptr::<PageTable>() };
        table.zero();
        entry.set(frame, flags);
        Ok(frame)
    }
}

/// Clears the kernel root so `init()` can run again in a later test.
/// Never compiled outside test builds — production boot calls `init()`
/// exactly once and relies on the single-call assertion holding.
#[cfg(test)]
pub fn test_reset() {
    *KERNEL_PML4.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address::PAGE_SIZE as PS;

    fn with_host_backed_memory(frames: usize, f: impl FnOnce()) {
        use alloc::vec;
        let size = frames as u64 * PS;
        let mut backing = vec![0u8; size as usize];
        let base = backing.as_mut_ptr() as u64;
        unsafe { crate::memory::address::init_hhdm(0) };
        crate::memory::pmm::init(PhysAddr::new(base), size);
        f();
        core::mem::forget(backing);
    }

    #[test]
    fn map_then_translate_round_trips() {
        with_host_backed_memory(256, || {
            let root = new_table().unwrap();
            let phys = pmm::alloc_frame().unwrap();
            let virt = VirtAddr::new(0x1000_0000);
            unsafe {
                map_page(root, virt, phys, PageTableFlags::KERNEL_DATA).unwrap();
            }
            let got = translate(root, virt + 0x42).unwrap();
            assert_eq!(got, phys + 0x42);

            unsafe { unmap_page(root, virt).unwrap() };
            assert!(translate(root, virt).is_none());
        });
    }

    #[test]
    fn huge_page_translates_across_its_whole_span() {
        with_host_backed_memory(2048, || {
            let root = new_table().unwrap();
            let phys_base = pmm::alloc_contiguous(512).unwrap(); // 2 MiB worth
            let virt_base = VirtAddr::new(0x4000_0000);
            unsafe {
                map_huge_page(root, virt_base, phys_base, PageTableFlags::KERNEL_DATA).unwrap();
            }
            let probe = virt_base + (HUGE_PAGE_SIZE / 2);
            let expected = phys_base + (HUGE_PAGE_SIZE / 2);
            assert_eq!(translate(root, probe), Some(expected));
        });
    }

    #[test]
    fn second_map_of_same_page_is_a_no_op() {
        with_host_backed_memory(64, || {
            let root = new_table().unwrap();
            let phys = pmm::alloc_frame().unwrap();
            let virt = VirtAddr::new(0x2000_0000);
            unsafe {
                map_page(root, virt, phys, PageTableFlags::KERNEL_DATA).unwrap();
                let second = pmm::alloc_frame().unwrap();
                // Already-present leaf entries are left untouched, not an error.
                map_page(root, virt, second, PageTableFlags::KERNEL_DATA).unwrap();
                assert_eq!(translate(root, virt), Some(phys));
            }
        });
    }
}
