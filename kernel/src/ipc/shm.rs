//! Named shared-memory regions.
//!
//! A region's virtual window is assigned from `KernelConfig::SHM_WINDOW_BASE`
//! by the slot index the region lands in — `base = WINDOW_BASE + index *
//! MAX_SHARED_MEMORY_SIZE` — so two live regions can never overlap: each
//! occupies a full `MAX_SHARED_MEMORY_SIZE` slot regardless of how much of
//! it is actually backed by frames.

use crate::config::KernelConfig;
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::vmm::{self, PageTableFlags};
use crate::memory::pmm;
use crate::sync::spinlock::SpinLock;
use crate::task::process::Pid;
use crate::util::collections::{handle_unpack, SlotTable};
use alloc::vec::Vec;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    NotFound,
    NotAttached,
    OutOfMemory,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShmError::NotFound => "no shared memory region with that id",
            ShmError::NotAttached => "process is not attached to this region",
            ShmError::OutOfMemory => "could not back this region with physical frames",
        };
        write!(f, "{s}")
    }
}

struct ShmRecord {
    creator_pid: Pid,
    size_bytes: u64,
    base_va: VirtAddr,
    frames: Vec<PhysAddr>,
    attached: Vec<Pid>,
}

static REGISTRY: SpinLock<SlotTable<ShmRecord>> = SpinLock::new(SlotTable::new());

fn round_up_to_page(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Creates a region of at least `size_bytes` (clamped to
/// `[1, MAX_SHARED_MEMORY_SIZE]` and rounded up to a page).
///
/// Backs the region page by page from the PMM and maps it into the
/// kernel address space via the VMM; if any page fails partway through,
/// every frame and mapping already established for this region is rolled
/// back before returning `OutOfMemory`.
pub fn create(creator_pid: Pid, size_bytes: u64) -> Result<u64, ShmError> {
    let clamped = size_bytes.clamp(1, KernelConfig::MAX_SHARED_MEMORY_SIZE);
    let rounded = round_up_to_page(clamped);

    let mut registry = REGISTRY.lock();
    let handle = registry.insert(ShmRecord {
        creator_pid,
        size_bytes: rounded,
        base_va: VirtAddr::new(0),
        frames: Vec::new(),
        attached: Vec::new(),
    });
    let (_, index) = handle_unpack(handle);
    let base_va = VirtAddr::new(KernelConfig::SHM_WINDOW_BASE + (index as u64) * KernelConfig::MAX_SHARED_MEMORY_SIZE);

    let page_count = (rounded / PAGE_SIZE) as usize;
    let mut frames = Vec::with_capacity(page_count);
    let mut mapped_ok = true;

    for i in 0..page_count {
        let Ok(frame) = pmm::alloc_frame() else {
            mapped_ok = false;
            break;
        };
        let va = VirtAddr::new(base_va.as_u64() + (i as u64) * PAGE_SIZE);
        // SAFETY: `va` falls inside this region's freshly reserved window,
        // which no other record can claim, and `frame` was just allocated
        // from the PMM and isn't mapped anywhere else.
        let mapped = unsafe {
            vmm::map_page(vmm::kernel_pml4(), va, frame, PageTableFlags::KERNEL_DATA)
        };
        if mapped.is_err() {
            pmm::free_frame(frame);
            mapped_ok = false;
            break;
        }
        frames.push(frame);
    }

    if !mapped_ok {
        for (i, &frame) in frames.iter().enumerate() {
            let va = VirtAddr::new(base_va.as_u64() + (i as u64) * PAGE_SIZE);
            // SAFETY: unwinding a partially-built region; each `va` here
            // was mapped in the loop above and nowhere else.
            let _ = unsafe { vmm::unmap_page(vmm::kernel_pml4(), va) };
            pmm::free_frame(frame);
        }
        registry.remove(handle);
        return Err(ShmError::OutOfMemory);
    }

    let record = registry.get_mut(handle).expect("just inserted");
    record.base_va = base_va;
    record.frames = frames;

    Ok(handle)
}

/// Attaches `pid` to region `id`, returning its virtual base. Attaching
/// a pid that's already attached is idempotent — it returns the same
/// base and does not duplicate the entry.
pub fn attach(id: u64, pid: Pid) -> Result<VirtAddr, ShmError> {
    let mut registry = REGISTRY.lock();
    let record = registry.get_mut(id).ok_or(ShmError::NotFound)?;
    if !record.attached.contains(&pid) {
        record.attached.push(pid);
    }
    Ok(record.base_va)
}

pub fn detach(id: u64, pid: Pid) -> Result<(), ShmError> {
    let mut registry = REGISTRY.lock();
    let record = registry.get_mut(id).ok_or(ShmError::NotFound)?;
    let before = record.attached.len();
    record.attached.retain(|&p| p != pid);
    if record.attached.len() == before {
        return Err(ShmError::NotAttached);
    }
    Ok(())
}

/// Unmaps every page and releases every frame backing region `id`.
///
/// Does not check whether any pid is still attached — destroying a
/// region out from under an attacher is tolerated as a unilateral
/// reclamation by the creator, not guarded against here. Callers are
/// expected to `detach` first; those that don't leave their attachment
/// pointing at nothing, which is their problem, not the registry's.
pub fn destroy(id: u64) -> Result<(), ShmError> {
    let mut registry = REGISTRY.lock();
    let record = registry.remove(id).ok_or(ShmError::NotFound)?;

    for (i, &frame) in record.frames.iter().enumerate() {
        let va = VirtAddr::new(record.base_va.as_u64() + (i as u64) * PAGE_SIZE);
        // SAFETY: `va` was mapped by this same record's `create()` and is
        // being torn down exactly once, here.
        let _ = unsafe { vmm::unmap_page(vmm::kernel_pml4(), va) };
        pmm::free_frame(frame);
    }
    Ok(())
}

pub fn creator(id: u64) -> Result<Pid, ShmError> {
    REGISTRY.lock().get(id).map(|r| r.creator_pid).ok_or(ShmError::NotFound)
}

pub fn size_of(id: u64) -> Result<u64, ShmError> {
    REGISTRY.lock().get(id).map(|r| r.size_bytes).ok_or(ShmError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address;
    use crate::memory::{pmm as pmm_mod, vmm as vmm_mod};
    use alloc::vec;

    /// Host-backed stand-in for physical memory plus a freshly
    /// bootstrapped VMM, mirroring the harness in `memory::vmm::tests`.
    fn with_memory(frames: usize, f: impl FnOnce()) {
        let byte_len = frames * PAGE_SIZE as usize;
        let mut backing = vec![0u8; byte_len];
        unsafe { address::init_hhdm(backing.as_mut_ptr() as u64) };
        pmm_mod::init(PhysAddr::new(0), byte_len as u64);
        vmm_mod::test_reset();
        vmm_mod::init();
        f();
    }

    #[test]
    fn two_regions_get_disjoint_windows() {
        with_memory(64, || {
            let a = create(1, 4096).unwrap();
            let b = create(1, 4096).unwrap();
            let va_a = attach(a, 1).unwrap();
            let va_b = attach(b, 1).unwrap();
            assert_ne!(va_a.as_u64(), va_b.as_u64());
            destroy(a).unwrap();
            destroy(b).unwrap();
        });
    }

    #[test]
    fn attach_is_idempotent() {
        with_memory(16, || {
            let id = create(1, 4096).unwrap();
            let first = attach(id, 7).unwrap();
            let second = attach(id, 7).unwrap();
            assert_eq!(first.as_u64(), second.as_u64());
            destroy(id).unwrap();
        });
    }

    #[test]
    fn destroy_tolerates_stale_attachments() {
        with_memory(16, || {
            let id = create(1, 4096).unwrap();
            attach(id, 9).unwrap();
            assert!(destroy(id).is_ok());
            assert_eq!(creator(id), Err(ShmError::NotFound));
        });
    }
}
