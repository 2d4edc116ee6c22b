#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

mod arch;
mod config;
mod ipc;
mod memory;
mod sync;
mod syscall;
mod task;
mod util;

/// Everything below only makes sense wired to real hardware via the
/// Limine protocol; under `cargo test` the std test harness supplies its
/// own entry point and panic handler, so none of this is compiled then.
#[cfg(not(test))]
mod boot_entry {
    use limine::memory_map::EntryType;

    use crate::arch::serial::SERIAL;
    use crate::kprintln;
    use crate::memory::address::PhysAddr;

    /// Picks the largest USABLE region in the Limine memory map to back
    /// the PMM's bitmap. The PMM only ever manages one contiguous range
    /// (see its module doc) — this is where we decide which one.
    fn pick_largest_usable_region() -> (PhysAddr, u64) {
        let mut best_base = 0u64;
        let mut best_len = 0u64;
        for entry in crate::arch::boot::get_memory_map() {
            if entry.entry_type == EntryType::USABLE && entry.length > best_len {
                best_base = entry.base;
                best_len = entry.length;
            }
        }
        assert!(best_len > 0, "no usable memory region reported by bootloader");
        (PhysAddr::new(best_base), best_len)
    }

    /// Kernel entry point called by the Limine bootloader.
    ///
    /// Boot order matches `memory::init`'s own contract (HHDM, then PMM,
    /// then VMM, then heap) plus the process table and scheduler once
    /// there's a heap to allocate them out of.
    #[unsafe(no_mangle)]
    unsafe extern "C" fn _start() -> ! {
        assert!(crate::arch::boot::base_revision_supported());

        SERIAL.lock().init();
        kprintln!("Pelican kernel booting...");

        let hhdm_offset = crate::arch::boot::get_hhdm_offset();
        let (phys_base, phys_size) = pick_largest_usable_region();

        unsafe { crate::memory::init(hhdm_offset, phys_base, phys_size) };
        // SAFETY: `memory::init` just built the identity map covering the
        // code and stack currently executing, satisfying `activate`'s contract.
        unsafe { crate::memory::vmm::activate() };
        kprintln!("[boot] memory subsystem online");

        crate::task::scheduler::init(crate::task::scheduler::Policy::RoundRobin);
        let init_pid = crate::task::process::create("init", 0);
        crate::task::scheduler::add(init_pid);
        kprintln!("[boot] process table and scheduler online, init pid = {}", init_pid);

        kprintln!("[boot] Pelican is up");
        loop {
            unsafe { core::arch::asm!("hlt") };
        }
    }
}
