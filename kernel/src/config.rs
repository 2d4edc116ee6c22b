// =============================================================================
// Pelican — Kernel Configuration
// =============================================================================
//
// There's no filesystem before the heap and scheduler exist, so "config"
// here means compile-time constants rather than a parsed file. Collecting
// them in one place beats scattering magic numbers through pmm.rs, vmm.rs,
// the scheduler, and the IPC registries separately.
// =============================================================================

/// Process-visible limits and scheduling defaults.
pub struct KernelConfig;

impl KernelConfig {
    /// Largest payload a single IPC message may carry, in bytes.
    pub const MAX_MESSAGE_SIZE: usize = 1024;
    /// Largest number of undelivered messages a queue will hold.
    pub const MAX_MESSAGES_PER_QUEUE: usize = 64;
    /// Largest a single shared-memory region may be, in bytes.
    pub const MAX_SHARED_MEMORY_SIZE: u64 = 4 * 1024 * 1024;

    /// Lowest and highest scheduling priority a process may carry.
    pub const MIN_PRIORITY: u8 = 0;
    pub const MAX_PRIORITY: u8 = 10;
    /// Priorities at or above this are "interactive" and exempt from
    /// tick-driven preemption.
    pub const INTERACTIVE_PRIORITY_THRESHOLD: u8 = 9;

    /// Default number of timer ticks granted per scheduled process.
    pub const DEFAULT_TIME_SLICE: u32 = 5;

    /// Base of the reserved virtual address window shared memory regions
    /// are carved out of. Each region occupies a `MAX_SHARED_MEMORY_SIZE`
    /// slot regardless of its actual size, indexed by `shm_id - 1`.
    pub const SHM_WINDOW_BASE: u64 = 0x0000_7000_0000_0000;
}
