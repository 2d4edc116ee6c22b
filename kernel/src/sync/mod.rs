// =============================================================================
// Pelican — Kernel Synchronization Primitives
// =============================================================================
//
// This module provides synchronization primitives for the kernel. There is
// no std here, so no std::sync — just the ticket spinlock below, used for
// every shared kernel table.
//
// Lock ordering, innermost to outermost:
//   Level 1: PMM bitmap lock
//   Level 2: Page table lock
//   Level 3: IPC endpoint locks (queue / shm registries)
//   Level 4: Process table lock
//   Level 5 (outermost): Scheduler run queue lock
//
// Never acquire a lower-level lock while holding a higher-level one — e.g.
// the scheduler may call into the process table while holding its own run
// queue lock, but the process table must never call back into the
// scheduler while holding the process table lock.
// =============================================================================

pub mod spinlock;

