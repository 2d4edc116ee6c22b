//! Named IPC: message queues and shared memory.
//!
//! Both registries are generation-guarded `SlotTable`s keyed by a handle
//! that doubles as the id a process-visible syscall hands back, so a
//! destroyed queue's old id can never alias a freshly created one that
//! happened to land in the same slot.

pub mod queue;
pub mod shm;

use crate::task::process::{self, ProcessState, WaitChannel};

/// Wakes every process parked on `channel`: Waiting → Ready, clears
/// `waiting_on`, and re-adds it to the scheduler's run queue.
///
/// Queue `send()` wakes at most one waiter directly (see `queue.rs`) to
/// honor FIFO-by-parking-order; this broader scan is for `destroy()`,
/// which must unpark every waiter, not just the head of the line.
pub fn wake_on(channel: WaitChannel) {
    for pid in process::find_waiting_on(channel) {
        let _ = process::set_state(pid, ProcessState::Ready);
        let _ = process::set_waiting_on(pid, WaitChannel::None);
        crate::task::scheduler::add(pid);
    }
}
