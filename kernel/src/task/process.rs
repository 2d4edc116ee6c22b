//! Process table — process control blocks and the all-processes list.
//!
//! The table owns every `Process` record. Other subsystems (the scheduler,
//! the IPC registries) refer to a process by its `Pid`, never by a pointer
//! into this table — the table is the only thing that actually holds the
//! records, so a process being moved or reaped can never leave a dangling
//! reference lying around in someone else's state.

use crate::sync::spinlock::SpinLock;
use crate::util::collections::SmallName;
use alloc::vec::Vec;
use core::fmt;

/// Process identifier. Signed so that 0 can mean "no parent" without
/// colliding with a real pid; pids are otherwise always positive.
pub type Pid = i32;

/// Longest process name the table stores inline.
pub const MAX_PROCESS_NAME: usize = 32;

/// The resource a `Waiting` process is parked on.
///
/// Replaces a raw `waiting_on: *const ()` back-reference with a typed,
/// ownership-free tag: the process table only needs to know *that* a
/// process is waiting on something, not dereference the something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    None,
    /// Parked in `receive()` on this message queue's handle.
    Queue(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Ready,
    Waiting,
    Stopped,
    Zombie,
}

#[derive(Clone, Copy)]
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: SmallName<MAX_PROCESS_NAME>,
    pub state: ProcessState,
    pub priority: u8,
    pub last_run: u64,
    pub total_runtime: u64,
    pub waiting_on: WaitChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    NotFound,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::NotFound => write!(f, "no process with that pid"),
        }
    }
}

struct Table {
    processes: Vec<Process>,
    next_pid: Pid,
}

impl Table {
    const fn new() -> Self {
        Self {
            processes: Vec::new(),
            // Pid 0 is reserved for "no parent" — the first real process
            // created gets pid 1.
            next_pid: 1,
        }
    }

    fn index_of(&self, pid: Pid) -> Option<usize> {
        self.processes.iter().position(|p| p.pid == pid)
    }
}

static TABLE: SpinLock<Table> = SpinLock::new(Table::new());

/// Creates a new process record and returns its freshly allocated pid.
///
/// The pid counter is monotonic for the lifetime of the kernel; it is
/// never reused even after the process that held it terminates.
pub fn create(name: &str, ppid: Pid) -> Pid {
    let mut table = TABLE.lock();
    let pid = table.next_pid;
    table.next_pid += 1;
    table.processes.push(Process {
        pid,
        ppid,
        name: SmallName::new(name),
        state: ProcessState::Ready,
        priority: 0,
        last_run: 0,
        total_runtime: 0,
        waiting_on: WaitChannel::None,
    });
    pid
}

/// Removes a process's record.
///
/// Before the record is dropped, the process is pulled out of the
/// scheduler's ready queue — a terminated pid must never be selected by
/// a later `schedule()`. The table does not know about IPC wait lists;
/// a caller that terminates a process blocked in `receive()` is expected
/// to have already woken it (see `ipc::wake_on`), same as the source's
/// own division of responsibility.
pub fn terminate(pid: Pid) -> Result<(), ProcessError> {
    let mut table = TABLE.lock();
    let index = table.index_of(pid).ok_or(ProcessError::NotFound)?;
    table.processes.swap_remove(index);
    drop(table);

    crate::task::scheduler::remove(pid);
    Ok(())
}

pub fn get(pid: Pid) -> Option<Process> {
    TABLE.lock().processes.iter().find(|p| p.pid == pid).copied()
}

/// The process currently marked `Running`, if the scheduler has run at
/// least once. At most one record may be in this state.
pub fn current() -> Option<Process> {
    TABLE
        .lock()
        .processes
        .iter()
        .find(|p| p.state == ProcessState::Running)
        .copied()
}

pub fn list() -> Vec<Process> {
    TABLE.lock().processes.clone()
}

/// Overwrites the state of `pid`'s record. Used by the scheduler and IPC
/// layer to move a process between Ready/Running/Waiting/Zombie.
pub fn set_state(pid: Pid, state: ProcessState) -> Result<(), ProcessError> {
    let mut table = TABLE.lock();
    let index = table.index_of(pid).ok_or(ProcessError::NotFound)?;
    table.processes[index].state = state;
    Ok(())
}

pub fn set_waiting_on(pid: Pid, channel: WaitChannel) -> Result<(), ProcessError> {
    let mut table = TABLE.lock();
    let index = table.index_of(pid).ok_or(ProcessError::NotFound)?;
    table.processes[index].waiting_on = channel;
    Ok(())
}

pub fn set_priority(pid: Pid, priority: u8) -> Result<(), ProcessError> {
    let mut table = TABLE.lock();
    let index = table.index_of(pid).ok_or(ProcessError::NotFound)?;
    let clamped = priority.min(crate::config::KernelConfig::MAX_PRIORITY);
    table.processes[index].priority = clamped;
    Ok(())
}

/// Stamps `last_run` and adds one tick to `total_runtime`. Called by the
/// scheduler once per tick for whichever process is Running.
pub fn record_tick(pid: Pid, now: u64) -> Result<(), ProcessError> {
    let mut table = TABLE.lock();
    let index = table.index_of(pid).ok_or(ProcessError::NotFound)?;
    let p = &mut table.processes[index];
    p.last_run = now;
    p.total_runtime += 1;
    Ok(())
}

/// Finds every process parked on `channel`. Used by `ipc::wake_on` —
/// kept here (rather than exposing the raw process list) so the table
/// stays the only thing that iterates its own records.
pub fn find_waiting_on(channel: WaitChannel) -> Vec<Pid> {
    TABLE
        .lock()
        .processes
        .iter()
        .filter(|p| p.state == ProcessState::Waiting && p.waiting_on == channel)
        .map(|p| p.pid)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test works on its own pids starting from wherever the shared
    // static table counter happens to be, so assertions key off identity
    // and state, never off specific pid values.

    #[test]
    fn create_assigns_increasing_pids_and_reserves_zero() {
        let a = create("a", 0);
        let b = create("b", a);
        assert!(a > 0);
        assert!(b > a);
        assert_eq!(get(b).unwrap().ppid, a);
        terminate(a).unwrap();
        terminate(b).unwrap();
    }

    #[test]
    fn terminate_removes_record_and_is_idempotent_failure() {
        let pid = create("solo", 0);
        assert!(get(pid).is_some());
        terminate(pid).unwrap();
        assert!(get(pid).is_none());
        assert_eq!(terminate(pid), Err(ProcessError::NotFound));
    }

    #[test]
    fn waiting_on_round_trips() {
        let pid = create("waiter", 0);
        set_state(pid, ProcessState::Waiting).unwrap();
        set_waiting_on(pid, WaitChannel::Queue(7)).unwrap();
        assert_eq!(get(pid).unwrap().waiting_on, WaitChannel::Queue(7));
        assert_eq!(find_waiting_on(WaitChannel::Queue(7)), alloc::vec![pid]);
        terminate(pid).unwrap();
    }

    #[test]
    fn priority_is_clamped() {
        let pid = create("loud", 0);
        set_priority(pid, 255).unwrap();
        assert_eq!(get(pid).unwrap().priority, crate::config::KernelConfig::MAX_PRIORITY);
        terminate(pid).unwrap();
    }
}
