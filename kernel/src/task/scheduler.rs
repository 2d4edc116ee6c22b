//! Ready-queue scheduler — RoundRobin and Priority policies, preemption on
//! timer tick.
//!
//! The scheduler never owns a `Process`; it only ever holds `Pid`s and
//! asks the process table to read or flip state. A process stays in the
//! run queue for as long as it's schedulable (Ready or Running); it's
//! only pulled out by `remove()` when something outside normal rotation
//! takes it out of the running — termination, or parking it on an IPC
//! wait list.

use crate::config::KernelConfig;
use crate::sync::spinlock::SpinLock;
use crate::task::process::{self, Pid, ProcessState};
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RoundRobin,
    Priority,
}

struct Inner {
    policy: Policy,
    queue: Vec<Pid>,
    cursor: usize,
    current: Option<Pid>,
    slice_remaining: u32,
}

impl Inner {
    const fn new() -> Self {
        Self {
            policy: Policy::RoundRobin,
            queue: Vec::new(),
            cursor: 0,
            current: None,
            slice_remaining: 0,
        }
    }
}

static SCHEDULER: SpinLock<Inner> = SpinLock::new(Inner::new());

/// Chooses the scheduling policy. Safe to call again later to switch
/// policies at runtime; it does not touch the existing queue.
pub fn init(policy: Policy) {
    SCHEDULER.lock().policy = policy;
}

/// Adds `pid` to the run queue and marks it Ready. Re-adding a pid
/// already present is a no-op, matching "duplicates are ignored".
pub fn add(pid: Pid) {
    let mut sched = SCHEDULER.lock();
    if !sched.queue.contains(&pid) {
        sched.queue.push(pid);
    }
    drop(sched);
    let _ = process::set_state(pid, ProcessState::Ready);
}

/// Removes `pid` from the run queue, preserving the relative order of
/// the remainder. Used when a process terminates or parks on an IPC
/// wait list.
pub fn remove(pid: Pid) {
    let mut sched = SCHEDULER.lock();
    sched.queue.retain(|&p| p != pid);
    if sched.current == Some(pid) {
        sched.current = None;
    }
}

pub fn current_pid() -> Option<Pid> {
    SCHEDULER.lock().current
}

/// Picks the next Ready pid per the active policy. Does not mutate
/// scheduler state — callers decide what to do with the answer.
fn select_next(sched: &Inner) -> Option<Pid> {
    if sched.queue.is_empty() {
        return None;
    }
    match sched.policy {
        Policy::RoundRobin => {
            let len = sched.queue.len();
            for step in 1..=len {
                let index = (sched.cursor + step) % len;
                let pid = sched.queue[index];
                if process::get(pid).map(|p| p.state) == Some(ProcessState::Ready) {
                    return Some(pid);
                }
            }
            None
        }
        Policy::Priority => {
            let mut best: Option<(usize, Pid, u8)> = None;
            for (index, &pid) in sched.queue.iter().enumerate() {
                let Some(p) = process::get(pid) else { continue };
                if p.state != ProcessState::Ready {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((_, _, best_prio)) => p.priority > best_prio,
                };
                if better {
                    best = Some((index, pid, p.priority));
                }
            }
            best.map(|(_, pid, _)| pid)
        }
    }
}

/// Selects the next process and performs a context switch to it.
///
/// The outgoing process (if any) goes Running → Ready and stays in the
/// queue; the incoming process goes Ready → Running. If the queue has
/// no Ready entries, this is a no-op — the caller keeps running.
pub fn schedule() {
    let mut sched = SCHEDULER.lock();
    let Some(next) = select_next(&sched) else {
        return;
    };

    let prev = sched.current.take();
    if let Some(prev_pid) = prev {
        let _ = process::set_state(prev_pid, ProcessState::Ready);
    }

    let next_index = sched.queue.iter().position(|&p| p == next);
    if let Some(index) = next_index {
        sched.cursor = index;
    }
    sched.current = Some(next);
    sched.slice_remaining = KernelConfig::DEFAULT_TIME_SLICE;
    drop(sched);

    let _ = process::set_state(next, ProcessState::Running);
    let now = crate::task::clock::now();
    let _ = process::record_tick(next, now);

    #[cfg(not(test))]
    {
        if let Some(prev_pid) = prev {
            if prev_pid != next {
                // SAFETY: called with interrupts masked by the timer ISR
                // or by a caller that has already disabled them; the
                // scheduler lock was dropped above so the resumed side
                // can freely re-enter this module.
                unsafe { crate::task::context::switch_to(prev_pid, next) };
            }
        }
    }
    #[cfg(test)]
    {
        let _ = prev;
    }
}

/// Called from the timer interrupt handler on every tick.
///
/// Refuses to run if interrupts were already masked on entry — that
/// means we're inside some other critical section, and re-entering the
/// scheduler here could deadlock on a lock that section is holding.
pub fn tick() {
    if !crate::sync::spinlock::interrupts_enabled() {
        return;
    }

    let current = { SCHEDULER.lock().current };
    let Some(pid) = current else { return };
    let Some(p) = process::get(pid) else { return };

    let _ = process::record_tick(pid, crate::task::clock::now());

    if p.priority >= KernelConfig::INTERACTIVE_PRIORITY_THRESHOLD {
        return;
    }

    let mut sched = SCHEDULER.lock();
    if sched.slice_remaining > 0 {
        sched.slice_remaining -= 1;
    }
    let exhausted = sched.slice_remaining == 0;
    drop(sched);

    if exhausted {
        schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_pids(n: usize, priority: u8) -> Vec<Pid> {
        (0..n)
            .map(|i| {
                let pid = process::create("t", 0);
                process::set_priority(pid, priority).unwrap();
                add(pid);
                pid
            })
            .collect()
    }

    fn cleanup(pids: &[Pid]) {
        for &pid in pids {
            remove(pid);
            let _ = process::terminate(pid);
        }
    }

    #[test]
    fn round_robin_visits_everyone_before_repeating() {
        init(Policy::RoundRobin);
        let pids = fresh_pids(3, 0);

        let mut seen = Vec::new();
        for _ in 0..pids.len() {
            schedule();
            seen.push(current_pid().unwrap());
        }
        seen.sort();
        let mut expected = pids.clone();
        expected.sort();
        assert_eq!(seen, expected);

        cleanup(&pids);
    }

    #[test]
    fn priority_policy_prefers_highest_ready_priority() {
        init(Policy::Priority);
        let low = process::create("low", 0);
        process::set_priority(low, 2).unwrap();
        add(low);
        let high = process::create("high", 0);
        process::set_priority(high, 8).unwrap();
        add(high);

        schedule();
        assert_eq!(current_pid(), Some(high));

        cleanup(&[low, high]);
    }

    #[test]
    fn remove_drops_pid_from_consideration() {
        init(Policy::RoundRobin);
        let pids = fresh_pids(2, 0);
        remove(pids[0]);
        schedule();
        assert_eq!(current_pid(), Some(pids[1]));
        cleanup(&pids);
    }
}
