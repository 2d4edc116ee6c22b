//! Named message queues.

use crate::config::KernelConfig;
use crate::sync::spinlock::SpinLock;
use crate::task::process::{self, Pid, ProcessState, WaitChannel};
use crate::util::collections::SlotTable;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

pub const MAX_QUEUE_NAME: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    NameExists,
    NotFound,
    Full,
    Invalid,
    /// Returned from a parked `receive()` that woke up because its queue
    /// was destroyed, rather than because a message arrived.
    Destroyed,
    /// Returned from a non-blocking `receive()` on an empty queue.
    NotReady,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueError::NameExists => "a queue with that name already exists",
            QueueError::NotFound => "no queue with that id or name",
            QueueError::Full => "queue is at its message bound",
            QueueError::Invalid => "message exceeds the maximum payload size",
            QueueError::Destroyed => "queue was destroyed while receive was parked",
            QueueError::NotReady => "queue is empty",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub sender_pid: Pid,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

struct QueueRecord {
    owner_pid: Pid,
    name: crate::util::collections::SmallName<MAX_QUEUE_NAME>,
    messages: VecDeque<Message>,
    /// Pids parked in `receive(wait=true)`, in the order they parked.
    waiters: VecDeque<Pid>,
}

static REGISTRY: SpinLock<SlotTable<QueueRecord>> = SpinLock::new(SlotTable::new());

/// Creates a named queue. Fails if a live queue already holds `name`.
pub fn create(owner_pid: Pid, name: &str) -> Result<u64, QueueError> {
    let mut registry = REGISTRY.lock();
    if registry.find(|r| r.name == name).is_some() {
        return Err(QueueError::NameExists);
    }
    let handle = registry.insert(QueueRecord {
        owner_pid,
        name: crate::util::collections::SmallName::new(name),
        messages: VecDeque::new(),
        waiters: VecDeque::new(),
    });
    Ok(handle)
}

/// Returns the pid that created queue `id`.
pub fn owner(id: u64) -> Result<Pid, QueueError> {
    REGISTRY
        .lock()
        .get(id)
        .map(|r| r.owner_pid)
        .ok_or(QueueError::NotFound)
}

/// Looks up a live queue's id by name.
pub fn open(name: &str) -> Result<u64, QueueError> {
    REGISTRY
        .lock()
        .find(|r| r.name == name)
        .ok_or(QueueError::NotFound)
}

/// Deletes a queue. Every process parked in `receive()` on it is woken
/// first — with a `Destroyed` outcome on their pending receive — and
/// *then* the record is deleted, so no waiter is ever left pointing at a
/// `waiting_on` channel that no longer resolves to anything.
pub fn destroy(id: u64) -> Result<(), QueueError> {
    let mut registry = REGISTRY.lock();
    let record = registry.get_mut(id).ok_or(QueueError::NotFound)?;
    let waiters: Vec<Pid> = record.waiters.drain(..).collect();

    for pid in waiters {
        let _ = process::set_waiting_on(pid, WaitChannel::None);
        crate::task::scheduler::add(pid);
    }

    registry.remove(id);
    drop(registry);
    Ok(())
}

/// Sends `data` to queue `id`. Wakes at most one parked receiver, taken
/// from the front of the wait list so wakeups stay FIFO by parking
/// order.
pub fn send(id: u64, sender_pid: Pid, data: &[u8]) -> Result<(), QueueError> {
    if data.len() > KernelConfig::MAX_MESSAGE_SIZE {
        return Err(QueueError::Invalid);
    }
    let mut registry = REGISTRY.lock();
    let record = registry.get_mut(id).ok_or(QueueError::NotFound)?;
    if record.messages.len() >= KernelConfig::MAX_MESSAGES_PER_QUEUE {
        return Err(QueueError::Full);
    }
    record.messages.push_back(Message {
        sender_pid,
        timestamp: crate::task::clock::now(),
        payload: data.to_vec(),
    });
    let woken = record.waiters.pop_front();
    drop(registry);

    if let Some(pid) = woken {
        let _ = process::set_waiting_on(pid, WaitChannel::None);
        crate::task::scheduler::add(pid);
    }
    Ok(())
}

/// Receives from queue `id`. With `wait = false`, returns `NotReady`
/// immediately on an empty queue. With `wait = true`, parks the calling
/// process and yields to the scheduler; the caller resumes here once
/// woken, either by a matching `send()` or by the queue being destroyed.
pub fn receive(id: u64, pid: Pid, wait: bool) -> Result<Message, QueueError> {
    {
        let mut registry = REGISTRY.lock();
        let record = registry.get_mut(id).ok_or(QueueError::NotFound)?;
        if let Some(msg) = record.messages.pop_front() {
            return Ok(msg);
        }
        if !wait {
            return Err(QueueError::NotReady);
        }
        record.waiters.push_back(pid);
    }

    let _ = process::set_state(pid, ProcessState::Waiting);
    let _ = process::set_waiting_on(pid, WaitChannel::Queue(id));
    crate::task::scheduler::remove(pid);
    crate::task::scheduler::schedule();

    // Resumed: re-check our own post-condition rather than trusting why
    // we were woken.
    let mut registry = REGISTRY.lock();
    match registry.get_mut(id) {
        None => Err(QueueError::Destroyed),
        Some(record) => record.messages.pop_front().ok_or(QueueError::NotReady),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_received_in_send_order() {
        let id = create(1, "q-order").unwrap();
        send(id, 1, b"m1").unwrap();
        send(id, 1, b"m2").unwrap();
        send(id, 1, b"m3").unwrap();

        assert_eq!(receive(id, 2, false).unwrap().payload, b"m1");
        assert_eq!(receive(id, 2, false).unwrap().payload, b"m2");
        assert_eq!(receive(id, 2, false).unwrap().payload, b"m3");
        destroy(id).unwrap();
    }

    #[test]
    fn send_wakes_the_parked_receiver() {
        let id = create(1, "q-wake").unwrap();
        let receiver = process::create("receiver", 0);

        // Simulate the parking half of receive() without actually
        // yielding, since there's no second thread of execution to
        // resume us in a host test.
        process::set_state(receiver, ProcessState::Waiting).unwrap();
        process::set_waiting_on(receiver, WaitChannel::Queue(id)).unwrap();
        crate::task::scheduler::remove(receiver);
        REGISTRY.lock().get_mut(id).unwrap().waiters.push_back(receiver);

        send(id, 1, b"hello").unwrap();

        assert_eq!(process::get(receiver).unwrap().state, ProcessState::Ready);
        assert_eq!(process::get(receiver).unwrap().waiting_on, WaitChannel::None);

        destroy(id).unwrap();
        let _ = process::terminate(receiver);
    }

    #[test]
    fn queue_rejects_sends_past_its_bound() {
        let id = create(1, "q-bound").unwrap();
        for _ in 0..KernelConfig::MAX_MESSAGES_PER_QUEUE {
            send(id, 1, b"x").unwrap();
        }
        assert_eq!(send(id, 1, b"x"), Err(QueueError::Full));
        receive(id, 2, false).unwrap();
        send(id, 1, b"x").unwrap();
        destroy(id).unwrap();
    }

    #[test]
    fn destroy_wakes_waiters_before_deleting() {
        let id = create(1, "q-destroy").unwrap();
        let receiver = process::create("receiver2", 0);
        process::set_state(receiver, ProcessState::Waiting).unwrap();
        process::set_waiting_on(receiver, WaitChannel::Queue(id)).unwrap();
        crate::task::scheduler::remove(receiver);
        REGISTRY.lock().get_mut(id).unwrap().waiters.push_back(receiver);

        destroy(id).unwrap();

        assert_eq!(process::get(receiver).unwrap().state, ProcessState::Ready);
        assert_eq!(open("q-destroy"), Err(QueueError::NotFound));
        let _ = process::terminate(receiver);
    }

    #[test]
    fn duplicate_names_are_rejected_until_destroyed() {
        let id = create(1, "q-dup").unwrap();
        assert_eq!(create(1, "q-dup"), Err(QueueError::NameExists));
        destroy(id).unwrap();
        assert!(create(1, "q-dup").is_ok());
        destroy(open("q-dup").unwrap()).unwrap();
    }
}
