//! Syscall dispatch surface for the IPC layer.
//!
//! A single numeric-keyed entry point, `dispatch`, so a trap/entry
//! collaborator outside this core only has to marshal raw registers into
//! four integers and hand them here — it never needs to know about
//! `ipc::queue` or `ipc::shm` directly.

use crate::ipc::{queue, shm};
use crate::task::process;

/// Syscall numbers the core answers.
pub mod nr {
    pub const MSG_CREATE: u64 = 100;
    pub const MSG_DESTROY: u64 = 101;
    pub const MSG_OPEN: u64 = 102;
    pub const MSG_SEND: u64 = 103;
    pub const MSG_RECEIVE: u64 = 104;
    pub const SHM_CREATE: u64 = 105;
    pub const SHM_DESTROY: u64 = 106;
    pub const SHM_ATTACH: u64 = 107;
    pub const SHM_DETACH: u64 = 108;
}

/// The upper bound of user-space canonical addresses; anything at or
/// above this is kernel memory and never a valid user pointer.
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Validates that `[ptr, ptr+len)` is non-null, non-overflowing, and
/// entirely below the kernel/user split.
fn validate_user_ptr(ptr: u64, len: usize) -> bool {
    if ptr == 0 {
        return false;
    }
    match ptr.checked_add(len as u64) {
        Some(end) => end <= USER_SPACE_END,
        None => false,
    }
}

/// Reads a UTF-8 name out of a user buffer `(ptr, len)`, capped at
/// `queue::MAX_QUEUE_NAME` bytes — anything naming a queue can't be
/// longer than what the registry would store anyway.
unsafe fn read_user_name(ptr: u64, len: u64) -> Option<&'static str> {
    let len = (len as usize).min(queue::MAX_QUEUE_NAME);
    if !validate_user_ptr(ptr, len) {
        return None;
    }
    let slice = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
    core::str::from_utf8(slice).ok()
}

fn current_pid() -> process::Pid {
    process::current().map(|p| p.pid).unwrap_or(0)
}

/// Dispatches one syscall. Returns `-1` for any failure (unknown number,
/// bad pointer, or a subsystem error) and the documented success value
/// otherwise, matching the table's `0 / -1` and `id / -1` conventions.
///
/// # Safety
/// `a0`/`a1`/`a2` are treated as raw user pointers for some syscall
/// numbers (`MSG_CREATE`'s name, `MSG_SEND`'s payload, `MSG_RECEIVE`'s
/// output buffer). The caller must ensure these came from the faulting
/// process's own validated address space.
pub unsafe fn dispatch(nr: u64, a0: u64, a1: u64, a2: u64) -> i64 {
    let pid = current_pid();
    match nr {
        nr::MSG_CREATE => {
            let Some(name) = (unsafe { read_user_name(a0, a1) }) else {
                return -1;
            };
            queue::create(pid, name).map(|id| id as i64).unwrap_or(-1)
        }
        nr::MSG_DESTROY => queue::destroy(a0).map(|_| 0).unwrap_or(-1),
        nr::MSG_OPEN => {
            let Some(name) = (unsafe { read_user_name(a0, a1) }) else {
                return -1;
            };
            queue::open(name).map(|id| id as i64).unwrap_or(-1)
        }
        nr::MSG_SEND => {
            let size = a2 as usize;
            if !validate_user_ptr(a1, size) {
                return -1;
            }
            let data = unsafe { core::slice::from_raw_parts(a1 as *const u8, size) };
            queue::send(a0, pid, data).map(|_| 0).unwrap_or(-1)
        }
        nr::MSG_RECEIVE => {
            let out_ptr = a1;
            let wait = a2 != 0;
            match queue::receive(a0, pid, wait) {
                Ok(msg) => {
                    if !validate_user_ptr(out_ptr, msg.payload.len()) {
                        return -1;
                    }
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            msg.payload.as_ptr(),
                            out_ptr as *mut u8,
                            msg.payload.len(),
                        )
                    };
                    0
                }
                Err(_) => -1,
            }
        }
        nr::SHM_CREATE => shm::create(pid, a0).map(|id| id as i64).unwrap_or(-1),
        nr::SHM_DESTROY => shm::destroy(a0).map(|_| 0).unwrap_or(-1),
        nr::SHM_ATTACH => shm::attach(a0, pid).map(|va| va.as_u64() as i64).unwrap_or(0),
        nr::SHM_DETACH => shm::detach(a0, pid).map(|_| 0).unwrap_or(-1),
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_returns_failure() {
        assert_eq!(unsafe { dispatch(9999, 0, 0, 0) }, -1);
    }

    #[test]
    fn msg_create_and_destroy_round_trip() {
        let name = b"syscall-q\0";
        let id = unsafe { dispatch(nr::MSG_CREATE, name.as_ptr() as u64, 9, 0) };
        assert!(id >= 0);
        assert_eq!(unsafe { dispatch(nr::MSG_DESTROY, id as u64, 0, 0) }, 0);
    }

    #[test]
    fn msg_send_and_receive_round_trip() {
        let name = b"syscall-q2";
        let id = unsafe { dispatch(nr::MSG_CREATE, name.as_ptr() as u64, name.len() as u64, 0) };
        assert!(id >= 0);

        let payload = b"hi";
        let sent = unsafe {
            dispatch(nr::MSG_SEND, id as u64, payload.as_ptr() as u64, payload.len() as u64)
        };
        assert_eq!(sent, 0);

        let mut out = [0u8; 2];
        let received = unsafe {
            dispatch(nr::MSG_RECEIVE, id as u64, out.as_mut_ptr() as u64, 0)
        };
        assert_eq!(received, 0);
        assert_eq!(&out, payload);

        assert_eq!(unsafe { dispatch(nr::MSG_DESTROY, id as u64, 0, 0) }, 0);
    }

    #[test]
    fn null_pointer_is_rejected() {
        assert_eq!(unsafe { dispatch(nr::MSG_CREATE, 0, 4, 0) }, -1);
    }
}
