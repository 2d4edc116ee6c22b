//! Kernel-stack context switch.
//!
//! The scheduler's contract for a context switch is "save callee-saved
//! registers of A, restore those of B, return on B's stack" — it makes no
//! assumptions beyond that, so this module is the only place that knows
//! what a saved context actually looks like.

use crate::sync::spinlock::SpinLock;
use crate::task::process::Pid;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

/// Size of each process's kernel-mode stack.
pub const KERNEL_STACK_SIZE: usize = 4096 * 8;

#[repr(C, align(16))]
struct KernelStack {
    data: [u8; KERNEL_STACK_SIZE],
}

impl KernelStack {
    fn top(&self) -> u64 {
        self.data.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }
}

/// A process's saved kernel stack pointer plus the stack it lives on.
struct Saved {
    kernel_rsp: u64,
    _stack: Box<KernelStack>,
}

static STACKS: SpinLock<BTreeMap<Pid, Saved>> = SpinLock::new(BTreeMap::new());

core::arch::global_asm!(
    ".global pelican_context_switch",
    "pelican_context_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

unsafe extern "C" {
    fn pelican_context_switch(old_rsp_ptr: *mut u64, new_rsp: u64);
}

/// Registers a freshly created process so it has a kernel stack to switch
/// onto. A process that has never run lands in `switch_to` with a stack
/// already laid out to return at `entry`.
pub fn prepare(pid: Pid, entry: extern "C" fn() -> !) {
    let layout = core::alloc::Layout::new::<KernelStack>();
    let stack = unsafe {
        let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
        assert!(!ptr.is_null(), "out of memory preparing kernel stack for pid {pid}");
        Box::from_raw(ptr)
    };
    let top = stack.top();
    let sp = top - 7 * 8;
    unsafe {
        let ptr = sp as *mut u64;
        ptr.add(0).write(0); // r15
        ptr.add(1).write(0); // r14
        ptr.add(2).write(0); // r13
        ptr.add(3).write(0); // r12
        ptr.add(4).write(0); // rbx
        ptr.add(5).write(0); // rbp
        ptr.add(6).write(entry as u64); // rip (ret target)
    }
    STACKS.lock().insert(
        pid,
        Saved {
            kernel_rsp: sp,
            _stack: stack,
        },
    );
}

/// Drops the kernel stack a terminated process was using.
pub fn release(pid: Pid) {
    STACKS.lock().remove(&pid);
}

/// Switches from `from`'s kernel stack to `to`'s.
///
/// # Safety
/// Both pids must have been `prepare`d, interrupts must be masked, and
/// the caller must not be holding any lock that `to`'s resumed code
/// might need to re-acquire (the scheduler drops its own lock before
/// calling this for exactly that reason).
pub unsafe fn switch_to(from: Pid, to: Pid) {
    let mut stacks = STACKS.lock();
    let old_ptr = match stacks.get_mut(&from) {
        Some(saved) => &mut saved.kernel_rsp as *mut u64,
        None => {
            // `from` has no stack yet (first schedule with no prior
            // current process) — write the discarded value nowhere that
            // matters.
            static mut DISCARD: u64 = 0;
            core::ptr::addr_of_mut!(DISCARD)
        }
    };
    let new_rsp = match stacks.get(&to) {
        Some(saved) => saved.kernel_rsp,
        None => return,
    };
    drop(stacks);
    unsafe { pelican_context_switch(old_ptr, new_rsp) };
}
