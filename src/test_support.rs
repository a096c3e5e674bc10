//! Shared test-only `Port` and task-construction helpers.
//!
//! `Scheduler::reschedule` only ever updates bookkeeping (see its doc
//! comment in `scheduler.rs`): the actual register-level switch happens
//! later, when a real port's trampoline calls `on_context_switch`. That
//! means every dispatch decision, priority boost, and wait-queue transition
//! this crate makes is observable without ever performing a real context
//! switch, so a single OS thread driving the production API directly is
//! enough to exercise it — no analogue of `r3_port_std`'s green-thread
//! machinery is needed here.
//!
//! What a single OS thread genuinely cannot exercise is a blocking call
//! actually suspending and later resuming a *different* call stack (the
//! task that blocked only "returns" from `block_current` once some other
//! execution flow unblocks it); those round trips are this crate's
//! counterpart to `r3_port_std`'s job, not this kernel's, so the tests below
//! stick to the bookkeeping a single thread can observe directly.
use core::cell::Cell;
use core::fmt;
use core::mem::MaybeUninit;

use crate::port::Port;
use crate::stack::Stack;
use crate::task::{Priority, SchedulingPolicy, TaskCb};

pub(crate) struct TestPort;

std::thread_local! {
    static CPU_LOCK_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

unsafe impl Port for TestPort {
    type StackContext = u32;

    unsafe fn enter_cpu_lock() {
        CPU_LOCK_ACTIVE.with(|c| {
            assert!(!c.get(), "CPU Lock entered while already active");
            c.set(true);
        });
    }

    unsafe fn leave_cpu_lock() {
        CPU_LOCK_ACTIVE.with(|c| c.set(false));
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK_ACTIVE.with(|c| c.get())
    }

    fn is_task_context() -> bool {
        true
    }

    fn initialize_stack(
        _stack: &mut [MaybeUninit<u8>],
        _entry: extern "C" fn(usize) -> !,
        _arg: usize,
    ) -> u32 {
        0
    }

    fn request_context_switch() {}

    fn fatal_error(args: fmt::Arguments<'_>) -> ! {
        panic!("{args}");
    }
}

extern "C" fn unreachable_entry(_arg: usize) -> ! {
    unreachable!("test tasks are never really dispatched onto a stack")
}

/// Leak a 256-byte stack and task control block, ready for
/// `Scheduler::add_task`. Tests never exit, so leaking is fine.
pub(crate) fn new_task(priority: Priority, policy: SchedulingPolicy, quantum: u32) -> &'static TaskCb<TestPort> {
    let region: &'static mut [MaybeUninit<u8>; 256] = Box::leak(Box::new([MaybeUninit::uninit(); 256]));
    let stack = Stack::new(region);
    let task = TaskCb::new(stack, unreachable_entry, 0, priority, policy, quantum);
    Box::leak(Box::new(task))
}
