//! Thread control block: the kernel's per-task state.
//!
//! Field granularity is grounded on `r3_kernel`'s `TaskCb` (several small
//! `CpuLockCell`s rather than one coarse lock), generalized with the
//! blocking taxonomy and round-robin quantum bookkeeping from `distortos`'
//! `ThreadControlBlock.hpp`/`ThreadState.hpp` (see `examples/original_source`).
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::error::KernelResult;
use crate::id::ThreadIdentifier;
use crate::klock::{lock_cpu, CpuLockCell, CpuLockToken};
use crate::list::{Link, Linked};
use crate::mutex::MutexCb;
use crate::port::Port;
use crate::stack::Stack;
use crate::time::Instant;
use crate::wait::ThreadList;

/// `0` is the lowest priority, `255` the highest, matching the kernel's
/// public numbering.
pub type Priority = u8;

pub const LOWEST_PRIORITY: Priority = 0;
pub const HIGHEST_PRIORITY: Priority = Priority::MAX;

/// Mirrors `distortos::ThreadState` restricted to what the scheduler core
/// needs (signal-waiting and the detached state belong to the user-facing
/// thread wrapper this crate does not implement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed, not yet handed to [`crate::scheduler::Scheduler::add_task`].
    Created,
    /// Runnable: either queued on the ready list or presently the task
    /// being executed (the scheduler's `running` pointer disambiguates).
    Runnable,
    Sleeping,
    BlockedOnSemaphore,
    BlockedOnMutex,
    BlockedOnConditionVariable,
    BlockedOnBarrier,
    Suspended,
    /// Ran to completion; eligible for reactivation via `add_task` again.
    Terminated,
}

/// Whether a task's position among equal-effective-priority peers is fixed
/// until it blocks, or periodically rotated to the back of its priority
/// band. Mirrors `distortos::SchedulingPolicy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    Fifo,
    RoundRobin,
}

/// Bookkeeping for whatever this task is presently blocked on. Grouped
/// together (as opposed to one `CpuLockCell` per field) because every
/// field here only ever changes as part of the same block/unblock
/// transition, mirroring `r3_kernel::wait::TaskWait`.
pub(crate) struct TaskWait<P: Port> {
    /// The list the task is presently linked into — the ready list, the
    /// suspended list, or a mutex/semaphore/condvar waiters list — or
    /// `None` while it is the task actually executing (removed from its
    /// list on dispatch-in).
    pub current_list: Option<NonNull<ThreadList<P>>>,
    /// Set iff `state == BlockedOnMutex` and that mutex uses
    /// `PriorityInheritance`; lets a boost walk the ownership chain.
    pub blocking_mutex: Option<NonNull<MutexCb<P>>>,
    pub wait_result: KernelResult<()>,
    pub timeout_deadline: Option<Instant>,
}

impl<P: Port> Clone for TaskWait<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for TaskWait<P> {}

impl<P: Port> TaskWait<P> {
    const fn new() -> Self {
        TaskWait {
            current_list: None,
            blocking_mutex: None,
            wait_result: Ok(()),
            timeout_deadline: None,
        }
    }
}

pub struct TaskCb<P: Port> {
    pub(crate) link: Link<TaskCb<P>>,
    /// Membership in the software-timer supervisor's deadline-sorted list,
    /// independent of `link`: a task can be on a mutex/semaphore/condvar
    /// waiters list *and* have an armed timeout at the same time.
    pub(crate) timer_link: crate::timer::TimerLink<TaskCb<P>>,
    pub(crate) stack: UnsafeCell<Stack<P>>,
    pub(crate) entry: extern "C" fn(usize) -> !,
    pub(crate) arg: usize,
    pub(crate) policy: SchedulingPolicy,
    /// Configured round-robin slice length in ticks; meaningless under
    /// `SchedulingPolicy::Fifo`.
    pub(crate) round_robin_quantum: u32,

    pub(crate) state: CpuLockCell<P, ThreadState>,
    pub(crate) base_priority: CpuLockCell<P, Priority>,
    /// `0` means "no boost". Recomputed by
    /// [`crate::mutex::recompute_boosted_priority`] whenever a mutex this
    /// task owns gains/loses a waiter, or the task's base priority changes.
    pub(crate) boosted_priority: CpuLockCell<P, Priority>,
    pub(crate) quantum_remaining: CpuLockCell<P, u32>,
    /// Bumped each time this (statically allocated, externally owned) TCB
    /// is reactivated after running to completion, so a stale
    /// [`crate::id::ThreadIdentifier`] from a previous incarnation can
    /// never alias the new one.
    pub(crate) sequence: CpuLockCell<P, u32>,
    pub(crate) wait: CpuLockCell<P, TaskWait<P>>,
    /// Every mutex currently locked by this task, regardless of protocol:
    /// walked to recompute a priority boost when one of them gains or
    /// loses a waiter, and to release/abandon them all on thread exit. Not
    /// a `CpuLockCell` itself: list membership is a raw-pointer operation
    /// already trusted to run under CPU Lock, same as the ready list.
    pub(crate) owned_mutexes: crate::list::List<MutexCb<P>>,
}

// Safety: every mutable field is either a `CpuLockCell` (token-gated) or a
// `List`/`UnsafeCell` only ever touched while CPU Lock is held; the kernel
// never runs on more than one core, so there is no genuine concurrent
// access for `Sync` to guard against — only the auto-derivation (which
// balks at the raw pointers inside `TaskWait`/`List`) cannot see that.
unsafe impl<P: Port> Sync for TaskCb<P> {}

impl<P: Port> TaskCb<P> {
    pub const fn new(
        stack: Stack<P>,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        priority: Priority,
        policy: SchedulingPolicy,
        round_robin_quantum: u32,
    ) -> Self {
        TaskCb {
            link: Link::new(),
            timer_link: Link::new(),
            stack: UnsafeCell::new(stack),
            entry,
            arg,
            policy,
            round_robin_quantum,
            state: CpuLockCell::new(ThreadState::Created),
            base_priority: CpuLockCell::new(priority),
            boosted_priority: CpuLockCell::new(0),
            quantum_remaining: CpuLockCell::new(round_robin_quantum),
            sequence: CpuLockCell::new(0),
            wait: CpuLockCell::new(TaskWait::new()),
            owned_mutexes: crate::list::List::new(),
        }
    }

    /// `max(base_priority, boosted_priority)` — the value the ready list
    /// and every waiters list actually order by.
    pub(crate) fn effective_priority(&self, tok: &CpuLockToken<P>) -> Priority {
        self.base_priority.get(tok).max(self.boosted_priority.get(tok))
    }

    /// This task's stable identity for its current incarnation: the
    /// address of its control block paired with a sequence number bumped
    /// every time a `Terminated` task is re-activated, so an identifier
    /// captured before an exit never aliases the restarted incarnation.
    pub fn id(&self) -> ThreadIdentifier {
        let g = lock_cpu::<P>();
        self.id_locked(&g)
    }

    /// Same as [`id`](Self::id), for callers that already hold CPU Lock.
    pub(crate) fn id_locked(&self, tok: &CpuLockToken<P>) -> ThreadIdentifier {
        ThreadIdentifier::new(core::ptr::NonNull::from(self), self.sequence.get(tok))
    }

    /// # Safety
    /// Caller must hold CPU Lock and must not alias this with another live
    /// `&mut Stack<P>` to the same task.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn stack_mut(&self) -> &mut Stack<P> {
        &mut *self.stack.get()
    }
}

unsafe impl<P: Port> Linked for TaskCb<P> {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

unsafe impl<P: Port> Linked<crate::timer::TimerMarker> for TaskCb<P> {
    fn link(&self) -> &Link<Self, crate::timer::TimerMarker> {
        &self.timer_link
    }
}
