//! The generic sorted-waiter-list substrate shared by the ready queue, the
//! suspended queue, and every mutex/semaphore/condition-variable/barrier
//! waiters list.
//!
//! Grounded on `r3_kernel`'s `wait::WaitQueue` (which plays the same role
//! for r3's mutex/semaphore/event-group waiters) generalized to also serve
//! as the scheduler's run queue, per `distortos`' `ThreadList` — in that
//! design the run queue, the suspended queue and every primitive's waiters
//! list are all literally the same sorted-intrusive-list type.
use core::ptr::NonNull;

use crate::klock::CpuLockToken;
use crate::list::List;
use crate::port::Port;
use crate::task::TaskCb;

/// A sorted intrusive list of [`TaskCb`]s, descending by effective
/// priority with FIFO order among ties.
///
/// All mutating methods require a CPU Lock token to read the priorities
/// they sort by, which also happens to document that every mutation must
/// run with interrupts masked.
pub struct ThreadList<P: Port> {
    list: List<TaskCb<P>>,
}

impl<P: Port> ThreadList<P> {
    pub const fn new() -> Self {
        ThreadList { list: List::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// The highest-effective-priority member, i.e. the one a `wait()` on
    /// this list would wake first.
    pub fn front(&self) -> Option<NonNull<TaskCb<P>>> {
        self.list.front()
    }

    /// Insert `task`, descending by effective priority, after every
    /// existing member of equal priority (FIFO among ties).
    ///
    /// # Safety
    /// `task` must not presently be linked into any list, and CPU Lock
    /// must be held for the duration of the call.
    pub unsafe fn insert(&self, task: NonNull<TaskCb<P>>, tok: &CpuLockToken<P>) {
        self.insert_with(task, tok, false)
    }

    /// Insert `task` *before* existing equal-priority peers instead of
    /// after — used to implement the `always_behind = false` branch of
    /// `Scheduler::set_priority`'s re-insertion rule (placing a
    /// lowered-priority thread at the head of its new, lower band).
    ///
    /// # Safety
    /// Same as [`insert`](Self::insert).
    pub unsafe fn insert_before_equal(&self, task: NonNull<TaskCb<P>>, tok: &CpuLockToken<P>) {
        self.insert_with(task, tok, true)
    }

    unsafe fn insert_with(
        &self,
        task: NonNull<TaskCb<P>>,
        tok: &CpuLockToken<P>,
        before_equal: bool,
    ) {
        let key = task.as_ref().effective_priority(tok);
        self.list.insert_sorted_by(task, |a, b| {
            let pa = a.effective_priority(tok);
            let pb = b.effective_priority(tok);
            // Descending by priority: an existing member ahead of the new
            // task (`Greater`) stays ahead unless its priority is strictly
            // lower. Ties land after existing equal-priority members
            // (FIFO order) except when repositioning wants them to cut in
            // front instead (`before_equal`, used to re-seat a
            // just-lowered-priority task at the head of its new band).
            match pb.cmp(&pa) {
                core::cmp::Ordering::Equal if before_equal => core::cmp::Ordering::Less,
                core::cmp::Ordering::Equal => core::cmp::Ordering::Greater,
                other => other,
            }
        });
        debug_assert_eq!(task.as_ref().effective_priority(tok), key);
    }

    /// # Safety
    /// `task` must currently be linked into this list, and CPU Lock must be
    /// held.
    pub unsafe fn remove(&self, task: NonNull<TaskCb<P>>) {
        self.list.remove(task);
    }

    /// # Safety
    /// CPU Lock must be held and the list must not be mutated through
    /// another path while the iterator is alive.
    pub unsafe fn iter(&self) -> crate::list::Iter<'_, TaskCb<P>> {
        self.list.iter()
    }
}

impl<P: Port> Default for ThreadList<P> {
    fn default() -> Self {
        Self::new()
    }
}
