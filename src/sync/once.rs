//! One-shot initialization barrier (`OnceFlag`/`call_once`).
//!
//! Grounded on `distortos`' once-flag pattern described alongside
//! `ConditionVariable` in `examples/original_source` — a `done` flag
//! guarded by an inline intrusive waiters list "used like a mutex" rather
//! than a real [`crate::mutex::MutexCb`], since a once-flag has no owner
//! to track and no priority protocol to apply, just mutual exclusion over
//! who gets to run the initializer.
use crate::klock::{lock_cpu, CpuLockCell};
use crate::scheduler::{Scheduler, UnblockReason};
use crate::task::ThreadState;
use crate::wait::ThreadList;

pub struct OnceFlag<P: crate::port::Port> {
    done: CpuLockCell<P, bool>,
    locked: CpuLockCell<P, bool>,
    waiters: ThreadList<P>,
}

// Safety: every field is only ever touched while CPU Lock is held.
unsafe impl<P: crate::port::Port> Sync for OnceFlag<P> {}

impl<P: crate::port::Port> OnceFlag<P> {
    pub const fn new() -> Self {
        OnceFlag {
            done: CpuLockCell::new(false),
            locked: CpuLockCell::new(false),
            waiters: ThreadList::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        let g = lock_cpu::<P>();
        self.done.get(&*g)
    }

    /// Run `f` exactly once across every caller that ever calls
    /// `call_once` on this flag, however many threads race to get here
    /// first. Callers that lose the race block until the winner finishes,
    /// then return without having run `f` themselves.
    pub fn call_once<F: FnOnce()>(&'static self, scheduler: &Scheduler<P>, f: F) {
        let mut g = lock_cpu::<P>();
        if self.done.get(&*g) {
            return;
        }
        loop {
            if !self.locked.get(&*g) {
                self.locked.set(&mut *g, true);
                break;
            }
            let _ = scheduler.block_current(&mut g, &self.waiters, ThreadState::BlockedOnBarrier, None);
            if self.done.get(&*g) {
                return;
            }
        }
        // Run the initializer outside CPU Lock: it is arbitrary user code
        // that may itself block.
        drop(g);
        f();
        let mut g = lock_cpu::<P>();
        self.done.set(&mut *g, true);
        self.locked.set(&mut *g, false);
        // `unblock` removes `task` from `self.waiters` itself, via the
        // `current_list` it recorded when `task` blocked.
        while let Some(task) = self.waiters.front() {
            scheduler.unblock(&mut g, task, UnblockReason::Request);
        }
        scheduler.reschedule_locked(&mut g);
    }
}

impl<P: crate::port::Port> Default for OnceFlag<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::task::SchedulingPolicy;
    use crate::test_support::{new_task, TestPort};
    use core::cell::Cell;

    #[test]
    fn call_once_runs_the_initializer_exactly_once() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        static ONCE: OnceFlag<TestPort> = OnceFlag::new();
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();

        let runs = Cell::new(0);
        assert!(!ONCE.is_completed());
        ONCE.call_once(&SCHED, || runs.set(runs.get() + 1));
        assert!(ONCE.is_completed());
        ONCE.call_once(&SCHED, || runs.set(runs.get() + 1));
        ONCE.call_once(&SCHED, || runs.set(runs.get() + 1));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn is_completed_reflects_state_before_and_after() {
        static ONCE: OnceFlag<TestPort> = OnceFlag::new();
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();

        assert!(!ONCE.is_completed());
        ONCE.call_once(&SCHED, || {});
        assert!(ONCE.is_completed());
    }
}
