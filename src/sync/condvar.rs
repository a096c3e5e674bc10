//! Condition variable.
//!
//! Grounded on `distortos::ConditionVariable` (see
//! `examples/original_source/ConditionVariable.cpp`): `wait` atomically
//! releases the associated mutex and blocks, re-acquiring it before
//! returning to the caller, exactly mirroring that implementation's
//! `unlock()`/block/`lock()` sequence under one critical section for the
//! release half.
use crate::error::KernelResult;
use crate::klock::lock_cpu;
use crate::mutex::MutexCb;
use crate::scheduler::{Scheduler, UnblockReason};
use crate::task::ThreadState;
use crate::wait::ThreadList;

pub struct CondVarCb<P: crate::port::Port> {
    waiters: ThreadList<P>,
}

// Safety: `waiters` is only ever touched while CPU Lock is held.
unsafe impl<P: crate::port::Port> Sync for CondVarCb<P> {}

impl<P: crate::port::Port> CondVarCb<P> {
    pub const fn new() -> Self {
        CondVarCb {
            waiters: ThreadList::new(),
        }
    }

    /// Release `mutex`, block until notified (spuriously or not), then
    /// re-acquire `mutex` before returning — regardless of how the wait
    /// itself concluded, so the caller always resumes holding the mutex
    /// it passed in.
    pub fn wait(&'static self, scheduler: &Scheduler<P>, mutex: &'static MutexCb<P>) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        mutex.unlock_locked(scheduler, &mut g)?;
        let wait_result =
            scheduler.block_current(&mut g, &self.waiters, ThreadState::BlockedOnConditionVariable, None);
        drop(g);
        mutex.lock(scheduler)?;
        wait_result
    }

    /// Re-check `predicate` in a loop, waiting again each time it is still
    /// true — the standard remedy for spurious wake-ups.
    pub fn wait_while<F>(
        &'static self,
        scheduler: &Scheduler<P>,
        mutex: &'static MutexCb<P>,
        mut predicate: F,
    ) -> KernelResult<()>
    where
        F: FnMut() -> bool,
    {
        while predicate() {
            self.wait(scheduler, mutex)?;
        }
        Ok(())
    }

    pub fn notify_one(&'static self, scheduler: &Scheduler<P>) {
        let mut g = lock_cpu::<P>();
        // `unblock` removes `task` from `self.waiters` itself, via the
        // `current_list` it recorded when `task` blocked.
        if let Some(task) = self.waiters.front() {
            scheduler.unblock(&mut g, task, UnblockReason::Request);
            scheduler.reschedule_locked(&mut g);
        }
    }

    pub fn notify_all(&'static self, scheduler: &Scheduler<P>) {
        let mut g = lock_cpu::<P>();
        while let Some(task) = self.waiters.front() {
            scheduler.unblock(&mut g, task, UnblockReason::Request);
        }
        scheduler.reschedule_locked(&mut g);
    }
}

impl<P: crate::port::Port> Default for CondVarCb<P> {
    fn default() -> Self {
        Self::new()
    }
}
