//! Mutex: mutual exclusion with an optional priority protocol.
//!
//! Grounded on `r3_kernel::mutex` for the ceiling protocol and the
//! owned-mutexes linkage it uses to recompute a task's boosted priority,
//! generalized with the priority-inheritance algorithm from
//! `distortos::internal::synchronization::MutexControlBlock` (see
//! `examples/original_source/include/distortos/internal/synchronization/MutexControlBlock.hpp`),
//! which r3_kernel itself does not implement.
use core::ptr::NonNull;

use crate::error::{Error, KernelResult};
use crate::klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockToken};
use crate::list::{Link, Linked};
use crate::port::Port;
use crate::scheduler::{Scheduler, UnblockReason};
use crate::task::{Priority, TaskCb, ThreadState};
use crate::time::Instant;
use crate::wait::ThreadList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    Normal,
    ErrorCheck,
    Recursive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    None,
    PriorityInheritance,
    PriorityProtect,
}

pub struct MutexCb<P: Port> {
    link: Link<MutexCb<P>>,
    waiters: ThreadList<P>,
    owner: CpuLockCell<P, Option<NonNull<TaskCb<P>>>>,
    recursive_locks: CpuLockCell<P, u16>,
    /// Set when the previous owner terminated while holding this lock and
    /// nobody has called [`mark_consistent`](MutexCb::mark_consistent)
    /// yet. Cleared by `mark_consistent`, or turned permanent (`broken`)
    /// if the mutex is unlocked while still set.
    abandoned: CpuLockCell<P, bool>,
    /// Set once an abandoned mutex is released without ever being marked
    /// consistent: the mutex can never be locked again.
    broken: CpuLockCell<P, bool>,
    mtype: MutexType,
    protocol: MutexProtocol,
    priority_ceiling: Priority,
}

unsafe impl<P: Port> Linked for MutexCb<P> {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

// Safety: every field is either immutable after construction or a
// `CpuLockCell`/`ThreadList`, both only ever touched while CPU Lock is
// held; the raw pointers inside are what block auto-derivation, not any
// genuine concurrent access on this kernel's single core.
unsafe impl<P: Port> Sync for MutexCb<P> {}

impl<P: Port> MutexCb<P> {
    pub const fn new(mtype: MutexType, protocol: MutexProtocol, priority_ceiling: Priority) -> Self {
        MutexCb {
            link: Link::new(),
            waiters: ThreadList::new(),
            owner: CpuLockCell::new(None),
            recursive_locks: CpuLockCell::new(0),
            abandoned: CpuLockCell::new(false),
            broken: CpuLockCell::new(false),
            mtype,
            protocol,
            priority_ceiling,
        }
    }

    /// Blocking lock: waits indefinitely if already held.
    pub fn lock(&'static self, scheduler: &Scheduler<P>) -> KernelResult<()> {
        self.lock_impl(scheduler, None, false)
    }

    /// Returns `Err(Error::Busy)` immediately instead of blocking.
    pub fn try_lock(&'static self, scheduler: &Scheduler<P>) -> KernelResult<()> {
        self.lock_impl(scheduler, None, true)
    }

    /// Blocks until acquired or `deadline`, whichever comes first.
    pub fn lock_until(&'static self, scheduler: &Scheduler<P>, deadline: Instant) -> KernelResult<()> {
        self.lock_impl(scheduler, Some(deadline), false)
    }

    fn lock_impl(
        &'static self,
        scheduler: &Scheduler<P>,
        deadline: Option<Instant>,
        try_only: bool,
    ) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        let current = scheduler
            .current_locked(&g)
            .expect("mutex lock from no running task");

        if self.broken.get(&*g) {
            return Err(Error::NotRecoverable);
        }

        if self.owner.get(&*g) == Some(current) {
            return match self.mtype {
                MutexType::Recursive => match self.recursive_locks.get(&*g).checked_add(1) {
                    Some(next) => {
                        self.recursive_locks.set(&mut *g, next);
                        Ok(())
                    }
                    None => Err(Error::Again),
                },
                MutexType::ErrorCheck => Err(Error::Deadlk),
                MutexType::Normal => {
                    // Relocking a Normal mutex from its own owner is
                    // undefined by design (spec'd as "treat as deadlock").
                    // A debug build turns that into a loud, immediate
                    // failure instead of the silent self-deadlock a
                    // release build produces by falling into the same
                    // contended path used for every other thread.
                    if cfg!(debug_assertions) {
                        P::fatal_error(format_args!("Normal mutex relocked by its own owner"));
                    }
                    self.block_on_contended(scheduler, &mut g, current, deadline, try_only)
                }
            };
        }

        if self.owner.get(&*g).is_none() {
            if self.protocol == MutexProtocol::PriorityProtect {
                // Safety: `current` is the running task.
                let requester_priority = unsafe { current.as_ref() }.effective_priority(&*g);
                if requester_priority > self.priority_ceiling {
                    return Err(Error::Inval);
                }
            }
            self.acquire(current, &mut g);
            // Safety: `current` is the running task.
            recompute_boosted_priority(unsafe { current.as_ref() }, &mut g);
            scheduler.reschedule_locked(&mut g);
            return if self.abandoned.get(&*g) { Err(Error::Owned) } else { Ok(()) };
        }

        self.block_on_contended(scheduler, &mut g, current, deadline, try_only)
    }

    /// Install `task` as the uncontended new owner, linking the mutex into
    /// its `owned_mutexes`.
    fn acquire(&'static self, task: NonNull<TaskCb<P>>, g: &mut CpuLockGuard<P>) {
        self.owner.set(&mut **g, Some(task));
        self.recursive_locks.set(&mut **g, 1);
        // Safety: this mutex was just confirmed unowned, hence not
        // presently linked into any owner's list; `g` proves CPU Lock.
        unsafe {
            task.as_ref().owned_mutexes.push_back(NonNull::from(self));
        }
    }

    /// Clear the inconsistent-state flag after verifying and repairing
    /// whatever invariant the previous owner's termination may have
    /// broken. Only the mutex's current owner may call this, and only
    /// while it is actually abandoned; otherwise a plain `Perm`/`Inval`.
    pub fn mark_consistent(&'static self, scheduler: &Scheduler<P>) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        let current = scheduler
            .current_locked(&g)
            .expect("mark_consistent from no running task");
        if self.owner.get(&*g) != Some(current) {
            return Err(Error::Perm);
        }
        if !self.abandoned.get(&*g) {
            return Err(Error::Inval);
        }
        self.abandoned.set(&mut *g, false);
        Ok(())
    }

    fn block_on_contended(
        &'static self,
        scheduler: &Scheduler<P>,
        g: &mut CpuLockGuard<P>,
        current: NonNull<TaskCb<P>>,
        deadline: Option<Instant>,
        try_only: bool,
    ) -> KernelResult<()> {
        if try_only {
            return Err(Error::Busy);
        }
        if self.protocol == MutexProtocol::PriorityInheritance {
            // Safety: `current` is the running task.
            unsafe { current.as_ref() }
                .wait
                .modify(&mut **g, |w| w.blocking_mutex = Some(NonNull::from(self)));
            let requester_priority = unsafe { current.as_ref() }.effective_priority(&**g);
            if let Some(owner) = self.owner.get(&**g) {
                boost_chain(unsafe { owner.as_ref() }, requester_priority, g);
            }
        }
        // On resume, ownership was already transferred by `unlock` before
        // it woke us — nothing left to do but propagate the wait result,
        // overridden if the mutex we just received was abandoned.
        let result = scheduler.block_current(g, &self.waiters, ThreadState::BlockedOnMutex, deadline);
        match result {
            Ok(()) if self.abandoned.get(&**g) => Err(Error::Owned),
            other => other,
        }
    }

    pub fn unlock(&'static self, scheduler: &Scheduler<P>) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        self.unlock_locked(scheduler, &mut g)
    }

    /// Same as [`unlock`](Self::unlock), for callers (condition variables)
    /// that already hold CPU Lock and want to fold the release into a
    /// larger critical section.
    pub(crate) fn unlock_locked(
        &'static self,
        scheduler: &Scheduler<P>,
        g: &mut CpuLockGuard<P>,
    ) -> KernelResult<()> {
        let current = scheduler
            .current_locked(g)
            .expect("mutex unlock from no running task");
        if self.owner.get(&**g) != Some(current) {
            return Err(Error::Perm);
        }
        let remaining = self.recursive_locks.get(&**g) - 1;
        self.recursive_locks.set(&mut **g, remaining);
        if remaining > 0 {
            return Ok(());
        }
        // Safety: `current` owns this mutex, hence it is linked into
        // `current`'s `owned_mutexes`; `g` proves CPU Lock.
        unsafe {
            current.as_ref().owned_mutexes.remove(NonNull::from(self));
        }
        // Safety: `g` proves CPU Lock.
        match self.waiters.front() {
            None => {
                self.owner.set(&mut **g, None);
                if self.abandoned.get(&**g) {
                    // Released without ever being marked consistent: the
                    // mutex can never be locked again.
                    self.broken.set(&mut **g, true);
                }
                recompute_boosted_priority(unsafe { current.as_ref() }, g);
            }
            Some(next) => {
                // `unblock` removes `next` from `self.waiters` itself, via
                // the `current_list` it recorded when `next` blocked.
                self.acquire(next, g);
                scheduler.unblock(g, next, UnblockReason::Request);
                recompute_boosted_priority(unsafe { current.as_ref() }, g);
                recompute_boosted_priority(unsafe { next.as_ref() }, g);
            }
        }
        scheduler.reschedule_locked(g);
        Ok(())
    }
}

impl<P: Port> Drop for MutexCb<P> {
    /// Destroying a locked mutex is UB per spec; a debug build turns it
    /// into a fatal assertion instead of leaving dangling waiters.
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            let g = lock_cpu::<P>();
            if self.owner.get(&*g).is_some() {
                P::fatal_error(format_args!("mutex destroyed while still locked"));
            }
        }
    }
}

/// Raise `owner`'s boosted priority to at least `to` and, if that actually
/// changes its effective priority, reposition it and keep propagating up
/// the ownership chain (`owner` blocked on another inheritance mutex whose
/// owner must then also be boosted, and so on).
///
/// This is the cheap "push up" half of priority inheritance, used when a
/// new waiter arrives; [`recompute_boosted_priority`] is the more thorough
/// "pull down" half used whenever a boost might need to *decrease*.
fn boost_chain<P: Port>(owner: &TaskCb<P>, to: Priority, g: &mut CpuLockGuard<P>) {
    if to <= owner.boosted_priority.get(&**g) {
        return;
    }
    let old_effective = owner.effective_priority(&**g);
    owner.boosted_priority.set(&mut **g, to);
    if owner.effective_priority(&**g) == old_effective {
        return;
    }
    reposition_on_current_list(owner, &**g);
    if let Some(mutex) = owner.wait.get(&**g).blocking_mutex {
        // Safety: `blocking_mutex` only ever names a `'static` mutex this
        // task is presently waiting on.
        if let Some(next_owner) = unsafe { mutex.as_ref() }.owner.get(&**g) {
            boost_chain(unsafe { next_owner.as_ref() }, to, g);
        }
    }
}

/// Recompute `task`'s boosted priority from scratch as the max of (a) the
/// ceilings of its owned `PriorityProtect` mutexes and (b) the effective
/// priority of the highest-priority waiter on each owned
/// `PriorityInheritance` mutex. Called whenever a boost might need to
/// shrink: on unlock, and on a base-priority change.
pub(crate) fn recompute_boosted_priority<P: Port>(task: &TaskCb<P>, g: &mut CpuLockGuard<P>) {
    let mut boosted: Priority = 0;
    // Safety: `owned_mutexes` is only ever mutated under CPU
    // Lock, which `g` proves is held.
    unsafe {
        for m in task.owned_mutexes.iter() {
            let m = m.as_ref();
            let candidate = match m.protocol {
                MutexProtocol::PriorityProtect => m.priority_ceiling,
                MutexProtocol::PriorityInheritance => m
                    .waiters
                    .front()
                    .map(|w| w.as_ref().effective_priority(&**g))
                    .unwrap_or(0),
                MutexProtocol::None => 0,
            };
            boosted = boosted.max(candidate);
        }
    }
    let old_effective = task.effective_priority(&**g);
    task.boosted_priority.set(&mut **g, boosted);
    if task.effective_priority(&**g) == old_effective {
        return;
    }
    reposition_on_current_list(task, &**g);
    if let Some(mutex) = task.wait.get(&**g).blocking_mutex {
        // Safety: as above.
        if let Some(owner) = unsafe { mutex.as_ref() }.owner.get(&**g) {
            recompute_boosted_priority(unsafe { owner.as_ref() }, g);
        }
    }
}

/// Re-sort `task` on whatever list presently holds it after its effective
/// priority changed. A no-op if it is the running task (`current_list`
/// is `None` exactly then) — nothing to resort until it next blocks.
fn reposition_on_current_list<P: Port>(task: &TaskCb<P>, tok: &CpuLockToken<P>) {
    let ptr = NonNull::from(task);
    if let Some(list) = task.wait.get(tok).current_list {
        // Safety: `task` is linked into `*list` by the `current_list`
        // invariant; `tok` proves CPU Lock.
        unsafe {
            (*list.as_ptr()).remove(ptr);
            (*list.as_ptr()).insert(ptr, tok);
        }
    }
}

/// Release every mutex `task` still owns when it exits, so waiters are not
/// abandoned forever and the priority boosts they caused are cleared.
/// Every released mutex is marked [`abandoned`](MutexCb::abandoned) —
/// whoever ends up owning it next (directly, or via hand-off to a waiter)
/// gets `Err(Error::Owned)` back from its lock call and must call
/// [`MutexCb::mark_consistent`] before the state it protects can be
/// trusted again.
pub(crate) fn abandon_owned_mutexes<P: Port>(
    _scheduler: &Scheduler<P>,
    task: NonNull<TaskCb<P>>,
    g: &mut CpuLockGuard<P>,
) {
    // Safety: `g` proves CPU Lock.
    while let Some(mutex) = unsafe { task.as_ref().owned_mutexes.front() } {
        // Safety: just read from the list it is linked into.
        unsafe { task.as_ref().owned_mutexes.remove(mutex) };
        let m = unsafe { mutex.as_ref() };
        m.abandoned.set(&mut **g, true);
        match m.waiters.front() {
            None => {
                m.owner.set(&mut **g, None);
            }
            Some(next) => {
                // `unblock` removes `next` from `m.waiters` itself, via the
                // `current_list` it recorded when `next` blocked.
                m.acquire(next, g);
                _scheduler.unblock(g, next, UnblockReason::Request);
                recompute_boosted_priority(unsafe { next.as_ref() }, g);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock::lock_cpu;
    use crate::scheduler::Scheduler;
    use crate::task::SchedulingPolicy;
    use crate::test_support::{new_task, TestPort};

    #[test]
    fn uncontended_lock_unlock_round_trip() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        static MUTEX: MutexCb<TestPort> = MutexCb::new(MutexType::Normal, MutexProtocol::None, 0);
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));
        // Idempotent: a second lock/unlock cycle behaves the same.
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));
    }

    #[test]
    fn recursive_mutex_tracks_nested_lock_count() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        static MUTEX: MutexCb<TestPort> = MutexCb::new(MutexType::Recursive, MutexProtocol::None, 0);
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));
        // Fully unwound: one more unlock is a permission error, not a no-op.
        assert_eq!(MUTEX.unlock(&SCHED), Err(Error::Perm));
    }

    #[test]
    fn error_check_mutex_reports_self_relock_as_deadlock() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        static MUTEX: MutexCb<TestPort> = MutexCb::new(MutexType::ErrorCheck, MutexProtocol::None, 0);
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        assert_eq!(MUTEX.lock(&SCHED), Err(Error::Deadlk));
    }

    #[test]
    fn priority_protect_rejects_lock_above_ceiling() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        static MUTEX: MutexCb<TestPort> = MutexCb::new(MutexType::Normal, MutexProtocol::PriorityProtect, 10);
        let task = new_task(20, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();
        assert_eq!(MUTEX.lock(&SCHED), Err(Error::Inval));
    }

    #[test]
    fn priority_protect_boosts_owner_to_ceiling() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        static MUTEX: MutexCb<TestPort> = MutexCb::new(MutexType::Normal, MutexProtocol::PriorityProtect, 50);
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        let g = lock_cpu::<TestPort>();
        assert_eq!(task.effective_priority(&g), 50);
        drop(g);
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));
        let g = lock_cpu::<TestPort>();
        assert_eq!(task.effective_priority(&g), 5);
    }

    #[test]
    fn mark_consistent_recovers_from_abandonment() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        static MUTEX: MutexCb<TestPort> = MutexCb::new(MutexType::Normal, MutexProtocol::None, 0);
        let low = new_task(1, SchedulingPolicy::Fifo, 0);
        let high = new_task(10, SchedulingPolicy::Fifo, 0);

        SCHED.add_task(low).unwrap();
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));

        // Adding a strictly higher-priority task preempts `low` without
        // either task ever calling a blocking API.
        SCHED.add_task(high).unwrap();
        {
            let g = lock_cpu::<TestPort>();
            assert_eq!(SCHED.current_locked(&g), Some(NonNull::from(high)));
        }

        // `low` is gone without releasing the mutex: abandon it exactly as
        // `Scheduler::exit_current` would.
        {
            let mut g = lock_cpu::<TestPort>();
            abandon_owned_mutexes(&SCHED, NonNull::from(low), &mut g);
        }

        // `high` inherits the abandoned mutex and is told to verify it.
        assert_eq!(MUTEX.lock(&SCHED), Err(Error::Owned));
        assert_eq!(MUTEX.mark_consistent(&SCHED), Ok(()));
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));

        // Fully recovered: a fresh lock/unlock cycle raises nothing.
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));
    }

    #[test]
    fn mutex_becomes_permanently_unusable_if_never_marked_consistent() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        static MUTEX: MutexCb<TestPort> = MutexCb::new(MutexType::Normal, MutexProtocol::None, 0);
        let low = new_task(1, SchedulingPolicy::Fifo, 0);
        let high = new_task(10, SchedulingPolicy::Fifo, 0);

        SCHED.add_task(low).unwrap();
        assert_eq!(MUTEX.lock(&SCHED), Ok(()));
        SCHED.add_task(high).unwrap();
        {
            let mut g = lock_cpu::<TestPort>();
            abandon_owned_mutexes(&SCHED, NonNull::from(low), &mut g);
        }

        // `high` picks it up, never calls `mark_consistent`, and releases
        // it: the mutex is now broken for everyone.
        assert_eq!(MUTEX.lock(&SCHED), Err(Error::Owned));
        assert_eq!(MUTEX.unlock(&SCHED), Ok(()));
        assert_eq!(MUTEX.lock(&SCHED), Err(Error::NotRecoverable));
    }
}
