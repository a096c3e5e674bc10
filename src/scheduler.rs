//! The scheduler: run queue, suspended queue, current-task pointer, tick
//! counter, context-switch counter, and the software-timer supervisor.
//!
//! Grounded on the dispatch logic in `r3_kernel/src/task.rs`
//! (`make_ready`/`choose_next_running_task`/`unlock_cpu_and_check_preemption`),
//! generalized to the plain [`crate::wait::ThreadList`] model instead of
//! r3_kernel's const-generic priority bitmap.
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::error::{Error, KernelResult};
use crate::klock::{lock_cpu, CpuLockGuard};
use crate::port::Port;
use crate::task::{Priority, SchedulingPolicy, TaskCb, ThreadState};
use crate::time::{Duration, Instant, TickClock};
use crate::timer::{SoftwareTimerCb, SoftwareTimerSupervisor};
use crate::wait::ThreadList;

/// Reason an unblock happened, reported to the woken task via its
/// `TaskWait::wait_result` (and, for mutexes, used to decide whether
/// ownership was actually transferred).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    /// Woken by an explicit call (`mutex unlock` transferring ownership,
    /// `sem.post`, `cv.notify_*`, `Scheduler::resume`, ...).
    Request,
    /// The armed timeout fired before the wait was satisfied.
    Timeout,
    /// Interrupted by a signal (reserved for the optional signals feature;
    /// this crate's core never produces it itself).
    Interrupted,
}

pub(crate) struct SchedulerState<P: Port> {
    running: Option<NonNull<TaskCb<P>>>,
    /// The task whose context was last handed out by
    /// [`Scheduler::on_context_switch`] — i.e. whichever task is actually
    /// executing on the CPU right now, as opposed to `running` (the task
    /// the scheduler has *decided* should run, which changes the instant
    /// `reschedule` runs, ahead of the port actually performing the swap).
    previous: Option<NonNull<TaskCb<P>>>,
    runnable: ThreadList<P>,
    suspended: ThreadList<P>,
    sleeping: ThreadList<P>,
    clock: TickClock,
    tick_count: u64,
    context_switch_count: u64,
    timers: SoftwareTimerSupervisor<P>,
}

/// The kernel's single global scheduler instance. Per `spec.md`'s "global
/// scheduler singleton" design note, applications declare one
/// `static SCHEDULER: Scheduler<MyPort> = Scheduler::new();` and route every
/// operation through it; it is never constructed twice and never dropped.
pub struct Scheduler<P: Port> {
    state: UnsafeCell<SchedulerState<P>>,
}

// Safety: `SchedulerState` is only ever touched from inside a method that
// first calls `lock_cpu`, i.e. with interrupts masked on this kernel's
// single core. There is never genuine concurrent access; only the
// raw-pointer fields prevent the auto-derivation from seeing that.
unsafe impl<P: Port> Sync for Scheduler<P> {}

impl<P: Port> Scheduler<P> {
    pub const fn new() -> Self {
        Scheduler {
            state: UnsafeCell::new(SchedulerState {
                running: None,
                previous: None,
                runnable: ThreadList::new(),
                suspended: ThreadList::new(),
                sleeping: ThreadList::new(),
                clock: TickClock::new(),
                tick_count: 0,
                context_switch_count: 0,
                timers: SoftwareTimerSupervisor::new(),
            }),
        }
    }

    /// # Safety
    /// Caller must hold CPU Lock (a live `CpuLockGuard<P>` proves it).
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut SchedulerState<P> {
        &mut *self.state.get()
    }

    pub fn now(&self) -> Instant {
        let _g = lock_cpu::<P>();
        // Safety: `_g` proves CPU Lock is held.
        unsafe { self.state() }.clock.now()
    }

    pub fn tick_count(&self) -> u64 {
        let _g = lock_cpu::<P>();
        unsafe { self.state() }.tick_count
    }

    pub fn context_switch_count(&self) -> u64 {
        let _g = lock_cpu::<P>();
        unsafe { self.state() }.context_switch_count
    }

    /// `TCB::Created|Terminated -> Runnable`. Initializes the stack on
    /// first activation and inserts the task into the run queue at the
    /// position its priority dictates, preempting the current task if it
    /// now outranks it.
    pub fn add_task(&self, task: &'static TaskCb<P>) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        // Safety: `g` proves CPU Lock is held.
        let state = unsafe { self.state() };
        let prior = task.state.get(&*g);
        if !matches!(prior, ThreadState::Created | ThreadState::Terminated) {
            return Err(Error::Inval);
        }
        if prior == ThreadState::Terminated {
            let seq = task.sequence.get(&*g);
            task.sequence.set(&mut *g, seq.wrapping_add(1));
        }
        // Safety: the task was `Created`/`Terminated`, so it owns its
        // stack outright and nothing else can be touching it.
        unsafe { task.stack_mut() }.initialize(task.entry, task.arg);
        task.boosted_priority.set(&mut *g, 0);
        task.quantum_remaining.set(&mut *g, task.round_robin_quantum);
        task.state.set(&mut *g, ThreadState::Runnable);
        let task_ptr = NonNull::from(task);
        // Safety: `task` was just taken out of `Created`/`Terminated`, so
        // it cannot already be linked anywhere; `g` proves CPU Lock.
        Self::insert_into_runnable(state, task_ptr, &mut g);
        self.reschedule(state, &mut g);
        Ok(())
    }

    /// Link `task` onto the run queue and record that as its
    /// `current_list`, maintaining the invariant that a task's
    /// `current_list` is `Some` exactly when it is linked into some list
    /// (i.e. not presently the task dispatched onto the CPU).
    ///
    /// # Safety
    /// `task` must not presently be linked into any list.
    fn insert_into_runnable(state: &mut SchedulerState<P>, task: NonNull<TaskCb<P>>, g: &mut CpuLockGuard<P>) {
        let runnable_ptr = NonNull::from(&state.runnable);
        // Safety: forwarded to the caller.
        unsafe { state.runnable.insert(task, &**g) };
        task.as_ref_checked()
            .wait
            .modify(&mut **g, |w| w.current_list = Some(runnable_ptr));
    }

    /// The task presently executing, if the scheduler has been started.
    pub(crate) fn current(&self) -> Option<NonNull<TaskCb<P>>> {
        let _g = lock_cpu::<P>();
        unsafe { self.state() }.running
    }

    /// Same as [`current`](Self::current), for callers that already hold
    /// CPU Lock and must not enter it a second time.
    pub(crate) fn current_locked(&self, g: &CpuLockGuard<P>) -> Option<NonNull<TaskCb<P>>> {
        let _ = g;
        // Safety: `g` proves CPU Lock is held.
        unsafe { self.state() }.running
    }

    /// The stable identity (spec.md §6's `(address, sequence_number)`
    /// guarantee) of the task presently executing, if the scheduler has
    /// been started.
    pub fn current_task_id(&self) -> Option<crate::id::ThreadIdentifier> {
        let g = lock_cpu::<P>();
        // Safety: `g` proves CPU Lock is held.
        let running = unsafe { self.state() }.running?;
        // Safety: `running` came from `state.running`, hence a valid,
        // currently-live task.
        Some(unsafe { running.as_ref() }.id_locked(&g))
    }

    /// Run [`reschedule`](Self::reschedule) for callers (mutex/semaphore/
    /// condvar unlock paths) that already hold CPU Lock and have just
    /// changed priorities or ownership in a way that might require
    /// preempting the current task.
    pub(crate) fn reschedule_locked(&self, g: &mut CpuLockGuard<P>) {
        let state = unsafe { self.state() };
        self.reschedule(state, g);
    }

    /// Remove the current task from the run queue, mark it `state` and
    /// link it into `list`, then dispatch whatever should run next.
    /// Returns once this task is woken again, carrying the `wait_result`
    /// its waker stored.
    ///
    /// `list` outliving the wait is the caller's responsibility — every
    /// caller in this crate passes a `&'static` or scheduler-owned list.
    pub(crate) fn block_current(
        &self,
        g: &mut CpuLockGuard<P>,
        list: &ThreadList<P>,
        state_tag: ThreadState,
        deadline: Option<Instant>,
    ) -> KernelResult<()> {
        debug_assert!(P::is_task_context(), "blocking call from interrupt context");
        let state = unsafe { self.state() };
        let current = state
            .running
            .expect("block_current called with no running task");
        current.as_ref_checked().state.set(&mut **g, state_tag);
        current.as_ref_checked().wait.modify(&mut **g, |w| {
            w.current_list = Some(NonNull::from(list));
            w.timeout_deadline = deadline;
        });
        // Safety: `current` was just removed from scheduling (its state is
        // no longer `Runnable`), so it is not linked anywhere yet; `g`
        // proves CPU Lock.
        unsafe { list.insert(current, &**g) };
        if let Some(deadline) = deadline {
            // Safety: `current` was just unlinked from scheduling and is not
            // presently armed in the timer supervisor; `g` proves CPU Lock.
            unsafe { state.timers.arm_timeout(current, deadline, &**g) };
        }
        state.running = None;
        self.reschedule(state, g);
        // By the time control returns here, this task has been dispatched
        // back in by `reschedule`/`on_context_switch`; `wait_result` was
        // filled in by whoever unblocked it.
        let result = current.as_ref_checked().wait.get(&**g).wait_result;
        current
            .as_ref_checked()
            .wait
            .modify(&mut **g, |w| w.blocking_mutex = None);
        result
    }

    /// Move `task` from whatever list it is on back to `Runnable`, reset
    /// its round-robin quantum (per `distortos::ThreadControlBlock`, a
    /// quantum reset accompanies every unblock, not just a tick expiry),
    /// disarm any pending timeout, and record `wait_result`/`reason`.
    /// Does not itself reschedule — callers that need a context switch
    /// call [`reschedule`](Self::reschedule) once after all the unblocks
    /// they intend to perform in one critical section.
    pub(crate) fn unblock(
        &self,
        g: &mut CpuLockGuard<P>,
        task: NonNull<TaskCb<P>>,
        reason: UnblockReason,
    ) {
        let state = unsafe { self.state() };
        let t = task.as_ref_checked();
        let prior_list = t.wait.get(&**g).current_list;
        if let Some(list) = prior_list {
            // Safety: `task` is a member of `*list` by the `current_list`
            // invariant; `g` proves CPU Lock.
            unsafe { (*list.as_ptr()).remove(task) };
        }
        // Safety: `g` proves CPU Lock; disarming an already-disarmed task
        // is a no-op per `SoftwareTimerSupervisor::disarm_timeout`.
        unsafe { state.timers.disarm_timeout(task, &**g) };
        t.wait.modify(&mut **g, |w| {
            w.current_list = None;
            w.wait_result = match reason {
                UnblockReason::Request => Ok(()),
                UnblockReason::Timeout => Err(Error::TimedOut),
                UnblockReason::Interrupted => Err(Error::Intr),
            };
        });
        t.quantum_remaining.set(&mut **g, t.round_robin_quantum);
        t.state.set(&mut **g, ThreadState::Runnable);
        // Safety: just unlinked from its previous list (or was never on
        // one); `g` proves CPU Lock.
        Self::insert_into_runnable(state, task, g);
    }

    /// `suspend()`: block the current task with no wait condition other
    /// than an explicit [`resume`](Self::resume).
    pub fn suspend_current(&self) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        self.block_current(&mut g, &state.suspended, ThreadState::Suspended, None)
    }

    /// Suspend an arbitrary runnable task (not necessarily current).
    pub fn suspend(&self, task: &'static TaskCb<P>) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        let task_ptr = NonNull::from(task);
        if Some(task_ptr) == state.running {
            return self.block_current(&mut g, &state.suspended, ThreadState::Suspended, None);
        }
        if task.state.get(&*g) != ThreadState::Runnable {
            return Err(Error::Inval);
        }
        let prior_list = task.wait.get(&*g).current_list;
        if let Some(list) = prior_list {
            // Safety: on that list by invariant; `g` proves CPU Lock.
            unsafe { (*list.as_ptr()).remove(task_ptr) };
        }
        task.state.set(&mut *g, ThreadState::Suspended);
        task.wait
            .modify(&mut *g, |w| w.current_list = Some(NonNull::from(&state.suspended)));
        // Safety: just unlinked; `g` proves CPU Lock.
        unsafe { state.suspended.insert(task_ptr, &*g) };
        Ok(())
    }

    pub fn resume(&self, task: &'static TaskCb<P>) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        if task.state.get(&*g) != ThreadState::Suspended {
            return Err(Error::Inval);
        }
        let task_ptr = NonNull::from(task);
        self.unblock(&mut g, task_ptr, UnblockReason::Request);
        self.reschedule(state, &mut g);
        Ok(())
    }

    /// `sleep_for(d)`: block the current task until `d` ticks have
    /// elapsed. Per spec.md §5, this always sleeps *at least* `d`: the
    /// deadline is `now + d + 1` to compensate for however much of the
    /// current tick has already elapsed when this is called.
    pub fn sleep_for(&self, d: Duration) -> KernelResult<()> {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        let deadline = state
            .clock
            .now()
            .saturating_add(d)
            .saturating_add(Duration::from_ticks(1));
        match self.block_current(&mut g, &state.sleeping, ThreadState::Sleeping, Some(deadline)) {
            Ok(()) | Err(Error::TimedOut) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Start (or restart) a periodic/one-shot software timer: `delay`
    /// ticks from now, then every `period` ticks after that if `period`
    /// is nonzero.
    pub fn start_timer(&self, timer: &'static SoftwareTimerCb<P>, delay: Duration, period: Duration) {
        let _g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        let now = state.clock.now();
        // Safety: `_g` proves CPU Lock.
        unsafe { state.timers.start(timer, now, delay, period) };
    }

    pub fn stop_timer(&self, timer: &'static SoftwareTimerCb<P>) {
        let _g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        // Safety: `_g` proves CPU Lock.
        unsafe { state.timers.stop(timer) };
    }

    /// Rotate the current task behind its equal-priority peers.
    pub fn yield_now(&self) {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        if let Some(current) = state.running {
            let t = current.as_ref_checked();
            t.quantum_remaining.set(&mut *g, t.round_robin_quantum);
            // Safety: `current` is the running task, hence not linked into
            // any list — reinserting it lands it at the tail of its band.
            Self::insert_into_runnable(state, current, &mut g);
            state.running = None;
            self.reschedule(state, &mut g);
        }
    }

    /// `set_priority`: change a task's base priority and reposition it.
    /// `always_behind` controls placement when the new priority is lower
    /// than the old one and the task is presently queued among peers of
    /// that new, lower band (spec.md §4.4.2): `true` inserts at the tail
    /// of the band (default FIFO placement), `false` at the head
    /// (preserving "it just ran" immediacy).
    pub fn set_priority(&self, task: &'static TaskCb<P>, priority: Priority, always_behind: bool) {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        task.base_priority.set(&mut *g, priority);
        crate::mutex::recompute_boosted_priority(task, &mut g);
        self.reposition(state, &mut g, task, always_behind);
        self.reschedule(state, &mut g);
    }

    /// Re-sort `task` on whatever list it currently sits on (ready,
    /// suspended, or a primitive's waiters list) after its effective
    /// priority changed. No-op if it is the running task (nothing to
    /// resort) or not linked anywhere.
    pub(crate) fn reposition(
        &self,
        _state: &mut SchedulerState<P>,
        g: &mut CpuLockGuard<P>,
        task: &'static TaskCb<P>,
        always_behind: bool,
    ) {
        let task_ptr = NonNull::from(task);
        if let Some(list) = task.wait.get(&**g).current_list {
            // Safety: `task` is linked into `*list` by the invariant that
            // `current_list` always names the list currently holding it.
            unsafe {
                (*list.as_ptr()).remove(task_ptr);
                if always_behind {
                    (*list.as_ptr()).insert(task_ptr, &**g);
                } else {
                    (*list.as_ptr()).insert_before_equal(task_ptr, &**g);
                }
            }
        }
    }

    /// The current task exits: `Terminated`, unlinked, and a new task
    /// dispatched. Never returns.
    pub fn exit_current(&self) -> ! {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        let current = state.running.take().expect("exit with no running task");
        let t = current.as_ref_checked();
        t.state.set(&mut *g, ThreadState::Terminated);
        crate::mutex::abandon_owned_mutexes(self, current, &mut g);
        self.reschedule(state, &mut g);
        unreachable!("a terminated task must never be dispatched again")
    }

    /// The tick ISR entry point. Advances the clock, fires due software
    /// timers, and — under `SchedulingPolicy::RoundRobin` — rotates the
    /// current task if its quantum has just expired. Returns whether a
    /// context switch is now needed (the port uses this to decide whether
    /// to request one).
    pub fn tick(&self) -> bool {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        state.tick_count = state.tick_count.wrapping_add(1);
        let now = state.clock.advance();
        let mut needs_switch = state.timers.tick(now, self, &mut g);
        if let Some(current) = state.running {
            let t = current.as_ref_checked();
            if t.policy == SchedulingPolicy::RoundRobin {
                let remaining = t.quantum_remaining.get(&*g);
                if remaining > 0 {
                    let remaining = remaining - 1;
                    t.quantum_remaining.set(&mut *g, remaining);
                    if remaining == 0 {
                        t.quantum_remaining.set(&mut *g, t.round_robin_quantum);
                        // Safety: current is running, hence not linked
                        // anywhere; this moves it behind its peers.
                        Self::insert_into_runnable(state, current, &mut g);
                        state.running = None;
                        needs_switch = true;
                    }
                }
            }
        }
        if needs_switch {
            self.reschedule(state, &mut g);
        }
        needs_switch
    }

    /// Decide who should run next and update `state.running` accordingly.
    /// This only updates the scheduler's bookkeeping; the actual register
    /// swap happens later, when the port gets around to invoking
    /// [`on_context_switch`](Self::on_context_switch) — `request_context_switch`
    /// is how the scheduler tells it that's now needed.
    ///
    /// Two cases reach here with `state.running == None`: the very first
    /// dispatch, and every voluntary block (the caller already cleared
    /// `running` and unlinked the task itself). Both just need the new
    /// head of the run queue installed. Otherwise the current task is
    /// still genuinely running — it only yields its spot if a strictly
    /// higher-priority task is ready, in which case it goes back onto the
    /// run queue at the head of its band (it did not choose to give up
    /// the CPU, so it keeps its place among peers).
    fn reschedule(&self, state: &mut SchedulerState<P>, g: &mut CpuLockGuard<P>) {
        match state.running {
            None => {
                // Safety: `g` proves CPU Lock; the head of `runnable` is a
                // task this scheduler owns.
                if let Some(head) = state.runnable.front() {
                    unsafe { state.runnable.remove(head) };
                    let h = head.as_ref_checked();
                    h.state.set(&mut **g, ThreadState::Runnable);
                    // It is about to be dispatched, not merely queued.
                    h.wait.modify(&mut **g, |w| w.current_list = None);
                    state.running = Some(head);
                    P::request_context_switch();
                }
            }
            Some(current) => {
                if let Some(head) = state.runnable.front() {
                    if head.as_ref_checked().effective_priority(g)
                        > current.as_ref_checked().effective_priority(g)
                    {
                        // Safety: `head` is on `runnable`, not linked
                        // elsewhere; `current` is the running task, hence
                        // not presently linked into any list either.
                        let runnable_ptr = NonNull::from(&state.runnable);
                        unsafe {
                            state.runnable.remove(head);
                            state.runnable.insert_before_equal(current, &**g);
                        }
                        current
                            .as_ref_checked()
                            .wait
                            .modify(&mut **g, |w| w.current_list = Some(runnable_ptr));
                        let h = head.as_ref_checked();
                        h.state.set(&mut **g, ThreadState::Runnable);
                        h.wait.modify(&mut **g, |w| w.current_list = None);
                        state.running = Some(head);
                        P::request_context_switch();
                    }
                }
            }
        }
    }

    /// Called by the port's context-switch trampoline with the stack
    /// pointer it just saved for the outgoing task (`None` the very first
    /// time, when there was no previous task to save one for). Returns the
    /// stack context to restore for the incoming task. This is the only
    /// place the scheduler and the port's register-level switch meet.
    pub fn on_context_switch(&self, outgoing_sp: Option<P::StackContext>) -> P::StackContext {
        let mut g = lock_cpu::<P>();
        let state = unsafe { self.state() };
        state.context_switch_count = state.context_switch_count.wrapping_add(1);
        if let (Some(prev), Some(sp)) = (state.previous, outgoing_sp) {
            // Safety: `g` proves CPU Lock; `prev` is no longer the
            // executing task, so nothing else can hold `&mut Stack` to it.
            unsafe { prev.as_ref_checked().stack_mut() }.set_context(sp);
        }
        self.reschedule(state, &mut g);
        let running = state.running.expect("no task to dispatch");
        state.previous = Some(running);
        // Safety: `g` proves CPU Lock; no one else holds `&mut Stack`.
        unsafe { running.as_ref_checked().stack_mut().context() }
    }
}

/// Small helper so call sites read `ptr.as_ref_checked()` instead of
/// repeating the safety comment for "this pointer is one of ours and
/// CPU Lock is held" at every dereference.
pub(crate) trait NonNullExt<T> {
    fn as_ref_checked(&self) -> &T;
}

impl<T> NonNullExt<T> for NonNull<T> {
    fn as_ref_checked(&self) -> &T {
        // Safety: every `NonNull<TaskCb<P>>`/`NonNull<MutexCb<P>>` this
        // kernel holds points at a `'static` object handed to it by the
        // application and never freed.
        unsafe { self.as_ref() }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SchedulingPolicy;
    use crate::test_support::{new_task, TestPort};

    #[test]
    fn runnable_list_dispatches_the_highest_priority_among_several_peers() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let runner = new_task(10, SchedulingPolicy::Fifo, 0);
        let low = new_task(3, SchedulingPolicy::Fifo, 0);
        let high = new_task(9, SchedulingPolicy::Fifo, 0);
        let mid = new_task(6, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(runner).unwrap();
        // Added lowest to highest, none of which preempts `runner`, so all
        // three sit together on the run queue at once, ordered by however
        // `ThreadList::insert` places them relative to each other.
        SCHED.add_task(low).unwrap();
        SCHED.add_task(high).unwrap();
        SCHED.add_task(mid).unwrap();
        assert_eq!(SCHED.current(), Some(NonNull::from(runner)));

        SCHED.suspend_current().unwrap();
        assert_eq!(SCHED.current(), Some(NonNull::from(high)));
    }

    #[test]
    fn current_task_id_is_none_when_idle_and_matches_the_running_task_otherwise() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        assert_eq!(SCHED.current_task_id(), None);

        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();
        assert_eq!(SCHED.current_task_id(), Some(task.id()));
    }

    #[test]
    fn higher_priority_task_preempts_on_add() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let low = new_task(1, SchedulingPolicy::Fifo, 0);
        let high = new_task(9, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(low).unwrap();
        assert_eq!(SCHED.current(), Some(NonNull::from(low)));
        SCHED.add_task(high).unwrap();
        assert_eq!(SCHED.current(), Some(NonNull::from(high)));
    }

    #[test]
    fn equal_priority_task_does_not_preempt() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let first = new_task(5, SchedulingPolicy::Fifo, 0);
        let second = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(first).unwrap();
        SCHED.add_task(second).unwrap();
        assert_eq!(SCHED.current(), Some(NonNull::from(first)));
    }

    #[test]
    fn round_robin_rotates_equal_priority_peers_on_quantum_expiry() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let a = new_task(5, SchedulingPolicy::RoundRobin, 1);
        let b = new_task(5, SchedulingPolicy::RoundRobin, 1);
        let c = new_task(5, SchedulingPolicy::RoundRobin, 1);
        SCHED.add_task(a).unwrap();
        SCHED.add_task(b).unwrap();
        SCHED.add_task(c).unwrap();
        assert_eq!(SCHED.current(), Some(NonNull::from(a)));

        SCHED.tick();
        assert_eq!(SCHED.current(), Some(NonNull::from(b)));
        SCHED.tick();
        assert_eq!(SCHED.current(), Some(NonNull::from(c)));
        SCHED.tick();
        assert_eq!(SCHED.current(), Some(NonNull::from(a)));
    }

    #[test]
    fn fifo_task_does_not_rotate_on_tick() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let a = new_task(5, SchedulingPolicy::Fifo, 0);
        let b = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(a).unwrap();
        SCHED.add_task(b).unwrap();
        for _ in 0..5 {
            SCHED.tick();
        }
        assert_eq!(SCHED.current(), Some(NonNull::from(a)));
    }

    #[test]
    fn suspend_and_resume_restores_runnable_state() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let low = new_task(1, SchedulingPolicy::Fifo, 0);
        let other = new_task(1, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(low).unwrap();
        SCHED.add_task(other).unwrap();
        let g = lock_cpu::<TestPort>();
        assert_eq!(low.state.get(&*g), ThreadState::Runnable);
        drop(g);

        SCHED.suspend(other).unwrap();
        let g = lock_cpu::<TestPort>();
        assert_eq!(other.state.get(&*g), ThreadState::Suspended);
        drop(g);

        SCHED.resume(other).unwrap();
        let g = lock_cpu::<TestPort>();
        assert_eq!(other.state.get(&*g), ThreadState::Runnable);
    }

    #[test]
    fn suspending_an_already_suspended_task_is_rejected() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let low = new_task(1, SchedulingPolicy::Fifo, 0);
        let other = new_task(1, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(low).unwrap();
        SCHED.add_task(other).unwrap();
        SCHED.suspend(other).unwrap();
        assert_eq!(SCHED.suspend(other), Err(Error::Inval));
        assert_eq!(SCHED.resume(low), Err(Error::Inval));
    }

    #[test]
    fn tick_count_and_context_switch_count_are_independent_counters() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let a = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(a).unwrap();
        assert_eq!(SCHED.tick_count(), 0);
        assert_eq!(SCHED.context_switch_count(), 0);
        SCHED.tick();
        SCHED.tick();
        assert_eq!(SCHED.tick_count(), 2);
        assert_eq!(SCHED.context_switch_count(), 0);
        SCHED.on_context_switch(None);
        assert_eq!(SCHED.context_switch_count(), 1);
    }

    #[test]
    fn set_priority_updates_dispatch_order() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let low = new_task(1, SchedulingPolicy::Fifo, 0);
        let mid = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(low).unwrap();
        SCHED.add_task(mid).unwrap();
        assert_eq!(SCHED.current(), Some(NonNull::from(mid)));

        SCHED.set_priority(low, 9, true);
        assert_eq!(SCHED.current(), Some(NonNull::from(low)));
    }
}
