//! Software timers: the tick-driven callback mechanism used both by
//! applications (periodic/one-shot [`SoftwareTimerCb`]s) and internally, to
//! implement every blocking call's optional timeout.
//!
//! Grounded on `distortos::SoftwareTimer`/`SoftwareTimerControlBlock` (see
//! `examples/original_source/include/distortos/SoftwareTimer.hpp`), which
//! likewise threads a single supervisor's sorted deadline list through both
//! user timers and the scheduler's own timeout bookkeeping.
use core::cell::Cell;
use core::ptr::NonNull;

use crate::klock::CpuLockToken;
use crate::list::{Link, List, Linked};
use crate::port::Port;
use crate::scheduler::{Scheduler, UnblockReason};
use crate::task::TaskCb;
use crate::time::{Duration, Instant};

/// Marker distinguishing a [`TaskCb`]'s timeout-list link from its
/// wait/ready-list link — see [`crate::list::Linked`].
pub struct TimerMarker;

pub(crate) type TimerLink<T> = Link<T, TimerMarker>;

/// A periodic or one-shot callback driven by the tick.
///
/// Applications declare these `'static`, the same way they declare
/// [`TaskCb`]s, and hand them to
/// [`SoftwareTimerSupervisor::start`]/[`stop`](SoftwareTimerSupervisor::stop)
/// via the scheduler.
pub struct SoftwareTimerCb<P: Port> {
    link: Link<SoftwareTimerCb<P>>,
    deadline: Cell<Option<Instant>>,
    /// `Duration::ZERO` means one-shot: the timer disarms itself after
    /// firing instead of re-arming for another period.
    period: Cell<Duration>,
    function_runner: fn(&SoftwareTimerCb<P>),
}

impl<P: Port> SoftwareTimerCb<P> {
    pub const fn new(function_runner: fn(&SoftwareTimerCb<P>)) -> Self {
        SoftwareTimerCb {
            link: Link::new(),
            deadline: Cell::new(None),
            period: Cell::new(Duration::ZERO),
            function_runner,
        }
    }

    /// "Running" per spec: linked into the supervisor, or periodic (a
    /// periodic timer counts as running between the moment it fires and
    /// the moment it is re-armed a few lines later in `tick`).
    pub fn is_running(&self) -> bool {
        self.deadline.get().is_some()
    }
}

unsafe impl<P: Port> Linked for SoftwareTimerCb<P> {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

// Safety: every field is a plain `Cell`, only ever touched while CPU Lock
// is held (`start`/`stop`/`tick` all require it); the raw pointer inside
// `link` is what blocks auto-derivation, not any genuine concurrent access
// on this kernel's single core.
unsafe impl<P: Port> Sync for SoftwareTimerCb<P> {}

/// Owns every armed timeout and every running [`SoftwareTimerCb`], each kept
/// as its own list sorted ascending by deadline so `tick` only ever has to
/// look at the front.
pub(crate) struct SoftwareTimerSupervisor<P: Port> {
    timeouts: List<TaskCb<P>, TimerMarker>,
    timers: List<SoftwareTimerCb<P>>,
}

impl<P: Port> SoftwareTimerSupervisor<P> {
    pub(crate) const fn new() -> Self {
        SoftwareTimerSupervisor {
            timeouts: List::new(),
            timers: List::new(),
        }
    }

    /// Arm `task`'s timeout to fire at `deadline`. Called by
    /// [`Scheduler::block_current`] right after the task is linked onto
    /// whatever it is waiting on.
    ///
    /// # Safety
    /// `task` must not already have an armed timeout, and CPU Lock must be
    /// held.
    pub(crate) unsafe fn arm_timeout(
        &self,
        task: NonNull<TaskCb<P>>,
        deadline: Instant,
        tok: &CpuLockToken<P>,
    ) {
        let _ = deadline;
        unsafe {
            self.timeouts
                .insert_sorted_by(task, |a, b| deadline_of(a, tok).cmp(&deadline_of(b, tok)));
        }
    }

    /// Disarm `task`'s timeout, if one is pending. A no-op if it already
    /// fired or was never armed — every unblock path calls this
    /// unconditionally.
    ///
    /// # Safety
    /// CPU Lock must be held.
    pub(crate) unsafe fn disarm_timeout(&self, task: NonNull<TaskCb<P>>, _tok: &CpuLockToken<P>) {
        let linked = <TaskCb<P> as Linked<TimerMarker>>::link(unsafe { task.as_ref() }).is_linked();
        if linked {
            unsafe { self.timeouts.remove(task) };
        }
    }

    /// Start (or restart) a periodic/one-shot software timer.
    ///
    /// # Safety
    /// CPU Lock must be held, and `timer` must not presently be linked.
    pub(crate) unsafe fn start(
        &self,
        timer: &'static SoftwareTimerCb<P>,
        now: Instant,
        delay: Duration,
        period: Duration,
    ) {
        let ptr = NonNull::from(timer);
        if timer.link().is_linked() {
            self.timers.remove(ptr);
        }
        let deadline = now.saturating_add(delay);
        timer.deadline.set(Some(deadline));
        timer.period.set(period);
        self.timers
            .insert_sorted_by(ptr, |a, b| a.deadline.get().cmp(&b.deadline.get()));
    }

    /// # Safety
    /// CPU Lock must be held.
    pub(crate) unsafe fn stop(&self, timer: &'static SoftwareTimerCb<P>) {
        if timer.link().is_linked() {
            self.timers.remove(NonNull::from(timer));
        }
        timer.deadline.set(None);
    }

    /// Fire everything due at `now`: expired task timeouts unblock their
    /// task with [`UnblockReason::Timeout`]; expired software timers run
    /// their callback and, if periodic, re-arm for the next period.
    /// Returns whether any timeout fired (the scheduler reschedules if so
    /// — firing a user timer's callback never by itself requires one).
    ///
    /// # Safety
    /// CPU Lock must be held for the duration of the call (true of every
    /// caller: this only runs from inside `Scheduler::tick`).
    pub(crate) fn tick(
        &self,
        now: Instant,
        scheduler: &Scheduler<P>,
        g: &mut crate::klock::CpuLockGuard<P>,
    ) -> bool {
        let mut any_timeout = false;
        loop {
            let Some(front) = self.timeouts.front() else {
                break;
            };
            // Safety: `front` is linked into `self.timeouts`, hence a
            // valid `'static` task; `g` proves CPU Lock.
            let due = unsafe { deadline_of(front.as_ref(), &*g) } <= now;
            if !due {
                break;
            }
            // Safety: CPU Lock held; `front` was just confirmed linked.
            unsafe { self.timeouts.remove(front) };
            scheduler.unblock(g, front, UnblockReason::Timeout);
            any_timeout = true;
        }
        loop {
            let Some(front) = self.timers.front() else {
                break;
            };
            // Safety: `front` is linked into `self.timers`.
            let timer = unsafe { front.as_ref() };
            let Some(deadline) = timer.deadline.get() else {
                break;
            };
            if deadline > now {
                break;
            }
            // Safety: CPU Lock held; `front` was just confirmed linked.
            unsafe { self.timers.remove(front) };
            let period = timer.period.get();
            (timer.function_runner)(timer);
            if period != Duration::ZERO {
                let next = deadline.saturating_add(period);
                timer.deadline.set(Some(next));
                // Safety: `front` was just unlinked above.
                unsafe {
                    self.timers
                        .insert_sorted_by(front, |a, b| a.deadline.get().cmp(&b.deadline.get()));
                }
            } else {
                timer.deadline.set(None);
            }
        }
        any_timeout
    }
}

/// Read a task's armed deadline. Panics if called on a task with no
/// deadline set — every caller here only does so for tasks linked into
/// `timeouts`, which never happens without one.
fn deadline_of<P: Port>(task: &TaskCb<P>, tok: &CpuLockToken<P>) -> Instant {
    task.wait
        .get(tok)
        .timeout_deadline
        .expect("task linked into the timeout list must have a deadline")
}
