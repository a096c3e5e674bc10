//! Fixed-capacity queues built from a pair of semaphores over a `'static`
//! ring buffer.
//!
//! Grounded on `distortos::StaticFifoQueue`/`StaticMessageQueue` (see
//! `examples/original_source`): a `push_sem` counting free slots and a
//! `pop_sem` counting used slots turn every push/pop into "wait, touch
//! exactly the slot you were handed, post" — no separate lock is needed
//! around the buffer itself because each semaphore token *is* exclusive
//! access to one slot.
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use crate::error::KernelResult;
use crate::klock::{lock_cpu, CpuLockCell};
use crate::port::Port;
use crate::scheduler::Scheduler;

use super::semaphore::SemaphoreCb;

/// A bounded FIFO channel: `push` blocks while full, `pop` blocks while
/// empty. `buffer.len()` is the queue's capacity.
pub struct QueueCb<P: Port, T: 'static> {
    push_sem: SemaphoreCb<P>,
    pop_sem: SemaphoreCb<P>,
    buffer: &'static [UnsafeCell<MaybeUninit<T>>],
    push_cursor: CpuLockCell<P, usize>,
    pop_cursor: CpuLockCell<P, usize>,
}

// Safety: every slot in `buffer` is touched by at most one task at a time
// — a `push_sem`/`pop_sem` token is exactly a license to touch the one
// slot its cursor currently names, and the cursor itself only moves while
// CPU Lock is held.
unsafe impl<P: Port, T: Send> Sync for QueueCb<P, T> {}

impl<P: Port, T: 'static> QueueCb<P, T> {
    pub const fn new(buffer: &'static [UnsafeCell<MaybeUninit<T>>]) -> Self {
        let capacity = buffer.len() as u32;
        QueueCb {
            push_sem: SemaphoreCb::new(capacity, capacity),
            pop_sem: SemaphoreCb::new(0, capacity),
            buffer,
            push_cursor: CpuLockCell::new(0),
            pop_cursor: CpuLockCell::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.pop_sem.count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&'static self, scheduler: &Scheduler<P>, value: T) -> KernelResult<()> {
        self.push_sem.wait(scheduler)?;
        self.push_at_reserved_slot(value);
        self.pop_sem.post(scheduler)
    }

    pub fn try_push(&'static self, scheduler: &Scheduler<P>, value: T) -> KernelResult<()> {
        self.push_sem.try_wait(scheduler)?;
        self.push_at_reserved_slot(value);
        self.pop_sem.post(scheduler)
    }

    fn push_at_reserved_slot(&self, value: T) {
        let mut g = lock_cpu::<P>();
        let idx = self.push_cursor.get(&*g);
        self.push_cursor.set(&mut *g, (idx + 1) % self.buffer.len());
        drop(g);
        // Safety: `push_sem` just handed us exclusive ownership of slot
        // `idx` until the matching `pop` reads it.
        unsafe { (*self.buffer[idx].get()).write(value) };
    }

    pub fn pop(&'static self, scheduler: &Scheduler<P>) -> KernelResult<T> {
        self.pop_sem.wait(scheduler)?;
        let value = self.pop_at_reserved_slot();
        self.push_sem.post(scheduler)?;
        Ok(value)
    }

    pub fn try_pop(&'static self, scheduler: &Scheduler<P>) -> KernelResult<T> {
        self.pop_sem.try_wait(scheduler)?;
        let value = self.pop_at_reserved_slot();
        self.push_sem.post(scheduler)?;
        Ok(value)
    }

    fn pop_at_reserved_slot(&self) -> T {
        let mut g = lock_cpu::<P>();
        let idx = self.pop_cursor.get(&*g);
        self.pop_cursor.set(&mut *g, (idx + 1) % self.buffer.len());
        drop(g);
        // Safety: `pop_sem` just handed us exclusive ownership of slot
        // `idx`, which a matching `push` fully initialized before posting.
        unsafe { (*self.buffer[idx].get()).assume_init_read() }
    }
}

/// A bounded priority channel: `pop` always returns the greatest element
/// presently enqueued, breaking ties FIFO. Insertion is O(n) to keep the
/// backing array sorted at all times, trading push cost for a pop that
/// never has to search.
pub struct MessageQueueCb<P: Port, T: Ord + 'static> {
    push_sem: SemaphoreCb<P>,
    pop_sem: SemaphoreCb<P>,
    buffer: &'static [UnsafeCell<MaybeUninit<T>>],
    len: CpuLockCell<P, usize>,
}

// Safety: see `QueueCb` — every slot within `0..len` is only ever touched
// while CPU Lock is held, and slots at or beyond `len` are untouched.
unsafe impl<P: Port, T: Ord + Send> Sync for MessageQueueCb<P, T> {}

impl<P: Port, T: Ord + 'static> MessageQueueCb<P, T> {
    pub const fn new(buffer: &'static [UnsafeCell<MaybeUninit<T>>]) -> Self {
        let capacity = buffer.len() as u32;
        MessageQueueCb {
            push_sem: SemaphoreCb::new(capacity, capacity),
            pop_sem: SemaphoreCb::new(0, capacity),
            buffer,
            len: CpuLockCell::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&'static self, scheduler: &Scheduler<P>, value: T) -> KernelResult<()> {
        self.push_sem.wait(scheduler)?;
        self.insert_sorted(value);
        self.pop_sem.post(scheduler)
    }

    pub fn try_push(&'static self, scheduler: &Scheduler<P>, value: T) -> KernelResult<()> {
        self.push_sem.try_wait(scheduler)?;
        self.insert_sorted(value);
        self.pop_sem.post(scheduler)
    }

    fn insert_sorted(&self, value: T) {
        let mut g = lock_cpu::<P>();
        let len = self.len.get(&*g);
        let mut pos = len;
        for i in 0..len {
            // Safety: slots `0..len` are always fully initialized.
            let existing = unsafe { (*self.buffer[i].get()).assume_init_ref() };
            if value > *existing {
                pos = i;
                break;
            }
        }
        for i in (pos..len).rev() {
            // Safety: slot `i` is initialized (`i < len`); slot `i + 1` is
            // either uninitialized (`i == len - 1`) or about to be
            // overwritten by this same shift on the next iteration.
            unsafe {
                let shifted = (*self.buffer[i].get()).assume_init_read();
                (*self.buffer[i + 1].get()).write(shifted);
            }
        }
        // Safety: `pos <= len < capacity`, and slot `pos` was just vacated
        // by the shift above (or was already past the initialized range).
        unsafe { (*self.buffer[pos].get()).write(value) };
        self.len.set(&mut *g, len + 1);
    }

    pub fn pop(&'static self, scheduler: &Scheduler<P>) -> KernelResult<T> {
        self.pop_sem.wait(scheduler)?;
        let value = self.pop_highest();
        self.push_sem.post(scheduler)?;
        Ok(value)
    }

    pub fn try_pop(&'static self, scheduler: &Scheduler<P>) -> KernelResult<T> {
        self.pop_sem.try_wait(scheduler)?;
        let value = self.pop_highest();
        self.push_sem.post(scheduler)?;
        Ok(value)
    }

    fn pop_highest(&self) -> T {
        let mut g = lock_cpu::<P>();
        let len = self.len.get(&*g);
        // Safety: `len > 0` is guaranteed by having just acquired a
        // `pop_sem` token.
        let value = unsafe { (*self.buffer[0].get()).assume_init_read() };
        for i in 1..len {
            // Safety: slot `i` is initialized; slot `i - 1` was just
            // vacated by this same shift (or by the read above).
            unsafe {
                let shifted = (*self.buffer[i].get()).assume_init_read();
                (*self.buffer[i - 1].get()).write(shifted);
            }
        }
        self.len.set(&mut *g, len - 1);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::task::SchedulingPolicy;
    use crate::test_support::{new_task, TestPort};

    fn leak_buffer<T>(capacity: usize) -> &'static [UnsafeCell<MaybeUninit<T>>] {
        let mut v = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            v.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Box::leak(v.into_boxed_slice())
    }

    #[test]
    fn push_pop_round_trips_in_fifo_order() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let buffer = leak_buffer::<u32>(3);
        let queue: &'static QueueCb<TestPort, u32> = Box::leak(Box::new(QueueCb::new(buffer)));
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();

        assert!(queue.is_empty());
        queue.push(&SCHED, 1).unwrap();
        queue.push(&SCHED, 2).unwrap();
        queue.push(&SCHED, 3).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(&SCHED), Ok(1));
        assert_eq!(queue.pop(&SCHED), Ok(2));
        assert_eq!(queue.pop(&SCHED), Ok(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn try_push_on_a_full_queue_fails_without_blocking() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let buffer = leak_buffer::<u32>(2);
        let queue: &'static QueueCb<TestPort, u32> = Box::leak(Box::new(QueueCb::new(buffer)));
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();

        queue.try_push(&SCHED, 1).unwrap();
        queue.try_push(&SCHED, 2).unwrap();
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.try_push(&SCHED, 3), Err(crate::error::Error::Again));
    }

    #[test]
    fn try_pop_on_an_empty_queue_fails_without_blocking() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let buffer = leak_buffer::<u32>(2);
        let queue: &'static QueueCb<TestPort, u32> = Box::leak(Box::new(QueueCb::new(buffer)));
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();

        assert_eq!(queue.try_pop(&SCHED), Err(crate::error::Error::Again));
    }

    /// Orders only by `key`, so two values with the same key are a genuine
    /// `Ord`-tie — `seq` just lets the test tell them apart afterward.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Keyed {
        key: u8,
        seq: u32,
    }

    impl PartialOrd for Keyed {
        fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Keyed {
        fn cmp(&self, other: &Self) -> core::cmp::Ordering {
            self.key.cmp(&other.key)
        }
    }

    #[test]
    fn message_queue_pops_highest_priority_first_breaking_ties_fifo() {
        static SCHED: Scheduler<TestPort> = Scheduler::new();
        let buffer = leak_buffer::<Keyed>(4);
        let queue: &'static MessageQueueCb<TestPort, Keyed> = Box::leak(Box::new(MessageQueueCb::new(buffer)));
        let task = new_task(5, SchedulingPolicy::Fifo, 0);
        SCHED.add_task(task).unwrap();

        queue.push(&SCHED, Keyed { key: 1, seq: 100 }).unwrap();
        queue.push(&SCHED, Keyed { key: 5, seq: 200 }).unwrap();
        queue.push(&SCHED, Keyed { key: 5, seq: 201 }).unwrap();
        queue.push(&SCHED, Keyed { key: 3, seq: 300 }).unwrap();

        // Highest key first; among the two key-5 entries, FIFO order.
        assert_eq!(queue.pop(&SCHED), Ok(Keyed { key: 5, seq: 200 }));
        assert_eq!(queue.pop(&SCHED), Ok(Keyed { key: 5, seq: 201 }));
        assert_eq!(queue.pop(&SCHED), Ok(Keyed { key: 3, seq: 300 }));
        assert_eq!(queue.pop(&SCHED), Ok(Keyed { key: 1, seq: 100 }));
    }
}
