//! Stable identity for kernel objects that outlives any one "incarnation".
use core::ptr::NonNull;

use crate::task::TaskCb;

/// Identifies a task by the address of its control block plus a sequence
/// number bumped every time that control block is reused for a new
/// incarnation (a statically allocated task re-activated after exiting).
/// Comparing two `ThreadIdentifier`s for equality is therefore safe even
/// across a task's exit and restart: a stale identifier from a previous
/// incarnation will not alias the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadIdentifier {
    addr: usize,
    sequence: u32,
}

impl ThreadIdentifier {
    pub(crate) fn new<P: crate::port::Port>(task: NonNull<TaskCb<P>>, sequence: u32) -> Self {
        ThreadIdentifier {
            addr: task.as_ptr() as usize,
            sequence,
        }
    }
}
