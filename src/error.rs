//! The stable numeric error taxonomy shared by every kernel operation.
//!
//! Mirrors `r3_kernel`'s per-operation suberror pattern (see `error.rs` in the
//! teacher crate) collapsed into a single enum: this crate exposes one
//! operation surface instead of r3's per-syscall error types, so one `Error`
//! covers all of them.
use core::fmt;

/// Result type returned by every blocking and non-blocking kernel operation.
pub type KernelResult<T = ()> = Result<T, Error>;

/// The numeric error taxonomy of the kernel's public API.
///
/// Internal invariant violations (stack overflow, destroying a busy
/// primitive, calling a blocking API from interrupt context) are not
/// represented here: they call [`crate::port::Port::fatal_error`] instead of
/// returning a value.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The calling task does not own the resource it tried to release.
    Perm = 1,
    /// A parameter was out of range, or an operation's preconditions were not
    /// satisfied (e.g. a `PriorityProtect` lock attempted above the ceiling).
    Inval,
    /// The operation would deadlock (relocking a non-recursive mutex).
    Deadlk,
    /// The resource is not immediately available (non-blocking call).
    Busy,
    /// Decrementing a semaphore below zero, or retrying would be required.
    Again,
    /// A timed wait expired before its condition was satisfied.
    TimedOut,
    /// The wait was interrupted by a signal or an explicit interrupt request.
    Intr,
    /// A counting resource (semaphore, recursive lock count) would overflow.
    Overflow,
    /// The requested combination of features is not supported by this build.
    NotSup,
    /// No memory is available to satisfy the request.
    NoMem,
    /// Lock acquired, but its previous owner terminated while still holding
    /// it: state it protected may be inconsistent. Call
    /// [`crate::mutex::MutexCb::mark_consistent`] before trusting it, or the
    /// mutex becomes permanently unusable on the next unlock.
    Owned,
    /// The mutex was abandoned by its owner and never marked consistent; it
    /// can no longer be locked by anyone.
    NotRecoverable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Perm => "operation not permitted",
            Self::Inval => "invalid argument",
            Self::Deadlk => "resource deadlock would occur",
            Self::Busy => "resource busy",
            Self::Again => "resource temporarily unavailable",
            Self::TimedOut => "timed out",
            Self::Intr => "interrupted",
            Self::Overflow => "value too large",
            Self::NotSup => "not supported",
            Self::NoMem => "out of memory",
            Self::Owned => "previous owner died",
            Self::NotRecoverable => "state not recoverable",
        };
        f.write_str(s)
    }
}
