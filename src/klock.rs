//! CPU Lock: the kernel's sole mutual-exclusion mechanism.
//!
//! On a single core, mutual exclusion between the scheduler and interrupt
//! handlers is achieved by masking interrupts rather than by spinning. A
//! [`CpuLockCell`] can only be read or written while holding a
//! [`CpuLockToken`], and [`tokenlock`]'s singleton token guarantees at
//! compile time that at most one such token exists at any time, so there is
//! no runtime check to "acquire" the lock beyond asking the port to mask
//! interrupts.
use core::{fmt, ops};

use tokenlock::UnsyncTokenLock;

use crate::port::Port;

pub(crate) struct CpuLockTag<P>(P);

/// The key that unlocks [`CpuLockCell`]. Functions thread `&mut
/// CpuLockGuard<P>` (which derefs to this) rather than this type directly,
/// so ordinary Rust mutable-reference reborrowing does the work that
/// `tokenlock`'s own `TokenRef`/`TokenRefMut` wrapper types exist for.
pub(crate) type CpuLockToken<P> = tokenlock::UnsyncSingletonToken<CpuLockTag<P>>;

type CpuLockKeyhole<P> = tokenlock::SingletonTokenId<CpuLockTag<P>>;

/// A cell that can only be accessed while CPU Lock is active.
pub(crate) struct CpuLockCell<P, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<P>>);

impl<P, T> CpuLockCell<P, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<P, T: Clone> CpuLockCell<P, T> {
    /// Read-modify-write in one step, for the fields whose update rule is
    /// "change one part of this struct" rather than a plain replacement.
    pub(crate) fn modify(&self, tok: &mut CpuLockToken<P>, f: impl FnOnce(&mut T)) {
        let mut value = self.get(tok);
        f(&mut value);
        self.set(tok, value);
    }
}

impl<P, T> ops::Deref for CpuLockCell<P, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<P>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P, T> ops::DerefMut for CpuLockCell<P, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<P, T: fmt::Debug> fmt::Debug for CpuLockCell<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CpuLockCell(..)")
    }
}

/// Whether CPU Lock is already active is a caller-observable precondition
/// violation, not a recoverable runtime error: entering it twice is a bug
/// in the kernel itself.
pub(crate) fn lock_cpu<P: Port>() -> CpuLockGuard<P> {
    // Safety: `enter_cpu_lock` is only meant to be called by the kernel, and
    // only from a context where CPU Lock is not already active.
    unsafe { P::enter_cpu_lock() };
    // Safety: we just entered CPU Lock, and by construction there cannot be
    // another live `CpuLockGuard` (entering again would have deadlocked the
    // port or tripped its own reentrancy check).
    unsafe { assume_cpu_lock() }
}

/// Construct a [`CpuLockGuard`] without entering CPU Lock.
///
/// # Safety
///
/// The caller must guarantee CPU Lock is genuinely active and that no other
/// `CpuLockGuard` presently exists.
pub(crate) unsafe fn assume_cpu_lock<P: Port>() -> CpuLockGuard<P> {
    CpuLockGuard {
        // Safety: forwarded to the caller.
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for an active CPU Lock. Dropping it restores interrupts.
pub(crate) struct CpuLockGuard<P: Port> {
    token: CpuLockToken<P>,
}

impl<P: Port> Drop for CpuLockGuard<P> {
    fn drop(&mut self) {
        // Safety: CPU Lock is active and we are the one controlling it.
        unsafe { P::leave_cpu_lock() };
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
