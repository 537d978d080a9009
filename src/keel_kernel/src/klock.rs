//! The scheduler-off critical section (the "S level").
//!
//! Acquiring the lock masks only the tick interrupt source, so device ISRs
//! stay live while scheduler state is mutated. The lock is materialized as a
//! singleton token; every piece of kernel state lives in a [`SchedLockCell`]
//! that can only be read or written while the token is presented, so the
//! type system rules out unsynchronized access.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{error::KernelError, utils::Init, PortThreading};

pub(super) struct SchedLockTag<Traits>(Traits);

/// The key that "unlocks" [`SchedLockCell`].
pub(super) type SchedLockToken<Traits> = tokenlock::UnsyncSingletonToken<SchedLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`SchedLockToken`].
pub(super) type SchedLockKeyhole<Traits> = tokenlock::SingletonTokenId<SchedLockTag<Traits>>;

/// Cell type that can be accessed by [`SchedLockToken`] (which can be
/// obtained by [`lock_sched`]).
pub(super) struct SchedLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, SchedLockKeyhole<Traits>>);

impl<Traits, T> SchedLockCell<Traits, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(SchedLockKeyhole::new(), x))
    }
}

// Safety: the contents are only reachable while the singleton token is
// presented, and at most one token exists at any time, so all access is
// serialized even though the cell itself is shared.
unsafe impl<Traits, T: Send + ?Sized> Sync for SchedLockCell<Traits, T> {}

impl<Traits, T: Init> Init for SchedLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits, T> ops::Deref for SchedLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, SchedLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for SchedLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for SchedLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = lock_sched::<Traits>() {
            f.write_str("SchedLockCell(")?;
            self.0.read(&*lock).fmt(f)?;
            f.write_str(")")
        } else {
            f.write_str("SchedLockCell(< locked >)")
        }
    }
}

/// Attempt to enter the scheduler-off section and get an RAII guard.
/// Returns `Err(Fail)` if the section is already active in this context.
pub(super) fn lock_sched<Traits: PortThreading>() -> Result<SchedLockGuard<Traits>, KernelError> {
    // Safety: `try_enter_sched_lock` is only meant to be called by the kernel
    if unsafe { Traits::try_enter_sched_lock() } {
        // Safety: We just entered the scheduler-off section, so no other
        //         instance of `SchedLockGuard` can exist at this point.
        Ok(unsafe { assume_sched_lock() })
    } else {
        Err(KernelError::Fail)
    }
}

/// Assume the scheduler-off section is active and get a guard.
///
/// # Safety
///
/// The section must really be active (e.g., the caller is the tick handler,
/// where the tick source is inherently masked), and no other instance of
/// `SchedLockGuard` may exist at the point of the call.
pub(super) unsafe fn assume_sched_lock<Traits: PortThreading>() -> SchedLockGuard<Traits> {
    SchedLockGuard {
        // Safety: there are no other instances of `SchedLockToken`; this is
        //         upheld by the caller.
        token: unsafe { SchedLockToken::new_unchecked() },
    }
}

/// Enter the scheduler-off section from the trap path, where it may already
/// be considered active.
pub(super) fn lock_sched_or_assume<Traits: PortThreading>() -> SchedLockGuard<Traits> {
    lock_sched().unwrap_or_else(|_| unsafe { assume_sched_lock() })
}

/// RAII guard for the scheduler-off section.
///
/// [`SchedLockToken`] can be borrowed from this type.
pub(super) struct SchedLockGuard<Traits: PortThreading> {
    token: SchedLockToken<Traits>,
}

impl<Traits: PortThreading> Drop for SchedLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: the section is currently active, and it's us (the kernel)
        // who control it
        unsafe {
            Traits::leave_sched_lock();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for SchedLockGuard<Traits> {
    type Target = SchedLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for SchedLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Release the scheduler-off section *without* dropping the guard, run the
/// port's yield primitive, and re-enter the section. The caller's token
/// borrows must all be dead across this call.
///
/// This is the parking point of every blocking operation: the task that
/// re-acquires the section here may have been switched out and back in an
/// arbitrary number of times.
pub(super) fn yield_under_lock<Traits: PortThreading>(lock: &mut SchedLockGuard<Traits>) {
    let _ = lock;
    // Safety: (1) no cell access happens while the section is released,
    //         because the token borrows are dead; (2) the section is active;
    //         (3) it is re-entered before this function returns.
    unsafe {
        Traits::leave_sched_lock();
        Traits::yield_cpu();
        Traits::enter_sched_lock();
    }
}
