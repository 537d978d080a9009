//! Counting semaphores
//!
//! Wakeups use direct handoff: `signal` never increments the count while a
//! waiter exists, it passes the token straight to the FIFO head. This
//! closes the window in which a third task could `trywait` a freshly
//! incremented count before the woken task runs.
use core::num::NonZeroU16;

use crate::{
    error::{KernelError, Result},
    klock, task,
    wait::{self, WaitOrigin, WaitQueue, WaitResult},
    KernelTraits, System,
};

/// The saturation bound of a semaphore's counter.
pub const SEM_MAX_COUNT: u32 = i32::MAX as u32;

/// Handle to a kernel semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(NonZeroU16);

impl SemaphoreId {
    pub(crate) fn from_raw(raw: NonZeroU16) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u16 {
        self.0.get()
    }
}

/// *Semaphore control block* - the state data of a semaphore.
pub(crate) struct SemaphoreCb {
    pub(crate) count: u32,
    pub(crate) max_waiters: u16,
    pub(crate) wait_queue: WaitQueue,
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a semaphore with `initial_count` tokens and room for at most
    /// `max_waiters` blocked tasks.
    pub fn sem_create(max_waiters: u16, initial_count: u32) -> Result<SemaphoreId> {
        if max_waiters == 0 || initial_count > SEM_MAX_COUNT {
            return Err(KernelError::SemAlloc);
        }
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        kcb.semaphores
            .insert(SemaphoreCb {
                count: initial_count,
                max_waiters,
                wait_queue: WaitQueue::new(),
            })
            .map(SemaphoreId::from_raw)
            .ok_or(KernelError::SemAlloc)
    }

    /// Destroy a semaphore nobody is waiting on.
    pub fn sem_destroy(id: SemaphoreId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        if !kcb
            .semaphores
            .get(id.raw())
            .ok_or(KernelError::SemDealloc)?
            .wait_queue
            .is_empty()
        {
            return Err(KernelError::TaskBusy);
        }
        kcb.semaphores.remove(id.raw());
        Ok(())
    }

    /// Take a token, blocking in FIFO order while none is available.
    ///
    /// The fast path only runs when no task is already waiting, preserving
    /// FIFO fairness against the slow path.
    pub fn sem_wait(id: SemaphoreId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let blocked = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            let current = kcb.current.ok_or(KernelError::Fail)?;
            let take = {
                let s = kcb.semaphores.get_mut(id.raw()).ok_or(KernelError::SemOperation)?;
                if s.count > 0 && s.wait_queue.is_empty() {
                    s.count -= 1;
                    None
                } else {
                    if s.wait_queue.len() >= s.max_waiters as usize {
                        return Err(KernelError::SemOperation);
                    }
                    s.wait_queue.push_back(current);
                    Some(current)
                }
            };
            if take.is_some() {
                wait::block_current(kcb, Some(WaitOrigin::Semaphore(id)), 0);
            }
            take
        };

        if let Some(current) = blocked {
            task::wait_until_running(&mut lock, current);
            // On a successful wake the signaller passed the token directly
            // to us; the count was never incremented, so there is nothing
            // left to take. A cut-short wait (suspension while blocked)
            // received no token.
            let kcb = Traits::state().kcb().read(&*lock);
            match kcb.task(current).map(|t| t.wait_result) {
                Some(WaitResult::Complete) => Ok(()),
                _ => Err(KernelError::Timeout),
            }
        } else {
            Ok(())
        }
    }

    /// Take a token without blocking. Fails with `TaskBusy` unless a token
    /// is available *and* no task is already waiting.
    pub fn sem_trywait(id: SemaphoreId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        let s = kcb.semaphores.get_mut(id.raw()).ok_or(KernelError::SemOperation)?;
        if s.count > 0 && s.wait_queue.is_empty() {
            s.count -= 1;
            Ok(())
        } else {
            Err(KernelError::TaskBusy)
        }
    }

    /// Release a token: hand it to the FIFO head waiter, or increment the
    /// count (saturating silently at [`SEM_MAX_COUNT`]).
    pub fn sem_signal(id: SemaphoreId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let woke = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            let next = {
                let s = kcb.semaphores.get_mut(id.raw()).ok_or(KernelError::SemOperation)?;
                match s.wait_queue.pop_front() {
                    Some(next) => Some(next),
                    None => {
                        if s.count < SEM_MAX_COUNT {
                            s.count += 1;
                        }
                        None
                    }
                }
            };
            if let Some(next) = next {
                wait::complete_wait(kcb, next, WaitResult::Complete);
            }
            next
        };
        if woke.is_some() {
            // Let a just-woken higher-level task preempt immediately.
            task::unlock_sched_and_check_preemption(lock);
        }
        Ok(())
    }

    /// A racy snapshot of the current count. Advisory only.
    pub fn sem_value(id: SemaphoreId) -> Result<u32> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        Ok(kcb
            .semaphores
            .get(id.raw())
            .ok_or(KernelError::SemOperation)?
            .count)
    }

    pub fn sem_waiting_count(id: SemaphoreId) -> Result<usize> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        Ok(kcb
            .semaphores
            .get(id.raw())
            .ok_or(KernelError::SemOperation)?
            .wait_queue
            .len())
    }
}
