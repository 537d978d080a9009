//! Condition variables
//!
//! Waiters are woken into the Ready state directly ("wake then contend"):
//! a signalled task re-acquires the associated mutex through an ordinary
//! lock, which may block it again behind other contenders.
use core::num::NonZeroU16;

use crate::{
    error::{KernelError, Result},
    klock, mutex, task,
    wait::{self, WaitOrigin, WaitQueue, WaitResult},
    KernelTraits, MutexId, System,
};

/// Handle to a kernel condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CondvarId(NonZeroU16);

impl CondvarId {
    pub(crate) fn from_raw(raw: NonZeroU16) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u16 {
        self.0.get()
    }
}

/// *Condition variable control block*.
pub(crate) struct CondvarCb {
    pub(crate) wait_queue: WaitQueue,
}

/// The shared body of `wait` and `timedwait`. `delay == 0` means an
/// unbounded wait.
///
/// The enqueue on the condition variable and the release of the mutex
/// happen in one scheduler-off section, so no third task can observe the
/// mutex free while the waiter is not yet on the queue.
fn wait_inner<Traits: KernelTraits>(cv: CondvarId, mx: MutexId, delay: u32) -> Result {
    let mut lock = klock::lock_sched::<Traits>()?;
    let current = {
        let kcb = Traits::state().kcb().write(&mut *lock);
        let current = kcb.current.ok_or(KernelError::Fail)?;
        {
            let owner = kcb.mutexes.get(mx.raw()).ok_or(KernelError::Fail)?.owner;
            if owner != Some(current) {
                return Err(KernelError::NotOwner);
            }
        }
        kcb.condvars
            .get_mut(cv.raw())
            .ok_or(KernelError::Fail)?
            .wait_queue
            .push_back(current);
        wait::block_current(kcb, Some(WaitOrigin::Condvar(cv)), delay);
        // We verified ownership above, so this cannot fail.
        mutex::unlock_in(kcb, mx, current)?;
        current
    };

    task::wait_until_running(&mut lock, current);

    let timed_out = {
        let kcb = Traits::state().kcb().read(&*lock);
        kcb.task(current).map(|t| t.wait_result) == Some(WaitResult::TimedOut)
    };
    drop(lock);

    // Re-acquire the mutex regardless of how the wait ended; a timeout
    // outcome takes precedence over the lock result.
    let lock_result = System::<Traits>::mutex_lock(mx);
    if timed_out {
        Err(KernelError::Timeout)
    } else {
        lock_result
    }
}

impl<Traits: KernelTraits> System<Traits> {
    pub fn cond_create() -> Result<CondvarId> {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        kcb.condvars
            .insert(CondvarCb {
                wait_queue: WaitQueue::new(),
            })
            .map(CondvarId::from_raw)
            .ok_or(KernelError::Fail)
    }

    /// Destroy a condition variable nobody is waiting on.
    pub fn cond_destroy(cv: CondvarId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        if !kcb
            .condvars
            .get(cv.raw())
            .ok_or(KernelError::Fail)?
            .wait_queue
            .is_empty()
        {
            return Err(KernelError::TaskBusy);
        }
        kcb.condvars.remove(cv.raw());
        Ok(())
    }

    /// Atomically release `mx` and wait for a signal, then re-acquire `mx`.
    /// The caller must hold `mx`.
    pub fn cond_wait(cv: CondvarId, mx: MutexId) -> Result {
        wait_inner::<Traits>(cv, mx, 0)
    }

    /// As [`Self::cond_wait`] with a deadline. `ticks == 0` reports
    /// `Timeout` immediately, without enqueueing or releasing the mutex.
    pub fn cond_timedwait(cv: CondvarId, mx: MutexId, ticks: u32) -> Result {
        if ticks == 0 {
            let lock = klock::lock_sched::<Traits>()?;
            let kcb = Traits::state().kcb().read(&*lock);
            let current = kcb.current.ok_or(KernelError::Fail)?;
            kcb.condvars.get(cv.raw()).ok_or(KernelError::Fail)?;
            let owner = kcb.mutexes.get(mx.raw()).ok_or(KernelError::Fail)?.owner;
            if owner != Some(current) {
                return Err(KernelError::NotOwner);
            }
            return Err(KernelError::Timeout);
        }
        wait_inner::<Traits>(cv, mx, ticks)
    }

    /// Wake the longest-waiting task, if any.
    pub fn cond_signal(cv: CondvarId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let woke = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            let next = kcb
                .condvars
                .get_mut(cv.raw())
                .ok_or(KernelError::Fail)?
                .wait_queue
                .pop_front();
            if let Some(next) = next {
                wait::complete_wait(kcb, next, WaitResult::Complete);
            }
            next
        };
        if woke.is_some() {
            task::unlock_sched_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Wake every waiting task.
    pub fn cond_broadcast(cv: CondvarId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let woke_any = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            kcb.condvars.get(cv.raw()).ok_or(KernelError::Fail)?;
            let mut woke_any = false;
            loop {
                let next = kcb
                    .condvars
                    .get_mut(cv.raw())
                    .unwrap()
                    .wait_queue
                    .pop_front();
                match next {
                    Some(next) => {
                        wait::complete_wait(kcb, next, WaitResult::Complete);
                        woke_any = true;
                    }
                    None => break,
                }
            }
            woke_any
        };
        if woke_any {
            task::unlock_sched_and_check_preemption(lock);
        }
        Ok(())
    }

    pub fn cond_waiting_count(cv: CondvarId) -> Result<usize> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        Ok(kcb
            .condvars
            .get(cv.raw())
            .ok_or(KernelError::Fail)?
            .wait_queue
            .len())
    }
}
