//! Mutexes
//!
//! Non-recursive, FIFO-fair. Ownership is transferred to the head waiter
//! inside the same scheduler-off section that wakes it, so released
//! mutexes are never re-contended by later arrivals.
use core::num::NonZeroU16;

use crate::{
    error::{KernelError, Result},
    kcb::Kcb,
    klock, task,
    wait::{self, WaitOrigin, WaitQueue, WaitResult},
    KernelStatic, KernelTraits, System, TaskId,
};

/// Handle to a kernel mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(NonZeroU16);

impl MutexId {
    pub(crate) fn from_raw(raw: NonZeroU16) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u16 {
        self.0.get()
    }
}

/// *Mutex control block* - the state data of a mutex.
pub(crate) struct MutexCb {
    pub(crate) owner: Option<TaskId>,
    pub(crate) wait_queue: WaitQueue,
}

enum LockPath {
    Acquired,
    OwnedByCaller,
    MustBlock,
}

/// The shared slow/fast path of `lock` and `timedlock`. `delay == 0` means
/// an unbounded wait.
fn lock_inner<Traits: KernelTraits>(id: MutexId, delay: u32) -> Result {
    let mut lock = klock::lock_sched::<Traits>()?;
    let (current, path) = {
        let kcb = Traits::state().kcb().write(&mut *lock);
        let current = kcb.current.ok_or(KernelError::Fail)?;
        let path = {
            let m = kcb.mutexes.get_mut(id.raw()).ok_or(KernelError::Fail)?;
            if m.owner == Some(current) {
                LockPath::OwnedByCaller
            } else if m.owner.is_none() {
                m.owner = Some(current);
                LockPath::Acquired
            } else {
                m.wait_queue.push_back(current);
                LockPath::MustBlock
            }
        };
        if let LockPath::MustBlock = path {
            wait::block_current(kcb, Some(WaitOrigin::Mutex(id)), delay);
        }
        (current, path)
    };

    match path {
        LockPath::Acquired => Ok(()),
        LockPath::OwnedByCaller => Err(KernelError::TaskBusy),
        LockPath::MustBlock => {
            task::wait_until_running(&mut lock, current);
            let kcb = Traits::state().kcb().read(&*lock);
            match kcb.task(current).map(|t| t.wait_result) {
                // On a successful wake the unlocker has already made us the
                // owner; on expiry the tick path has already removed us
                // from the wait list.
                Some(WaitResult::Complete) => Ok(()),
                Some(WaitResult::TimedOut) => Err(KernelError::Timeout),
                None => Err(KernelError::Fail),
            }
        }
    }
}

/// Release `id` while the caller already holds the scheduler lock, handing
/// ownership to the head waiter if there is one. Returns the woken task.
///
/// Used by `unlock` and by the condition-variable wait path, which must
/// release the mutex atomically with its own enqueue.
pub(crate) fn unlock_in<Traits: KernelStatic>(
    kcb: &mut Kcb<Traits>,
    id: MutexId,
    current: TaskId,
) -> Result<Option<TaskId>> {
    let next = {
        let m = kcb.mutexes.get_mut(id.raw()).ok_or(KernelError::Fail)?;
        if m.owner != Some(current) {
            return Err(KernelError::NotOwner);
        }
        match m.wait_queue.pop_front() {
            Some(next) => {
                m.owner = Some(next);
                Some(next)
            }
            None => {
                m.owner = None;
                None
            }
        }
    };
    if let Some(next) = next {
        wait::complete_wait(kcb, next, WaitResult::Complete);
    }
    Ok(next)
}

impl<Traits: KernelTraits> System<Traits> {
    pub fn mutex_create() -> Result<MutexId> {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        kcb.mutexes
            .insert(MutexCb {
                owner: None,
                wait_queue: WaitQueue::new(),
            })
            .map(MutexId::from_raw)
            .ok_or(KernelError::Fail)
    }

    /// Destroy an unowned, uncontended mutex.
    pub fn mutex_destroy(id: MutexId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        {
            let m = kcb.mutexes.get(id.raw()).ok_or(KernelError::Fail)?;
            if m.owner.is_some() || !m.wait_queue.is_empty() {
                return Err(KernelError::TaskBusy);
            }
        }
        kcb.mutexes.remove(id.raw());
        Ok(())
    }

    /// Acquire the mutex, blocking in FIFO order while it is owned.
    /// A recursive attempt fails with `TaskBusy`.
    pub fn mutex_lock(id: MutexId) -> Result {
        lock_inner::<Traits>(id, 0)
    }

    /// As [`Self::mutex_lock`], but never blocks.
    pub fn mutex_trylock(id: MutexId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        let current = kcb.current.ok_or(KernelError::Fail)?;
        let m = kcb.mutexes.get_mut(id.raw()).ok_or(KernelError::Fail)?;
        if m.owner.is_none() {
            m.owner = Some(current);
            Ok(())
        } else {
            Err(KernelError::TaskBusy)
        }
    }

    /// As [`Self::mutex_lock`] with a deadline. `ticks == 0` behaves as
    /// [`Self::mutex_trylock`]; on expiry the caller is off the wait list
    /// and gets `Timeout`. If ownership was transferred in the same tick
    /// the wake wins and the result is `Ok`.
    pub fn mutex_timedlock(id: MutexId, ticks: u32) -> Result {
        if ticks == 0 {
            return Self::mutex_trylock(id);
        }
        lock_inner::<Traits>(id, ticks)
    }

    /// Release the mutex, transferring ownership to the head waiter if any.
    pub fn mutex_unlock(id: MutexId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let woke = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            let current = kcb.current.ok_or(KernelError::Fail)?;
            unlock_in(kcb, id, current)?
        };
        if woke.is_some() {
            task::unlock_sched_and_check_preemption(lock);
        }
        Ok(())
    }

    pub fn mutex_owned_by_current(id: MutexId) -> Result<bool> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        let current = kcb.current.ok_or(KernelError::Fail)?;
        let m = kcb.mutexes.get(id.raw()).ok_or(KernelError::Fail)?;
        Ok(m.owner == Some(current))
    }

    pub fn mutex_waiting_count(id: MutexId) -> Result<usize> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        Ok(kcb
            .mutexes
            .get(id.raw())
            .ok_or(KernelError::Fail)?
            .wait_queue
            .len())
    }
}
