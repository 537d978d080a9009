//! Wait lists and the blocked-task bookkeeping shared by all waitable
//! objects.
//!
//! Wait lists are FIFO rings of task ids; a blocked task additionally
//! carries a single back-link ([`WaitOrigin`]) naming the list it occupies,
//! so a timeout or cancellation can remove it without scanning every
//! object.
use alloc::collections::VecDeque;

use crate::condvar::CondvarId;
use crate::kcb::Kcb;
use crate::mutex::MutexId;
use crate::semaphore::SemaphoreId;
use crate::task::{TaskId, TaskSt};
use crate::PortThreading;

/// A FIFO queue of tasks blocked on one waitable object.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<TaskId>,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn push_back(&mut self, task: TaskId) {
        debug_assert!(!self.waiters.contains(&task));
        self.waiters.push_back(task);
    }

    pub(crate) fn pop_front(&mut self) -> Option<TaskId> {
        self.waiters.pop_front()
    }

    pub(crate) fn remove(&mut self, task: TaskId) -> bool {
        if let Some(pos) = self.waiters.iter().position(|&t| t == task) {
            self.waiters.remove(pos);
            true
        } else {
            false
        }
    }

    pub(crate) fn contains(&self, task: TaskId) -> bool {
        self.waiters.contains(&task)
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Names the wait list a blocked task sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOrigin {
    Mutex(MutexId),
    Semaphore(SemaphoreId),
    Condvar(CondvarId),
}

/// The result of the wait, written by whoever ends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitResult {
    /// The wait condition was satisfied; any associated resource has
    /// already been transferred to the waiter.
    Complete,
    /// The delay expired before the condition was satisfied.
    TimedOut,
}

/// Transition the running task into the Blocked state. The caller has
/// already inserted it into the relevant wait list (if any) and is about to
/// yield; `delay == 0` means no time bound.
pub(crate) fn block_current<Traits: PortThreading>(
    kcb: &mut Kcb<Traits>,
    origin: Option<WaitOrigin>,
    delay: u32,
) {
    let task = kcb
        .current_task_mut()
        .expect("blocking operation outside a task context");
    debug_assert_eq!(task.st, TaskSt::Running);
    task.wait_origin = origin;
    task.wait_result = WaitResult::Complete;
    task.delay = delay;
    task.st = TaskSt::Blocked;
}

/// Deassociate `task` from its wait and make it Ready.
///
/// This may make a task Ready but doesn't yield the processor. Call
/// `unlock_sched_and_check_preemption` as needed.
pub(crate) fn complete_wait<Traits: PortThreading>(
    kcb: &mut Kcb<Traits>,
    task: TaskId,
    result: WaitResult,
) {
    if let Some(t) = kcb.task_mut(task) {
        debug_assert_eq!(t.st, TaskSt::Blocked);
        t.wait_origin = None;
        t.wait_result = result;
        t.delay = 0;
    }
    kcb.make_ready(task);
}

/// Remove `task` from the wait list named by `origin`. Used by the timeout
/// path and by suspension/cancellation of a blocked task.
pub(crate) fn remove_waiter<Traits: PortThreading>(
    kcb: &mut Kcb<Traits>,
    origin: WaitOrigin,
    task: TaskId,
) -> bool {
    match origin {
        WaitOrigin::Mutex(id) => kcb
            .mutexes
            .get_mut(id.raw())
            .map_or(false, |m| m.wait_queue.remove(task)),
        WaitOrigin::Semaphore(id) => kcb
            .semaphores
            .get_mut(id.raw())
            .map_or(false, |s| s.wait_queue.remove(task)),
        WaitOrigin::Condvar(id) => kcb
            .condvars
            .get_mut(id.raw())
            .map_or(false, |c| c.wait_queue.remove(task)),
    }
}
