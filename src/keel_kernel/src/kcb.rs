//! The kernel control block and the scheduler entry points reached from
//! the port's trap path.
use core::num::NonZeroU16;

use alloc::{boxed::Box, vec::Vec};

use crate::{
    condvar::CondvarCb,
    error::{KernelError, Result},
    klock,
    mutex::MutexCb,
    semaphore::SemaphoreCb,
    task::{self, readyqueue::ReadyQueue, Priority, TaskCb, TaskId, TaskSt},
    timer::{self, TimerCb, TimerId},
    utils::Xorshift32,
    wait::{self, WaitResult},
    KernelTraits, PortThreading, PortToKernel, System,
};

/// Stack size of the kernel-spawned idle task.
pub(crate) const IDLE_TASK_STACK: usize = 512;

/// The scheduling mode, fixed before the first dispatch by the return
/// value of the application entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedMode {
    /// The tick interrupt may switch tasks at any suspension-free point.
    Preemptive,
    /// Switching happens only at voluntary yields; the tick interrupt
    /// still drives timekeeping and software timers.
    Cooperative,
}

/// An optional policy override consulted by the scheduler on every
/// election. Returning the id of a Ready task elects it; `None` falls
/// through to the standard priority/round-robin selection.
///
/// The hook runs inside the scheduler-off section and must not block.
pub type RtHookFn<Traits> = fn(&Kcb<Traits>) -> Option<TaskId>;

/// A monotonically keyed table of kernel objects. Ids are never reused, so
/// a stale handle simply stops resolving instead of aliasing a newer
/// object.
pub(crate) struct ObjectTable<T> {
    entries: Vec<(u16, T)>,
    next_id: u16,
}

impl<T> ObjectTable<T> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> Option<NonZeroU16> {
        let id = NonZeroU16::new(self.next_id)?;
        self.next_id = self.next_id.checked_add(1).unwrap_or(0);
        self.entries.push((id.get(), value));
        Some(id)
    }

    pub(crate) fn get(&self, id: u16) -> Option<&T> {
        self.entries
            .binary_search_by_key(&id, |e| e.0)
            .ok()
            .map(|i| &self.entries[i].1)
    }

    pub(crate) fn get_mut(&mut self, id: u16) -> Option<&mut T> {
        self.entries
            .binary_search_by_key(&id, |e| e.0)
            .ok()
            .map(move |i| &mut self.entries[i].1)
    }

    pub(crate) fn remove(&mut self, id: u16) -> Option<T> {
        self.entries
            .binary_search_by_key(&id, |e| e.0)
            .ok()
            .map(|i| self.entries.remove(i).1)
    }
}

/// *Kernel control block* - the singleton holding all scheduler state.
/// Reached exclusively through the scheduler-off token cell in
/// [`crate::State`].
pub struct Kcb<Traits: PortThreading> {
    /// All tasks, in creation (= id) order. Iteration is deterministic and
    /// lookup is a binary search.
    pub(crate) tasks: Vec<Box<TaskCb<Traits>>>,
    pub(crate) current: Option<TaskId>,
    pub(crate) next_tid: u16,
    pub(crate) ticks: u32,
    pub(crate) mode: SchedMode,
    pub(crate) started: bool,
    pub(crate) rt_hook: Option<RtHookFn<Traits>>,
    pub(crate) ready: ReadyQueue,
    pub(crate) mutexes: ObjectTable<MutexCb>,
    pub(crate) semaphores: ObjectTable<SemaphoreCb>,
    pub(crate) condvars: ObjectTable<CondvarCb>,
    pub(crate) timers: ObjectTable<TimerCb>,
    /// Armed timers, sorted by `deadline` ascending; ties keep insertion
    /// order.
    pub(crate) timer_active: Vec<TimerId>,
    pub(crate) canary_gen: Xorshift32,
}

impl<Traits: PortThreading> Kcb<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            tasks: Vec::new(),
            current: None,
            next_tid: 1,
            ticks: 0,
            mode: SchedMode::Preemptive,
            started: false,
            rt_hook: None,
            ready: ReadyQueue::new(),
            mutexes: ObjectTable::new(),
            semaphores: ObjectTable::new(),
            condvars: ObjectTable::new(),
            timers: ObjectTable::new(),
            timer_active: Vec::new(),
            canary_gen: Xorshift32::new(0),
        }
    }

    pub(crate) fn task_index(&self, id: TaskId) -> Option<usize> {
        self.tasks.binary_search_by_key(&id, |t| t.id).ok()
    }

    pub(crate) fn task(&self, id: TaskId) -> Option<&TaskCb<Traits>> {
        self.task_index(id).map(|i| &*self.tasks[i])
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskCb<Traits>> {
        self.task_index(id).map(move |i| &mut *self.tasks[i])
    }

    pub(crate) fn current_task(&self) -> Option<&TaskCb<Traits>> {
        self.current.and_then(|id| self.task(id))
    }

    pub(crate) fn current_task_mut(&mut self) -> Option<&mut TaskCb<Traits>> {
        match self.current {
            Some(id) => self.task_mut(id),
            None => None,
        }
    }

    /// Transition `id` into Ready and enqueue it at the tail of its level.
    pub(crate) fn make_ready(&mut self, id: TaskId) {
        if let Some(t) = self.task_mut(id) {
            t.st = TaskSt::Ready;
            let level = t.level();
            self.ready.push_back(level, id);
        }
    }

    /// Whether a Ready task outranks the running one (or there is no
    /// running one).
    pub(crate) fn preemption_pending(&self) -> bool {
        match self.current_task() {
            Some(t) if t.st == TaskSt::Running => self
                .ready
                .highest_level()
                .map_or(false, |highest| highest < t.level()),
            _ => true,
        }
    }

    // Read-only inspection, usable from a real-time hook.

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// Ready tasks in selection order (level-major, FIFO within a level).
    pub fn ready_tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ready.iter()
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskSt> {
        self.task(id).map(|t| t.st)
    }

    pub fn task_priority(&self, id: TaskId) -> Option<Priority> {
        self.task(id).map(|t| t.base_priority)
    }

    pub fn task_rt_data(&self, id: TaskId) -> Option<usize> {
        self.task(id).map(|t| t.rt_data)
    }
}

/// Demote the running task (if any) to the tail of its level and elect the
/// next task. The yield-path scheduler entry.
pub(crate) fn choose_next_running_task<Traits: PortThreading>(kcb: &mut Kcb<Traits>) -> Result {
    if let Some(current) = kcb.current {
        let demote = kcb.task(current).map_or(false, |t| t.st == TaskSt::Running);
        if demote {
            let level = kcb.task(current).unwrap().level();
            kcb.task_mut(current).unwrap().st = TaskSt::Ready;
            kcb.ready.push_back(level, current);
        }
    }
    elect(kcb)
}

/// Pick the next running task: the real-time hook first, then the highest
/// non-empty level in FIFO order. Fails with `NoTasks` on an empty ready
/// set.
fn elect<Traits: PortThreading>(kcb: &mut Kcb<Traits>) -> Result {
    let hook_pick = match kcb.rt_hook {
        Some(hook) => {
            hook(&*kcb).filter(|&id| kcb.task(id).map_or(false, |t| t.st == TaskSt::Ready))
        }
        None => None,
    };

    let id = match hook_pick {
        Some(id) => {
            let level = kcb.task(id).unwrap().level();
            kcb.ready.remove(level, id);
            id
        }
        None => match kcb.ready.pop_highest() {
            Some((_, id)) => id,
            None => return Err(KernelError::NoTasks),
        },
    };

    let t = kcb.task_mut(id).unwrap();
    t.st = TaskSt::Running;
    t.time_slice = t.base_priority.time_slice();
    kcb.current = Some(id);
    Ok(())
}

/// Advance every blocked task's delay counter, waking the expired ones. A
/// waiter that is still on a wait list when its delay hits zero has timed
/// out; one whose resource was already handed over is no longer on any
/// list and never reaches this path with a nonzero delay.
fn update_delays<Traits: PortThreading>(kcb: &mut Kcb<Traits>) {
    for i in 0..kcb.tasks.len() {
        let (id, expired_origin) = {
            let t = &mut kcb.tasks[i];
            if t.st != TaskSt::Blocked || t.delay == 0 {
                continue;
            }
            t.delay -= 1;
            if t.delay != 0 {
                continue;
            }
            let origin = t.wait_origin.take();
            t.wait_result = if origin.is_some() {
                WaitResult::TimedOut
            } else {
                WaitResult::Complete
            };
            (t.id, origin)
        };
        if let Some(origin) = expired_origin {
            wait::remove_waiter(kcb, origin, id);
        }
        kcb.make_ready(id);
    }
}

/// The tick-path scheduling decision: account the running task's slice,
/// consult the real-time hook, and switch when the slice expired or a
/// higher-level task became Ready.
fn tick_elect<Traits: PortThreading>(kcb: &mut Kcb<Traits>) -> Result {
    let (current, expired, level) = match kcb.current_task() {
        Some(t) if t.st == TaskSt::Running => (t.id, t.time_slice <= 1, t.level()),
        _ => return choose_next_running_task(kcb),
    };

    {
        let t = kcb.task_mut(current).unwrap();
        t.time_slice = t.time_slice.saturating_sub(1);
    }

    if let Some(hook) = kcb.rt_hook {
        match hook(&*kcb) {
            Some(id) if id == current => {
                // The hook re-elected the running task; grant a fresh slice.
                let slice = kcb.task(current).unwrap().base_priority.time_slice();
                kcb.task_mut(current).unwrap().time_slice = slice;
                return Ok(());
            }
            Some(id) if kcb.task(id).map_or(false, |t| t.st == TaskSt::Ready) => {
                return choose_next_running_task(kcb);
            }
            _ => {}
        }
    }

    let higher_ready = kcb
        .ready
        .highest_level()
        .map_or(false, |highest| highest < level);

    if expired || higher_ready {
        choose_next_running_task(kcb)
    } else {
        Ok(())
    }
}

/// Halt the system through the port's direct console path.
pub(crate) fn kernel_panic<Traits: PortThreading>(err: KernelError) -> ! {
    // Safety: we are on the way down; nothing is released again
    unsafe { Traits::enter_critical() };
    Traits::panic_halt(err)
}

fn idle_entry<Traits: KernelTraits>() {
    loop {
        let _ = System::<Traits>::task_wfi();
    }
}

unsafe impl<Traits: KernelTraits> PortToKernel for System<Traits> {
    unsafe fn boot() -> ! {
        // Safety: the port enters the scheduler-off section before boot
        let mut lock = unsafe { klock::assume_sched_lock::<Traits>() };
        {
            let kcb = Traits::state().kcb().write(&mut *lock);
            kcb.canary_gen.mix(Traits::entropy());
            if let Err(err) =
                task::spawn_in(kcb, idle_entry::<Traits>, IDLE_TASK_STACK, Priority::Idle, false)
            {
                kernel_panic::<Traits>(err);
            }
        }
        drop(lock);

        // The application spawns its initial tasks and selects the mode.
        let mode = (Traits::APP_MAIN)();

        let mut lock = klock::lock_sched_or_assume::<Traits>();
        let result = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            kcb.mode = mode;
            if kcb.tasks.len() < 2 {
                Err(KernelError::NoTasks)
            } else {
                kcb.started = true;
                elect(kcb)
            }
        };
        if let Err(err) = result {
            kernel_panic::<Traits>(err);
        }
        // The scheduler-off section stays conceptually active across the
        // first dispatch; the port releases it at the switch boundary.
        core::mem::forget(lock);

        // Safety: we are the kernel booting on the port's behalf
        unsafe {
            Traits::timer_enable();
            Traits::dispatch_first_task()
        }
    }

    unsafe fn timer_tick() {
        let mut lock = klock::lock_sched_or_assume::<Traits>();
        let result = (|| -> Result {
            let kcb = Traits::state().kcb().write(&mut *lock);
            kcb.ticks = kcb.ticks.saturating_add(1);
            timer::process_expired(kcb);
            update_delays(kcb);
            #[cfg(feature = "stack-protect")]
            if kcb.ticks & 31 == 0 {
                task::check_current_canary(kcb)?;
            }
            if kcb.started && kcb.mode == SchedMode::Preemptive {
                tick_elect(kcb)?;
            }
            Ok(())
        })();
        drop(lock);
        if let Err(err) = result {
            kernel_panic::<Traits>(err);
        }
    }

    unsafe fn choose_running_task() {
        let mut lock = klock::lock_sched_or_assume::<Traits>();
        let result = (|| -> Result {
            let kcb = Traits::state().kcb().write(&mut *lock);
            if !kcb.started {
                return Ok(());
            }
            #[cfg(feature = "stack-protect")]
            task::check_current_canary(kcb)?;
            choose_next_running_task(kcb)
        })();
        drop(lock);
        if let Err(err) = result {
            kernel_panic::<Traits>(err);
        }
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Run `f` with shared access to the running task's control block (or
    /// `None` when nothing is scheduled), entering the scheduler-off
    /// section for the duration.
    ///
    /// This is the accessor ports use to read and update per-task context
    /// (through the interior mutability of
    /// [`crate::PortThreading::PortTaskState`]) around a switch.
    pub fn with_running_task<R>(f: impl FnOnce(Option<&TaskCb<Traits>>) -> R) -> R {
        // Safety: the blocking entry waits for the section instead of
        // failing, so the token is exclusively ours afterwards
        unsafe { Traits::enter_sched_lock() };
        let lock = unsafe { klock::assume_sched_lock::<Traits>() };
        let result = {
            let kcb = Traits::state().kcb().read(&*lock);
            f(kcb.current_task())
        };
        drop(lock);
        result
    }

    /// Install or clear the real-time scheduler hook.
    pub fn set_rt_hook(hook: Option<RtHookFn<Traits>>) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        Traits::state().kcb().write(&mut *lock).rt_hook = hook;
        Ok(())
    }

    /// The scheduling mode selected at boot.
    pub fn sched_mode() -> Result<SchedMode> {
        let lock = klock::lock_sched::<Traits>()?;
        Ok(Traits::state().kcb().read(&*lock).mode)
    }
}
