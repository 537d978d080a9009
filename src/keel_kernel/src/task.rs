//! Tasks
use core::{fmt, num::NonZeroU16, ptr::NonNull};

use alloc::alloc::Layout;
use alloc::boxed::Box;

use bitflags::bitflags;

use crate::{
    error::{KernelError, Result},
    kcb::Kcb,
    klock::{self, SchedLockGuard},
    wait::{self, WaitOrigin, WaitResult},
    KernelTraits, PortThreading, SchedMode, System,
};

pub(crate) mod readyqueue;

/// The smallest stack a task may be spawned with, before the port's trap
/// red zone is added.
pub const MIN_TASK_STACK: usize = 256;

/// Unique task identifier. Allocated monotonically from 1; zero is reserved
/// as "invalid" and ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(NonZeroU16);

impl TaskId {
    pub const fn new(raw: u16) -> Option<Self> {
        match NonZeroU16::new(raw) {
            Some(x) => Some(Self(x)),
            None => None,
        }
    }

    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

/// Task priority, lower level number = higher urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Crit = 0,
    Realtime = 1,
    High = 2,
    Above = 3,
    Normal = 4,
    Below = 5,
    Low = 6,
    Idle = 7,
}

impl Priority {
    /// The number of priority levels.
    pub const LEVELS: usize = 8;

    pub const fn level(self) -> usize {
        self as usize
    }

    /// The time-slice budget (in ticks) granted to a task of this priority
    /// on each election.
    pub const fn time_slice(self) -> u8 {
        match self {
            Self::Crit => 1,
            Self::Realtime => 2,
            Self::High => 3,
            Self::Above => 4,
            Self::Normal => 5,
            Self::Below => 7,
            Self::Low => 10,
            Self::Idle => 15,
        }
    }

    pub const fn from_level(level: usize) -> Option<Self> {
        match level {
            0 => Some(Self::Crit),
            1 => Some(Self::Realtime),
            2 => Some(Self::High),
            3 => Some(Self::Above),
            4 => Some(Self::Normal),
            5 => Some(Self::Below),
            6 => Some(Self::Low),
            7 => Some(Self::Idle),
            _ => None,
        }
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// Created but not yet schedulable, or exited.
    Stopped,
    Ready,
    Running,
    Blocked,
    Suspended,
}

bitflags! {
    /// Per-task flag word.
    pub struct TaskFlags: u32 {
        /// The task runs in the unprivileged mode and enters the kernel
        /// through the numbered syscall surface.
        const USER_MODE = 1 << 0;
    }
}

/// An owned, aligned task stack buffer.
pub(crate) struct StackBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl StackBuf {
    fn alloc(size: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, align).ok()?;
        // Safety: `size` is validated non-zero by the spawn path
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for StackBuf {
    fn drop(&mut self) {
        // Safety: allocated with this exact layout in `alloc`
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// Safety: the buffer is exclusively owned and only ever lent out as raw
// pointers under the scheduler lock.
unsafe impl Send for StackBuf {}
unsafe impl Sync for StackBuf {}

impl fmt::Debug for StackBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StackBuf")
            .field("base", &self.ptr)
            .field("len", &self.len())
            .finish()
    }
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// The port's per-task context storage.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that low-level port code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    pub(crate) id: TaskId,
    pub(crate) entry: fn(),
    pub(crate) stack: StackBuf,
    pub(crate) st: TaskSt,
    pub(crate) base_priority: Priority,
    pub(crate) time_slice: u8,
    pub(crate) delay: u32,
    pub(crate) wait_origin: Option<WaitOrigin>,
    pub(crate) wait_result: WaitResult,
    pub(crate) rt_data: usize,
    pub(crate) flags: TaskFlags,
    #[cfg(feature = "stack-protect")]
    pub(crate) canary: u32,
}

impl<Traits: PortThreading> TaskCb<Traits> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn entry(&self) -> fn() {
        self.entry
    }

    pub fn state(&self) -> TaskSt {
        self.st
    }

    pub fn priority(&self) -> Priority {
        self.base_priority
    }

    pub(crate) fn level(&self) -> usize {
        self.base_priority.level()
    }

    pub fn is_user_mode(&self) -> bool {
        self.flags.contains(TaskFlags::USER_MODE)
    }

    pub fn stack_base(&self) -> *mut u8 {
        self.stack.base()
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Where the port should place the initial stack pointer: the top of
    /// the stack buffer, below the upper guard word when stack protection
    /// is on. Always aligned to `STACK_ALIGN`.
    pub fn initial_stack_top(&self) -> usize {
        let top = self.stack.base() as usize + self.stack.len();
        if cfg!(feature = "stack-protect") {
            top - 16
        } else {
            top
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("id", &self.id)
            .field("st", &self.st)
            .field("base_priority", &self.base_priority)
            .field("time_slice", &self.time_slice)
            .field("delay", &self.delay)
            .field("wait_origin", &self.wait_origin)
            .field("stack", &self.stack)
            .finish()
    }
}

/// Create a task in `kcb` and make it Ready. Requires the scheduler lock to
/// be held by the caller (the kcb borrow is the proof).
pub(crate) fn spawn_in<Traits: KernelTraits>(
    kcb: &mut Kcb<Traits>,
    entry: fn(),
    stack_size: usize,
    priority: Priority,
    user_mode: bool,
) -> Result<TaskId> {
    let id = TaskId::new(kcb.next_tid).ok_or(KernelError::TcbAlloc)?;

    let align = Traits::STACK_ALIGN;
    let size = stack_size
        .max(MIN_TASK_STACK)
        .checked_add(align - 1)
        .ok_or(KernelError::StackAlloc)?
        & !(align - 1);
    let size = size
        .checked_add(Traits::STACK_RED_ZONE)
        .ok_or(KernelError::StackAlloc)?;

    let stack = StackBuf::alloc(size, align).ok_or(KernelError::StackAlloc)?;

    #[cfg(feature = "stack-protect")]
    let canary = kcb.canary_gen.next_u32();

    let task = Box::new(TaskCb::<Traits> {
        port_task_state: crate::utils::Init::INIT,
        id,
        entry,
        stack,
        st: TaskSt::Stopped,
        base_priority: priority,
        time_slice: priority.time_slice(),
        delay: 0,
        wait_origin: None,
        wait_result: WaitResult::Complete,
        rt_data: 0,
        flags: if user_mode {
            TaskFlags::USER_MODE
        } else {
            TaskFlags::empty()
        },
        #[cfg(feature = "stack-protect")]
        canary,
    });

    #[cfg(feature = "stack-protect")]
    write_canaries(&task);

    kcb.next_tid = kcb.next_tid.checked_add(1).unwrap_or(0);
    kcb.tasks.push(task);

    // Safety: the scheduler lock is held and the boxed TCB's address is
    // stable from here on
    unsafe { Traits::initialize_task_state(kcb.tasks.last().unwrap()) };

    kcb.make_ready(id);
    Ok(id)
}

#[cfg(feature = "stack-protect")]
fn write_canaries<Traits: PortThreading>(task: &TaskCb<Traits>) {
    let base = task.stack.base();
    // Safety: the buffer is at least MIN_TASK_STACK bytes and 4-aligned at
    // both ends
    unsafe {
        (base as *mut u32).write_volatile(task.canary);
        (base.add(task.stack.len() - 4) as *mut u32).write_volatile(task.canary);
    }
}

/// Verify the running task's stack guard words.
#[cfg(feature = "stack-protect")]
pub(crate) fn check_current_canary<Traits: PortThreading>(kcb: &Kcb<Traits>) -> Result {
    if let Some(task) = kcb.current_task() {
        let base = task.stack.base();
        // Safety: same layout as `write_canaries`
        let (lo, hi) = unsafe {
            (
                (base as *const u32).read_volatile(),
                (base.add(task.stack.len() - 4) as *const u32).read_volatile(),
            )
        };
        if lo != task.canary || hi != task.canary {
            return Err(KernelError::StackCheck);
        }
    }
    Ok(())
}

/// Park the calling task until the scheduler elects it again. Entered in
/// the Blocked (or Suspended) state with the scheduler lock held; returns
/// with the lock held and the task Running.
pub(crate) fn wait_until_running<Traits: KernelTraits>(
    lock: &mut SchedLockGuard<Traits>,
    task: TaskId,
) {
    loop {
        {
            let kcb = Traits::state().kcb().read(&**lock);
            match kcb.task(task) {
                Some(t) if t.st == TaskSt::Running => break,
                Some(_) => {}
                None => break,
            }
        }
        klock::yield_under_lock(lock);
    }
}

/// Relinquish the scheduler lock. After that, if a task with a priority
/// level higher than the running task's is Ready, yield the processor.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_sched_and_check_preemption<Traits: KernelTraits>(
    lock: SchedLockGuard<Traits>,
) {
    let should_yield = {
        let kcb = Traits::state().kcb().read(&*lock);
        kcb.started && kcb.preemption_pending()
    };
    drop(lock);

    if should_yield && Traits::is_task_context() {
        // Safety: the scheduler lock is inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Suspend `id`, abandoning any wait it is blocked on. Returns whether the
/// suspended task is the caller (which must then park itself).
pub(crate) fn suspend_in<Traits: PortThreading>(kcb: &mut Kcb<Traits>, id: TaskId) -> Result<bool> {
    let (st, level, origin) = {
        let t = kcb.task(id).ok_or(KernelError::TaskNotFound)?;
        (t.st, t.level(), t.wait_origin)
    };

    let abandoned_wait = match st {
        TaskSt::Ready => {
            kcb.ready.remove(level, id);
            false
        }
        TaskSt::Running => false,
        TaskSt::Blocked => {
            if let Some(origin) = origin {
                wait::remove_waiter(kcb, origin, id);
            }
            true
        }
        TaskSt::Stopped | TaskSt::Suspended => return Err(KernelError::TaskCantSuspend),
    };

    let t = kcb.task_mut(id).unwrap();
    t.st = TaskSt::Suspended;
    t.delay = 0;
    t.wait_origin = None;
    if abandoned_wait {
        // The wait was cut short; the resumed task must not report a
        // successful acquisition it never received.
        t.wait_result = WaitResult::TimedOut;
    }

    Ok(kcb.current == Some(id))
}

pub(crate) fn resume_in<Traits: PortThreading>(kcb: &mut Kcb<Traits>, id: TaskId) -> Result {
    let st = kcb.task(id).ok_or(KernelError::TaskNotFound)?.st;
    if st != TaskSt::Suspended {
        return Err(KernelError::TaskCantResume);
    }
    kcb.make_ready(id);
    Ok(())
}

pub(crate) fn cancel_in<Traits: PortThreading>(kcb: &mut Kcb<Traits>, id: TaskId) -> Result {
    if kcb.current == Some(id) {
        return Err(KernelError::TaskCantRemove);
    }
    let idx = kcb.task_index(id).ok_or(KernelError::TaskNotFound)?;
    let (st, level, origin) = {
        let t = &kcb.tasks[idx];
        (t.st, t.level(), t.wait_origin)
    };
    match st {
        TaskSt::Running => return Err(KernelError::TaskCantRemove),
        TaskSt::Ready => {
            kcb.ready.remove(level, id);
        }
        TaskSt::Blocked => {
            if let Some(origin) = origin {
                wait::remove_waiter(kcb, origin, id);
            }
        }
        TaskSt::Stopped | TaskSt::Suspended => {}
    }
    // Dropping the box releases the TCB and its stack; every list reference
    // to the id is gone by this point.
    kcb.tasks.remove(idx);
    Ok(())
}

pub(crate) fn set_priority_in<Traits: PortThreading>(
    kcb: &mut Kcb<Traits>,
    id: TaskId,
    priority: Priority,
) -> Result {
    let (st, old) = {
        let t = kcb.task(id).ok_or(KernelError::TaskNotFound)?;
        (t.st, t.base_priority)
    };
    if old == priority {
        return Ok(());
    }
    kcb.task_mut(id).unwrap().base_priority = priority;
    if st == TaskSt::Ready {
        kcb.ready.remove(old.level(), id);
        kcb.ready.push_back(priority.level(), id);
    }
    Ok(())
}

/// Transition the running task into Blocked with a pure time wait.
pub(crate) fn block_current_for_delay<Traits: PortThreading>(kcb: &mut Kcb<Traits>, ticks: u32) {
    wait::block_current(kcb, None, ticks);
}

/// These associated functions implement the task-related kernel services.
impl<Traits: KernelTraits> System<Traits> {
    /// Create and start a new task at [`Priority::Normal`].
    pub fn task_spawn(entry: fn(), stack_size: usize) -> Result<TaskId> {
        Self::task_spawn_with_priority(entry, stack_size, Priority::Normal)
    }

    pub fn task_spawn_with_priority(
        entry: fn(),
        stack_size: usize,
        priority: Priority,
    ) -> Result<TaskId> {
        let mut lock = klock::lock_sched::<Traits>()?;
        let id = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            spawn_in(kcb, entry, stack_size, priority, false)?
        };
        unlock_sched_and_check_preemption(lock);
        Ok(id)
    }

    /// Spawn an unprivileged task. Used by the `tadd` syscall.
    pub fn task_spawn_user(entry: fn(), stack_size: usize) -> Result<TaskId> {
        let mut lock = klock::lock_sched::<Traits>()?;
        let id = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            spawn_in(kcb, entry, stack_size, Priority::Normal, true)?
        };
        unlock_sched_and_check_preemption(lock);
        Ok(id)
    }

    /// Cancel and remove a task. A task cannot cancel itself.
    pub fn task_cancel(id: TaskId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        cancel_in(kcb, id)
    }

    /// Voluntarily yield the processor.
    pub fn task_yield() {
        // Safety: called from a task context with no lock held
        unsafe { Traits::yield_cpu() };
    }

    /// Block the calling task for `ticks` system ticks. Zero is a no-op.
    pub fn task_delay(ticks: u32) -> Result {
        if ticks == 0 {
            return Ok(());
        }
        let mut lock = klock::lock_sched::<Traits>()?;
        let current = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            let current = kcb.current.ok_or(KernelError::Fail)?;
            block_current_for_delay(kcb, ticks);
            current
        };
        wait_until_running(&mut lock, current);
        Ok(())
    }

    /// Suspend a task (possibly the caller), removing it from scheduling
    /// until [`Self::task_resume`].
    pub fn task_suspend(id: TaskId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let is_current = {
            let kcb = Traits::state().kcb().write(&mut *lock);
            suspend_in(kcb, id)?
        };
        if is_current {
            wait_until_running(&mut lock, id);
        }
        Ok(())
    }

    pub fn task_resume(id: TaskId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        {
            let kcb = Traits::state().kcb().write(&mut *lock);
            resume_in(kcb, id)?;
        }
        unlock_sched_and_check_preemption(lock);
        Ok(())
    }

    /// Change a task's base priority.
    pub fn task_set_priority(id: TaskId, priority: Priority) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        {
            let kcb = Traits::state().kcb().write(&mut *lock);
            set_priority_in(kcb, id, priority)?;
        }
        unlock_sched_and_check_preemption(lock);
        Ok(())
    }

    pub fn task_priority(id: TaskId) -> Result<Priority> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        Ok(kcb.task(id).ok_or(KernelError::TaskNotFound)?.base_priority)
    }

    /// The id of the calling task.
    pub fn task_current() -> Result<TaskId> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        kcb.current.ok_or(KernelError::Fail)
    }

    /// Reverse lookup: find a task by its entry function.
    pub fn task_idref(entry: fn()) -> Result<TaskId> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        kcb.tasks
            .iter()
            .find(|t| t.entry == entry)
            .map(|t| t.id)
            .ok_or(KernelError::TaskNotFound)
    }

    /// Attach an opaque word consumed by the real-time scheduler hook.
    pub fn task_set_rt_data(id: TaskId, rt_data: usize) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        kcb.task_mut(id).ok_or(KernelError::TaskNotFound)?.rt_data = rt_data;
        Ok(())
    }

    /// Wait for the next tick. In cooperative mode this is a plain yield.
    pub fn task_wfi() -> Result {
        let (mode, start) = {
            let lock = klock::lock_sched::<Traits>()?;
            let kcb = Traits::state().kcb().read(&*lock);
            (kcb.mode, kcb.ticks)
        };
        match mode {
            SchedMode::Cooperative => {
                Self::task_yield();
                Ok(())
            }
            SchedMode::Preemptive => {
                loop {
                    Traits::idle_wait();
                    let lock = klock::lock_sched::<Traits>()?;
                    let now = Traits::state().kcb().read(&*lock).ticks;
                    if now != start {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    /// The number of tasks in the system, including the idle task.
    pub fn task_count() -> Result<usize> {
        let lock = klock::lock_sched::<Traits>()?;
        Ok(Traits::state().kcb().read(&*lock).tasks.len())
    }

    /// The global tick counter.
    pub fn ticks() -> Result<u32> {
        let lock = klock::lock_sched::<Traits>()?;
        Ok(Traits::state().kcb().read(&*lock).ticks)
    }

    /// Milliseconds since boot, derived from the tick counter.
    pub fn uptime_ms() -> Result<u64> {
        let ticks = Self::ticks()? as u64;
        Ok(ticks * 1000 / Traits::TICKS_PER_SEC as u64)
    }

    /// Mark the calling task Stopped. The port's entry trampoline calls
    /// this when a task's entry function returns, then dispatches away for
    /// the last time.
    pub fn exit_current_task() -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        let current = kcb.current.ok_or(KernelError::Fail)?;
        kcb.task_mut(current).unwrap().st = TaskSt::Stopped;
        Ok(())
    }
}
