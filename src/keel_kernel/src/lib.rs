//! The `keel` kernel core: task lifecycle and scheduling, synchronization
//! primitives, software timers, and the trap-level dispatch contract, for
//! single-hart 32-bit microcontrollers.
//!
//! The kernel is generic over a *system type* implementing [`KernelTraits`],
//! which binds together a port (the architecture- or host-specific layer
//! implementing [`PortThreading`] and [`PortTimer`]) and the kernel's static
//! state ([`KernelStatic`]). Ports provide a `use_port!` macro that defines
//! the system type and instantiates the state.
//!
//! # Contexts
//!
//! Code runs either in a *task context* (on a task's own stack, interrupts
//! enabled unless a critical section is active) or in a *trap context* (the
//! tick interrupt or an environment call). Blocking operations are only
//! legal in a task context; the trap context reaches the same scheduler
//! entry points through [`PortToKernel`].
#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod error;
mod kcb;
mod klock;
mod condvar;
mod mutex;
mod semaphore;
pub mod syscall;
mod task;
mod timer;
pub mod utils;
mod wait;

pub use crate::error::{KernelError, Result};
pub use crate::kcb::{Kcb, RtHookFn, SchedMode};
pub use crate::condvar::CondvarId;
pub use crate::mutex::MutexId;
pub use crate::semaphore::{SemaphoreId, SEM_MAX_COUNT};
pub use crate::task::{Priority, TaskCb, TaskId, TaskSt, MIN_TASK_STACK};
pub use crate::timer::{TimerId, TimerMode, TIMER_TICK_BATCH};

use crate::utils::Init;

/// The marker type through which all kernel services are invoked, e.g.,
/// `System::<SystemTraits>::task_spawn(entry, 1024)`.
pub struct System<Traits>(core::marker::PhantomData<Traits>);

/// The umbrella trait a system type must satisfy. Automatically implemented
/// for any type implementing the component traits.
pub trait KernelTraits: PortThreading + PortTimer + KernelStatic + 'static {}
impl<T: PortThreading + PortTimer + KernelStatic + 'static> KernelTraits for T {}

/// Associates the kernel's static state and the application entry point with
/// a system type. Implemented by a port's `use_port!` macro.
///
/// # Safety
///
/// `state` must return the same instance every time, and that instance must
/// not be shared with another system type.
pub unsafe trait KernelStatic: PortThreading {
    fn state() -> &'static State<Self>;

    /// The application entry point. Called once during boot, after the idle
    /// task exists but before the first dispatch. Its return value selects
    /// the scheduling mode.
    const APP_MAIN: fn() -> SchedMode;
}

/// The port's threading and context-switching surface.
///
/// # Safety
///
/// The implementation must uphold the contract documented on each method;
/// the kernel's memory safety rests on it.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Architecture-defined per-task context storage (saved stack pointer,
    /// cooperative register snapshot, or a host-side thread handle).
    type PortTaskState: Send + Sync + Init + core::fmt::Debug + 'static;

    /// Bytes to reserve above every task stack for a full trap frame (the
    /// "red zone"). Added on top of the requested stack size at spawn.
    const STACK_RED_ZONE: usize;

    /// Required alignment of a task stack base and initial stack pointer.
    const STACK_ALIGN: usize = 16;

    /// Try to enter the scheduler-off critical section (mask the tick
    /// source). Returns `false` if it is already active.
    unsafe fn try_enter_sched_lock() -> bool;

    /// Enter the scheduler-off critical section, waiting for it to become
    /// available if another context holds it.
    unsafe fn enter_sched_lock();

    /// Leave the scheduler-off critical section.
    unsafe fn leave_sched_lock();

    fn is_sched_lock_active() -> bool;

    /// Disable all maskable interrupts. Used only where data is shared with
    /// arbitrary ISRs (notably the panic path).
    unsafe fn enter_critical();

    unsafe fn leave_critical();

    /// Whether the current context is a task context (as opposed to the
    /// boot phase or a trap handler). Preemption checks only yield from a
    /// task context; the trap path requests elections through
    /// [`PortToKernel`] instead.
    fn is_task_context() -> bool;

    /// Prepare a newly spawned task for its first dispatch: build the
    /// cooperative context and the initial trap frame on the task's stack.
    ///
    /// Called with the scheduler lock held and the task registered in the
    /// task table (its address is stable from this point on).
    unsafe fn initialize_task_state(task: &TaskCb<Self>);

    /// Relinquish the processor and run the scheduler. In preemptive mode
    /// this reaches the trap path (`ecall` on the reference port); in
    /// cooperative mode it performs a save/restore context switch.
    ///
    /// Must be called without the scheduler lock held.
    unsafe fn yield_cpu();

    /// Transfer control to the first elected task. Called once at the end of
    /// boot with the scheduler lock conceptually held; the lock is released
    /// at the switch boundary.
    unsafe fn dispatch_first_task() -> !;

    /// Wait for the next interrupt in a low-power state, then return.
    fn idle_wait();

    /// Best-effort shutdown and hard halt, reporting `err` through the
    /// port's direct (non-deferred) console path. Must not take any lock.
    fn panic_halt(err: KernelError) -> !;

    /// A word of boot-time entropy used to seed the stack-canary generator.
    fn entropy() -> u32 {
        0x9e37_79b9
    }
}

/// The port's tick-source surface.
pub trait PortTimer: Sized + 'static {
    /// Nominal tick frequency. `uptime` and millisecond conversions are
    /// derived from this.
    const TICKS_PER_SEC: u32;

    /// Start the periodic tick source.
    unsafe fn timer_enable();

    /// Stop the periodic tick source entirely (not the lightweight masking
    /// used by the scheduler-off section).
    unsafe fn timer_disable();
}

/// Kernel entry points called by the port. Implemented on [`System`].
///
/// # Safety
///
/// Only meant to be called by a port, from the contexts documented on each
/// method.
pub unsafe trait PortToKernel {
    /// Boot the kernel: spawn the idle task, run the application entry
    /// point, verify the task set, elect the first task, and invoke
    /// [`PortThreading::dispatch_first_task`].
    ///
    /// Called after hardware initialization with the scheduler lock active.
    unsafe fn boot() -> !;

    /// The tick entry: advance the tick counter, fire expired software
    /// timers, update delay-waiters, account the running task's time slice,
    /// and (in preemptive mode) elect the next task.
    ///
    /// Called from the tick interrupt (or the simulator's tick thread).
    unsafe fn timer_tick();

    /// The yield entry: demote the running task to the tail of its level
    /// and elect the next task. Ticks are not advanced.
    unsafe fn choose_running_task();
}

/// Kernel static state: the kernel control block behind the scheduler-off
/// token. One instance exists per system type, created by `use_port!`.
pub struct State<Traits: PortThreading> {
    kcb: klock::SchedLockCell<Traits, Kcb<Traits>>,
}

impl<Traits: PortThreading> State<Traits> {
    pub const fn new() -> Self {
        Self {
            kcb: klock::SchedLockCell::new(Kcb::new()),
        }
    }

    pub(crate) fn kcb(&self) -> &klock::SchedLockCell<Traits, Kcb<Traits>> {
        &self.kcb
    }
}

impl<Traits: PortThreading> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_utils;
