//! Simulation environment for running the keel kernel on a hosted
//! environment.
//!
//! Every task is backed by an OS thread, but the threads are *gated*: a
//! task thread only executes while the kernel has it elected, and parks
//! itself at every port entry point otherwise. A dedicated timer thread
//! delivers the tick interrupt at a fixed wall-clock cadence. The result
//! is not cycle-accurate preemption - a task that never calls into the
//! kernel keeps its host thread running until its next kernel entry - but
//! every scheduler-visible transition happens exactly where it would on
//! hardware, which is what the kernel's end-to-end tests observe.
use std::cell::Cell;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use keel_kernel::utils::Init;
use keel_kernel::{
    KernelError, KernelTraits, PortToKernel, System, TaskCb, TaskId,
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate keel_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// Wall-clock duration of one simulated tick.
pub const TICK_INTERVAL: Duration = Duration::from_micros(200);

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + keel_kernel::PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static State;
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The timer thread, standing in for the tick interrupt.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
    /// The task this thread backs, if any.
    static CURRENT_TASK: Cell<Option<TaskId>> = Cell::new(None);
}

/// Per-task port state.
#[derive(Debug)]
pub struct TaskState {
    /// The task's state in the port's thread-management state machine.
    /// Accessed under the scheduler lock, so a spin mutex is sufficient.
    tsm: spin::Mutex<Tsm>,
}

/// Thread-management state machine. These don't exactly align with the
/// task states defined in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No context yet; `initialize_task_state` hasn't run.
    Uninit,
    /// Initialized but no host thread has been spawned.
    Dormant,
    /// A host thread backs this task.
    Live,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: spin::Mutex::new(Tsm::Uninit),
        }
    }
}

impl Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

struct PortCore {
    /// The scheduler-off section: the holder's thread id, or `None`.
    sched_lock: Option<ThreadId>,
    /// The task the kernel last elected; only its thread may run.
    running: Option<TaskId>,
    started: bool,
    timer_on: bool,
    shutdown: bool,
    panicked: Option<KernelError>,
}

/// The internal state of the port.
pub struct State {
    core: Mutex<PortCore>,
    cond: Condvar,
}

impl State {
    pub const fn new() -> Self {
        Self {
            core: Mutex::new(PortCore {
                sched_lock: None,
                running: None,
                started: false,
                timer_on: false,
                shutdown: false,
                panicked: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn core(&self) -> std::sync::MutexGuard<'_, PortCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Boot the kernel and run the simulation until [`shutdown`] is
    /// called. Panics from the kernel's panic path are re-raised here.
    pub fn port_boot<Traits: PortInstance>(&'static self) {
        log::trace!("port_boot");

        // The boot thread: enters the scheduler-off section and hands
        // control to the kernel, never to return.
        thread::Builder::new()
            .name("keel-boot".to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));
                // Safety: we are the port booting the kernel
                unsafe {
                    Traits::enter_sched_lock();
                    <System<Traits> as PortToKernel>::boot();
                }
            })
            .unwrap();

        // The timer thread: one tick per TICK_INTERVAL once the scheduler
        // is live.
        thread::Builder::new()
            .name("keel-tick".to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
                loop {
                    thread::sleep(TICK_INTERVAL);
                    {
                        let core = self.core();
                        if core.shutdown {
                            break;
                        }
                        if !core.started || !core.timer_on {
                            continue;
                        }
                    }
                    // Safety: we stand in for the tick interrupt
                    unsafe { <System<Traits> as PortToKernel>::timer_tick() };
                    self.sync_after_dispatch::<Traits>();
                }
                log::trace!("timer thread stopped");
            })
            .unwrap();

        // Wait for the simulation to end.
        let mut core = self.core();
        while !core.shutdown {
            core = self.cond.wait(core).unwrap_or_else(PoisonError::into_inner);
        }
        if let Some(err) = core.panicked {
            drop(core);
            panic!("kernel panic: {err}");
        }
    }

    /// Ask the kernel for an election, then reflect the outcome onto the
    /// thread gates.
    fn dispatch<Traits: PortInstance>(&'static self) {
        // Safety: we are the port; the scheduler lock is not held here
        unsafe { <System<Traits> as PortToKernel>::choose_running_task() };
        self.sync_after_dispatch::<Traits>();
    }

    /// Publish the kernel's `current` to the gates, spawning the backing
    /// thread on a task's first election.
    fn sync_after_dispatch<Traits: PortInstance>(&'static self) {
        let target = System::<Traits>::with_running_task(|task| {
            task.map(|task| {
                let mut tsm = task.port_task_state.tsm.lock();
                let first_run = matches!(*tsm, Tsm::Dormant);
                if first_run {
                    *tsm = Tsm::Live;
                }
                (task.id(), task.entry(), first_run)
            })
        });

        {
            let mut core = self.core();
            core.running = target.map(|(id, _, _)| id);
            self.cond.notify_all();
        }

        if let Some((id, entry, true)) = target {
            log::trace!("spawning backing thread for task {}", id.get());
            thread::Builder::new()
                .name(format!("keel-task-{}", id.get()))
                .spawn(move || task_thread_main::<Traits>(id, entry))
                .unwrap();
        }
    }

    /// Block the calling task thread until the kernel elects it again.
    /// Threads without a task identity (boot, timer) pass through.
    fn gate_current(&self) {
        let me = CURRENT_TASK.with(|c| c.get());
        let Some(me) = me else { return };

        let mut core = self.core();
        loop {
            if core.shutdown {
                // The simulation is over; this thread must not touch user
                // state again.
                drop(core);
                loop {
                    thread::park();
                }
            }
            if core.running == Some(me) {
                return;
            }
            core = self.cond.wait(core).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub unsafe fn try_enter_sched_lock(&self) -> bool {
        let me = thread::current().id();
        let mut core = self.core();
        loop {
            match core.sched_lock {
                None => {
                    core.sched_lock = Some(me);
                    return true;
                }
                // Re-entry from the same thread is the kernel-visible
                // "already active" case.
                Some(holder) if holder == me => return false,
                // Contention from another thread is invisible on a single
                // hart; wait it out.
                Some(_) => {
                    core = self.cond.wait(core).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    pub unsafe fn enter_sched_lock(&self) {
        let me = thread::current().id();
        let mut core = self.core();
        loop {
            if core.sched_lock.is_none() {
                core.sched_lock = Some(me);
                return;
            }
            assert_ne!(
                core.sched_lock,
                Some(me),
                "scheduler-off section entered twice by one thread"
            );
            core = self.cond.wait(core).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub unsafe fn leave_sched_lock(&self) {
        let mut core = self.core();
        debug_assert!(core.sched_lock.is_some());
        core.sched_lock = None;
        self.cond.notify_all();
    }

    pub fn is_sched_lock_active(&self) -> bool {
        self.core().sched_lock.is_some()
    }

    pub fn is_task_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(&self, task: &TaskCb<Traits>) {
        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Uninit => *tsm = Tsm::Dormant,
            Tsm::Dormant => {}
            Tsm::Live => unreachable!("task restart is not supported"),
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        self.dispatch::<Traits>();
        self.gate_current();
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        // The switch boundary: release the section held across boot.
        unsafe { Traits::leave_sched_lock() };
        self.core().started = true;
        self.sync_after_dispatch::<Traits>();

        // The boot thread has nothing further to do.
        loop {
            thread::park();
        }
    }

    pub fn idle_wait(&self) {
        thread::sleep(TICK_INTERVAL / 4);
    }

    pub fn panic_halt(&self, err: KernelError) -> ! {
        log::error!("kernel panic: {err}");
        {
            let mut core = self.core();
            core.panicked = Some(err);
            core.shutdown = true;
            self.cond.notify_all();
        }
        panic!("kernel panic: {err}");
    }

    pub unsafe fn timer_enable(&self) {
        self.core().timer_on = true;
    }

    pub unsafe fn timer_disable(&self) {
        self.core().timer_on = false;
    }

    pub fn entropy(&self) -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0)
    }
}

fn task_thread_main<Traits: PortInstance>(id: TaskId, entry: fn()) {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
    CURRENT_TASK.with(|c| c.set(Some(id)));

    let state = Traits::port_state();
    state.gate_current();

    log::debug!("task {} is now running", id.get());
    entry();
    log::debug!("task {} returned from its entry", id.get());

    // The task ran to completion: retire it and let the scheduler move on.
    let _ = System::<Traits>::exit_current_task();
    state.dispatch::<Traits>();
}

/// Initiate graceful shutdown. The simulation's [`State::port_boot`]
/// returns once this is called; task threads are permanently parked.
pub fn shutdown<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut core = state.core();
    core.shutdown = true;
    state.cond.notify_all();
}

/// Boot the simulated system and run it until [`shutdown`].
pub fn boot<Traits: PortInstance>() {
    Traits::port_state().port_boot::<Traits>();
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident => $app_main:path) => {
        $vis struct $SystemTraits;

        fn __keel_app_main() -> $crate::keel_kernel::SchedMode {
            $app_main()
        }

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::keel_kernel::{
                KernelError, KernelStatic, PortThreading, PortTimer, SchedMode, State, TaskCb,
            };
            use $crate::{PortInstance, State as PortState, TaskState};

            pub(super) static PORT_STATE: PortState = PortState::new();
            static KERNEL_STATE: State<$SystemTraits> = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static PortState {
                    &PORT_STATE
                }
            }

            unsafe impl KernelStatic for $SystemTraits {
                fn state() -> &'static State<$SystemTraits> {
                    &KERNEL_STATE
                }

                const APP_MAIN: fn() -> SchedMode = super::__keel_app_main;
            }

            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                const STACK_RED_ZONE: usize = 0;

                unsafe fn try_enter_sched_lock() -> bool {
                    PORT_STATE.try_enter_sched_lock()
                }

                unsafe fn enter_sched_lock() {
                    PORT_STATE.enter_sched_lock()
                }

                unsafe fn leave_sched_lock() {
                    PORT_STATE.leave_sched_lock()
                }

                fn is_sched_lock_active() -> bool {
                    PORT_STATE.is_sched_lock_active()
                }

                unsafe fn enter_critical() {
                    // The simulator has no device ISRs to mask.
                }

                unsafe fn leave_critical() {}

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                unsafe fn initialize_task_state(task: &TaskCb<Self>) {
                    PORT_STATE.initialize_task_state::<Self>(task)
                }

                unsafe fn yield_cpu() {
                    PORT_STATE.yield_cpu::<Self>()
                }

                unsafe fn dispatch_first_task() -> ! {
                    PORT_STATE.dispatch_first_task::<Self>()
                }

                fn idle_wait() {
                    PORT_STATE.idle_wait()
                }

                fn panic_halt(err: KernelError) -> ! {
                    PORT_STATE.panic_halt(err)
                }

                fn entropy() -> u32 {
                    PORT_STATE.entropy()
                }
            }

            impl PortTimer for $SystemTraits {
                const TICKS_PER_SEC: u32 = 1000;

                unsafe fn timer_enable() {
                    PORT_STATE.timer_enable()
                }

                unsafe fn timer_disable() {
                    PORT_STATE.timer_disable()
                }
            }
        }
    };
}
