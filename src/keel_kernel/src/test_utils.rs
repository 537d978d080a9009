//! A minimal in-process port used by the kernel's own unit tests. Nothing
//! here performs real context switching; tests drive the scheduler entry
//! points directly and observe the resulting state.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::{
    error::KernelError, klock, task::TaskSt, KernelStatic, PortThreading, PortTimer, SchedMode,
    State, TaskCb, TaskId,
};

pub(crate) struct MockTraits;

static SCHED_LOCK: AtomicBool = AtomicBool::new(false);

unsafe impl PortThreading for MockTraits {
    type PortTaskState = ();
    const STACK_RED_ZONE: usize = 0;

    unsafe fn try_enter_sched_lock() -> bool {
        !SCHED_LOCK.swap(true, Ordering::Acquire)
    }

    unsafe fn enter_sched_lock() {
        loop {
            if unsafe { Self::try_enter_sched_lock() } {
                break;
            }
            std::hint::spin_loop();
        }
    }

    unsafe fn leave_sched_lock() {
        SCHED_LOCK.store(false, Ordering::Release);
    }

    fn is_sched_lock_active() -> bool {
        SCHED_LOCK.load(Ordering::Relaxed)
    }

    unsafe fn enter_critical() {}
    unsafe fn leave_critical() {}

    fn is_task_context() -> bool {
        // The mock never yields; preemption checks fall through.
        false
    }

    unsafe fn initialize_task_state(_task: &TaskCb<Self>) {}

    unsafe fn yield_cpu() {}

    unsafe fn dispatch_first_task() -> ! {
        unreachable!("the mock port never dispatches")
    }

    fn idle_wait() {}

    fn panic_halt(err: KernelError) -> ! {
        panic!("kernel panic: {err}");
    }
}

impl PortTimer for MockTraits {
    const TICKS_PER_SEC: u32 = 1000;
    unsafe fn timer_enable() {}
    unsafe fn timer_disable() {}
}

static STATE: State<MockTraits> = State::new();

unsafe impl KernelStatic for MockTraits {
    fn state() -> &'static State<MockTraits> {
        &STATE
    }

    const APP_MAIN: fn() -> SchedMode = || SchedMode::Preemptive;
}

static TEST_SERIAL: Mutex<()> = Mutex::new(());

/// Run `f` with exclusive access to a freshly reset kernel state.
pub(crate) fn with_fresh_kernel<R>(f: impl FnOnce() -> R) -> R {
    let _serial = TEST_SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    {
        let mut lock = klock::lock_sched::<MockTraits>().unwrap();
        *STATE.kcb().write(&mut *lock) = crate::kcb::Kcb::new();
    }
    f()
}

/// Force `id` into the Running state and mark the scheduler started, as if
/// the port had just dispatched it.
pub(crate) fn make_running(id: TaskId) {
    let mut lock = klock::lock_sched::<MockTraits>().unwrap();
    let kcb = STATE.kcb().write(&mut *lock);
    let level = kcb.task(id).expect("no such task").level();
    kcb.ready.remove(level, id);
    let t = kcb.task_mut(id).unwrap();
    t.st = TaskSt::Running;
    t.time_slice = t.base_priority.time_slice();
    kcb.current = Some(id);
    kcb.started = true;
}

/// Deliver `n` ticks through the kernel's tick entry.
pub(crate) fn run_ticks(n: u32) {
    use crate::PortToKernel;
    for _ in 0..n {
        // Safety: the mock's "tick interrupt" is this call itself
        unsafe { crate::System::<MockTraits>::timer_tick() };
    }
}
