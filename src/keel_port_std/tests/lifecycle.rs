//! Task-lifecycle scenarios end to end: suspend/resume, cancellation, and
//! the cooperative mode's yield-driven rotation.
mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use keel_kernel::{KernelError, SchedMode, System, TaskId};

mod suspend_resume {
    use super::*;

    keel_port_std::use_port!(unsafe struct SystemTraits => app_main);
    type Sys = System<SystemTraits>;

    static WORKER: OnceLock<TaskId> = OnceLock::new();
    static WORK: AtomicUsize = AtomicUsize::new(0);
    static RESUMED_WORK: AtomicUsize = AtomicUsize::new(usize::MAX);

    fn worker() {
        loop {
            WORK.fetch_add(1, Ordering::SeqCst);
            Sys::task_delay(1).unwrap();
        }
    }

    fn controller() {
        let worker = *WORKER.get().unwrap();

        // Let the worker make some progress, then freeze it.
        Sys::task_delay(50).unwrap();
        Sys::task_suspend(worker).unwrap();
        let frozen_at = WORK.load(Ordering::SeqCst);
        assert!(frozen_at > 0);

        // No progress while suspended.
        Sys::task_delay(50).unwrap();
        assert_eq!(WORK.load(Ordering::SeqCst), frozen_at);
        assert_eq!(
            Sys::task_suspend(worker),
            Err(KernelError::TaskCantSuspend)
        );

        Sys::task_resume(worker).unwrap();
        Sys::task_delay(50).unwrap();
        RESUMED_WORK.store(WORK.load(Ordering::SeqCst), Ordering::SeqCst);
        assert!(RESUMED_WORK.load(Ordering::SeqCst) > frozen_at);

        // Cancellation severs the task entirely.
        let count_before = Sys::task_count().unwrap();
        Sys::task_cancel(worker).unwrap();
        assert_eq!(Sys::task_count().unwrap(), count_before - 1);
        assert_eq!(Sys::task_cancel(worker), Err(KernelError::TaskNotFound));

        keel_port_std::shutdown::<SystemTraits>();
    }

    fn app_main() -> SchedMode {
        WORKER
            .set(Sys::task_spawn(worker, 4096).unwrap())
            .unwrap();
        Sys::task_spawn(controller, 4096).unwrap();
        SchedMode::Preemptive
    }

    #[test]
    fn suspend_stops_and_resume_restarts_a_worker() {
        common::with_deadline(|| {
            keel_port_std::boot::<SystemTraits>();
            assert_ne!(RESUMED_WORK.load(Ordering::SeqCst), usize::MAX);
        });
    }
}

mod cooperative {
    use super::*;

    keel_port_std::use_port!(unsafe struct SystemTraits => app_main);
    type Sys = System<SystemTraits>;

    const ROUNDS: usize = 3;

    static TRACE: Mutex<Vec<(char, usize)>> = Mutex::new(Vec::new());
    static A_DONE: AtomicBool = AtomicBool::new(false);
    static DELAY_WOKE: AtomicBool = AtomicBool::new(false);

    fn task_a() {
        for round in 0..ROUNDS {
            TRACE.lock().unwrap().push(('a', round));
            Sys::task_yield();
        }
        A_DONE.store(true, Ordering::SeqCst);

        // Delays complete in cooperative mode too, as long as someone
        // else keeps yielding.
        Sys::task_delay(10).unwrap();
        DELAY_WOKE.store(true, Ordering::SeqCst);
        keel_port_std::shutdown::<SystemTraits>();
    }

    fn task_b() {
        for round in 0..ROUNDS {
            TRACE.lock().unwrap().push(('b', round));
            Sys::task_yield();
        }
        // Keep the scheduler turning while task a sleeps.
        while !DELAY_WOKE.load(Ordering::SeqCst) {
            Sys::task_yield();
        }
    }

    fn app_main() -> SchedMode {
        Sys::task_spawn(task_a, 4096).unwrap();
        Sys::task_spawn(task_b, 4096).unwrap();
        SchedMode::Cooperative
    }

    #[test]
    fn yields_rotate_and_delays_expire_on_ticks() {
        common::with_deadline(|| {
            keel_port_std::boot::<SystemTraits>();

            let trace = TRACE.lock().unwrap();
            // Strict a/b alternation: each yield hands over to the peer.
            let expected: Vec<(char, usize)> = (0..ROUNDS)
                .flat_map(|round| [('a', round), ('b', round)])
                .collect();
            assert_eq!(&*trace, &expected);

            assert!(A_DONE.load(Ordering::SeqCst));
            assert!(DELAY_WOKE.load(Ordering::SeqCst));
        });
    }
}
