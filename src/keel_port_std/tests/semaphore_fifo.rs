//! Semaphore handoff under heavy contention: N waiters, N signals, strict
//! FIFO service.
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use keel_kernel::{Priority, SchedMode, SemaphoreId, System};

keel_port_std::use_port!(unsafe struct SystemTraits => app_main);
type Sys = System<SystemTraits>;

const WAITERS: usize = 5;

static SEM: OnceLock<SemaphoreId> = OnceLock::new();
static ARRIVAL: AtomicUsize = AtomicUsize::new(0);
static SERVED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn waiter_body() {
    let s = *SEM.get().unwrap();
    let tag = ARRIVAL.fetch_add(1, Ordering::SeqCst);
    Sys::sem_wait(s).unwrap();
    SERVED.lock().unwrap().push(tag);
    if SERVED.lock().unwrap().len() == WAITERS {
        keel_port_std::shutdown::<SystemTraits>();
    }
}

fn w0() {
    waiter_body();
}

fn w1() {
    waiter_body();
}

fn w2() {
    waiter_body();
}

fn w3() {
    waiter_body();
}

fn w4() {
    waiter_body();
}

/// Spawns the waiters one by one, sleeping in between, so each is queued
/// on the semaphore before the next one even exists; the arrival order is
/// exact by construction.
fn controller() {
    let s = *SEM.get().unwrap();
    let entries: [fn(); WAITERS] = [w0, w1, w2, w3, w4];
    for (k, entry) in entries.into_iter().enumerate() {
        Sys::task_spawn(entry, 4096).unwrap();
        Sys::task_delay(50).unwrap();
        assert_eq!(Sys::sem_waiting_count(s).unwrap(), k + 1);
    }

    for _ in 0..WAITERS {
        Sys::sem_signal(s).unwrap();
    }
}

fn app_main() -> SchedMode {
    SEM.set(Sys::sem_create(WAITERS as u16, 0).unwrap()).unwrap();
    // The controller outranks the waiters, so its signalling burst cannot
    // be preempted by the tasks it wakes.
    Sys::task_spawn_with_priority(controller, 4096, Priority::Above).unwrap();
    SchedMode::Preemptive
}

#[test]
fn n_signals_serve_n_waiters_in_fifo_order() {
    common::with_deadline(|| {
        keel_port_std::boot::<SystemTraits>();

        let served = SERVED.lock().unwrap();
        assert_eq!(&*served, &[0, 1, 2, 3, 4]);

        let s = *SEM.get().unwrap();
        assert_eq!(Sys::sem_value(s).unwrap(), 0);
        assert_eq!(Sys::sem_waiting_count(s).unwrap(), 0);
    });
}
