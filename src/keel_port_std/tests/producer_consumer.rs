//! Bounded-buffer producer/consumer over two counting semaphores and a
//! mutex.
mod common;

use std::sync::{Mutex, OnceLock};

use keel_kernel::{MutexId, SchedMode, SemaphoreId, System};

keel_port_std::use_port!(unsafe struct SystemTraits => app_main);
type Sys = System<SystemTraits>;

const ITEMS: u32 = 100;
const SLOTS: u32 = 10;

static IDS: OnceLock<(SemaphoreId, SemaphoreId, MutexId)> = OnceLock::new();
static BUFFER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
static CONSUMED: Mutex<Vec<u32>> = Mutex::new(Vec::new());

fn ids() -> (SemaphoreId, SemaphoreId, MutexId) {
    *IDS.get().unwrap()
}

fn producer() {
    let (empty, full, m) = ids();
    for i in 0..ITEMS {
        Sys::sem_wait(empty).unwrap();
        Sys::mutex_lock(m).unwrap();
        BUFFER.lock().unwrap().push(i);
        Sys::mutex_unlock(m).unwrap();
        Sys::sem_signal(full).unwrap();
    }
}

fn consumer() {
    let (empty, full, m) = ids();
    for _ in 0..ITEMS {
        Sys::sem_wait(full).unwrap();
        Sys::mutex_lock(m).unwrap();
        let item = BUFFER.lock().unwrap().remove(0);
        Sys::mutex_unlock(m).unwrap();
        Sys::sem_signal(empty).unwrap();
        CONSUMED.lock().unwrap().push(item);
    }
    keel_port_std::shutdown::<SystemTraits>();
}

fn app_main() -> SchedMode {
    let empty = Sys::sem_create(4, SLOTS).unwrap();
    let full = Sys::sem_create(4, 0).unwrap();
    let m = Sys::mutex_create().unwrap();
    IDS.set((empty, full, m)).unwrap();

    Sys::task_spawn(producer, 4096).unwrap();
    Sys::task_spawn(consumer, 4096).unwrap();
    SchedMode::Preemptive
}

#[test]
fn all_items_flow_in_order() {
    common::with_deadline(|| {
        keel_port_std::boot::<SystemTraits>();

        let consumed = CONSUMED.lock().unwrap();
        assert_eq!(consumed.len(), ITEMS as usize);
        assert!(
            consumed.iter().copied().eq(0..ITEMS),
            "items consumed out of order"
        );

        // Everything drained: both semaphores are back at their initial
        // counts and the buffer is empty.
        let (empty, full, m) = ids();
        assert_eq!(Sys::sem_value(empty).unwrap(), SLOTS);
        assert_eq!(Sys::sem_value(full).unwrap(), 0);
        assert_eq!(Sys::sem_waiting_count(empty).unwrap(), 0);
        assert_eq!(Sys::sem_waiting_count(full).unwrap(), 0);
        assert_eq!(Sys::mutex_waiting_count(m).unwrap(), 0);
        assert!(BUFFER.lock().unwrap().is_empty());

        // The whole exchange fits comfortably into the tick budget.
        assert!(Sys::ticks().unwrap() <= 10_000);
    });
}
