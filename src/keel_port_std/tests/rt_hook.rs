//! Earliest-deadline-first election through the real-time hook.
//!
//! Three periodic tasks publish their absolute deadlines; the hook elects
//! the ready task with the earliest one. A background task must still get
//! processor time whenever no periodic job is ready.
mod common;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use keel_kernel::{Kcb, SchedMode, System, TaskId};

keel_port_std::use_port!(unsafe struct SystemTraits => app_main);
type Sys = System<SystemTraits>;

const PERIODS: [u32; 3] = [10, 15, 20];
const RUN_TICKS: u32 = 60;

/// Absolute deadline per periodic task, indexed by `rt_data - 1`.
static DEADLINES: [AtomicU32; 3] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];
static JOBS: [AtomicUsize; 3] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];
static BACKGROUND_RUNS: AtomicUsize = AtomicUsize::new(0);

fn edf_hook(kcb: &Kcb<SystemTraits>) -> Option<TaskId> {
    kcb.ready_tasks()
        .filter_map(|id| {
            let slot = kcb.task_rt_data(id)?;
            if slot == 0 {
                return None;
            }
            let deadline = DEADLINES[slot - 1].load(Ordering::Relaxed);
            Some((deadline, id))
        })
        .min_by_key(|&(deadline, _)| deadline)
        .map(|(_, id)| id)
}

fn periodic_body(slot: usize) {
    let period = PERIODS[slot];
    loop {
        JOBS[slot].fetch_add(1, Ordering::Relaxed);
        let next = Sys::ticks().unwrap() + period;
        DEADLINES[slot].store(next, Ordering::Relaxed);
        if Sys::task_delay(period).is_err() {
            return;
        }
    }
}

fn periodic_0() {
    periodic_body(0);
}

fn periodic_1() {
    periodic_body(1);
}

fn periodic_2() {
    periodic_body(2);
}

fn background() {
    loop {
        BACKGROUND_RUNS.fetch_add(1, Ordering::Relaxed);
        Sys::task_delay(1).unwrap();
    }
}

fn supervisor() {
    Sys::task_delay(RUN_TICKS).unwrap();
    keel_port_std::shutdown::<SystemTraits>();
}

fn app_main() -> SchedMode {
    let entries: [fn(); 3] = [periodic_0, periodic_1, periodic_2];
    for (slot, entry) in entries.into_iter().enumerate() {
        let id = Sys::task_spawn(entry, 4096).unwrap();
        DEADLINES[slot].store(PERIODS[slot], Ordering::Relaxed);
        Sys::task_set_rt_data(id, slot + 1).unwrap();
    }
    Sys::task_spawn(background, 4096).unwrap();
    Sys::task_spawn(supervisor, 4096).unwrap();
    Sys::set_rt_hook(Some(edf_hook)).unwrap();
    SchedMode::Preemptive
}

#[test]
fn every_job_meets_its_period_and_background_still_runs() {
    common::with_deadline(|| {
        keel_port_std::boot::<SystemTraits>();

        // Over 60 ticks (jobs release at t=0 and every period after), a
        // task that never misses runs at least floor(RUN_TICKS / period)
        // times.
        for (slot, period) in PERIODS.iter().enumerate() {
            let min_jobs = (RUN_TICKS / period) as usize;
            let jobs = JOBS[slot].load(Ordering::Relaxed);
            assert!(
                jobs >= min_jobs,
                "task {slot} (period {period}) ran {jobs} jobs, expected >= {min_jobs}"
            );
        }

        assert!(
            BACKGROUND_RUNS.load(Ordering::Relaxed) >= 1,
            "the non-real-time task was starved"
        );
    });
}
