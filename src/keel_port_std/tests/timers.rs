//! Software-timer periodicity under a running scheduler.
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use keel_kernel::{SchedMode, System, TimerMode};

keel_port_std::use_port!(unsafe struct SystemTraits => app_main);
type Sys = System<SystemTraits>;

static FIRES_1000: AtomicUsize = AtomicUsize::new(0);
static FIRES_3000: AtomicUsize = AtomicUsize::new(0);
static FIRES_500: AtomicUsize = AtomicUsize::new(0);

fn bump_1000(_: usize) {
    FIRES_1000.fetch_add(1, Ordering::Relaxed);
}

fn bump_3000(_: usize) {
    FIRES_3000.fetch_add(1, Ordering::Relaxed);
}

fn bump_500(_: usize) {
    FIRES_500.fetch_add(1, Ordering::Relaxed);
}

fn observer() {
    // Sleep past the 3000-tick mark, then stop the world.
    Sys::task_delay(3100).unwrap();
    keel_port_std::shutdown::<SystemTraits>();
}

fn app_main() -> SchedMode {
    let t1 = Sys::timer_create(bump_1000, 1000, 0).unwrap();
    let t2 = Sys::timer_create(bump_3000, 3000, 0).unwrap();
    let t3 = Sys::timer_create(bump_500, 500, 0).unwrap();
    Sys::timer_start(t1, TimerMode::AutoReload).unwrap();
    Sys::timer_start(t2, TimerMode::AutoReload).unwrap();
    Sys::timer_start(t3, TimerMode::AutoReload).unwrap();

    Sys::task_spawn(observer, 4096).unwrap();
    SchedMode::Preemptive
}

fn assert_within(name: &str, actual: usize, expected: usize) {
    assert!(
        (expected.saturating_sub(1)..=expected + 1).contains(&actual),
        "{name}: fired {actual} times, expected {expected} (±1)"
    );
}

#[test]
fn auto_reload_timers_keep_their_periods() {
    common::with_deadline(|| {
        keel_port_std::boot::<SystemTraits>();

        assert_within("1000-tick timer", FIRES_1000.load(Ordering::Relaxed), 3);
        assert_within("3000-tick timer", FIRES_3000.load(Ordering::Relaxed), 1);
        assert_within("500-tick timer", FIRES_500.load(Ordering::Relaxed), 6);
    });
}
