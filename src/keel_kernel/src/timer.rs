//! Software timers
//!
//! Timers are driven by the tick entry: the active list is sorted by
//! absolute deadline, so processing stops at the first non-expired record.
//! Per tick, at most [`TIMER_TICK_BATCH`] timers fire; any remaining
//! expired timers are picked up on the following tick, bounding the time
//! spent in the trap context.
use core::num::NonZeroU16;

use arrayvec::ArrayVec;

use crate::{
    error::{KernelError, Result},
    kcb::Kcb,
    klock, KernelTraits, PortThreading, System,
};

/// The most timers one tick may fire.
pub const TIMER_TICK_BATCH: usize = 4;

/// Handle to a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(NonZeroU16);

impl TimerId {
    pub(crate) fn from_raw(raw: NonZeroU16) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u16 {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Disabled,
    OneShot,
    AutoReload,
}

/// *Timer control block* - the state data of a software timer.
pub(crate) struct TimerCb {
    pub(crate) period: u32,
    /// Absolute tick at which the timer fires next. Meaningful only while
    /// armed.
    pub(crate) deadline: u32,
    /// The expected fire tick the current deadline was derived from.
    /// Auto-reload advances this by `period` instead of re-reading the
    /// clock, so latency never accumulates into drift.
    pub(crate) last_fire: u32,
    pub(crate) mode: TimerMode,
    pub(crate) callback: fn(usize),
    pub(crate) arg: usize,
}

/// Insert `id` into the active list keeping it deadline-sorted; equal
/// deadlines keep insertion order.
fn active_insert<Traits: PortThreading>(kcb: &mut Kcb<Traits>, id: TimerId, deadline: u32) {
    let pos = {
        let timers = &kcb.timers;
        kcb.timer_active.partition_point(|&t| {
            timers.get(t.raw()).map_or(true, |cb| cb.deadline <= deadline)
        })
    };
    kcb.timer_active.insert(pos, id);
}

fn active_remove<Traits: PortThreading>(kcb: &mut Kcb<Traits>, id: TimerId) {
    kcb.timer_active.retain(|&t| t != id);
}

/// Fire expired timers. Called from the tick entry after `ticks` advanced.
pub(crate) fn process_expired<Traits: PortThreading>(kcb: &mut Kcb<Traits>) {
    let now = kcb.ticks;

    let mut batch: ArrayVec<TimerId, TIMER_TICK_BATCH> = ArrayVec::new();
    while !batch.is_full() {
        match kcb.timer_active.first() {
            Some(&id) => {
                let expired = kcb
                    .timers
                    .get(id.raw())
                    .map_or(true, |cb| cb.deadline <= now);
                if !expired {
                    // The list is sorted; nothing further down is due.
                    break;
                }
                kcb.timer_active.remove(0);
                if kcb.timers.get(id.raw()).is_some() {
                    batch.push(id);
                }
            }
            None => break,
        }
    }

    for id in batch {
        let (callback, arg) = match kcb.timers.get(id.raw()) {
            Some(cb) => (cb.callback, cb.arg),
            None => continue,
        };

        // The callback runs in trap context and must not block, allocate,
        // or yield.
        callback(arg);

        let reinsert = {
            let cb = kcb.timers.get_mut(id.raw()).unwrap();
            match cb.mode {
                TimerMode::AutoReload => {
                    cb.last_fire = cb.last_fire.saturating_add(cb.period);
                    cb.deadline = cb.last_fire;
                    Some(cb.deadline)
                }
                _ => {
                    cb.mode = TimerMode::Disabled;
                    None
                }
            }
        };
        if let Some(deadline) = reinsert {
            active_insert(kcb, id, deadline);
        }
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a timer in the Disabled state.
    pub fn timer_create(callback: fn(usize), period_ticks: u32, arg: usize) -> Result<TimerId> {
        if period_ticks == 0 {
            return Err(KernelError::Fail);
        }
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        kcb.timers
            .insert(TimerCb {
                period: period_ticks,
                deadline: 0,
                last_fire: 0,
                mode: TimerMode::Disabled,
                callback,
                arg,
            })
            .map(TimerId::from_raw)
            .ok_or(KernelError::Fail)
    }

    /// Remove a timer entirely, disarming it first if needed.
    pub fn timer_destroy(id: TimerId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        kcb.timers.get(id.raw()).ok_or(KernelError::Fail)?;
        active_remove(kcb, id);
        kcb.timers.remove(id.raw());
        Ok(())
    }

    /// Arm the timer: the first fire happens `period` ticks from now.
    pub fn timer_start(id: TimerId, mode: TimerMode) -> Result {
        if mode == TimerMode::Disabled {
            return Self::timer_cancel(id);
        }
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        let now = kcb.ticks;
        let deadline = {
            let cb = kcb.timers.get_mut(id.raw()).ok_or(KernelError::Fail)?;
            cb.mode = mode;
            cb.last_fire = now.saturating_add(cb.period);
            cb.deadline = cb.last_fire;
            cb.deadline
        };
        // Re-arming an already armed timer repositions it.
        active_remove(kcb, id);
        active_insert(kcb, id, deadline);
        Ok(())
    }

    /// Disarm the timer, keeping the record for a later restart.
    pub fn timer_cancel(id: TimerId) -> Result {
        let mut lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().write(&mut *lock);
        kcb.timers.get_mut(id.raw()).ok_or(KernelError::Fail)?.mode = TimerMode::Disabled;
        active_remove(kcb, id);
        Ok(())
    }

    pub fn timer_mode(id: TimerId) -> Result<TimerMode> {
        let lock = klock::lock_sched::<Traits>()?;
        let kcb = Traits::state().kcb().read(&*lock);
        Ok(kcb.timers.get(id.raw()).ok_or(KernelError::Fail)?.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, MockTraits};
    use crate::KernelStatic;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Sys = System<MockTraits>;

    fn entry_a() {}

    static FIRED_A: AtomicUsize = AtomicUsize::new(0);
    static FIRED_B: AtomicUsize = AtomicUsize::new(0);
    static FIRED_SLOW: AtomicUsize = AtomicUsize::new(0);

    fn cb_a(_: usize) {
        FIRED_A.fetch_add(1, Ordering::Relaxed);
    }

    fn cb_b(_: usize) {
        FIRED_B.fetch_add(1, Ordering::Relaxed);
    }

    fn cb_slow(_: usize) {
        FIRED_SLOW.fetch_add(1, Ordering::Relaxed);
    }

    fn setup() {
        FIRED_A.store(0, Ordering::Relaxed);
        FIRED_B.store(0, Ordering::Relaxed);
        FIRED_SLOW.store(0, Ordering::Relaxed);
        let a = Sys::task_spawn(entry_a, 512).unwrap();
        test_utils::make_running(a);
    }

    fn active_deadlines() -> Vec<u32> {
        let lock = crate::klock::lock_sched::<MockTraits>().unwrap();
        let kcb = MockTraits::state().kcb().read(&*lock);
        kcb.timer_active
            .iter()
            .map(|&t| kcb.timers.get(t.raw()).unwrap().deadline)
            .collect()
    }

    #[test]
    fn one_shot_fires_once_and_disables() {
        test_utils::with_fresh_kernel(|| {
            setup();
            let t = Sys::timer_create(cb_a, 3, 0).unwrap();
            Sys::timer_start(t, TimerMode::OneShot).unwrap();

            test_utils::run_ticks(2);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 0);
            test_utils::run_ticks(1);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);
            assert_eq!(Sys::timer_mode(t).unwrap(), TimerMode::Disabled);

            test_utils::run_ticks(10);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn auto_reload_fires_periodically_without_drift() {
        test_utils::with_fresh_kernel(|| {
            setup();
            let t = Sys::timer_create(cb_a, 5, 0).unwrap();
            Sys::timer_start(t, TimerMode::AutoReload).unwrap();

            test_utils::run_ticks(25);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 5);

            // The next deadline is derived from the previous one, not from
            // "now".
            assert_eq!(active_deadlines(), vec![30]);
        });
    }

    #[test]
    fn active_list_stays_deadline_sorted() {
        test_utils::with_fresh_kernel(|| {
            setup();
            let slow = Sys::timer_create(cb_slow, 50, 0).unwrap();
            let fast = Sys::timer_create(cb_a, 2, 0).unwrap();
            let mid = Sys::timer_create(cb_b, 10, 0).unwrap();
            Sys::timer_start(slow, TimerMode::AutoReload).unwrap();
            Sys::timer_start(fast, TimerMode::AutoReload).unwrap();
            Sys::timer_start(mid, TimerMode::AutoReload).unwrap();

            let mut sorted = active_deadlines();
            sorted.sort_unstable();
            assert_eq!(active_deadlines(), sorted);

            test_utils::run_ticks(17);
            let mut sorted = active_deadlines();
            sorted.sort_unstable();
            assert_eq!(active_deadlines(), sorted);

            // 17 ticks: the fast timer fired 8 times, the 10-tick one
            // once, the slow one not yet.
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 8);
            assert_eq!(FIRED_B.load(Ordering::Relaxed), 1);
            assert_eq!(FIRED_SLOW.load(Ordering::Relaxed), 0);
        });
    }

    #[test]
    fn batch_bound_defers_excess_expiries() {
        test_utils::with_fresh_kernel(|| {
            setup();
            // Six timers all due on the same tick; only four may fire on
            // it, the rest on the next.
            for _ in 0..6 {
                let t = Sys::timer_create(cb_a, 4, 0).unwrap();
                Sys::timer_start(t, TimerMode::OneShot).unwrap();
            }
            test_utils::run_ticks(4);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), TIMER_TICK_BATCH);
            test_utils::run_ticks(1);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 6);
        });
    }

    #[test]
    fn cancel_disarms_but_keeps_the_record() {
        test_utils::with_fresh_kernel(|| {
            setup();
            let t = Sys::timer_create(cb_a, 2, 0).unwrap();
            Sys::timer_start(t, TimerMode::AutoReload).unwrap();
            test_utils::run_ticks(2);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);

            Sys::timer_cancel(t).unwrap();
            test_utils::run_ticks(10);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);

            Sys::timer_start(t, TimerMode::OneShot).unwrap();
            test_utils::run_ticks(2);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 2);
        });
    }

    #[test]
    fn destroy_removes_from_active_list() {
        test_utils::with_fresh_kernel(|| {
            setup();
            let t = Sys::timer_create(cb_a, 2, 0).unwrap();
            Sys::timer_start(t, TimerMode::AutoReload).unwrap();
            Sys::timer_destroy(t).unwrap();
            assert!(active_deadlines().is_empty());
            test_utils::run_ticks(5);
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 0);
            assert_eq!(Sys::timer_mode(t), Err(KernelError::Fail));
        });
    }

    #[test]
    fn same_deadline_fires_in_insertion_order() {
        static ORDER: std::sync::Mutex<Vec<usize>> = std::sync::Mutex::new(Vec::new());

        fn record(arg: usize) {
            ORDER.lock().unwrap().push(arg);
        }

        test_utils::with_fresh_kernel(|| {
            setup();
            ORDER.lock().unwrap().clear();
            let t1 = Sys::timer_create(record, 3, 1).unwrap();
            let t2 = Sys::timer_create(record, 3, 2).unwrap();
            let t3 = Sys::timer_create(record, 3, 3).unwrap();
            Sys::timer_start(t1, TimerMode::OneShot).unwrap();
            Sys::timer_start(t2, TimerMode::OneShot).unwrap();
            Sys::timer_start(t3, TimerMode::OneShot).unwrap();

            test_utils::run_ticks(3);
            assert_eq!(&*ORDER.lock().unwrap(), &[1, 2, 3]);
        });
    }
}
