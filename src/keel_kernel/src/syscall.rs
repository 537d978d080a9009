//! The numbered syscall surface used by unprivileged tasks.
//!
//! The port's trap handler decodes an environment call into a number and up
//! to three argument words, hands them to [`dispatch`], writes the returned
//! value into the saved `a0` slot, and runs the scheduler entry when the
//! outcome asks for it. Blocking calls therefore never re-trap: they mutate
//! scheduler state here and let the trap epilogue perform the switch.
//!
//! Numbers 1–20 are POSIX-style stubs kept for ABI stability; they fail
//! with a negative error code.
use crate::{
    error::KernelError,
    klock, task,
    task::{Priority, TaskId},
    KernelTraits, System,
};

pub const SYS_TADD: usize = 32;
pub const SYS_TCANCEL: usize = 33;
pub const SYS_TYIELD: usize = 34;
pub const SYS_TDELAY: usize = 35;
pub const SYS_TSUSPEND: usize = 36;
pub const SYS_TRESUME: usize = 37;
pub const SYS_TPRIORITY: usize = 38;
pub const SYS_TID: usize = 39;
pub const SYS_TWFI: usize = 40;
pub const SYS_TCOUNT: usize = 41;
pub const SYS_TICKS: usize = 42;
pub const SYS_UPTIME: usize = 43;

const SYS_POSIX_FIRST: usize = 1;
const SYS_POSIX_LAST: usize = 20;

/// What the trap handler should do after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallOutcome {
    /// Value for the saved `a0` slot: non-negative on success, a negative
    /// [`KernelError`] code otherwise.
    pub ret: isize,
    /// The call changed scheduler state in a way that requires an election
    /// before the trap returns.
    pub resched: bool,
}

impl SyscallOutcome {
    fn ret(ret: isize) -> Self {
        Self {
            ret,
            resched: false,
        }
    }

    fn resched(ret: isize) -> Self {
        Self { ret, resched: true }
    }
}

fn result_ret(r: Result<isize, KernelError>) -> SyscallOutcome {
    match r {
        Ok(v) => SyscallOutcome::ret(v),
        Err(e) => SyscallOutcome::ret(e.code() as isize),
    }
}

fn task_arg(raw: usize) -> Result<TaskId, KernelError> {
    u16::try_from(raw)
        .ok()
        .and_then(TaskId::new)
        .ok_or(KernelError::TaskNotFound)
}

/// Block the calling task for `ticks` without yielding; the trap epilogue
/// performs the switch.
fn block_delay<Traits: KernelTraits>(ticks: u32) -> Result<(), KernelError> {
    let mut lock = klock::lock_sched::<Traits>()?;
    let kcb = Traits::state().kcb().write(&mut *lock);
    kcb.current.ok_or(KernelError::Fail)?;
    task::block_current_for_delay(kcb, ticks);
    Ok(())
}

/// Suspend without parking: if the target is the caller, the subsequent
/// election switches away from it.
fn suspend_for_syscall<Traits: KernelTraits>(id: TaskId) -> Result<bool, KernelError> {
    let mut lock = klock::lock_sched::<Traits>()?;
    let kcb = Traits::state().kcb().write(&mut *lock);
    task::suspend_in(kcb, id)
}

/// Decode and execute one environment call.
///
/// # Safety
///
/// `SYS_TADD` reinterprets its first argument as a task entry point; the
/// caller (the trap handler) forwards it from an unprivileged context and
/// the resulting task runs whatever it points at. This is the trust
/// boundary of a kernel without memory protection.
pub unsafe fn dispatch<Traits: KernelTraits>(
    num: usize,
    a0: usize,
    a1: usize,
    a2: usize,
) -> SyscallOutcome {
    let _ = a2;
    match num {
        SYS_POSIX_FIRST..=SYS_POSIX_LAST => {
            SyscallOutcome::ret(KernelError::Fail.code() as isize)
        }

        SYS_TADD => {
            // Safety: forwarded verbatim from the calling task; see above
            let entry: fn() = unsafe { core::mem::transmute(a0) };
            result_ret(
                System::<Traits>::task_spawn_user(entry, a1).map(|id| id.get() as isize),
            )
        }

        SYS_TCANCEL => result_ret(
            task_arg(a0).and_then(|id| System::<Traits>::task_cancel(id).map(|_| 0)),
        ),

        SYS_TYIELD => SyscallOutcome::resched(0),

        SYS_TDELAY => {
            let ticks = a0 as u32;
            if ticks == 0 {
                SyscallOutcome::ret(0)
            } else {
                match block_delay::<Traits>(ticks) {
                    Ok(()) => SyscallOutcome::resched(0),
                    Err(e) => SyscallOutcome::ret(e.code() as isize),
                }
            }
        }

        SYS_TSUSPEND => match task_arg(a0).and_then(suspend_for_syscall::<Traits>) {
            Ok(was_current) => {
                if was_current {
                    SyscallOutcome::resched(0)
                } else {
                    SyscallOutcome::ret(0)
                }
            }
            Err(e) => SyscallOutcome::ret(e.code() as isize),
        },

        SYS_TRESUME => match task_arg(a0).and_then(|id| System::<Traits>::task_resume(id)) {
            Ok(()) => SyscallOutcome::resched(0),
            Err(e) => SyscallOutcome::ret(e.code() as isize),
        },

        SYS_TPRIORITY => result_ret(task_arg(a0).and_then(|id| {
            let priority = Priority::from_level(a1).ok_or(KernelError::TaskInvalidPrio)?;
            System::<Traits>::task_set_priority(id, priority).map(|_| 0)
        })),

        SYS_TID => result_ret(System::<Traits>::task_current().map(|id| id.get() as isize)),

        // Wait-for-interrupt cannot spin inside the trap handler; it
        // degrades to yield semantics on the syscall surface.
        SYS_TWFI => SyscallOutcome::resched(0),

        SYS_TCOUNT => result_ret(System::<Traits>::task_count().map(|n| n as isize)),

        SYS_TICKS => result_ret(System::<Traits>::ticks().map(|t| t as isize)),

        SYS_UPTIME => result_ret(System::<Traits>::uptime_ms().map(|ms| ms as isize)),

        _ => SyscallOutcome::ret(KernelError::Fail.code() as isize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, MockTraits};
    use crate::KernelStatic;

    fn entry_a() {}
    fn entry_b() {}

    fn call(num: usize, a0: usize, a1: usize) -> SyscallOutcome {
        unsafe { dispatch::<MockTraits>(num, a0, a1, 0) }
    }

    #[test]
    fn posix_stubs_fail_with_negative_codes() {
        test_utils::with_fresh_kernel(|| {
            for num in 1..=20 {
                let out = call(num, 0, 0);
                assert!(out.ret < 0);
                assert!(!out.resched);
            }
        });
    }

    #[test]
    fn tadd_spawns_a_user_task() {
        test_utils::with_fresh_kernel(|| {
            let out = call(SYS_TADD, entry_a as usize, 1024);
            assert!(out.ret > 0);
            let id = TaskId::new(out.ret as u16).unwrap();

            let lock = crate::klock::lock_sched::<MockTraits>().unwrap();
            let kcb = MockTraits::state().kcb().read(&*lock);
            assert!(kcb.task(id).unwrap().is_user_mode());
        });
    }

    #[test]
    fn tid_and_tcount_report_state() {
        test_utils::with_fresh_kernel(|| {
            let a = crate::System::<MockTraits>::task_spawn(entry_a, 512).unwrap();
            test_utils::make_running(a);
            assert_eq!(call(SYS_TID, 0, 0).ret, a.get() as isize);
            assert_eq!(call(SYS_TCOUNT, 0, 0).ret, 1);
        });
    }

    #[test]
    fn tdelay_blocks_and_requests_resched() {
        test_utils::with_fresh_kernel(|| {
            let a = crate::System::<MockTraits>::task_spawn(entry_a, 512).unwrap();
            test_utils::make_running(a);

            assert_eq!(call(SYS_TDELAY, 0, 0), SyscallOutcome::ret(0));

            let out = call(SYS_TDELAY, 7, 0);
            assert_eq!(out, SyscallOutcome::resched(0));
            let lock = crate::klock::lock_sched::<MockTraits>().unwrap();
            let kcb = MockTraits::state().kcb().read(&*lock);
            assert_eq!(kcb.task(a).unwrap().st, crate::TaskSt::Blocked);
            assert_eq!(kcb.task(a).unwrap().delay, 7);
        });
    }

    #[test]
    fn tpriority_validates_the_level() {
        test_utils::with_fresh_kernel(|| {
            let a = crate::System::<MockTraits>::task_spawn(entry_a, 512).unwrap();
            test_utils::make_running(a);
            let b = crate::System::<MockTraits>::task_spawn(entry_b, 512).unwrap();

            assert_eq!(call(SYS_TPRIORITY, b.get() as usize, 2).ret, 0);
            assert_eq!(
                call(SYS_TPRIORITY, b.get() as usize, 8).ret,
                KernelError::TaskInvalidPrio.code() as isize
            );
        });
    }

    #[test]
    fn yield_and_wfi_request_resched() {
        test_utils::with_fresh_kernel(|| {
            assert!(call(SYS_TYIELD, 0, 0).resched);
            assert!(call(SYS_TWFI, 0, 0).resched);
        });
    }

    #[test]
    fn unknown_numbers_fail() {
        test_utils::with_fresh_kernel(|| {
            assert!(call(0, 0, 0).ret < 0);
            assert!(call(21, 0, 0).ret < 0);
            assert!(call(99, 0, 0).ret < 0);
        });
    }
}
