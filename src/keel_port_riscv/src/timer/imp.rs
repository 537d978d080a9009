//! The `mtime`-based tick driver.
use core::sync::atomic::{AtomicBool, Ordering};

use crate::timer::cfg::TimerOptions;

/// Whether the kernel has started the tick source. `mie.MTIE` is only
/// unmasked by the scheduler-off section's exit while this is set.
pub(crate) static TIMER_ON: AtomicBool = AtomicBool::new(false);

const MIE_MTIE: usize = 1 << 7;

/// Read the free-running 64-bit `mtime` on a 32-bit bus: re-read the high
/// word until it is stable across the low-word read.
fn mtime<Traits: TimerOptions>() -> u64 {
    let lo_ptr = Traits::MTIME as *const u32;
    let hi_ptr = (Traits::MTIME + 4) as *const u32;
    loop {
        // Safety: `Traits::MTIME` points at the CLINT per the port contract
        let (hi, lo, hi2) = unsafe {
            (
                hi_ptr.read_volatile(),
                lo_ptr.read_volatile(),
                hi_ptr.read_volatile(),
            )
        };
        if hi == hi2 {
            return ((hi as u64) << 32) | lo as u64;
        }
    }
}

fn mtimecmp_read<Traits: TimerOptions>() -> u64 {
    let lo_ptr = Traits::MTIMECMP as *const u32;
    let hi_ptr = (Traits::MTIMECMP + 4) as *const u32;
    // Safety: see `mtime`; nothing else writes `mtimecmp` concurrently on
    // this single-hart port
    unsafe { ((hi_ptr.read_volatile() as u64) << 32) | lo_ptr.read_volatile() as u64 }
}

/// Write the 64-bit `mtimecmp` without opening a window in which the
/// intermediate value could match `mtime` and raise a spurious interrupt:
/// park the low word at its maximum while the high word changes.
fn mtimecmp_write<Traits: TimerOptions>(value: u64) {
    let lo_ptr = Traits::MTIMECMP as *mut u32;
    let hi_ptr = (Traits::MTIMECMP + 4) as *mut u32;
    // Safety: see `mtimecmp_read`
    unsafe {
        lo_ptr.write_volatile(u32::MAX);
        hi_ptr.write_volatile((value >> 32) as u32);
        lo_ptr.write_volatile(value as u32);
    }
}

fn tick_interval<Traits: TimerOptions>() -> u64 {
    Traits::F_CPU / Traits::F_TIMER as u64
}

/// Arm the first compare value. Called during `port_boot`, before any
/// interrupt can be taken.
pub(crate) unsafe fn init<Traits: TimerOptions>() {
    mtimecmp_write::<Traits>(mtime::<Traits>().wrapping_add(tick_interval::<Traits>()));
}

/// Advance the compare value for the next tick from the *previous* target,
/// not from "now", so interrupt latency never accumulates into drift. This
/// also clears the pending timer interrupt.
pub(crate) unsafe fn advance_compare<Traits: TimerOptions>() {
    mtimecmp_write::<Traits>(mtimecmp_read::<Traits>().wrapping_add(tick_interval::<Traits>()));
}

pub unsafe fn timer_enable<Traits: TimerOptions>() {
    // Re-arm relative to the current time; the tick source may have been
    // off for a while.
    mtimecmp_write::<Traits>(mtime::<Traits>().wrapping_add(tick_interval::<Traits>()));
    TIMER_ON.store(true, Ordering::Relaxed);
    // `mie.MTIE` itself is owned by the scheduler-off section and gets set
    // on its next exit.
}

pub unsafe fn timer_disable() {
    TIMER_ON.store(false, Ordering::Relaxed);
    // Safety: masking a local interrupt source
    unsafe { core::arch::asm!("csrc mie, {}", in(reg) MIE_MTIE) };
}
