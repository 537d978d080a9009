//! The public interface of the `mtime`-based tick driver.

/// Compile-time configuration of the CLINT timer.
pub trait TimerOptions {
    /// Base address of the memory-mapped `mtime` register.
    const MTIME: usize;

    /// Base address of the memory-mapped `mtimecmp` register for hart 0.
    const MTIMECMP: usize;

    /// The core clock feeding `mtime`, in Hz.
    const F_CPU: u64;

    /// The tick frequency, in Hz.
    const F_TIMER: u32;
}

/// CLINT register offsets shared by QEMU `virt` and SiFive-lineage parts,
/// relative to the CLINT base address.
pub const CLINT_MTIMECMP_OFFSET: usize = 0x4000;
pub const CLINT_MTIME_OFFSET: usize = 0xbff8;
