//! RISC-V machine-mode port for the keel kernel, targeting RV32 cores with
//! a CLINT-compatible machine timer (QEMU `virt`, SiFive FE310 class
//! hardware).
//!
//! The port realizes context switching with a full trap frame saved on the
//! interrupted task's own stack: the trap vector stores every integer
//! register plus `mepc`/`mstatus`, calls the Rust-level handler, and
//! restores from whichever frame pointer the handler returns. Voluntary
//! yields reuse the same path through `ecall`; cooperative mode switches
//! with a classical save/restore context pair instead.
//!
//! The scheduler-off critical section masks only `mie.MTIE`, keeping
//! device interrupts live while scheduler state is mutated.
#![no_std]

/// Used by macros
#[doc(hidden)]
pub extern crate keel_kernel;

/// The [`keel_kernel::PortThreading`] implementation.
#[doc(hidden)]
pub mod threading {
    pub mod cfg;
    #[cfg(target_arch = "riscv32")]
    pub mod imp;
}

/// The `mtime`-based tick driver.
#[doc(hidden)]
pub mod timer {
    pub mod cfg;
    #[cfg(target_arch = "riscv32")]
    pub mod imp;
}

pub use self::threading::cfg::*;
pub use self::timer::cfg::*;

/// Defines the entry point of a port instantiation. Implemented by
/// [`use_port!`].
pub trait EntryPoint {
    /// Proceed with the boot process: install the trap vector, arm the
    /// timer, enter the scheduler-off section, and hand control to
    /// [`keel_kernel::PortToKernel::boot`].
    ///
    /// # Safety
    ///
    ///  - The processor must be in the machine mode with all interrupts
    ///    masked.
    ///  - This method hasn't been entered yet.
    unsafe fn start() -> !;
}
