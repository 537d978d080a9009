//! The public interface of the RISC-V threading port.

/// The size in bytes of the trap frame the vector pushes onto the
/// interrupted stack: 29 general-purpose registers (everything except
/// `x0` and `sp`) plus `mepc` and `mstatus`, padded to the stack
/// alignment.
pub const TRAP_FRAME_SIZE: usize = 128;

/// Compile-time port customization.
pub trait ThreadingOptions {
    /// Write one byte to the direct (non-deferred) console. Used only by
    /// the exception reporter and the panic path; the default discards the
    /// output.
    fn console_putc(byte: u8) {
        let _ = byte;
    }

    /// An MMIO word to write [`Self::SHUTDOWN_MAGIC`] to on panic, such as
    /// the QEMU `virt` test device. `None` skips the attempt and halts in
    /// a `wfi` loop directly.
    const SHUTDOWN_ADDR: Option<usize> = None;

    const SHUTDOWN_MAGIC: u32 = 0x5555;
}

/// Instantiate the port on a system type.
///
/// The application's reset path calls `<SystemTraits as
/// keel_port_riscv::EntryPoint>::start()` once the data/bss sections are
/// live.
#[cfg(target_arch = "riscv32")]
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident => $app_main:path) => {
        $vis struct $SystemTraits;

        fn __keel_app_main() -> $crate::keel_kernel::SchedMode {
            $app_main()
        }

        mod port_riscv_impl {
            use super::$SystemTraits;
            use $crate::keel_kernel::{
                KernelError, KernelStatic, PortThreading, PortTimer, SchedMode, State, TaskCb,
            };
            use $crate::threading::imp;
            use $crate::timer::imp as timer_imp;
            use $crate::{EntryPoint, PortInstance};

            static KERNEL_STATE: State<$SystemTraits> = State::new();

            unsafe impl PortInstance for $SystemTraits {}

            unsafe impl KernelStatic for $SystemTraits {
                fn state() -> &'static State<$SystemTraits> {
                    &KERNEL_STATE
                }

                const APP_MAIN: fn() -> SchedMode = super::__keel_app_main;
            }

            impl EntryPoint for $SystemTraits {
                unsafe fn start() -> ! {
                    unsafe { imp::port_boot::<Self>() }
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = imp::TaskState;
                const STACK_RED_ZONE: usize = $crate::TRAP_FRAME_SIZE;

                unsafe fn try_enter_sched_lock() -> bool {
                    unsafe { imp::try_enter_sched_lock() }
                }

                unsafe fn enter_sched_lock() {
                    unsafe { imp::enter_sched_lock() }
                }

                unsafe fn leave_sched_lock() {
                    unsafe { imp::leave_sched_lock() }
                }

                fn is_sched_lock_active() -> bool {
                    imp::is_sched_lock_active()
                }

                unsafe fn enter_critical() {
                    unsafe { imp::enter_critical() }
                }

                unsafe fn leave_critical() {
                    unsafe { imp::leave_critical() }
                }

                fn is_task_context() -> bool {
                    imp::is_task_context()
                }

                unsafe fn initialize_task_state(task: &TaskCb<Self>) {
                    unsafe { imp::initialize_task_state::<Self>(task) }
                }

                unsafe fn yield_cpu() {
                    unsafe { imp::yield_cpu::<Self>() }
                }

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { imp::dispatch_first_task::<Self>() }
                }

                fn idle_wait() {
                    imp::idle_wait()
                }

                fn panic_halt(err: KernelError) -> ! {
                    imp::panic_halt::<Self>(err)
                }

                fn entropy() -> u32 {
                    imp::entropy()
                }
            }

            impl PortTimer for $SystemTraits {
                const TICKS_PER_SEC: u32 = <$SystemTraits as $crate::TimerOptions>::F_TIMER;

                unsafe fn timer_enable() {
                    unsafe { timer_imp::timer_enable::<$SystemTraits>() }
                }

                unsafe fn timer_disable() {
                    unsafe { timer_imp::timer_disable() }
                }
            }

            /// The monomorphic trampoline the trap vector jumps through.
            #[no_mangle]
            extern "C" fn keel_trap_rust(mcause: usize, mepc: usize, frame: *mut usize) -> usize {
                // Safety: only the trap vector calls this
                unsafe { imp::trap_handler::<$SystemTraits>(mcause, mepc, frame) }
            }
        }
    };
}

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[cfg(target_arch = "riscv32")]
pub unsafe trait PortInstance:
    keel_kernel::KernelTraits
    + keel_kernel::PortThreading<PortTaskState = crate::threading::imp::TaskState>
    + ThreadingOptions
    + crate::TimerOptions
{
}
