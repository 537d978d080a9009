//! The machine-mode threading implementation: trap vector, context
//! switching, and the critical-section primitives.
use core::arch::{asm, global_asm};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use keel_kernel::utils::Init;
use keel_kernel::{
    KernelError, PortToKernel, SchedMode, System, TaskCb,
};

use crate::threading::cfg::{ThreadingOptions, TRAP_FRAME_SIZE};
use crate::timer;
use crate::PortInstance;

// Trap frame layout, as 32-bit word indices from the frame pointer. The
// layout here must match the store/load sequences in the assembly below.
const FRAME_EPC: usize = 0;
const FRAME_MSTATUS: usize = 1;
const FRAME_A0: usize = 10;
const FRAME_A1: usize = 11;
const FRAME_A2: usize = 12;
const FRAME_A7: usize = 17;

const MSTATUS_MPIE: usize = 1 << 7;
const MSTATUS_MPP_M: usize = 0b11 << 11;
const MSTATUS_MPP_U: usize = 0;

const MIE_MTIE: usize = 1 << 7;

const MCAUSE_INTERRUPT: usize = 1 << 31;
const MCAUSE_MTI: usize = 7;
const MCAUSE_ECALL_U: usize = 8;
const MCAUSE_ECALL_M: usize = 11;

// The trap vector. Reserves a full frame on the interrupted stack (every
// task stack carries a red zone of this size above its usable area), saves
// all integer registers except `x0`/`sp` plus the resume CSRs, and calls
// the Rust handler with (mcause, mepc, frame). The handler returns the
// stack pointer to restore from, which selects the next task.
// The immediate below must equal `TRAP_FRAME_SIZE`.
global_asm!(
    "
    .section .text._keel_trap_entry
    .global _keel_trap_entry
    .align 4
_keel_trap_entry:
    addi sp, sp, -128
    sw ra,  2*4(sp)
    sw gp,  3*4(sp)
    sw tp,  4*4(sp)
    sw t0,  5*4(sp)
    sw t1,  6*4(sp)
    sw t2,  7*4(sp)
    sw s0,  8*4(sp)
    sw s1,  9*4(sp)
    sw a0, 10*4(sp)
    sw a1, 11*4(sp)
    sw a2, 12*4(sp)
    sw a3, 13*4(sp)
    sw a4, 14*4(sp)
    sw a5, 15*4(sp)
    sw a6, 16*4(sp)
    sw a7, 17*4(sp)
    sw s2, 18*4(sp)
    sw s3, 19*4(sp)
    sw s4, 20*4(sp)
    sw s5, 21*4(sp)
    sw s6, 22*4(sp)
    sw s7, 23*4(sp)
    sw s8, 24*4(sp)
    sw s9, 25*4(sp)
    sw s10, 26*4(sp)
    sw s11, 27*4(sp)
    sw t3, 28*4(sp)
    sw t4, 29*4(sp)
    sw t5, 30*4(sp)
    sw t6, 31*4(sp)
    csrr t0, mepc
    sw t0, 0*4(sp)
    csrr t0, mstatus
    sw t0, 1*4(sp)
    csrr a0, mcause
    csrr a1, mepc
    mv a2, sp
    call keel_trap_rust
    j _keel_frame_restore

    # Restore a full trap frame pointed to by a0 and return to it. Also the
    # tail of every trap, and the way the first task is entered.
    .global _keel_frame_restore
    .align 4
_keel_frame_restore:
    mv sp, a0
    lw t0, 0*4(sp)
    csrw mepc, t0
    lw t0, 1*4(sp)
    csrw mstatus, t0
    lw ra,  2*4(sp)
    lw gp,  3*4(sp)
    lw tp,  4*4(sp)
    lw t1,  6*4(sp)
    lw t2,  7*4(sp)
    lw s0,  8*4(sp)
    lw s1,  9*4(sp)
    lw a0, 10*4(sp)
    lw a1, 11*4(sp)
    lw a2, 12*4(sp)
    lw a3, 13*4(sp)
    lw a4, 14*4(sp)
    lw a5, 15*4(sp)
    lw a6, 16*4(sp)
    lw a7, 17*4(sp)
    lw s2, 18*4(sp)
    lw s3, 19*4(sp)
    lw s4, 20*4(sp)
    lw s5, 21*4(sp)
    lw s6, 22*4(sp)
    lw s7, 23*4(sp)
    lw s8, 24*4(sp)
    lw s9, 25*4(sp)
    lw s10, 26*4(sp)
    lw s11, 27*4(sp)
    lw t3, 28*4(sp)
    lw t4, 29*4(sp)
    lw t5, 30*4(sp)
    lw t6, 31*4(sp)
    lw t0,  5*4(sp)
    addi sp, sp, 128
    mret

    # Save the cooperative context (callee-saved registers, ra, sp) into
    # the buffer at a0. Returns 0 on the save path; a later
    # _keel_context_restore of the same buffer returns here again with the
    # value passed in a1.
    .global _keel_context_save
    .align 4
_keel_context_save:
    sw ra,  0*4(a0)
    sw sp,  1*4(a0)
    sw s0,  2*4(a0)
    sw s1,  3*4(a0)
    sw s2,  4*4(a0)
    sw s3,  5*4(a0)
    sw s4,  6*4(a0)
    sw s5,  7*4(a0)
    sw s6,  8*4(a0)
    sw s7,  9*4(a0)
    sw s8, 10*4(a0)
    sw s9, 11*4(a0)
    sw s10, 12*4(a0)
    sw s11, 13*4(a0)
    li a0, 0
    ret

    .global _keel_context_restore
    .align 4
_keel_context_restore:
    lw ra,  0*4(a0)
    lw sp,  1*4(a0)
    lw s0,  2*4(a0)
    lw s1,  3*4(a0)
    lw s2,  4*4(a0)
    lw s3,  5*4(a0)
    lw s4,  6*4(a0)
    lw s5,  7*4(a0)
    lw s6,  8*4(a0)
    lw s7,  9*4(a0)
    lw s8, 10*4(a0)
    lw s9, 11*4(a0)
    lw s10, 12*4(a0)
    lw s11, 13*4(a0)
    mv a0, a1
    ret

    # First-dispatch shim for unprivileged tasks: the trap epilogue has
    # loaded a0 with the task's entry point from the synthetic frame. A
    # task whose entry returns parks itself on the yield syscall.
    .global _keel_task_entry_user
    .align 4
_keel_task_entry_user:
    jalr a0
1:
    li a7, 34
    ecall
    j 1b
    "
);

extern "C" {
    fn _keel_trap_entry();
    fn _keel_frame_restore(frame: usize) -> !;
    fn _keel_context_save(ctx: *mut Context) -> u32;
    fn _keel_context_restore(ctx: *const Context, ret: u32) -> !;
    fn _keel_task_entry_user();
}

/// The cooperative register snapshot saved by `_keel_context_save`.
#[derive(Debug)]
#[repr(C)]
pub struct Context {
    regs: [usize; 14],
}

impl Context {
    const fn zeroed() -> Self {
        Self { regs: [0; 14] }
    }
}

/// Per-task port state: the saved trap-frame pointer used by preemptive
/// switching and the cooperative register snapshot.
#[derive(Debug)]
#[repr(C)]
pub struct TaskState {
    sp: UnsafeCell<usize>,
    ctx: UnsafeCell<Context>,
}

// Safety: accessed only under the scheduler lock or from the trap path,
// which excludes each other on a single hart.
unsafe impl Sync for TaskState {}

impl Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sp: UnsafeCell::new(0),
        ctx: UnsafeCell::new(Context::zeroed()),
    };
}

/// Source of truth for the scheduler-off section. `mie.MTIE` mirrors it
/// whenever the tick source is on.
static SCHED_LOCK_HELD: AtomicBool = AtomicBool::new(true);

/// True between the first dispatch and forever after.
static STARTED: AtomicBool = AtomicBool::new(false);

/// Cached scheduling mode, latched at the first dispatch.
static MODE_COOPERATIVE: AtomicBool = AtomicBool::new(false);

/// Trap nesting depth. The current context is a task context iff the
/// scheduler has started and no trap is in progress.
static TRAP_NESTING: AtomicI32 = AtomicI32::new(0);

// The lock flags below use plain load/store pairs rather than
// read-modify-write atomics: the port is single-hart (so plain atomics
// don't require the A extension), and a trap that interleaves with a
// load/store pair always runs its own enter/leave to completion first.

pub unsafe fn try_enter_sched_lock() -> bool {
    if SCHED_LOCK_HELD.load(Ordering::Acquire) {
        false
    } else {
        SCHED_LOCK_HELD.store(true, Ordering::Release);
        // Safety: masking a local interrupt source
        unsafe { asm!("csrc mie, {}", in(reg) MIE_MTIE) };
        true
    }
}

pub unsafe fn enter_sched_lock() {
    // Single hart: the only way the section can be active here is a
    // programming error, not contention.
    debug_assert!(!SCHED_LOCK_HELD.load(Ordering::Relaxed) || TRAP_NESTING.load(Ordering::Relaxed) > 0);
    SCHED_LOCK_HELD.store(true, Ordering::Relaxed);
    // Safety: masking a local interrupt source
    unsafe { asm!("csrc mie, {}", in(reg) MIE_MTIE) };
}

pub unsafe fn leave_sched_lock() {
    SCHED_LOCK_HELD.store(false, Ordering::Release);
    if timer::imp::TIMER_ON.load(Ordering::Relaxed) {
        // Safety: unmasking the tick source outside the section
        unsafe { asm!("csrs mie, {}", in(reg) MIE_MTIE) };
    }
}

pub fn is_sched_lock_active() -> bool {
    SCHED_LOCK_HELD.load(Ordering::Relaxed)
}

pub unsafe fn enter_critical() {
    // Safety: clearing mstatus.MIE masks every local interrupt
    unsafe { asm!("csrci mstatus, 8") };
}

pub unsafe fn leave_critical() {
    // Safety: restoring mstatus.MIE
    unsafe { asm!("csrsi mstatus, 8") };
}

pub fn is_task_context() -> bool {
    STARTED.load(Ordering::Relaxed) && TRAP_NESTING.load(Ordering::Relaxed) == 0
}

pub fn idle_wait() {
    // Safety: `wfi` resumes on any local interrupt
    unsafe { asm!("wfi") };
}

pub fn entropy() -> u32 {
    riscv::register::mcycle::read() as u32
}

/// Boot entry: install the trap vector, arm the timer compare, and hand
/// over to the kernel with the scheduler-off section active.
pub unsafe fn port_boot<Traits: PortInstance>() -> ! {
    // Safety: the boot contract guarantees machine mode with interrupts
    // masked
    unsafe {
        riscv::register::mtvec::write(
            _keel_trap_entry as usize,
            riscv::register::mtvec::TrapMode::Direct,
        );
        timer::imp::init::<Traits>();
        enter_sched_lock();
        <System<Traits> as PortToKernel>::boot()
    }
}

/// Build the synthetic first-dispatch state on a freshly spawned task's
/// stack: a trap frame whose saved EPC enters the task and whose saved
/// status drops to the right privilege mode with interrupts enabled, plus
/// the cooperative snapshot used when the kernel runs cooperatively.
pub unsafe fn initialize_task_state<Traits: PortInstance>(task: &TaskCb<Traits>) {
    let stack_top = task.initial_stack_top() & !(Traits::STACK_ALIGN - 1);
    let frame = stack_top - TRAP_FRAME_SIZE;

    let frame_words = frame as *mut usize;
    // Safety: the frame lies inside the task's freshly allocated stack
    unsafe {
        for i in 0..TRAP_FRAME_SIZE / 4 {
            frame_words.add(i).write(0);
        }
        if task.is_user_mode() {
            frame_words
                .add(FRAME_EPC)
                .write(_keel_task_entry_user as usize);
            frame_words.add(FRAME_A0).write(task.entry() as usize);
            frame_words
                .add(FRAME_MSTATUS)
                .write(MSTATUS_MPIE | MSTATUS_MPP_U);
        } else {
            frame_words.add(FRAME_EPC).write(task_entry::<Traits> as usize);
            frame_words
                .add(FRAME_MSTATUS)
                .write(MSTATUS_MPIE | MSTATUS_MPP_M);
        }

        *task.port_task_state.sp.get() = frame;

        let ctx = &mut *task.port_task_state.ctx.get();
        ctx.regs = [0; 14];
        ctx.regs[0] = task_entry::<Traits> as usize; // ra
        ctx.regs[1] = stack_top; // sp
    }
}

/// Where privileged tasks begin and end.
extern "C" fn task_entry<Traits: PortInstance>() {
    let entry = System::<Traits>::with_running_task(|task| task.map(|t| t.entry()));
    if let Some(entry) = entry {
        entry();
    }
    let _ = System::<Traits>::exit_current_task();
    loop {
        // Safety: a task context without the scheduler lock
        unsafe { yield_cpu::<Traits>() };
    }
}

pub unsafe fn yield_cpu<Traits: PortInstance>() {
    if MODE_COOPERATIVE.load(Ordering::Relaxed) {
        // Safety: the caller guarantees a task context without the lock
        unsafe { coop_switch::<Traits>() };
    } else {
        // Reach the trap path; the ecall-from-M arm runs the scheduler.
        // Safety: the handler preserves the full context around this point
        unsafe { asm!("ecall") };
    }
}

/// The cooperative save/restore switch: returns when some other context
/// (or a wrap-around to ourselves) restores us.
unsafe fn coop_switch<Traits: PortInstance>() {
    let own_ctx = System::<Traits>::with_running_task(|task| {
        task.map(|t| t.port_task_state.ctx.get())
    });
    let Some(own_ctx) = own_ctx else { return };

    // Safety: `own_ctx` stays valid; TCBs are address-stable
    if unsafe { _keel_context_save(own_ctx) } != 0 {
        // Someone restored us; the wait is over.
        return;
    }

    // Safety: we are the port asking for an election
    unsafe { <System<Traits> as PortToKernel>::choose_running_task() };

    let next_ctx = System::<Traits>::with_running_task(|task| {
        task.map(|t| t.port_task_state.ctx.get() as *const Context)
    });
    match next_ctx {
        // Safety: every schedulable task has an initialized context
        Some(ctx) => unsafe { _keel_context_restore(ctx, 1) },
        None => panic_halt::<Traits>(KernelError::NoTasks),
    }
}

pub unsafe fn dispatch_first_task<Traits: PortInstance>() -> ! {
    STARTED.store(true, Ordering::Relaxed);

    // The switch boundary: the section the kernel held across boot ends
    // here. Interrupts stay globally masked until `mret`/the first task,
    // so nothing can preempt the remaining steps.
    unsafe { leave_sched_lock() };

    let mode = System::<Traits>::sched_mode().unwrap_or(SchedMode::Preemptive);
    MODE_COOPERATIVE.store(mode == SchedMode::Cooperative, Ordering::Relaxed);

    match mode {
        SchedMode::Preemptive => {
            let frame =
                System::<Traits>::with_running_task(|task| task.map(|t| unsafe { *t.port_task_state.sp.get() }));
            match frame {
                // Safety: the frame was built by `initialize_task_state`
                Some(frame) => unsafe { _keel_frame_restore(frame) },
                None => panic_halt::<Traits>(KernelError::NoTasks),
            }
        }
        SchedMode::Cooperative => {
            let ctx = System::<Traits>::with_running_task(|task| {
                task.map(|t| t.port_task_state.ctx.get() as *const Context)
            });
            match ctx {
                Some(ctx) => unsafe {
                    // Cooperative switching never traps, but the tick
                    // interrupt still drives timekeeping.
                    leave_critical();
                    _keel_context_restore(ctx, 1)
                },
                None => panic_halt::<Traits>(KernelError::NoTasks),
            }
        }
    }
}

/// The Rust side of the trap vector, after the frame is saved.
///
/// # Safety
///
/// Only the trap vector may call this, with `frame` pointing at the frame
/// it just pushed.
pub unsafe fn trap_handler<Traits: PortInstance>(
    mcause: usize,
    mepc: usize,
    frame: *mut usize,
) -> usize {
    TRAP_NESTING.store(TRAP_NESTING.load(Ordering::Relaxed) + 1, Ordering::Relaxed);

    // The interrupted context belongs to the running task; remember where
    // its frame lives so a switch can come back to it.
    System::<Traits>::with_running_task(|task| {
        if let Some(task) = task {
            // Safety: sp slot access is serialized by the trap itself
            unsafe { *task.port_task_state.sp.get() = frame as usize };
        }
    });

    let code = mcause & !MCAUSE_INTERRUPT;
    if mcause & MCAUSE_INTERRUPT != 0 {
        match code {
            MCAUSE_MTI => {
                // Program the next tick before anything else so the
                // interval stays drift-free.
                // Safety: we are the tick interrupt
                unsafe {
                    timer::imp::advance_compare::<Traits>();
                    <System<Traits> as PortToKernel>::timer_tick();
                }
            }
            _ => {
                report_exception::<Traits>(mcause, mepc);
                panic_halt::<Traits>(KernelError::Fail);
            }
        }
    } else {
        match code {
            MCAUSE_ECALL_U => {
                // Safety: slots lie within the frame the vector just wrote
                unsafe {
                    frame.add(FRAME_EPC).write(mepc.wrapping_add(4));
                    let num = frame.add(FRAME_A7).read();
                    let a0 = frame.add(FRAME_A0).read();
                    let a1 = frame.add(FRAME_A1).read();
                    let a2 = frame.add(FRAME_A2).read();
                    let outcome = keel_kernel::syscall::dispatch::<Traits>(num, a0, a1, a2);
                    frame.add(FRAME_A0).write(outcome.ret as usize);
                    if outcome.resched {
                        <System<Traits> as PortToKernel>::choose_running_task();
                    }
                }
            }
            MCAUSE_ECALL_M => {
                // Voluntary yield from a privileged task.
                // Safety: same as above
                unsafe {
                    frame.add(FRAME_EPC).write(mepc.wrapping_add(4));
                    <System<Traits> as PortToKernel>::choose_running_task();
                }
            }
            _ => {
                report_exception::<Traits>(mcause, mepc);
                panic_halt::<Traits>(KernelError::Fail);
            }
        }
    }

    // Resume whatever the scheduler now considers running.
    let next = System::<Traits>::with_running_task(|task| {
        task.map(|t| unsafe { *t.port_task_state.sp.get() })
    });

    TRAP_NESTING.store(TRAP_NESTING.load(Ordering::Relaxed) - 1, Ordering::Relaxed);
    next.unwrap_or(frame as usize)
}

const EXC_MSG: [&str; 16] = [
    "instruction address misaligned",
    "instruction access fault",
    "illegal instruction",
    "breakpoint",
    "load address misaligned",
    "load access fault",
    "store/AMO address misaligned",
    "store/AMO access fault",
    "environment call from U-mode",
    "environment call from S-mode",
    "reserved",
    "environment call from M-mode",
    "instruction page fault",
    "load page fault",
    "reserved",
    "store/AMO page fault",
];

fn puts<Traits: ThreadingOptions>(s: &str) {
    for byte in s.bytes() {
        Traits::console_putc(byte);
    }
}

fn put_hex<Traits: ThreadingOptions>(value: usize) {
    puts::<Traits>("0x");
    for shift in (0..8).rev() {
        let nibble = (value >> (shift * 4)) & 0xf;
        let digit = if nibble < 10 {
            b'0' + nibble as u8
        } else {
            b'a' + (nibble - 10) as u8
        };
        Traits::console_putc(digit);
    }
}

fn report_exception<Traits: PortInstance>(mcause: usize, mepc: usize) {
    puts::<Traits>("\r\n[EXCEPTION] ");
    let code = mcause & !MCAUSE_INTERRUPT;
    puts::<Traits>(EXC_MSG.get(code).copied().unwrap_or("unknown"));
    puts::<Traits>(" epc=");
    put_hex::<Traits>(mepc);
    puts::<Traits>("\r\n");
}

/// Report `err` through the direct console path and halt for good.
pub fn panic_halt<Traits: PortInstance>(err: KernelError) -> ! {
    // Safety: nothing is ever unmasked again
    unsafe { enter_critical() };

    puts::<Traits>("\r\n*** KERNEL PANIC (");
    put_hex::<Traits>(err.code() as usize);
    puts::<Traits>(") - ");
    puts::<Traits>(err.as_str());
    puts::<Traits>("\r\n");

    if let Some(addr) = Traits::SHUTDOWN_ADDR {
        // Safety: board-provided shutdown device address
        unsafe { (addr as *mut u32).write_volatile(Traits::SHUTDOWN_MAGIC) };
    }

    loop {
        idle_wait();
    }
}
