// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M and ARMv8-M mainline, with FPU.
//!
//! # Notes on ARM-M interrupts
//!
//! For performance and (believe it or not) simplicity, this implementation uses
//! several different interrupt service routines:
//!
//! - `SVCall` implements the `SVC` instruction used to make syscalls.
//! - `SysTick` handles interrupts from the System Tick Timer, which drives the
//!   kernel clock.
//! - `DefaultHandler` takes every device interrupt and runs whatever action
//!   was connected to the line.
//! - `PendSV` handles deferred context switches from interrupts.
//!
//! The last one deserves an explanation.
//!
//! On any interrupt, the processor stacks a small subset of machine state and
//! then calls our ISR. Our ISR is a normal Rust function, and follows the
//! normal (C) calling convention: there are some registers that it can use
//! without saving, and there are others it must save first. When the ISR
//! returns, it restores any registers it saved.
//!
//! This is great, as long as the code you're returning to is the *same code
//! that called you* -- but in the case of a context switch, it isn't.
//!
//! And so, if you want to be able to inspect callee registers (beyond `r0`
//! through `r3`) or switch threads, you need to do something more elaborate
//! than the basic hardware interrupt behavior: you need to carefully deposit
//! all thread state somewhere predictable, and then read it back on the way
//! out (possibly for a different thread if the context has switched). Here,
//! that somewhere is `TRAP_SCRATCH`, which `switch::trap_entry` and
//! `switch::trap_exit` copy to and from the threads' own `SavedState`.
//!
//! This is relatively costly, so it's only appropriate in an ISR that you
//! believe will result in a context switch. `SVCall` often does; the tick and
//! device interrupts usually don't. So we do the full save/restore sequence
//! around `SVCall` and the configurable faults, but *not* around `SysTick` or
//! `DefaultHandler`. Instead, if one of those discovers that a context switch
//! is owed once the last nested handler unwinds, it sets `PendSV` pending.
//! `PendSV` runs at the least urgent priority, so it follows every other
//! handler, and performs the full save/restore around the scheduler.
//!
//! # Priorities
//!
//! Lower numbers are more urgent.
//!
//! - Faults: `FAULT_PRIORITY`, so that faults in the kernel are caught.
//! - SVCall: `SVCALL_PRIORITY`. Only thread mode can raise it.
//! - Kernel lock: `KERNEL_LOCK_PRIORITY`. While the kernel is held, BASEPRI
//!   masks every handler at or below this urgency.
//! - Device interrupts: configurable between `MOST_URGENT_IRQ_PRIORITY` and
//!   `LEAST_URGENT_PRIORITY`, so they can nest among themselves but never
//!   preempt the kernel.
//! - SysTick and PendSV: `LEAST_URGENT_PRIORITY`.
//!
//! # Threads
//!
//! Threads run privileged, in thread mode, on the process stack. Stack
//! overflow is caught in hardware: on ARMv7-M the MPU covers the bottom of the
//! running thread's stack with an inaccessible region, and on ARMv8-M the
//! process stack limit register is set to the top of the guard area.

use core::arch::{asm, global_asm};
use core::ptr::{addr_of, addr_of_mut};
use core::sync::atomic::{AtomicU32, Ordering};

use abi::{FaultInfo, IrqStatus, Sysnum, ThreadFlags, UsageError};

use super::m_frame::{self, InitialFrame};
use crate::err::ConfigError;
use crate::fail::{self, Culprit, FatalReason};
use crate::irq::IrqController;
use crate::kernel::NextTask;
use crate::profiling;
use crate::startup::with_kernel;
use crate::switch::{self, TrapContext};
use crate::syscalls;
use crate::thread::{ArchState, Thread, ThreadEntry};

pub use super::m_frame::{
    EXC_RETURN_FP, EXC_RETURN_NO_FP, KERNEL_LOCK_PRIORITY,
    LEAST_URGENT_PRIORITY, MOST_URGENT_IRQ_PRIORITY,
};

#[cfg(armv6m)]
compile_error!("ARMv6-M has no BASEPRI or FPU and is not supported");
#[cfg(not(any(armv7m, armv8m)))]
compile_error!("unknown M-profile");

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

cfg_if::cfg_if! {
    if #[cfg(feature = "klog-semihosting")] {
        macro_rules! klog {
            ($($tt:tt)*) => {
                cortex_m_semihosting::hprintln!($($tt)*)
            };
        }
    } else if #[cfg(feature = "klog-itm")] {
        macro_rules! klog {
            ($($tt:tt)*) => {{
                // Safety: stimulus port 0 belongs to the kernel, and the
                // kernel is never reentered while it's logging.
                let stim = unsafe {
                    &mut (*(cortex_m::peripheral::ITM::PTR
                        as *mut cortex_m::peripheral::itm::RegisterBlock))
                        .stim[0]
                };
                cortex_m::iprintln!(stim, $($tt)*);
            }};
        }
    } else {
        macro_rules! klog {
            ($($tt:tt)*) => {{
                let _ = format_args!($($tt)*);
            }};
        }
    }
}

/// Priority of MemManage, BusFault and UsageFault.
pub const FAULT_PRIORITY: u8 = 0x00;
/// Priority of SVCall.
pub const SVCALL_PRIORITY: u8 = 0x40;

/// Modern ARMvX-M machines require 8-byte stack alignment.
pub const STACK_ALIGN: usize = 8;

/// Bytes at the base of each stack that the thread may not touch. This is the
/// smallest MPU region on ARMv7-M.
pub const STACK_GUARD: usize = 32;

/// To allow our clock frequency to be easily determined from a debugger, we
/// store it in memory.
#[no_mangle]
static CLOCK_FREQ_KHZ: AtomicU32 = AtomicU32::new(0);

/// ARMvx-M volatile registers that must be saved across context switches.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous and in this order;
    // the trap stubs store and load them as a block.
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    fpregs: [u32; 16],
    basepri: u32,
}

const EXC_RETURN_OFFSET: usize = core::mem::offset_of!(SavedState, exc_return);
static_assertions::const_assert_eq!(EXC_RETURN_OFFSET, 36);
static_assertions::const_assert_eq!(core::mem::offset_of!(SavedState, fpregs), 40);
static_assertions::const_assert_eq!(core::mem::offset_of!(SavedState, basepri), 104);

/// Map the volatile registers to (architecture-independent) syscall argument
/// and return slots.
impl ArchState for SavedState {
    fn stack_pointer(&self) -> usize {
        self.psp as usize
    }

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32 {
        self.r4
    }
    fn arg1(&self) -> u32 {
        self.r5
    }
    fn arg2(&self) -> u32 {
        self.r6
    }
    fn arg3(&self) -> u32 {
        self.r7
    }

    fn syscall_descriptor(&self) -> u32 {
        self.r11
    }

    /// Writes syscall return argument 0.
    fn ret0(&mut self, x: u32) {
        self.r4 = x
    }
    fn ret1(&mut self, x: u32) {
        self.r5 = x
    }
    fn ret2(&mut self, x: u32) {
        self.r6 = x
    }

    fn read_ret0(&self) -> u32 {
        self.r4
    }
    fn read_ret1(&self) -> u32 {
        self.r5
    }

    fn lock_state(&self) -> u32 {
        self.basepri
    }
    fn set_lock_state(&mut self, x: u32) {
        self.basepri = x
    }
}

/// Where the trap stubs park the interrupted thread's registers, and pick up
/// the next thread's.
///
/// Only the stubs and `ArmTrap` touch this, and `ArmTrap` only from inside
/// `with_kernel`.
#[no_mangle]
static mut TRAP_SCRATCH: SavedState = SavedState {
    r4: 0,
    r5: 0,
    r6: 0,
    r7: 0,
    r8: 0,
    r9: 0,
    r10: 0,
    r11: 0,
    psp: 0,
    exc_return: 0,
    fpregs: [0; 16],
    basepri: 0,
};

/// Moves thread state between `TRAP_SCRATCH` and the kernel.
pub struct ArmTrap;

impl TrapContext for ArmTrap {
    fn save_on_trap_entry(&mut self, save: &mut SavedState) {
        // Safety: the stub that got us here is done writing, and won't read
        // until we return to it.
        save.clone_from(unsafe { &*addr_of!(TRAP_SCRATCH) });
    }

    fn restore_on_trap_exit(&mut self, save: &SavedState) {
        // Safety: as above.
        unsafe { (*addr_of_mut!(TRAP_SCRATCH)).clone_from(save) }
    }
}

// Because debuggers need to know the clock frequency to set the SWO clock
// scaler that enables ITM, and because ITM is particularly useful when
// debugging boot failures, this should be set as early in boot as it can
// be.
pub fn set_clock_freq(tick_divisor: u32) {
    CLOCK_FREQ_KHZ.store(tick_divisor, Ordering::Relaxed);
}

extern "C" {
    /// Where every thread starts; see the assembly below.
    fn thread_trampoline();
}

/// Prepares `save` and `stack` so that the thread starts at `entry` the first
/// time it is switched in.
pub fn reinitialize(
    save: &mut SavedState,
    stack: &mut [u8],
    entry: ThreadEntry,
    args: [u32; 3],
    flags: ThreadFlags,
) -> Result<(), ConfigError> {
    let fp = flags.contains(ThreadFlags::USES_FPU);
    let init = InitialFrame {
        entry: entry as usize as u32,
        args,
        trampoline: thread_trampoline as usize as u32,
    };
    let psp = m_frame::write_initial_frame(stack, &init, fp, STACK_GUARD)?;
    *save = SavedState {
        psp: psp as u32,
        exc_return: if fp { EXC_RETURN_FP } else { EXC_RETURN_NO_FP },
        ..SavedState::default()
    };
    Ok(())
}

// Threads start here with their body in r0 and its arguments in r1-r3, and
// exit through the Exit syscall if the body ever returns.
global_asm! {"
    .section .text.thread_trampoline
    .globl thread_trampoline
    .type thread_trampoline,function
    thread_trampoline:
        mov r12, r0
        mov r0, r1
        mov r1, r2
        mov r2, r3
        blx r12
        mov r11, #{exit}
        svc #0
        udf #0
    ",
    exit = const Sysnum::Exit as u32,
}

/// Guard regions must be aligned to their size, so the guard starts at the
/// first 32-byte boundary in the stack.
fn guard_base(t: &Thread) -> u32 {
    ((t.stack().base + STACK_GUARD - 1) & !(STACK_GUARD - 1)) as u32
}

#[cfg(armv7m)]
pub fn apply_memory_protection(t: &Thread) {
    // We are manufacturing authority to interact with the MPU here, because we
    // can't thread a cortex-specific peripheral through an
    // architecture-independent API.
    let mpu = unsafe {
        // At least by not taking a &mut we're confident we're not violating
        // aliasing....
        &*cortex_m::peripheral::MPU::PTR
    };

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;
    // No access from any privilege level; never executable.
    const XN: u32 = 1 << 28;
    const AP_NONE: u32 = 0b000 << 24;
    // Normal memory, write-back, not shared.
    const TEX_SCB: u32 = 0b001 << 19 | 0b011 << 16;
    // log2(32) - 1
    const SIZE_32: u32 = 4 << 1;

    // Safety: we're messing with memory protection, so from the API's point
    // of view this is very unsafe. But the only region we load covers the
    // bottom of a thread stack, which the kernel never touches while the
    // thread is live.
    unsafe {
        mpu.ctrl.write(0);
        mpu.rnr.write(0);
        mpu.rbar.write(guard_base(t));
        mpu.rasr.write(XN | AP_NONE | TEX_SCB | SIZE_32 | 1);
        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

#[cfg(armv8m)]
pub fn apply_memory_protection(t: &Thread) {
    // ARMv8-M MPU regions can't deny privileged access, but the stack limit
    // register can.
    //
    // Safety: this affects only the process stack, which the kernel doesn't
    // run on. A limit above the thread's stack pointer faults the thread on
    // its next push, which is what we want.
    unsafe {
        cortex_m::register::psplim::write(guard_base(t) + STACK_GUARD as u32);
    }
}

pub fn start_first_thread(tick_divisor: u32, save: &SavedState) -> ! {
    // Enable faults and set fault/exception priorities to reasonable settings.
    // Our goal here is to keep the kernel non-preemptive, which means the
    // kernel entry points (SVCall, PendSV, SysTick, interrupt handlers) must
    // never interrupt one another while one of them holds the kernel. Fault
    // handlers need to be higher priority, however, so that we can detect
    // faults in the kernel.
    //
    // Safety: this is actually fairly safe. We're purely lowering priorities
    // from their defaults, so it can't cause any surprise preemption or
    // anything. But these operations are `unsafe` in the `cortex_m` crate.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Faults on, on the processors that distinguish faults. This
        // distinguishes the following faults from HardFault:
        //
        // - ARMv7+: MEMFAULT, BUSFAULT, USGFAULT
        // - ARMv8: SECUREFAULT
        cfg_if::cfg_if! {
            if #[cfg(armv7m)] {
                scb.shcsr.modify(|x| x | 0b111 << 16);
            } else {
                scb.shcsr.modify(|x| x | 0b1111 << 16);
            }
        }

        // MemManage, BusFault, UsageFault.
        scb.shpr[0].write(FAULT_PRIORITY);
        scb.shpr[1].write(FAULT_PRIORITY);
        scb.shpr[2].write(FAULT_PRIORITY);
        scb.shpr[7].write(SVCALL_PRIORITY);
        // PendSV and SysTick.
        scb.shpr[10].write(LEAST_URGENT_PRIORITY);
        scb.shpr[11].write(LEAST_URGENT_PRIORITY);

        // ARM's default disposition is that division by zero doesn't actually
        // fail, but rather returns 0. (!) We explicitly configure ourselves to
        // trap on any divide by zero.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);

        // How many IRQs have we got? This information is stored in a separate
        // area of the address space, away from the NVIC. It's given in blocks
        // of 32, minus 1, so there are always at least 32 interrupts.
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let irq_count = ((icb.ictr.read() as usize & 0xF) + 1) * 32;
        // Start every interrupt at the least urgent priority. IPR registers
        // on ARMv7/8 are modeled as `u8` by `cortex_m`.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        for i in 0..irq_count {
            nvic.ipr[i].write(LEAST_URGENT_PRIORITY);
        }
    }

    // Safety: this, too, is safe in practice but unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(tick_divisor - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt.
        syst.csr.modify(|v| v | 0b111);
    }

    extern "C" {
        // Exposed by the linker script.
        static _stack_base: u32;
    }

    // Safety: this is setting the Main stack pointer (i.e. kernel/interrupt
    // stack pointer) limit register. Either we haven't overflowed yet and
    // proceed, or we take an immediate fault. Both are safe.
    #[cfg(armv8m)]
    unsafe {
        cortex_m::register::msplim::write(addr_of!(_stack_base) as u32);
    }

    // Safety: nothing has trapped yet, so the scratch area is ours. Setting
    // the process stack pointer has no effect while we run on the main stack.
    unsafe {
        (*addr_of_mut!(TRAP_SCRATCH)).clone_from(save);
        cortex_m::register::psp::write(save.psp);
    }

    // Our basic goal here is to flip into Handler mode (i.e. interrupt state)
    // so that we can return into Thread mode running off the Process Stack
    // Pointer. The easiest way to do this on ARM-M is by entering Handler mode
    // by a trap. We use SVC, which we also use for system calls; the SVC entry
    // sequence (below) has code to detect this condition and do kernel startup
    // rather than processing it as a syscall.
    unsafe {
        asm!("
            @ Restore callee-save registers.
            ldm {save}, {{r4-r11}}
            @ Trap into the kernel.
            svc #0xFF
            @ noreturn generates a UDF here in case that should return.
            ",
            save = in(reg) addr_of!(TRAP_SCRATCH),
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call (SVC)
// instruction.
//
// First, we inspect LR, which on exception entry contains bits describing the
// _previous_ (interrupted) processor state. We can use this to detect if the
// SVC came from the Main (interrupt) stack. This only happens once, during
// startup, so we vector to a different routine in this case.
//
// We then store the calling thread's context into TRAP_SCRATCH, call into
// `syscall_entry`, and load TRAP_SCRATCH back (possibly for a different
// thread!).
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the kernel startup routine?
        cmp r0, #0x8
        @ If so, this is startup; jump ahead.
        beq 1f

        movw r0, #:lower16:TRAP_SCRATCH
        movt r0, #:upper16:TRAP_SCRATCH
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r0!, {{r4-r12, lr}}
        vstm r0!, {{s16-s31}}
        mrs r1, BASEPRI
        str r1, [r0]

        bl syscall_entry

        @ we're returning back to *some* thread, maybe not the same one.
        movw r0, #:lower16:TRAP_SCRATCH
        movt r0, #:upper16:TRAP_SCRATCH
        ldm r0!, {{r4-r12, lr}}
        vldm r0!, {{s16-s31}}
        ldr r1, [r0]
        msr BASEPRI, r1
        msr PSP, r12

        @ resume
        bx lr

    1:  @ starting up the first thread.
        @ Threads run privileged; make sure of it.
        movs r0, #0
        msr CONTROL, r0
        @ note: no barrier here because exc return serves as barrier

        @ Use the EXC_RETURN the first thread was prepared with.
        movw r0, #:lower16:TRAP_SCRATCH
        movt r0, #:upper16:TRAP_SCRATCH
        ldr lr, [r0, #{exc_return}]
        bx lr
    ",
    exc_return = const EXC_RETURN_OFFSET,
}

/// The Rust side of the SVCall handler, after all volatile registers have been
/// saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn syscall_entry() {
    with_kernel(|k| {
        let mut trap = ArmTrap;
        let hint = match switch::trap_entry(k, &mut trap) {
            Ok(()) => syscalls::dispatch(k, &mut Nvic),
            Err(hint) => hint,
        };
        switch::trap_exit(k, &mut trap, hint);
    });
}

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    let switch = with_kernel(|k| {
        k.isr_enter();
        let hint = k.tick_announce(1);
        k.isr_exit(hint)
    });
    if switch {
        pend_context_switch_from_isr();
    }
}

fn pend_context_switch_from_isr() {
    // This sets the bit to pend a PendSV interrupt. PendSV will happen after
    // the current ISR (and any chained ISRs) returns, and perform the context
    // switch.
    cortex_m::peripheral::SCB::set_pendsv();
}

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        movw r0, #:lower16:TRAP_SCRATCH
        movt r0, #:upper16:TRAP_SCRATCH
        mrs r12, PSP
        stm r0!, {{r4-r12, lr}}
        vstm r0!, {{s16-s31}}
        mrs r1, BASEPRI
        str r1, [r0]

        bl pendsv_entry

        movw r0, #:lower16:TRAP_SCRATCH
        movt r0, #:upper16:TRAP_SCRATCH
        ldm r0!, {{r4-r12, lr}}
        vldm r0!, {{s16-s31}}
        ldr r1, [r0]
        msr BASEPRI, r1
        msr PSP, r12

        bx lr
    ",
}

/// The Rust side of the PendSV handler, after all volatile registers have been
/// saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    profiling::event_pendsv_enter();
    with_kernel(|k| {
        let mut trap = ArmTrap;
        let hint = match switch::trap_entry(k, &mut trap) {
            Ok(()) => NextTask::Other,
            Err(hint) => hint,
        };
        switch::trap_exit(k, &mut trap, hint);
    });
    profiling::event_pendsv_exit();
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn DefaultHandler() {
    // We can cheaply get the identity of the interrupt that called us from the
    // bottom 9 bits of IPSR.
    //
    // Safety: we're just reading the PSR.
    let exception_num = unsafe {
        let mut ipsr: u32;
        asm!(
            "mrs {}, IPSR",
            out(reg) ipsr,
            options(pure, nomem, preserves_flags, nostack),
        );
        ipsr & 0x1FF
    };

    // The first 16 exceptions are architecturally defined; vendor hardware
    // interrupts start at 16.
    match exception_num {
        2 => fail::die("NMI"),
        12 => fail::die("DebugMon"),
        x if x >= 16 => {
            let irq = x - 16;
            let switch = with_kernel(|k| {
                k.isr_enter();
                let hint = k.handle_irq(irq);
                k.isr_exit(hint)
            });
            if switch {
                pend_context_switch_from_isr();
            }
        }
        x => fail::die(FatalReason::KernelOops(x)),
    }
}

/// The NVIC, as seen by the interrupt control syscalls.
pub struct Nvic;

impl Nvic {
    fn regs() -> &'static cortex_m::peripheral::nvic::RegisterBlock {
        // Safety: the register block is always mapped, and we only make
        // single-word writes to write-one registers, or byte writes to
        // priorities, so there's nothing to race.
        unsafe { &*cortex_m::peripheral::NVIC::PTR }
    }

    fn reg_and_mask(n: u32) -> (usize, u32) {
        ((n / 32) as usize, 1 << (n % 32))
    }
}

impl IrqController for Nvic {
    fn enable(&mut self, irq: u32) -> Result<(), UsageError> {
        // Enable the interrupt by poking the Interrupt Set Enable Register.
        let (reg, mask) = Self::reg_and_mask(irq);
        let iser = Self::regs().iser.get(reg).ok_or(UsageError::NoIrq)?;
        unsafe { iser.write(mask) };
        Ok(())
    }

    fn disable(&mut self, irq: u32) -> Result<(), UsageError> {
        // Disable the interrupt by poking the Interrupt Clear Enable Register.
        let (reg, mask) = Self::reg_and_mask(irq);
        let icer = Self::regs().icer.get(reg).ok_or(UsageError::NoIrq)?;
        unsafe { icer.write(mask) };
        Ok(())
    }

    fn set_priority(&mut self, irq: u32, priority: u8) -> Result<(), UsageError> {
        let ipr = Self::regs()
            .ipr
            .get(irq as usize)
            .ok_or(UsageError::NoIrq)?;
        if priority < MOST_URGENT_IRQ_PRIORITY {
            return Err(UsageError::BadArgument);
        }
        unsafe { ipr.write(priority) };
        Ok(())
    }

    fn trigger(&mut self, irq: u32) -> Result<(), UsageError> {
        // Pend the IRQ by poking the corresponding bit in the Interrupt Set
        // Pending Register (ISPR).
        let (reg, mask) = Self::reg_and_mask(irq);
        let ispr = Self::regs().ispr.get(reg).ok_or(UsageError::NoIrq)?;
        unsafe { ispr.write(mask) };
        Ok(())
    }

    fn clear_pending(&mut self, irq: u32) -> Result<(), UsageError> {
        let (reg, mask) = Self::reg_and_mask(irq);
        let icpr = Self::regs().icpr.get(reg).ok_or(UsageError::NoIrq)?;
        unsafe { icpr.write(mask) };
        Ok(())
    }

    fn status(&self, irq: u32) -> Result<IrqStatus, UsageError> {
        let (reg, mask) = Self::reg_and_mask(irq);
        let nvic = Self::regs();
        let mut status = IrqStatus::empty();

        let iser = nvic.iser.get(reg).ok_or(UsageError::NoIrq)?;
        status.set(IrqStatus::ENABLED, iser.read() & mask != 0);
        let ispr = nvic.ispr.get(reg).ok_or(UsageError::NoIrq)?;
        status.set(IrqStatus::PENDING, ispr.read() & mask != 0);

        Ok(status)
    }
}

global_asm! {"
    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    configurable_fault:
        movw r0, #:lower16:TRAP_SCRATCH
        movt r0, #:upper16:TRAP_SCRATCH
        mrs r12, PSP

        @ Save the integer context. We explicitly refrain from saving the
        @ floating point registers here: touching them would induce a lazy
        @ save on the thread's stack, which is clearly bad news if the stack
        @ is what faulted. handle_fault saves them once that's been dealt
        @ with.
        stm r0, {{r4-r12, lr}}

        @ Pull our fault number out of IPSR, allowing for program text to be
        @ shared across all configurable faults.
        mrs r0, IPSR
        and r0, r0, #0xf
        bl handle_fault

        @ The faulting thread is gone; load whoever runs next.
        movw r0, #:lower16:TRAP_SCRATCH
        movt r0, #:upper16:TRAP_SCRATCH
        ldm r0!, {{r4-r12, lr}}
        vldm r0!, {{s16-s31}}
        ldr r1, [r0]
        msr BASEPRI, r1
        msr PSP, r12

        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        b hard_fault_entry
    ",
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        #[cfg(armv8m)]
        const STKOF = 1 << (16 + 4);
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
    }
}

const MEM_MANAGE: u32 = 4;
const BUS_FAULT: u32 = 5;

impl Cfsr {
    /// Whether the fault happened while stacking onto a thread stack that
    /// can't take it.
    fn stack_invalid(self) -> bool {
        #[cfg(armv8m)]
        if self.contains(Cfsr::STKOF) {
            return true;
        }
        self.intersects(Cfsr::MSTKERR | Cfsr::STKERR)
    }
}

/// Rust entry point for the configurable faults.
///
/// # Safety
///
/// In brief: don't call this. This is an implementation factor of the fault
/// handler assembly code and should not be used for other purposes.
#[no_mangle]
unsafe extern "C" fn handle_fault(fault_type: u32) {
    // To diagnose the fault, we're going to need access to the System Control
    // Block. Pull such access from thin air.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());

    // Safety: the stub has just written this and is waiting on us.
    let exc_return = unsafe { (*addr_of!(TRAP_SCRATCH)).exc_return };
    if exc_return & 0b1000 == 0 {
        // This fault originates from the kernel or an interrupt handler.
        klog!(
            "kernel fault {}: CFSR={:#010x} MMFAR={:#010x} BFAR={:#010x}",
            fault_type,
            cfsr.bits(),
            scb.mmfar.read(),
            scb.bfar.read()
        );
        fail::die(FatalReason::KernelOops(cfsr.bits()));
    }

    // A fault taken while stacking another exception leaves that exception
    // pending, and it would fire as though the next thread had raised it.
    // Clear the pended SVCall, BusFault, MemManage and UsageFault bits.
    //
    // Safety: the main risk here is if SVC were higher priority than this
    // handler, which it is not.
    unsafe {
        scb.shcsr.modify(|bits| bits & !(0b1111 << 12));
    }

    let reason = if cfsr.stack_invalid() {
        FatalReason::StackOverflow
    } else {
        FatalReason::ThreadFault(match fault_type {
            MEM_MANAGE if cfsr.contains(Cfsr::IACCVIOL) => FaultInfo::IllegalText,
            MEM_MANAGE => FaultInfo::MemoryAccess {
                address: cfsr
                    .contains(Cfsr::MMARVALID)
                    .then(|| scb.mmfar.read()),
            },
            BUS_FAULT => FaultInfo::BusError {
                address: cfsr
                    .contains(Cfsr::BFARVALID)
                    .then(|| scb.bfar.read()),
            },
            _ if cfsr.contains(Cfsr::DIVBYZERO) => FaultInfo::DivideByZero,
            _ if cfsr.contains(Cfsr::UNDEFINSTR) => {
                FaultInfo::IllegalInstruction
            }
            _ => FaultInfo::InvalidOperation(cfsr.bits()),
        })
    };

    // CFSR is write-one-to-clear.
    unsafe {
        scb.cfsr.write(cfsr.bits());
    }

    if reason == FatalReason::StackOverflow {
        // Saving the floating point registers below would trigger the lazy
        // save onto the stack that just failed. Cancel it.
        const LSPACT: u32 = 1 << 0;
        unsafe {
            let fpu = &*cortex_m::peripheral::FPU::PTR;
            fpu.fpccr.modify(|x| x & !LSPACT);
        }
    }

    // Safety: fpregs is 16 aligned words, and nobody else is using the
    // scratch area.
    unsafe {
        let fpsave = addr_of_mut!(TRAP_SCRATCH.fpregs) as *mut u32;
        asm!("vstm {0}, {{s16-s31}}", in(reg) fpsave);
    }

    with_kernel(|k| {
        let mut trap = ArmTrap;
        let cur = k.current;
        let hint = match switch::trap_entry(k, &mut trap) {
            Ok(()) => fail::fatal_error(k, reason, Culprit::Thread(cur)),
            Err(hint) => hint,
        };
        switch::trap_exit(k, &mut trap, hint);
        uassert!(k.current != cur);
    });
}

/// Everything that escalates to HardFault is a kernel failure.
#[no_mangle]
unsafe extern "C" fn hard_fault_entry() -> ! {
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    fail::die(FatalReason::KernelOops(scb.hfsr.read()))
}

/// Masks every interrupt that can reach the kernel, returning the previous
/// mask for `irq_unlock`.
pub fn irq_lock() -> u32 {
    let prev = cortex_m::register::basepri::read();
    // Safety: raising BASEPRI only ever masks more.
    unsafe {
        cortex_m::register::basepri_max::write(KERNEL_LOCK_PRIORITY);
    }
    u32::from(prev)
}

pub fn irq_unlock(key: u32) {
    // Safety: restoring the mask `irq_lock` found.
    unsafe {
        cortex_m::register::basepri::write(key as u8);
    }
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

pub extern "C" fn idle_main(_: u32, _: u32, _: u32) {
    loop {
        cortex_m::asm::wfi();
    }
}
