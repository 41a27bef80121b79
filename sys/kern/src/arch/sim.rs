// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated ARM-M, for running the kernel on a development host.
//!
//! Nothing here executes thread code. Instead, `Sim` stands in for the CPU
//! and the exception entry stubs: it owns a register file shaped like the ARM
//! one, and a test plays the part of the running thread by poking registers
//! and "executing" syscalls, which go through the same `trap_entry`,
//! `syscalls::dispatch` and `trap_exit` path as on hardware. Interrupts are
//! delivered the same way the ARM backend delivers them, including the
//! deferred switch once the last nested handler unwinds.

use std::cell::Cell;

use abi::{IrqStatus, Sysnum, ThreadFlags, ThreadId, UsageError};

use super::m_frame::{self, InitialFrame};
use crate::err::ConfigError;
use crate::irq::IrqController;
use crate::kernel::{Kernel, NextTask};
use crate::profiling;
use crate::switch::{self, TrapContext};
use crate::syscalls;
use crate::thread::{ArchState, Thread, ThreadEntry};

pub use super::m_frame::{EXC_RETURN_FP, EXC_RETURN_NO_FP};

macro_rules! uassert {
    ($cond : expr) => {
        assert!($cond)
    };
}

/// Logging is discarded on the host; the arguments are still type-checked.
macro_rules! klog {
    ($($tt:tt)*) => {{
        let _ = format_args!($($tt)*);
    }};
}

/// Stacks must start on this boundary, as on hardware.
pub const STACK_ALIGN: usize = 8;

/// Bytes at the base of each stack that a thread's stack pointer must never
/// enter. Matches the smallest MPU region on ARMv7-M.
pub const STACK_GUARD: usize = 32;

/// The registers the exception entry stubs would save, in the same shape as
/// on ARM-M.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SavedState {
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub psp: usize,
    pub exc_return: u32,
    pub fpregs: [u32; 16],
    pub basepri: u32,
    /// Full address of the thread body. The initial frame only has room for
    /// 32 bits, which can't hold a host pointer.
    pub entry: usize,
}

impl ArchState for SavedState {
    fn stack_pointer(&self) -> usize {
        self.psp
    }

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
    // Simulated threads never execute, so the frame's code addresses are
    // left null.
    let init = InitialFrame {
        entry: 0,
        args,
        trampoline: 0,
    };
    let psp = m_frame::write_initial_frame(stack, &init, fp, STACK_GUARD)?;
    *save = SavedState {
        psp,
        entry: entry as usize,
        exc_return: if fp { EXC_RETURN_FP } else { EXC_RETURN_NO_FP },
        ..SavedState::default()
    };
    Ok(())
}

thread_local! {
    static GUARD: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Records where the guard region would go. There is no MPU to program.
pub fn apply_memory_protection(t: &Thread) {
    GUARD.with(|g| g.set(Some(t.stack().base)));
}

/// Base of the stack most recently protected on this host thread.
pub fn last_guard() -> Option<usize> {
    GUARD.with(Cell::get)
}

pub extern "C" fn idle_main(_: u32, _: u32, _: u32) {
    loop {
        core::hint::spin_loop();
    }
}

pub fn irq_lock() -> u32 {
    0
}

pub fn irq_unlock(_: u32) {}

pub fn set_clock_freq(_tick_divisor: u32) {}

pub fn reset() -> ! {
    panic!("system reset");
}

pub fn start_first_thread(_tick_divisor: u32, _save: &SavedState) -> ! {
    panic!("the simulator is driven through Sim, not started");
}

/// Number of lines on the simulated interrupt controller.
pub const NUM_IRQS: usize = 64;

/// An interrupt controller with the same rules as the NVIC as the kernel
/// configures it.
#[derive(Clone, Debug)]
pub struct FakeNvic {
    enabled: u64,
    pending: u64,
    priority: [u8; NUM_IRQS],
}

impl Default for FakeNvic {
    fn default() -> Self {
        Self {
            enabled: 0,
            pending: 0,
            priority: [m_frame::LEAST_URGENT_PRIORITY; NUM_IRQS],
        }
    }
}

impl FakeNvic {
    fn bit(irq: u32) -> Result<u64, UsageError> {
        if (irq as usize) < NUM_IRQS {
            Ok(1 << irq)
        } else {
            Err(UsageError::NoIrq)
        }
    }

    pub fn priority(&self, irq: u32) -> Option<u8> {
        self.priority.get(irq as usize).copied()
    }

    /// Takes the lowest-numbered line that is pending and enabled, clearing
    /// its pending bit as the hardware does on entry.
    fn take_next(&mut self) -> Option<u32> {
        let ready = self.pending & self.enabled;
        if ready == 0 {
            return None;
        }
        let irq = ready.trailing_zeros();
        self.pending &= !(1 << irq);
        Some(irq)
    }
}

impl IrqController for FakeNvic {
    fn enable(&mut self, irq: u32) -> Result<(), UsageError> {
        self.enabled |= Self::bit(irq)?;
        Ok(())
    }

    fn disable(&mut self, irq: u32) -> Result<(), UsageError> {
        self.enabled &= !Self::bit(irq)?;
        Ok(())
    }

    fn set_priority(&mut self, irq: u32, priority: u8) -> Result<(), UsageError> {
        Self::bit(irq)?;
        if priority < m_frame::MOST_URGENT_IRQ_PRIORITY {
            return Err(UsageError::BadArgument);
        }
        self.priority[irq as usize] = priority;
        Ok(())
    }

    fn trigger(&mut self, irq: u32) -> Result<(), UsageError> {
        self.pending |= Self::bit(irq)?;
        Ok(())
    }

    fn clear_pending(&mut self, irq: u32) -> Result<(), UsageError> {
        self.pending &= !Self::bit(irq)?;
        Ok(())
    }

    fn status(&self, irq: u32) -> Result<IrqStatus, UsageError> {
        let bit = Self::bit(irq)?;
        let mut s = IrqStatus::empty();
        s.set(IrqStatus::ENABLED, self.enabled & bit != 0);
        s.set(IrqStatus::PENDING, self.pending & bit != 0);
        Ok(s)
    }
}

/// The simulated CPU: the live register file, the interrupt controller, and
/// the pending bit of the deferred switch interrupt.
#[derive(Clone, Debug, Default)]
pub struct SimCpu {
    pub regs: SavedState,
    pub nvic: FakeNvic,
    pub pendsv: bool,
}

impl TrapContext for SimCpu {
    fn save_on_trap_entry(&mut self, save: &mut SavedState) {
        save.clone_from(&self.regs);
    }

    fn restore_on_trap_exit(&mut self, save: &SavedState) {
        self.regs.clone_from(save);
    }
}

/// A kernel running on a simulated CPU.
pub struct Sim<'a> {
    pub kernel: Kernel<'a>,
    pub cpu: SimCpu,
}

impl<'a> Sim<'a> {
    /// Picks the first thread and loads it onto the CPU, as
    /// `start_first_thread` does on hardware.
    pub fn start(mut kernel: Kernel<'a>) -> Self {
        let first = kernel.start();
        let t = &kernel.threads()[first];
        apply_memory_protection(t);
        let cpu = SimCpu {
            regs: t.save().clone(),
            ..SimCpu::default()
        };
        Self { kernel, cpu }
    }

    pub fn current(&self) -> ThreadId {
        self.kernel.current_id()
    }

    pub fn current_index(&self) -> usize {
        self.kernel.current_index()
    }

    /// Status word of the last syscall, as the running thread sees it.
    pub fn result(&self) -> i32 {
        self.cpu.regs.read_ret0() as i32
    }

    /// Data word of the last syscall.
    pub fn data(&self) -> u32 {
        self.cpu.regs.read_ret1()
    }

    /// Makes syscall `nr` from the running thread.
    ///
    /// Returns the status word if the caller is still running afterwards, and
    /// `None` if the syscall switched away from it.
    pub fn syscall(&mut self, nr: Sysnum, args: [u32; 4]) -> Option<i32> {
        let caller = self.kernel.current_id();
        let regs = &mut self.cpu.regs;
        [regs.r4, regs.r5, regs.r6, regs.r7] = args;
        regs.r11 = nr as u32;
        self.trap(|k, nvic| syscalls::dispatch(k, nvic));
        (self.kernel.current_id() == caller).then(|| self.result())
    }

    /// A full trap: save, run `body` unless the save found a dead thread,
    /// restore.
    fn trap(&mut self, body: impl FnOnce(&mut Kernel<'a>, &mut FakeNvic) -> NextTask) {
        let hint = match switch::trap_entry(&mut self.kernel, &mut self.cpu) {
            Ok(()) => body(&mut self.kernel, &mut self.cpu.nvic),
            Err(hint) => hint,
        };
        switch::trap_exit(&mut self.kernel, &mut self.cpu, hint);
    }

    pub fn enter_isr(&mut self) {
        self.kernel.isr_enter();
    }

    /// Leaves an interrupt handler. Leaving the outermost one with a switch
    /// owed runs the deferred switch.
    pub fn exit_isr(&mut self, hint: NextTask) {
        if self.kernel.isr_exit(hint) {
            self.cpu.pendsv = true;
        }
        if !self.kernel.in_isr() && core::mem::take(&mut self.cpu.pendsv) {
            profiling::event_pendsv_enter();
            self.trap(|_, _| NextTask::Other);
            profiling::event_pendsv_exit();
        }
    }

    /// Runs `body` as an interrupt handler.
    pub fn with_isr(&mut self, body: impl FnOnce(&mut Kernel<'a>) -> NextTask) {
        self.enter_isr();
        let hint = body(&mut self.kernel);
        self.exit_isr(hint);
    }

    /// Delivers interrupt line `irq` to the kernel.
    pub fn irq(&mut self, irq: u32) {
        self.with_isr(|k| k.handle_irq(irq));
    }

    /// Delivers every line that is pending and enabled on the controller.
    pub fn run_irqs(&mut self) {
        while let Some(irq) = self.cpu.nvic.take_next() {
            self.irq(irq);
        }
    }

    /// One timer interrupt.
    pub fn tick(&mut self) {
        self.with_isr(|k| k.tick_announce(1));
    }

    pub fn ticks(&mut self, n: u32) {
        for _ in 0..n {
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinitialize_keeps_the_whole_entry_address() {
        extern "C" fn body(_: u32, _: u32, _: u32) {}
        let mut save = SavedState::default();
        let stack = crate::testutil::stack();
        let base = stack.as_ptr() as usize;
        let top = base + stack.len();
        reinitialize(&mut save, stack, body, [1, 2, 3], ThreadFlags::empty())
            .unwrap();
        assert_eq!(save.entry, body as usize);
        assert_eq!(save.exc_return, EXC_RETURN_NO_FP);
        assert!(save.psp > base + STACK_GUARD && save.psp < top);
    }

    #[test]
    fn nvic_rejects_out_of_range_lines_and_urgent_priorities() {
        let mut nvic = FakeNvic::default();
        assert_eq!(nvic.enable(NUM_IRQS as u32), Err(UsageError::NoIrq));
        assert_eq!(nvic.set_priority(3, 0x40), Err(UsageError::BadArgument));
        assert_eq!(nvic.set_priority(3, 0xA0), Ok(()));
        assert_eq!(nvic.priority(3), Some(0xA0));
    }

    #[test]
    fn take_next_prefers_lowest_enabled_line() {
        let mut nvic = FakeNvic::default();
        for irq in [9, 4, 30] {
            nvic.trigger(irq).unwrap();
        }
        nvic.enable(9).unwrap();
        nvic.enable(30).unwrap();
        assert_eq!(nvic.take_next(), Some(9));
        assert_eq!(nvic.take_next(), Some(30));
        assert_eq!(nvic.take_next(), None);
        assert_eq!(nvic.status(4), Ok(IrqStatus::PENDING));
    }
}
