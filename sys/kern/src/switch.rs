// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving CPU state in and out of threads across traps.
//!
//! Every entry to the kernel that might switch threads (a syscall, the
//! deferred switch interrupt, a fault) is bracketed the same way:
//!
//! 1. The architecture's entry stub parks the interrupted thread's registers
//!    somewhere it controls.
//! 2. `trap_entry` copies them into the current thread's `SavedState`.
//! 3. The kernel does its work, producing a `NextTask` hint.
//! 4. `trap_exit` picks the next thread if needed and copies its
//!    `SavedState` back out for the exit stub to load.
//!
//! The two copies are the only architecture-specific operations here, and are
//! expressed by `TrapContext`.

use abi::{Errno, ThreadState};

use crate::arch::{self, ArchState, SavedState};
use crate::fail::{self, Culprit, FatalReason};
use crate::kernel::{Kernel, NextTask};
use crate::profiling;
use crate::trace::Trace;

/// Access to the register state an architecture's trap stubs save and
/// restore.
pub trait TrapContext {
    /// Copies the interrupted thread's state out of the trap frame.
    fn save_on_trap_entry(&mut self, save: &mut SavedState);
    /// Loads `save` into the trap frame, to be resumed on exit.
    fn restore_on_trap_exit(&mut self, save: &SavedState);
}

/// Arranges for the current thread to be switched away from at the next trap
/// exit.
///
/// The thread's syscall result is preset to `Again`, so a wait that ends in a
/// timeout needs no further bookkeeping; wakeups overwrite it.
pub(crate) fn request_switch(k: &mut Kernel<'_>) -> NextTask {
    let cur = k.current;
    k.threads[cur].save.set_result(Errno::Again.code());
    k.need_resched = true;
    NextTask::Other
}

/// First half of a trap: saves the interrupted thread's state.
///
/// If the saved stack pointer shows the thread has overrun its stack, the
/// thread is killed and `Err` carries the resulting hint; the caller should
/// skip straight to `trap_exit` without acting on the thread's request.
pub fn trap_entry(
    k: &mut Kernel<'_>,
    trap: &mut impl TrapContext,
) -> Result<(), NextTask> {
    let cur = k.current;
    let t = &mut k.threads[cur];
    trap.save_on_trap_entry(&mut t.save);
    let sp = t.save.stack_pointer();
    if !t.stack.holds(sp) {
        return Err(fail::fatal_error(
            k,
            FatalReason::StackOverflow,
            Culprit::Thread(cur),
        ));
    }
    Ok(())
}

/// Second half of a trap: chooses who runs next and restores their state.
pub fn trap_exit(k: &mut Kernel<'_>, trap: &mut impl TrapContext, hint: NextTask) {
    let prev = k.current;
    let resched = core::mem::take(&mut k.need_resched);
    if hint == NextTask::Other
        || resched
        || k.threads[prev].state != ThreadState::Running
    {
        let next = k.pick();
        if next != prev {
            profiling::event_context_switch(next);
            kern_trace!(
                k,
                Trace::Switch {
                    from: prev as u16,
                    to: next as u16
                }
            );
            arch::apply_memory_protection(&k.threads[next]);
        }
    }
    trap.restore_on_trap_exit(&k.threads[k.current].save);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SimCpu;
    use crate::testutil::*;
    use abi::{Sysnum, ThreadFlags};
    use proptest::prelude::*;

    fn arb_regs() -> impl Strategy<Value = ([u32; 8], [u32; 16], u32)> {
        (any::<[u32; 8]>(), any::<[u32; 16]>(), any::<u32>())
    }

    proptest! {
        /// State saved from the CPU when a thread is switched out comes back
        /// bit-for-bit when it is switched in.
        #[test]
        fn context_round_trips((gprs, fpregs, basepri) in arb_regs()) {
            let mut k = kernel(4);
            let (a, _) = k
                .spawn(crate::thread::ThreadSpec {
                    flags: ThreadFlags::USES_FPU,
                    ..spec(3)
                })
                .unwrap();
            let (b, _) = k.spawn(spec(3)).unwrap();
            let mut sim = Sim::start(k);
            prop_assert_eq!(sim.current(), a);

            let sp = sim.cpu.regs.psp;
            let [r4, r5, r6, r7, r8, r9, r10, _] = gprs;
            sim.cpu.regs.r8 = r8;
            sim.cpu.regs.r9 = r9;
            sim.cpu.regs.r10 = r10;
            sim.cpu.regs.fpregs = fpregs;
            sim.cpu.regs.basepri = basepri;
            // r4-r7 and r11 carry the syscall; they come back too, with the
            // result in r4.
            prop_assert_eq!(sim.syscall(Sysnum::Yield, [r4, r5, r6, r7]), None);
            prop_assert_eq!(sim.current(), b);
            prop_assert_eq!(sim.syscall(Sysnum::Yield, [0; 4]), None);
            prop_assert_eq!(sim.current(), a);

            let regs = &sim.cpu.regs;
            prop_assert_eq!(regs.r4, 0);
            prop_assert_eq!((regs.r5, regs.r6, regs.r7), (r5, r6, r7));
            prop_assert_eq!((regs.r8, regs.r9, regs.r10), (r8, r9, r10));
            prop_assert_eq!(regs.r11, Sysnum::Yield as u32);
            prop_assert_eq!(regs.fpregs, fpregs);
            prop_assert_eq!(regs.basepri, basepri);
            prop_assert_eq!(regs.psp, sp);
            prop_assert_eq!(regs.exc_return, crate::arch::EXC_RETURN_FP);
        }
    }

    #[test]
    fn same_thread_exit_is_a_plain_restore() {
        let mut k = kernel(3);
        let (a, _) = k.spawn(spec(3)).unwrap();
        let mut sim = Sim::start(k);
        sim.cpu.regs.r9 = 0x1234;
        let before = sim.kernel.trace().last().map(|e| (e.line, e.count));
        let mut cpu: SimCpu = sim.cpu.clone();
        trap_entry(&mut sim.kernel, &mut cpu).unwrap();
        cpu.regs.r9 = 0;
        trap_exit(&mut sim.kernel, &mut cpu, NextTask::Same);
        assert_eq!(sim.kernel.current_id(), a);
        assert_eq!(cpu.regs.r9, 0x1234);
        assert_eq!(
            sim.kernel.trace().last().map(|e| (e.line, e.count)),
            before,
            "no switch recorded"
        );
    }

    #[test]
    fn overrun_stack_kills_the_thread() {
        let mut k = kernel(4);
        let (a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current(), a);
        let base = sim.kernel.thread(a).stack().base;
        sim.cpu.regs.psp = base + 4;
        assert_eq!(sim.syscall(Sysnum::Yield, [0; 4]), None);
        assert_eq!(sim.kernel.thread(a).state(), ThreadState::Dead);
        assert_eq!(sim.current(), b);
        assert_eq!(
            sim.kernel.trace().recent().find_map(|e| match e.payload {
                Trace::Fatal(r) => Some(r),
                _ => None,
            }),
            Some(FatalReason::StackOverflow)
        );
    }

    #[test]
    fn switch_applies_guard_of_incoming_thread() {
        let mut k = kernel(4);
        let (_a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.syscall(Sysnum::Sleep, [5, 0, 0, 0]), None);
        assert_eq!(sim.current(), b);
        assert_eq!(
            crate::arch::last_guard(),
            Some(sim.kernel.thread(b).stack().base)
        );
    }
}
