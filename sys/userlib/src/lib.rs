// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread-side support library for the kernel.
//!
//! This contains syscall stubs and types, and re-exports the contents of the
//! `abi` crate that gets shared with the kernel.
//!
//! # Syscall stub implementation
//!
//! Every syscall goes through one stub, `sys_call_stub`. Arguments travel in
//! `r4`-`r7` and the syscall number in `r11`; the kernel answers in `r4`
//! (status: negative `Errno`, or a non-negative count), `r5` (data) and `r6`
//! (the high word of 64-bit data). Those are callee-saved registers in the C
//! ABI, so the stub is `naked`, meaning the compiler will *not* attempt to do
//! any framepointer/basepointer nonsense, and we can thus reason about the
//! assignment and availability of all registers.
//!
//! On anything that isn't an ARM target there's no kernel to trap into.
//! Instead, syscalls go to a per-thread hook installed with
//! `set_trap_hook`, so that code built on these wrappers can be tested on a
//! development host.

#![cfg_attr(target_os = "none", no_std)]

pub use abi::*;

/// Raw result registers: status, data, and the high data word.
type RawResult = [u32; 3];

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        fn syscall(nr: Sysnum, args: [u32; 4]) -> RawResult {
            let mut regs = args;
            // Safety: the stub reads four words from `regs` and writes three
            // back, all of which are in bounds.
            unsafe {
                sys_call_stub(&mut regs, nr as u32);
            }
            [regs[0], regs[1], regs[2]]
        }

        /// Core implementation of every syscall.
        ///
        /// See the note on syscall stubs at the top of this module for
        /// rationale.
        #[unsafe(naked)]
        unsafe extern "C" fn sys_call_stub(_regs: *mut [u32; 4], _nr: u32) {
            core::arch::naked_asm!("
                @ Spill the registers we're about to use to pass stuff.
                push {{r4-r7, r11, lr}}

                @ Move register arguments into place.
                ldm r0, {{r4-r7}}
                mov r11, r1

                @ To the kernel!
                svc #0

                @ Move the results into place. r0 comes back as we left it,
                @ courtesy of the exception frame.
                stm r0, {{r4-r6}}

                @ Restore the registers we used and return.
                pop {{r4-r7, r11, pc}}
                ",
            )
        }
    } else {
        mod host;
        pub use host::{clear_trap_hook, set_trap_hook};

        fn syscall(nr: Sysnum, args: [u32; 4]) -> RawResult {
            let mut regs = args;
            host::trap(nr, &mut regs);
            [regs[0], regs[1], regs[2]]
        }
    }
}

/// Makes a syscall whose only result is its status word.
fn status(nr: Sysnum, args: [u32; 4]) -> Result<u32, Errno> {
    Errno::check(syscall(nr, args)[0])
}

fn unit(nr: Sysnum, args: [u32; 4]) -> Result<(), Errno> {
    status(nr, args).map(|_| ())
}

fn tid(t: ThreadId) -> u32 {
    u32::from(t.0)
}

fn obj(o: ObjectId) -> u32 {
    u32::from(o.0)
}

/// Gives up the CPU to any other ready thread of the same priority.
pub fn sys_yield() {
    // Yield can't fail.
    let _ = syscall(Sysnum::Yield, [0; 4]);
}

/// Sleeps for `timeout`.
///
/// Returns the number of ticks that were left when something woke the caller
/// early with `sys_wakeup`, or zero if the sleep ran its course.
pub fn sys_sleep(timeout: Timeout) -> Result<u32, Errno> {
    status(Sysnum::Sleep, [timeout.to_raw(), 0, 0, 0])
}

/// Ends another thread's sleep early.
pub fn sys_wakeup(t: ThreadId) -> Result<(), Errno> {
    unit(Sysnum::Wakeup, [tid(t), 0, 0, 0])
}

/// Takes a thread off the CPU until `sys_resume`. A thread suspended while
/// waiting on an object stays queued for it, minus its timeout.
pub fn sys_suspend(t: ThreadId) -> Result<(), Errno> {
    unit(Sysnum::Suspend, [tid(t), 0, 0, 0])
}

pub fn sys_resume(t: ThreadId) -> Result<(), Errno> {
    unit(Sysnum::Resume, [tid(t), 0, 0, 0])
}

pub fn sys_abort(t: ThreadId) -> Result<(), Errno> {
    unit(Sysnum::Abort, [tid(t), 0, 0, 0])
}

/// Waits for a thread to exit. Joining a thread that's already gone
/// succeeds at once.
pub fn sys_join(t: ThreadId, timeout: Timeout) -> Result<(), Errno> {
    unit(Sysnum::Join, [tid(t), timeout.to_raw(), 0, 0])
}

/// Releases a thread that was created with a `Forever` start delay.
pub fn sys_start(t: ThreadId) -> Result<(), Errno> {
    unit(Sysnum::Start, [tid(t), 0, 0, 0])
}

pub fn sys_priority_set(t: ThreadId, p: Priority) -> Result<(), Errno> {
    unit(Sysnum::PrioritySet, [tid(t), p.0 as u32, 0, 0])
}

/// Reads a thread's current priority, including any it has inherited.
pub fn sys_priority_get(t: ThreadId) -> Result<Priority, Errno> {
    let [st, data, _] = syscall(Sysnum::PriorityGet, [tid(t), 0, 0, 0]);
    Errno::check(st)?;
    Ok(Priority(data as i8))
}

/// Keeps the caller on the CPU, whatever becomes ready, until the matching
/// `sys_sched_unlock`. Locks nest.
pub fn sys_sched_lock() -> Result<(), Errno> {
    unit(Sysnum::SchedLock, [0; 4])
}

pub fn sys_sched_unlock() -> Result<(), Errno> {
    unit(Sysnum::SchedUnlock, [0; 4])
}

pub fn sys_current_id() -> ThreadId {
    let [_, data, _] = syscall(Sysnum::CurrentId, [0; 4]);
    ThreadId(data as u16)
}

/// Ticks since the kernel started.
pub fn sys_uptime() -> u64 {
    let [_, lo, hi] = syscall(Sysnum::Uptime, [0; 4]);
    u64::from(hi) << 32 | u64::from(lo)
}

pub fn sys_sem_take(s: ObjectId, timeout: Timeout) -> Result<(), Errno> {
    unit(Sysnum::SemTake, [obj(s), timeout.to_raw(), 0, 0])
}

pub fn sys_sem_give(s: ObjectId) -> Result<(), Errno> {
    unit(Sysnum::SemGive, [obj(s), 0, 0, 0])
}

/// Zeroes a semaphore's count, failing any waiters with `Errno::Canceled`.
pub fn sys_sem_reset(s: ObjectId) -> Result<(), Errno> {
    unit(Sysnum::SemReset, [obj(s), 0, 0, 0])
}

pub fn sys_sem_count(s: ObjectId) -> Result<u32, Errno> {
    status(Sysnum::SemCount, [obj(s), 0, 0, 0])
}

pub fn sys_mutex_lock(m: ObjectId, timeout: Timeout) -> Result<(), Errno> {
    unit(Sysnum::MutexLock, [obj(m), timeout.to_raw(), 0, 0])
}

pub fn sys_mutex_unlock(m: ObjectId) -> Result<(), Errno> {
    unit(Sysnum::MutexUnlock, [obj(m), 0, 0, 0])
}

/// Releases `mutex` and waits on `cond`, taking `mutex` back before
/// returning successfully.
pub fn sys_cond_wait(
    cond: ObjectId,
    mutex: ObjectId,
    timeout: Timeout,
) -> Result<(), Errno> {
    unit(Sysnum::CondWait, [obj(cond), obj(mutex), timeout.to_raw(), 0])
}

pub fn sys_cond_signal(cond: ObjectId) -> Result<(), Errno> {
    unit(Sysnum::CondSignal, [obj(cond), 0, 0, 0])
}

/// Wakes every waiter on `cond`, returning how many there were.
pub fn sys_cond_broadcast(cond: ObjectId) -> Result<u32, Errno> {
    status(Sysnum::CondBroadcast, [obj(cond), 0, 0, 0])
}

pub fn sys_fifo_put(f: ObjectId, item: u32) -> Result<(), Errno> {
    unit(Sysnum::FifoPut, [obj(f), item, 0, 0])
}

pub fn sys_fifo_get(f: ObjectId, timeout: Timeout) -> Result<u32, Errno> {
    let [st, data, _] = syscall(Sysnum::FifoGet, [obj(f), timeout.to_raw(), 0, 0]);
    Errno::check(st)?;
    Ok(data)
}

/// Fails the first thread waiting on `f` with `Errno::Canceled`.
pub fn sys_fifo_cancel_wait(f: ObjectId) -> Result<(), Errno> {
    unit(Sysnum::FifoCancelWait, [obj(f), 0, 0, 0])
}

/// Waits on a bare wait queue. Returns the code the waker passed.
pub fn sys_waitq_pend(q: ObjectId, timeout: Timeout) -> Result<u32, Errno> {
    status(Sysnum::WaitqPend, [obj(q), timeout.to_raw(), 0, 0])
}

/// Wakes the first waiter on `q` with `code`. Returns whether there was one.
pub fn sys_waitq_wake_one(q: ObjectId, code: u32) -> Result<bool, Errno> {
    status(Sysnum::WaitqWakeOne, [obj(q), code, 0, 0]).map(|n| n != 0)
}

/// Wakes every waiter on `q` with `code`, returning how many there were.
pub fn sys_waitq_wake_all(q: ObjectId, code: u32) -> Result<u32, Errno> {
    status(Sysnum::WaitqWakeAll, [obj(q), code, 0, 0])
}

pub fn sys_irq_enable(irq: u32) -> Result<(), Errno> {
    irq_control(irq, IrqOp::Enable, 0)
}

pub fn sys_irq_disable(irq: u32) -> Result<(), Errno> {
    irq_control(irq, IrqOp::Disable, 0)
}

/// Sets an interrupt line pending, as though the device had raised it.
pub fn sys_irq_trigger(irq: u32) -> Result<(), Errno> {
    irq_control(irq, IrqOp::Trigger, 0)
}

pub fn sys_irq_clear_pending(irq: u32) -> Result<(), Errno> {
    irq_control(irq, IrqOp::ClearPending, 0)
}

/// Sets the hardware priority of an interrupt line. Priorities more urgent
/// than the kernel's own are refused, and fault the caller.
pub fn sys_irq_set_priority(irq: u32, priority: u8) -> Result<(), Errno> {
    irq_control(irq, IrqOp::SetPriority, u32::from(priority))
}

fn irq_control(irq: u32, op: IrqOp, value: u32) -> Result<(), Errno> {
    unit(Sysnum::IrqControl, [irq, op as u32, value, 0])
}

pub fn sys_irq_status(irq: u32) -> Result<IrqStatus, Errno> {
    let [st, data, _] = syscall(Sysnum::IrqStatus, [irq, 0, 0, 0]);
    Errno::check(st)?;
    Ok(IrqStatus::from_bits_truncate(data))
}

/// Ends the calling thread. Threads that return from their entry point end
/// up here too.
pub fn sys_exit() -> ! {
    let _ = syscall(Sysnum::Exit, [0; 4]);
    unreachable!("thread resumed after exit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Installs a hook that logs every trap and answers with `reply`.
    fn record(reply: RawResult) -> Rc<RefCell<Vec<(Sysnum, [u32; 4])>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        set_trap_hook(move |nr, regs| {
            l.borrow_mut().push((nr, *regs));
            regs[..3].copy_from_slice(&reply);
        });
        log
    }

    #[test]
    fn arguments_land_in_order() {
        let log = record([0; 3]);
        sys_cond_wait(ObjectId(3), ObjectId(4), Timeout::Ticks(9)).unwrap();
        sys_irq_set_priority(12, 0xC0).unwrap();
        sys_priority_set(ThreadId(0x0405), Priority(-2)).unwrap();
        assert_eq!(
            *log.borrow(),
            [
                (Sysnum::CondWait, [3, 4, 9, 0]),
                (Sysnum::IrqControl, [12, IrqOp::SetPriority as u32, 0xC0, 0]),
                (Sysnum::PrioritySet, [0x0405, 0xFFFF_FFFE, 0, 0]),
            ]
        );
        clear_trap_hook();
    }

    #[test]
    fn negative_status_is_an_errno() {
        let _ = record([Errno::Again.code() as u32, 0, 0]);
        assert_eq!(sys_sem_take(ObjectId(0), Timeout::Forever), Err(Errno::Again));
        assert_eq!(sys_fifo_get(ObjectId(0), Timeout::NoWait), Err(Errno::Again));
        clear_trap_hook();
    }

    #[test]
    fn data_words_are_decoded() {
        let _ = record([0, 0xFFFF_FFFD, 0]);
        assert_eq!(sys_priority_get(ThreadId(1)), Ok(Priority(-3)));

        let _ = record([0, 0x8000_0001, 0x2]);
        assert_eq!(sys_uptime(), 0x2_8000_0001);

        let _ = record([1, IrqStatus::PENDING.bits(), 0]);
        assert_eq!(sys_irq_status(5), Ok(IrqStatus::PENDING));
        assert_eq!(sys_waitq_wake_one(ObjectId(2), 0), Ok(true));
        clear_trap_hook();
    }

    #[test]
    #[should_panic(expected = "no trap hook")]
    fn trapping_without_a_hook_panics() {
        clear_trap_hook();
        sys_yield();
    }

    proptest! {
        #[test]
        fn timeouts_reach_the_kernel_intact(ticks in 1u32..u32::MAX - 1) {
            let log = record([0; 3]);
            sys_sleep(Timeout::Ticks(ticks)).unwrap();
            sys_sleep(Timeout::Forever).unwrap();
            let log = log.borrow();
            prop_assert_eq!(Timeout::from_raw(log[0].1[0]), Timeout::Ticks(ticks));
            prop_assert_eq!(Timeout::from_raw(log[1].1[0]), Timeout::Forever);
        }
    }
}
