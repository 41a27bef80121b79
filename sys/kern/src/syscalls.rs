// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! This builds on architecture-specific parts defined in the `arch::*` modules.
//!
//! # Syscall implementations
//!
//! With only a couple of exceptions, syscalls are implemented by functions with
//! the signature:
//!
//! ```ignore
//! fn syscall(k: &mut Kernel<'_>) -> Result<NextTask, UserError>;
//! ```
//!
//! The caller is always the kernel's current thread. On return, a `NextTask`
//! indicates success with a possible scheduling hint, while a `UserError`
//! indicates a condition that needs to either be returned as a response code
//! or recorded as a fault. A common wrapper takes care of the final side
//! effects, reducing code in each syscall.
//!
//! Arguments to syscalls need to be read from the caller's saved registers.
//! Each class of syscall has an *argument proxy* type to make this easy and
//! safe, e.g. `save.as_object_args()`. See the `thread::ArchState` trait for
//! details.
//!
//! The status word is zeroed before the handler runs. A syscall that blocks
//! has it overwritten by whatever ends the wait.

use abi::{IrqOp, Sysnum, UsageError};
use num_traits::FromPrimitive;

use crate::arch::{ArchState, SavedState};
use crate::err::UserError;
use crate::fail::{self, Culprit, FatalReason};
use crate::irq::IrqController;
use crate::kernel::{Kernel, NextTask};
use crate::profiling;
use crate::wait::Wait;

/// Runs the syscall the current thread has just trapped in with.
///
/// Before calling this, the thread's registers must have been saved into its
/// `SavedState` (see `switch::trap_entry`).
pub fn dispatch<C: IrqController>(k: &mut Kernel<'_>, irqs: &mut C) -> NextTask {
    let caller = k.current;
    let nr = k.threads[caller].save.syscall_descriptor();
    profiling::event_syscall_enter(nr);
    // The status register doubles as the first argument register, so take
    // the arguments before presetting a success status.
    let save = k.threads[caller].save.clone();
    let a = &save;
    k.threads[caller].save.set_result(0);

    let res = match Sysnum::try_from(nr) {
        Ok(Sysnum::Yield) => Ok(k.yield_now()),
        Ok(Sysnum::Sleep) => sleep(k, a),
        Ok(Sysnum::Wakeup) => k.wakeup(thread_arg(a)),
        Ok(Sysnum::Suspend) => k.suspend(thread_arg(a)),
        Ok(Sysnum::Resume) => k.resume(thread_arg(a)),
        Ok(Sysnum::Abort) => k.abort(thread_arg(a)),
        Ok(Sysnum::Join) => join(k, a),
        Ok(Sysnum::Start) => k.start_thread(thread_arg(a)),
        Ok(Sysnum::PrioritySet) => priority_set(k, a),
        Ok(Sysnum::PriorityGet) => priority_get(k, a),
        Ok(Sysnum::SchedLock) => k.sched_lock().map(|()| NextTask::Same),
        Ok(Sysnum::SchedUnlock) => k.sched_unlock(),
        Ok(Sysnum::CurrentId) => {
            let id = k.current_id();
            caller_save(k).set_data(u32::from(id.0));
            Ok(NextTask::Same)
        }
        Ok(Sysnum::Uptime) => {
            let now = k.uptime();
            caller_save(k).set_uptime(now);
            Ok(NextTask::Same)
        }
        Ok(Sysnum::SemTake) => sem_take(k, a),
        Ok(Sysnum::SemGive) => k.sem_give(object_arg(a)),
        Ok(Sysnum::SemReset) => k.sem_reset(object_arg(a)),
        Ok(Sysnum::SemCount) => sem_count(k, a),
        Ok(Sysnum::MutexLock) => mutex_lock(k, a),
        Ok(Sysnum::MutexUnlock) => k.mutex_unlock(object_arg(a)),
        Ok(Sysnum::CondWait) => cond_wait(k, a),
        Ok(Sysnum::CondSignal) => k.cond_signal(object_arg(a)),
        Ok(Sysnum::CondBroadcast) => cond_broadcast(k, a),
        Ok(Sysnum::FifoPut) => fifo_put(k, a),
        Ok(Sysnum::FifoGet) => fifo_get(k, a),
        Ok(Sysnum::FifoCancelWait) => k.fifo_cancel_wait(object_arg(a)),
        Ok(Sysnum::WaitqPend) => waitq_pend(k, a),
        Ok(Sysnum::WaitqWakeOne) => waitq_wake_one(k, a),
        Ok(Sysnum::WaitqWakeAll) => waitq_wake_all(k, a),
        Ok(Sysnum::IrqControl) => irq_control(a, irqs),
        Ok(Sysnum::IrqStatus) => irq_status(k, a, irqs),
        Ok(Sysnum::Exit) => k.exit(),
        Err(()) => {
            // Bogus syscall number! That's a fault.
            Err(UsageError::BadSyscallNumber.into())
        }
    };
    let hint = match res {
        Ok(nt) => nt,
        Err(UserError::Recoverable(code, hint)) => {
            k.threads[caller].save.set_result(code.code());
            hint
        }
        Err(UserError::Unrecoverable(fault)) => fail::fatal_error(
            k,
            FatalReason::ThreadFault(fault),
            Culprit::Thread(caller),
        ),
    };
    profiling::event_syscall_exit();
    hint
}

fn caller_save<'k>(k: &'k mut Kernel<'_>) -> &'k mut SavedState {
    let cur = k.current;
    &mut k.threads[cur].save
}

fn thread_arg(a: &SavedState) -> abi::ThreadId {
    a.as_thread_args().thread
}

fn object_arg(a: &SavedState) -> abi::ObjectId {
    a.as_object_args().object
}

/// Turns the outcome of a possibly-blocking operation into a hint, handing a
/// value produced without blocking to `deliver`.
fn finish<T>(
    k: &mut Kernel<'_>,
    w: Wait<T>,
    deliver: impl FnOnce(&mut SavedState, T),
) -> NextTask {
    match w {
        Wait::Done(v) => {
            deliver(caller_save(k), v);
            NextTask::Same
        }
        Wait::Blocked => NextTask::Other,
    }
}

fn sleep(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let timeout = abi::Timeout::from_raw(a.arg0());
    let w = k.sleep(timeout)?;
    Ok(finish(k, w, |save, left| save.set_result(left)))
}

fn join(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_thread_args();
    let w = k.join(a.thread, a.timeout)?;
    Ok(finish(k, w, |_, ()| ()))
}

fn priority_set(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_thread_args();
    k.priority_set(a.thread, a.priority)
}

fn priority_get(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let p = k.priority_get(thread_arg(a))?;
    caller_save(k).set_data(i32::from(p.0) as u32);
    Ok(NextTask::Same)
}

fn sem_take(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_object_args();
    let w = k.sem_take(a.object, a.timeout)?;
    Ok(finish(k, w, |_, ()| ()))
}

fn sem_count(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let n = k.sem_count(object_arg(a))?;
    // Limits are capped at i32::MAX when the semaphore is created.
    caller_save(k).set_result(n as i32);
    Ok(NextTask::Same)
}

fn mutex_lock(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_object_args();
    let w = k.mutex_lock(a.object, a.timeout)?;
    Ok(finish(k, w, |_, ()| ()))
}

fn cond_wait(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_cond_wait_args();
    let w = k.cond_wait(a.cond, a.mutex, a.timeout)?;
    Ok(finish(k, w, |_, ()| ()))
}

fn cond_broadcast(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let (n, hint) = k.cond_broadcast(object_arg(a))?;
    caller_save(k).set_result(n as i32);
    Ok(hint)
}

fn fifo_put(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_object_args();
    k.fifo_put(a.object, a.value)
}

fn fifo_get(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_object_args();
    let w = k.fifo_get(a.object, a.timeout)?;
    Ok(finish(k, w, |save, item| save.set_data(item)))
}

fn waitq_pend(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_object_args();
    let w = k.wait_enqueue(a.object, a.timeout)?;
    Ok(finish(k, w, |_, ()| ()))
}

fn waitq_wake_one(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_object_args();
    let (woken, hint) = k.wait_dequeue_one(a.object, a.value as i32)?;
    caller_save(k).set_result(i32::from(woken.is_some()));
    Ok(hint)
}

fn waitq_wake_all(k: &mut Kernel<'_>, a: &SavedState) -> Result<NextTask, UserError> {
    let a = a.as_object_args();
    let (n, hint) = k.wait_dequeue_all(a.object, a.value as i32)?;
    caller_save(k).set_result(n as i32);
    Ok(hint)
}

fn irq_control<C: IrqController>(
    a: &SavedState,
    irqs: &mut C,
) -> Result<NextTask, UserError> {
    let a = a.as_irq_args();
    let op = IrqOp::from_u32(a.op).ok_or(UsageError::BadArgument)?;
    match op {
        IrqOp::Disable => irqs.disable(a.irq)?,
        IrqOp::Enable => irqs.enable(a.irq)?,
        IrqOp::Trigger => irqs.trigger(a.irq)?,
        IrqOp::ClearPending => irqs.clear_pending(a.irq)?,
        IrqOp::SetPriority => {
            let prio = u8::try_from(a.value).map_err(|_| UsageError::BadArgument)?;
            irqs.set_priority(a.irq, prio)?
        }
    }
    Ok(NextTask::Same)
}

fn irq_status<C: IrqController>(
    k: &mut Kernel<'_>,
    a: &SavedState,
    irqs: &mut C,
) -> Result<NextTask, UserError> {
    let irq = a.as_irq_args().irq;
    let status = irqs.status(irq)?;
    caller_save(k).set_data(status.bits());
    Ok(NextTask::Same)
}
