// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt handling and the reschedule glue around it.
//!
//! Interrupt handlers don't go through the trap path: they run on whatever
//! thread was interrupted, and anything they make ready is only noted. Every
//! handler is bracketed by `isr_enter` and `isr_exit`. When the outermost
//! handler exits with a switch owed, `isr_exit` says so, and the architecture
//! pends its deferred switch interrupt, which does a full trap once all
//! handlers have unwound.
//!
//! Handlers are connected to lines through a small table of `IsrAction`s.

use abi::{Errno, IrqStatus, ObjectId, UsageError};
use heapless::FnvIndexMap;

use crate::config::MAX_ISRS;
use crate::err::UserError;
use crate::fail::{self, Culprit, FatalReason};
use crate::kernel::{Kernel, NextTask};
use crate::profiling;
use crate::sync::Class;
use crate::trace::Trace;

/// Operations on an interrupt controller, as needed by the `IrqControl`
/// syscalls.
pub trait IrqController {
    fn enable(&mut self, irq: u32) -> Result<(), UsageError>;
    fn disable(&mut self, irq: u32) -> Result<(), UsageError>;
    /// Sets the hardware priority of a line. Lines must stay at or below the
    /// kernel lock level, so controllers refuse anything more urgent.
    fn set_priority(&mut self, irq: u32, priority: u8) -> Result<(), UsageError>;
    /// Pends a line from software.
    fn trigger(&mut self, irq: u32) -> Result<(), UsageError>;
    fn clear_pending(&mut self, irq: u32) -> Result<(), UsageError>;
    fn status(&self, irq: u32) -> Result<IrqStatus, UsageError>;
}

/// What the kernel does when a connected line fires.
#[derive(Copy, Clone, Debug)]
pub enum IsrAction {
    /// Give the semaphore.
    Give(ObjectId),
    /// Put the word into the fifo. A full fifo drops it.
    Put(ObjectId, u32),
    /// Call a board-supplied handler with the kernel and the word.
    Call(fn(&mut Kernel<'_>, u32) -> NextTask, u32),
}

#[derive(Debug)]
pub struct IrqState {
    /// Nesting depth of interrupt handlers; zero in thread context.
    pub(crate) depth: u32,
    /// Switch owed once the outermost handler exits.
    pub(crate) pending: NextTask,
    pub(crate) actions: FnvIndexMap<u32, IsrAction, MAX_ISRS>,
}

impl Default for IrqState {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqState {
    pub fn new() -> Self {
        Self {
            depth: 0,
            pending: NextTask::Same,
            actions: FnvIndexMap::new(),
        }
    }
}

impl Kernel<'_> {
    /// Connects `action` to line `irq`, replacing any previous connection.
    pub fn irq_connect(
        &mut self,
        irq: u32,
        action: IsrAction,
    ) -> Result<(), Errno> {
        let check = match action {
            IsrAction::Give(id) => self.object(id, Class::Semaphore),
            IsrAction::Put(id, _) => self.object(id, Class::Fifo),
            IsrAction::Call(..) => Ok(0),
        };
        check.map_err(|_| Errno::Inval)?;
        self.irq
            .actions
            .insert(irq, action)
            .map_err(|_| Errno::NoMem)?;
        Ok(())
    }

    /// Disconnects line `irq`. Disconnecting an unconnected line does
    /// nothing.
    pub fn irq_disconnect(&mut self, irq: u32) {
        self.irq.actions.remove(&irq);
    }

    /// Called on entry to any kernel-aware interrupt handler.
    pub fn isr_enter(&mut self) {
        profiling::event_isr_enter();
        self.irq.depth += 1;
    }

    /// Called on exit from any kernel-aware interrupt handler, with the hint
    /// from whatever the handler did.
    ///
    /// Returns `true` if this was the outermost handler and a switch is owed,
    /// in which case the caller must arrange a full trap (on ARM-M, by pending
    /// PendSV).
    pub fn isr_exit(&mut self, hint: NextTask) -> bool {
        uassert!(self.irq.depth > 0);
        self.irq.pending = self.irq.pending.combine(hint);
        self.irq.depth -= 1;
        profiling::event_isr_exit();
        if self.irq.depth > 0 {
            return false;
        }
        let owed = core::mem::replace(&mut self.irq.pending, NextTask::Same);
        if owed == NextTask::Other {
            self.need_resched = true;
            true
        } else {
            false
        }
    }

    /// Runs the action connected to line `irq`. Called between `isr_enter`
    /// and `isr_exit`.
    ///
    /// A line firing with no action connected is fatal.
    pub fn handle_irq(&mut self, irq: u32) -> NextTask {
        kern_trace!(self, Trace::Irq(irq));
        let Some(&action) = self.irq.actions.get(&irq) else {
            return fail::fatal_error(self, FatalReason::SpuriousIrq(irq), Culprit::Isr);
        };
        let r = match action {
            IsrAction::Give(id) => self.sem_give(id),
            IsrAction::Put(id, word) => self.fifo_put(id, word),
            IsrAction::Call(f, word) => Ok(f(self, word)),
        };
        match r {
            Ok(hint) => hint,
            // A full fifo; the word is lost.
            Err(UserError::Recoverable(_, hint)) => hint,
            // The object was checked at connect time, so it has been
            // replaced under us.
            Err(UserError::Unrecoverable(_)) => fail::fatal_error(
                self,
                FatalReason::KernelOops(irq),
                Culprit::Isr,
            ),
        }
    }
}
