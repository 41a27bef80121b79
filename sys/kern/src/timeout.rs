// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tick processing and thread timeouts.
//!
//! Threads with a deadline are kept on one list sorted by deadline, with ties
//! in arming order. Each tick pops everything that has come due.

use abi::{Errno, ThreadState, WaitReason};

use crate::kernel::{Kernel, NextTask};
use crate::profiling;
use crate::time::Timestamp;
use crate::trace::Trace;

impl Kernel<'_> {
    pub(crate) fn arm_timeout(&mut self, i: usize, ticks: u32) {
        let deadline = self.now.after(ticks);
        self.cancel_timeout(i);
        self.threads[i].deadline = Some(deadline);
        self.timeouts
            .insert_by(self.threads, i, |a, b| a.deadline < b.deadline);
    }

    /// Disarms the timeout of thread `i`, if it has one.
    pub(crate) fn cancel_timeout(&mut self, i: usize) -> bool {
        self.threads[i].deadline = None;
        self.timeouts.remove(self.threads, i)
    }

    /// Earliest armed deadline, for a tickless timer driver.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timeouts
            .head()
            .and_then(|i| self.threads[i].deadline)
    }

    pub fn uptime(&self) -> Timestamp {
        self.now
    }

    /// Advances kernel time by `ticks`, expiring timeouts and charging the
    /// running thread's time slice for each one.
    ///
    /// This is called from the timer interrupt, between `isr_enter` and
    /// `isr_exit`.
    pub fn tick_announce(&mut self, ticks: u32) -> NextTask {
        profiling::event_tick_enter();
        let mut hint = NextTask::Same;
        for _ in 0..ticks {
            self.now.advance();
            hint = hint.combine(self.expire_timeouts());
            hint = hint.combine(self.slice_tick());
        }
        // Catch anything a Deferred wake left waiting.
        if self.preemption_due() {
            hint = NextTask::Other;
        }
        profiling::event_tick_exit();
        hint
    }

    fn expire_timeouts(&mut self) -> NextTask {
        let mut hint = NextTask::Same;
        while let Some(i) = self.timeouts.head() {
            if self.threads[i].deadline.is_some_and(|d| d > self.now) {
                break;
            }
            self.cancel_timeout(i);
            hint = hint.combine(self.expire(i));
        }
        hint
    }

    fn expire(&mut self, i: usize) -> NextTask {
        profiling::event_timeout_expired(i);
        kern_trace!(self, Trace::Timeout { thread: i as u16 });
        match self.threads[i].state {
            ThreadState::Blocked(WaitReason::Sleep) => self.wake(i, 0),
            ThreadState::Blocked(_) => {
                let was = self.threads[i].membership;
                self.detach(i);
                let hint = self.wake(i, Errno::Again.code());
                hint.combine(self.waiter_left(was))
            }
            // Anything that stopped waiting disarmed its timeout on the way.
            _ => NextTask::Same,
        }
    }
}
