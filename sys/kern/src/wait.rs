// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait queues and the block/wake primitives built on them.
//!
//! Every blocking operation in the kernel goes through `pend_current` (or
//! `block_current` for waits with no queue), and every wakeup through `wake`.
//! Keeping this in one place is what lets a timeout, a signal and an abort
//! race each other without a thread being woken twice: whichever
//! gets there first detaches the thread, and the losers find it detached.

use abi::{Errno, ObjectId, ThreadId, ThreadState, Timeout, WaitReason};
use kerncore::List;
use serde::Deserialize;

use crate::arch::ArchState;
use crate::err::UserError;
use crate::kernel::{Kernel, NextTask, IDLE_INDEX};
use crate::sync::Class;
use crate::thread::{level, Membership, QueueId, QueueLink, Thread};
use crate::trace::Trace;

/// Outcome of an operation that may block the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Wait<T> {
    /// Completed without blocking.
    Done(T),
    /// The caller is now blocked; its result will be written when it wakes.
    Blocked,
}

/// Order in which a wait queue releases its waiters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub enum WaitOrder {
    /// Most important first, and first-come first-served among equals.
    #[default]
    Priority,
    /// Strictly first-come first-served.
    Fifo,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct WaitQueue {
    list: List<QueueLink>,
    order: WaitOrder,
}

impl WaitQueue {
    pub const fn new(order: WaitOrder) -> Self {
        Self {
            list: List::new(),
            order,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// The waiter that would be released next.
    pub fn head(&self) -> Option<usize> {
        self.list.head()
    }

    pub fn order(&self) -> WaitOrder {
        self.order
    }

    pub fn iter<'t>(
        &self,
        threads: &'t [Thread],
    ) -> impl Iterator<Item = usize> + 't {
        self.list.iter(threads)
    }

    pub(crate) fn insert(&mut self, threads: &mut [Thread], i: usize) {
        match self.order {
            WaitOrder::Priority => self.list.insert_by(threads, i, |a, b| {
                a.priority.is_more_important_than(b.priority)
            }),
            WaitOrder::Fifo => self.list.push_back(threads, i),
        }
    }

    pub(crate) fn remove(&mut self, threads: &mut [Thread], i: usize) -> bool {
        self.list.remove(threads, i)
    }

    pub(crate) fn pop(&mut self, threads: &mut [Thread]) -> Option<usize> {
        self.list.pop_front(threads)
    }
}

impl Kernel<'_> {
    /// Runs `body` on the wait queue named by `q`.
    ///
    /// Queues are small `Copy` values, so this copies the queue out of its
    /// owner, lets `body` work on it alongside the thread table, and writes
    /// it back.
    pub(crate) fn with_queue<R>(
        &mut self,
        q: QueueId,
        body: impl FnOnce(&mut WaitQueue, &mut [Thread]) -> R,
    ) -> R {
        let mut queue = match q {
            QueueId::Object(id) => self.objects[id.index()].waiters,
            QueueId::Joiners(t) => self.threads[t].joiners,
        };
        let r = body(&mut queue, self.threads);
        match q {
            QueueId::Object(id) => self.objects[id.index()].waiters = queue,
            QueueId::Joiners(t) => self.threads[t].joiners = queue,
        }
        r
    }

    pub(crate) fn queue(&self, q: QueueId) -> &WaitQueue {
        match q {
            QueueId::Object(id) => &self.objects[id.index()].waiters,
            QueueId::Joiners(t) => &self.threads[t].joiners,
        }
    }

    /// Refuses to block from interrupt context or on the idle thread.
    pub(crate) fn check_may_block(&self) -> Result<(), UserError> {
        if self.in_isr() {
            return Err(Errno::Inval.into());
        }
        if self.current == IDLE_INDEX {
            return Err(Errno::Perm.into());
        }
        Ok(())
    }

    /// The common checks for an operation that found its resource
    /// unavailable: `NoWait` reports `Busy`, and anything else must be allowed
    /// to block.
    pub(crate) fn check_blocking(
        &self,
        timeout: Timeout,
    ) -> Result<(), UserError> {
        if timeout.is_no_wait() {
            return Err(Errno::Busy.into());
        }
        self.check_may_block()
    }

    /// Marks the calling thread blocked for `reason` and arranges the switch
    /// away from it. Its result defaults to `Again`, which is what a timeout
    /// delivers.
    pub(crate) fn block_current(&mut self, reason: WaitReason, timeout: Timeout) {
        let cur = self.current;
        self.threads[cur].state = ThreadState::Blocked(reason);
        let _ = crate::switch::request_switch(self);
        if let Timeout::Ticks(n) = timeout {
            self.arm_timeout(cur, n);
        }
        kern_trace!(
            self,
            Trace::Block {
                thread: cur as u16,
                reason
            }
        );
    }

    /// Queues the calling thread on `q` and blocks it.
    pub(crate) fn pend_current(&mut self, q: QueueId, timeout: Timeout) {
        let cur = self.current;
        uassert!(self.threads[cur].membership == Membership::Detached);
        self.with_queue(q, |queue, threads| queue.insert(threads, cur));
        self.threads[cur].membership = Membership::Waiting(q);
        let reason = match q {
            QueueId::Object(id) => WaitReason::Object(id),
            QueueId::Joiners(t) => WaitReason::Join(self.thread_id(t)),
        };
        self.block_current(reason, timeout);
    }

    /// Takes `i` off whichever queue it is on. Returns `false` if it was on
    /// none.
    pub(crate) fn detach(&mut self, i: usize) -> bool {
        let removed = match self.threads[i].membership {
            Membership::Detached => false,
            Membership::Ready => {
                let lvl = level(self.threads[i].priority);
                self.ready.remove(self.threads, lvl, i)
            }
            Membership::Waiting(q) => {
                self.with_queue(q, |queue, threads| queue.remove(threads, i))
            }
        };
        self.threads[i].membership = Membership::Detached;
        removed
    }

    /// Puts a detached, non-running thread on the ready queue.
    pub(crate) fn make_ready(&mut self, i: usize) -> NextTask {
        uassert!(self.threads[i].membership == Membership::Detached);
        let t = &mut self.threads[i];
        t.state = ThreadState::Ready;
        t.membership = Membership::Ready;
        let lvl = level(t.priority);
        self.ready.push_back(self.threads, lvl, i);
        self.preempt_hint(i)
    }

    /// Finishes the wait of detached thread `i`, delivering `code` as its
    /// result.
    ///
    /// A thread that was waiting on a condition variable first has to get its
    /// mutex back; if the mutex is taken it goes on to wait for that instead,
    /// and `code` is held until it gets it.
    pub(crate) fn wake(&mut self, i: usize, code: i32) -> NextTask {
        self.cancel_timeout(i);
        kern_trace!(
            self,
            Trace::Wake {
                thread: i as u16,
                code
            }
        );
        if let Some(r) = self.threads[i].relock.take() {
            return self.relock(i, r, code);
        }
        self.threads[i].save.set_result(code);
        self.end_wait(i)
    }

    /// Lets detached thread `i` run again after its wait, unless it was
    /// suspended meanwhile.
    pub(crate) fn end_wait(&mut self, i: usize) -> NextTask {
        let t = &mut self.threads[i];
        if core::mem::take(&mut t.suspended) {
            t.state = ThreadState::Suspended;
            NextTask::Same
        } else {
            self.make_ready(i)
        }
    }

    /// Unlinks the next waiter from `q` without waking it.
    pub(crate) fn pop_waiter(&mut self, q: QueueId) -> Option<usize> {
        let i = self.with_queue(q, |queue, threads| queue.pop(threads))?;
        self.threads[i].membership = Membership::Detached;
        Some(i)
    }

    pub(crate) fn wake_one(
        &mut self,
        q: QueueId,
        code: i32,
    ) -> Option<(usize, NextTask)> {
        let i = self.pop_waiter(q)?;
        Some((i, self.wake(i, code)))
    }

    /// Wakes every waiter on `q`, returning how many there were.
    pub(crate) fn wake_all(&mut self, q: QueueId, code: i32) -> (usize, NextTask) {
        let mut n = 0;
        let mut hint = NextTask::Same;
        while let Some((_, h)) = self.wake_one(q, code) {
            n += 1;
            hint = hint.combine(h);
        }
        (n, hint)
    }

    /// Blocks the caller on a generic wait queue object.
    pub fn wait_enqueue(
        &mut self,
        id: ObjectId,
        timeout: Timeout,
    ) -> Result<Wait<()>, UserError> {
        self.object(id, Class::WaitQueue)?;
        self.check_blocking(timeout)?;
        self.pend_current(QueueId::Object(id), timeout);
        Ok(Wait::Blocked)
    }

    /// Releases the next waiter of a wait queue object with result `code`.
    pub fn wait_dequeue_one(
        &mut self,
        id: ObjectId,
        code: i32,
    ) -> Result<(Option<ThreadId>, NextTask), UserError> {
        self.object(id, Class::WaitQueue)?;
        Ok(match self.wake_one(QueueId::Object(id), code) {
            Some((i, hint)) => (Some(self.thread_id(i)), hint),
            None => (None, NextTask::Same),
        })
    }

    /// Releases every waiter of a wait queue object with result `code`.
    pub fn wait_dequeue_all(
        &mut self,
        id: ObjectId,
        code: i32,
    ) -> Result<(usize, NextTask), UserError> {
        self.object(id, Class::WaitQueue)?;
        Ok(self.wake_all(QueueId::Object(id), code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Object;
    use crate::testutil::*;
    use abi::Sysnum;

    #[test]
    fn priority_order_is_fifo_among_equals() {
        let mut k = kernel(6);
        let q = k.create(Object::wait_queue(WaitOrder::Priority)).unwrap();
        let (a, _) = k.spawn(spec(5)).unwrap();
        let (b, _) = k.spawn(spec(5)).unwrap();
        let (c, _) = k.spawn(spec(2)).unwrap();
        let (d, _) = k.spawn(spec(9)).unwrap();
        let mut sim = Sim::start(k);

        // c, a, b block in that order, then d runs.
        for expected in [c, a, b] {
            assert_eq!(sim.current(), expected);
            assert_eq!(
                sim.syscall(Sysnum::WaitqPend, [q.0.into(), u32::MAX, 0, 0]),
                None
            );
        }
        assert_eq!(sim.current(), d);

        let queue = sim.kernel.queue(QueueId::Object(q));
        let order: Vec<_> = queue
            .iter(sim.kernel.threads())
            .map(|i| sim.kernel.thread_id(i))
            .collect();
        assert_eq!(order, [c, a, b]);
    }

    #[test]
    fn fifo_order_ignores_priority() {
        let mut k = kernel(4);
        let q = k.create(Object::wait_queue(WaitOrder::Fifo)).unwrap();
        let (a, _) = k.spawn(spec(5)).unwrap();
        let (b, _) = k.spawn(spec(8)).unwrap();
        let (c, _) = k.spawn(spec(9)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current(), a);
        // a sleeps so b can queue first.
        assert_eq!(sim.syscall(Sysnum::Sleep, [1, 0, 0, 0]), None);
        assert_eq!(
            sim.syscall(Sysnum::WaitqPend, [q.0.into(), u32::MAX, 0, 0]),
            None
        );
        sim.tick();
        assert_eq!(sim.current(), a);
        assert_eq!(
            sim.syscall(Sysnum::WaitqPend, [q.0.into(), u32::MAX, 0, 0]),
            None
        );
        assert_eq!(sim.current(), c);

        assert_eq!(
            sim.syscall(Sysnum::WaitqWakeOne, [q.0.into(), 7, 0, 0]),
            None
        );
        assert_eq!(sim.current(), b);
        assert_eq!(sim.result(), 7);
    }

    #[test]
    fn wake_all_reports_count_and_code() {
        let mut k = kernel(5);
        let q = k.create(Object::wait_queue(WaitOrder::Priority)).unwrap();
        let (a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(4)).unwrap();
        let (c, _) = k.spawn(spec(9)).unwrap();
        let mut sim = Sim::start(k);
        for _ in 0..2 {
            assert_eq!(
                sim.syscall(Sysnum::WaitqPend, [q.0.into(), u32::MAX, 0, 0]),
                None
            );
        }
        assert_eq!(sim.current(), c);
        let code = Errno::Canceled.code() as u32;
        assert_eq!(
            sim.syscall(Sysnum::WaitqWakeAll, [q.0.into(), code, 0, 0]),
            None
        );
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), Errno::Canceled.code());
        assert_eq!(sim.kernel.thread(b).state(), ThreadState::Ready);
        sim.kernel.check_invariants();
    }

    #[test]
    fn no_wait_on_queue_object_is_busy() {
        let mut k = kernel(3);
        let q = k.create(Object::wait_queue(WaitOrder::Fifo)).unwrap();
        let _ = k.spawn(spec(3)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(
            sim.syscall(Sysnum::WaitqPend, [q.0.into(), 0, 0, 0]),
            Some(Errno::Busy.code())
        );
    }

    #[test]
    fn blocking_from_isr_is_invalid() {
        let mut k = kernel(3);
        let q = k.create(Object::wait_queue(WaitOrder::Fifo)).unwrap();
        let _ = k.spawn(spec(3)).unwrap();
        let mut sim = Sim::start(k);
        sim.enter_isr();
        assert_eq!(
            sim.kernel.wait_enqueue(q, Timeout::Forever),
            Err(Errno::Inval.into())
        );
        sim.exit_isr(NextTask::Same);
    }
}
