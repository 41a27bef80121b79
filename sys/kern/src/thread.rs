// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of threads.
//!
//! A `Thread` is one slot of the kernel's statically-sized thread table. Slots
//! are named from outside by `ThreadId`, which carries a generation number so
//! that an id outliving its thread is detected rather than silently naming the
//! slot's next occupant.
//!
//! This module also holds the thread lifecycle operations: spawn, start,
//! suspend/resume, sleep/wakeup, abort and join.

use abi::{
    Errno, Generation, ObjectId, Priority, ThreadFlags, ThreadId, ThreadState,
    Timeout, UsageError, WaitReason,
};
use kerncore::{Adapter, Link};

use crate::arch::{self, SavedState};
use crate::config::{
    HIGHEST_PRIORITY, IDLE_PRIORITY, MIN_STACK_SIZE, NUM_COOP_PRIORITIES,
};
use crate::err::{ConfigError, UserError};
use crate::fail::{self, Culprit, FatalReason};
use crate::kernel::{Kernel, NextTask, IDLE_INDEX};
use crate::time::Timestamp;
use crate::trace::Trace;
use crate::wait::{Wait, WaitQueue};

/// Signature of a thread body. The three words come from `ThreadSpec::args`.
pub type ThreadEntry = extern "C" fn(u32, u32, u32);

/// Everything needed to create a thread.
pub struct ThreadSpec {
    pub entry: ThreadEntry,
    pub args: [u32; 3],
    pub stack: &'static mut [u8],
    pub priority: Priority,
    pub flags: ThreadFlags,
    /// `NoWait` makes the thread ready at once, `Ticks(n)` after `n` ticks,
    /// and `Forever` leaves it waiting for an explicit start.
    pub delay: Timeout,
}

/// Which scheduler queue, if any, a thread is linked into through its
/// `queue_link`.
///
/// A thread is on at most one queue at a time. The running thread is on none.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Membership {
    #[default]
    Detached,
    Ready,
    Waiting(QueueId),
}

/// Names a wait queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueId {
    /// The waiters of a kernel object.
    Object(ObjectId),
    /// Threads joining the thread in this slot.
    Joiners(usize),
}

/// Mutex re-acquisition owed to a thread that waited on a condition variable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Relock {
    pub mutex: ObjectId,
    /// Recursion depth to restore once the mutex is ours again.
    pub count: u32,
    /// Result of the condition wait, parked here while the thread queues for
    /// the mutex.
    pub code: Option<i32>,
}

/// Bounds of a thread's stack.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StackRegion {
    pub base: usize,
    pub size: usize,
}

impl StackRegion {
    pub fn of(stack: &[u8]) -> Result<Self, ConfigError> {
        let base = stack.as_ptr() as usize;
        if base % arch::STACK_ALIGN != 0 {
            return Err(ConfigError::StackMisaligned);
        }
        if stack.len() < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall);
        }
        Ok(Self {
            base,
            size: stack.len(),
        })
    }

    pub fn top(&self) -> usize {
        self.base + self.size
    }

    /// Checks that a saved stack pointer is inside the stack and clear of the
    /// guard area at its base.
    pub fn holds(&self, sp: usize) -> bool {
        sp >= self.base + arch::STACK_GUARD && sp <= self.top()
    }
}

/// Internal representation of a thread.
#[derive(Debug, Default)]
pub struct Thread {
    /// Saved machine state of the thread.
    pub(crate) save: SavedState,
    /// Priority the thread was created with or last set to.
    pub(crate) base_priority: Priority,
    /// Priority the scheduler uses. Differs from `base_priority` while the
    /// thread holds a mutex wanted by something more important.
    pub(crate) priority: Priority,
    pub(crate) state: ThreadState,
    pub(crate) generation: Generation,
    pub(crate) flags: ThreadFlags,
    pub(crate) membership: Membership,
    pub(crate) queue_link: Link,
    pub(crate) timeout_link: Link,
    /// Set exactly when `timeout_link` is linked.
    pub(crate) deadline: Option<Timestamp>,
    pub(crate) slice_left: u32,
    pub(crate) sched_locks: u32,
    pub(crate) stack: StackRegion,
    pub(crate) relock: Option<Relock>,
    /// Suspended while waiting. The thread stays queued, and when its wait
    /// ends it becomes `Suspended` instead of ready.
    pub(crate) suspended: bool,
    pub(crate) joiners: WaitQueue,
}

impl Thread {
    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn save(&self) -> &SavedState {
        &self.save
    }

    pub fn stack(&self) -> StackRegion {
        self.stack
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn is_suspended(&self) -> bool {
        self.state == ThreadState::Suspended || self.suspended
    }

    pub fn is_essential(&self) -> bool {
        self.flags.contains(ThreadFlags::ESSENTIAL)
    }

    /// Checks whether another thread may take the CPU from this one.
    pub fn is_preemptible(&self) -> bool {
        !self.priority.is_cooperative() && self.sched_locks == 0
    }
}

/// Threads are linked into the ready queue and into wait queues through
/// `queue_link`.
pub struct QueueLink;

impl Adapter for QueueLink {
    type Node = Thread;

    fn link(node: &Thread) -> &Link {
        &node.queue_link
    }

    fn link_mut(node: &mut Thread) -> &mut Link {
        &mut node.queue_link
    }
}

/// Threads with a deadline are linked into the timeout queue through
/// `timeout_link`.
pub struct TimeoutLink;

impl Adapter for TimeoutLink {
    type Node = Thread;

    fn link(node: &Thread) -> &Link {
        &node.timeout_link
    }

    fn link_mut(node: &mut Thread) -> &mut Link {
        &mut node.timeout_link
    }
}

/// Maps a priority to its ready queue level; level 0 is the most important.
pub fn level(p: Priority) -> usize {
    (i16::from(p.0) + NUM_COOP_PRIORITIES as i16) as usize
}

/// Checks that `p` is a priority a thread other than idle may have.
pub fn check_priority(p: Priority) -> Result<(), ConfigError> {
    if HIGHEST_PRIORITY.is_at_least(p) && p.is_more_important_than(IDLE_PRIORITY) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPriority)
    }
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to thread state for the rest of the
/// kernel.
///
/// Syscalls pass up to four argument words and a syscall number. Results go
/// back in up to three words: `ret0` is a signed status (negative `Errno` on
/// failure, otherwise zero or a small count), and `ret1`/`ret2` carry data.
pub trait ArchState: Default {
    fn stack_pointer(&self) -> usize;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u32;

    /// Reads the syscall descriptor (number).
    fn syscall_descriptor(&self) -> u32;

    /// Writes syscall return argument 0.
    fn ret0(&mut self, _: u32);
    /// Writes syscall return argument 1.
    fn ret1(&mut self, _: u32);
    /// Writes syscall return argument 2.
    fn ret2(&mut self, _: u32);

    /// Reads back return argument 0, as a thread would see it.
    fn read_ret0(&self) -> u32;
    /// Reads back return argument 1.
    fn read_ret1(&self) -> u32;

    /// Interrupt lock state the thread resumes with.
    fn lock_state(&self) -> u32;
    fn set_lock_state(&mut self, _: u32);

    /// Interprets arguments as for the thread-control syscalls.
    fn as_thread_args(&self) -> ThreadArgs {
        ThreadArgs {
            thread: ThreadId(self.arg0() as u16),
            timeout: Timeout::from_raw(self.arg1()),
            priority: Priority(self.arg1() as i8),
        }
    }

    /// Interprets arguments as for the semaphore, mutex, fifo and wait queue
    /// syscalls.
    fn as_object_args(&self) -> ObjectArgs {
        ObjectArgs {
            object: ObjectId(self.arg0() as u16),
            timeout: Timeout::from_raw(self.arg1()),
            value: self.arg1(),
        }
    }

    fn as_cond_wait_args(&self) -> CondWaitArgs {
        CondWaitArgs {
            cond: ObjectId(self.arg0() as u16),
            mutex: ObjectId(self.arg1() as u16),
            timeout: Timeout::from_raw(self.arg2()),
        }
    }

    fn as_irq_args(&self) -> IrqArgs {
        IrqArgs {
            irq: self.arg0(),
            op: self.arg1(),
            value: self.arg2(),
        }
    }

    /// Sets the status word a thread will see when its syscall returns.
    fn set_result(&mut self, code: i32) {
        self.ret0(code as u32);
    }

    /// Sets the data word a thread will see when its syscall returns.
    fn set_data(&mut self, word: u32) {
        self.ret1(word);
    }

    fn set_uptime(&mut self, now: Timestamp) {
        let [lo, hi]: [u32; 2] = now.into();
        self.ret1(lo);
        self.ret2(hi);
    }
}

/// Decoded arguments for thread-control syscalls.
#[derive(Copy, Clone, Debug)]
pub struct ThreadArgs {
    pub thread: ThreadId,
    pub timeout: Timeout,
    pub priority: Priority,
}

/// Decoded arguments for object syscalls. `timeout` and `value` are two views
/// of the same register.
#[derive(Copy, Clone, Debug)]
pub struct ObjectArgs {
    pub object: ObjectId,
    pub timeout: Timeout,
    pub value: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct CondWaitArgs {
    pub cond: ObjectId,
    pub mutex: ObjectId,
    pub timeout: Timeout,
}

#[derive(Copy, Clone, Debug)]
pub struct IrqArgs {
    pub irq: u32,
    pub op: u32,
    /// Operand for ops that take one.
    pub value: u32,
}

impl Kernel<'_> {
    /// Creates a thread in a free slot.
    ///
    /// A slot is free once its thread is dead and switched away from.
    pub fn spawn(
        &mut self,
        spec: ThreadSpec,
    ) -> Result<(ThreadId, NextTask), ConfigError> {
        let cur = self.current;
        let slot = self
            .threads
            .iter()
            .enumerate()
            .position(|(i, t)| t.state == ThreadState::Dead && i != cur)
            .ok_or(ConfigError::NoFreeSlot)?;
        let hint = self.spawn_at(slot, spec)?;
        Ok((self.thread_id(slot), hint))
    }

    pub(crate) fn spawn_at(
        &mut self,
        slot: usize,
        spec: ThreadSpec,
    ) -> Result<NextTask, ConfigError> {
        if slot == IDLE_INDEX {
            if spec.priority != IDLE_PRIORITY {
                return Err(ConfigError::InvalidPriority);
            }
        } else {
            check_priority(spec.priority)?;
        }
        let stack = StackRegion::of(spec.stack)?;

        let t = &mut self.threads[slot];
        let generation = t.generation.next();
        *t = Thread {
            generation,
            ..Thread::default()
        };
        arch::reinitialize(
            &mut t.save,
            spec.stack,
            spec.entry,
            spec.args,
            spec.flags,
        )?;
        t.stack = stack;
        t.base_priority = spec.priority;
        t.priority = spec.priority;
        t.flags = spec.flags;

        Ok(match spec.delay {
            Timeout::NoWait | Timeout::Ticks(0) => self.make_ready(slot),
            Timeout::Ticks(n) => {
                self.threads[slot].state = ThreadState::Blocked(WaitReason::Sleep);
                self.arm_timeout(slot, n);
                NextTask::Same
            }
            Timeout::Forever => {
                self.threads[slot].state = ThreadState::Prestart;
                NextTask::Same
            }
        })
    }

    /// Releases a thread created with a `Forever` start delay. Starting any
    /// other thread does nothing.
    pub fn start_thread(&mut self, tid: ThreadId) -> Result<NextTask, UserError> {
        let i = self.lookup(tid)?;
        if self.threads[i].state == ThreadState::Prestart {
            Ok(self.make_ready(i))
        } else {
            Ok(NextTask::Same)
        }
    }

    /// Resolves `tid` to a slot index, checking only that the slot exists and
    /// still holds the same incarnation.
    pub(crate) fn slot_of(&self, tid: ThreadId) -> Result<usize, UserError> {
        let i = tid.index();
        let t = self
            .threads
            .get(i)
            .ok_or(UsageError::ThreadOutOfRange)?;
        if t.generation != tid.generation() {
            return Err(Errno::NoThread.into());
        }
        Ok(i)
    }

    /// Resolves `tid` to the slot of a thread that has not exited.
    pub(crate) fn lookup(&self, tid: ThreadId) -> Result<usize, UserError> {
        let i = self.slot_of(tid)?;
        if self.threads[i].state == ThreadState::Dead {
            return Err(Errno::NoThread.into());
        }
        Ok(i)
    }

    /// Puts the calling thread to sleep.
    ///
    /// `NoWait` just yields. A thread sleeping for ticks wakes with zero when
    /// they elapse, or with the ticks it had left if `wakeup` cuts the sleep
    /// short. `Forever` suspends the caller.
    pub fn sleep(&mut self, timeout: Timeout) -> Result<Wait<i32>, UserError> {
        if self.in_isr() {
            return Err(Errno::Inval.into());
        }
        match timeout {
            Timeout::NoWait | Timeout::Ticks(0) => {
                let _ = self.yield_now();
                Ok(Wait::Done(0))
            }
            Timeout::Ticks(n) => {
                self.check_may_block()?;
                self.block_current(WaitReason::Sleep, Timeout::Ticks(n));
                Ok(Wait::Blocked)
            }
            Timeout::Forever => {
                self.check_may_block()?;
                let cur = self.current;
                self.threads[cur].state = ThreadState::Suspended;
                let _ = crate::switch::request_switch(self);
                self.threads[cur].save.set_result(0);
                Ok(Wait::Blocked)
            }
        }
    }

    /// Ends the sleep of `tid` early. Threads that aren't sleeping are left
    /// alone.
    pub fn wakeup(&mut self, tid: ThreadId) -> Result<NextTask, UserError> {
        let i = self.lookup(tid)?;
        if self.threads[i].state != ThreadState::Blocked(WaitReason::Sleep) {
            return Ok(NextTask::Same);
        }
        let left = self.threads[i]
            .deadline
            .map_or(0, |d| self.now.ticks_until(d));
        Ok(self.wake(i, left.min(i32::MAX as u64) as i32))
    }

    /// Stops `tid` from running until `resume`.
    ///
    /// A thread suspended while waiting on a queue loses its timeout but
    /// keeps its place, so whatever it waits for is still handed to it; it
    /// just doesn't run until resumed. A sleeping thread's sleep ends, with
    /// the ticks it had left as its result.
    pub fn suspend(&mut self, tid: ThreadId) -> Result<NextTask, UserError> {
        let i = self.lookup(tid)?;
        if i == IDLE_INDEX {
            return Err(Errno::Perm.into());
        }
        let hint = match self.threads[i].state {
            ThreadState::Prestart
            | ThreadState::Suspended
            | ThreadState::Dead => return Ok(NextTask::Same),
            ThreadState::Running => NextTask::Other,
            ThreadState::Ready => {
                self.detach(i);
                NextTask::Same
            }
            ThreadState::Blocked(_) => {
                if let Membership::Waiting(_) = self.threads[i].membership {
                    self.cancel_timeout(i);
                    self.threads[i].suspended = true;
                    kern_trace!(self, Trace::Suspend { thread: i as u16 });
                    return Ok(NextTask::Same);
                }
                let left = self.threads[i]
                    .deadline
                    .map_or(0, |d| self.now.ticks_until(d));
                self.cancel_timeout(i);
                self.threads[i]
                    .save
                    .set_result(left.min(i32::MAX as u64) as i32);
                NextTask::Same
            }
        };
        self.threads[i].state = ThreadState::Suspended;
        kern_trace!(self, Trace::Suspend { thread: i as u16 });
        Ok(hint)
    }

    pub fn resume(&mut self, tid: ThreadId) -> Result<NextTask, UserError> {
        let i = self.lookup(tid)?;
        match self.threads[i].state {
            ThreadState::Suspended => Ok(self.make_ready(i)),
            ThreadState::Blocked(_) => {
                // Still waiting; it runs when the wait ends.
                self.threads[i].suspended = false;
                Ok(NextTask::Same)
            }
            _ => Ok(NextTask::Same),
        }
    }

    /// Terminates `tid`, waking everything joined to it.
    ///
    /// Aborting an essential thread is fatal to the system. Mutexes the
    /// thread held stay locked.
    pub fn abort(&mut self, tid: ThreadId) -> Result<NextTask, UserError> {
        let i = self.slot_of(tid)?;
        if i == IDLE_INDEX {
            return Err(Errno::Perm.into());
        }
        if self.threads[i].state == ThreadState::Dead {
            return Ok(NextTask::Same);
        }
        if self.threads[i].is_essential() {
            return Ok(fail::fatal_error(
                self,
                FatalReason::EssentialExit,
                Culprit::Thread(i),
            ));
        }
        Ok(self.abort_index(i))
    }

    /// Terminates the calling thread.
    pub fn exit(&mut self) -> Result<NextTask, UserError> {
        let me = self.current_id();
        self.abort(me)
    }

    pub(crate) fn abort_index(&mut self, i: usize) -> NextTask {
        if self.threads[i].state == ThreadState::Dead {
            return NextTask::Same;
        }
        let was = self.threads[i].membership;
        self.detach(i);
        self.cancel_timeout(i);
        let t = &mut self.threads[i];
        t.relock = None;
        t.suspended = false;
        t.sched_locks = 0;
        t.state = ThreadState::Dead;
        kern_trace!(self, Trace::Abort { thread: i as u16 });

        let mut hint = self.waiter_left(was);
        let (_, woke) = self.wake_all(QueueId::Joiners(i), 0);
        hint = hint.combine(woke);
        if i == self.current {
            hint = NextTask::Other;
        }
        hint
    }

    /// Waits for `tid` to exit.
    ///
    /// Joining a thread that has already exited (or whose id is stale)
    /// succeeds at once. Joining yourself, or a thread that is joining you,
    /// fails with `Deadlock`.
    pub fn join(
        &mut self,
        tid: ThreadId,
        timeout: Timeout,
    ) -> Result<Wait<()>, UserError> {
        let i = tid.index();
        let Some(t) = self.threads.get(i) else {
            return Err(UsageError::ThreadOutOfRange.into());
        };
        if t.generation != tid.generation() || t.state == ThreadState::Dead {
            return Ok(Wait::Done(()));
        }
        if self.in_isr() {
            return Err(if timeout.is_no_wait() {
                Errno::Busy
            } else {
                Errno::Inval
            }
            .into());
        }
        let me = self.current_id();
        if i == self.current
            || t.state == ThreadState::Blocked(WaitReason::Join(me))
        {
            return Err(Errno::Deadlock.into());
        }
        if timeout.is_no_wait() {
            return Err(Errno::Busy.into());
        }
        self.check_may_block()?;
        self.pend_current(QueueId::Joiners(i), timeout);
        Ok(Wait::Blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use abi::Sysnum;

    #[test]
    fn level_maps_bands_in_order() {
        assert_eq!(level(HIGHEST_PRIORITY), 0);
        assert_eq!(level(Priority(0)), NUM_COOP_PRIORITIES);
        assert_eq!(level(IDLE_PRIORITY), crate::config::PRIORITY_LEVELS - 1);
    }

    #[test]
    fn idle_priority_is_reserved() {
        assert_eq!(check_priority(Priority(3)), Ok(()));
        assert_eq!(check_priority(HIGHEST_PRIORITY), Ok(()));
        assert_eq!(
            check_priority(IDLE_PRIORITY),
            Err(ConfigError::InvalidPriority)
        );
    }

    #[test]
    fn priority_range_covers_both_bands() {
        for p in [-16, -1, 0, 13] {
            assert_eq!(check_priority(Priority(p)), Ok(()), "priority {p}");
        }
        for p in [-17, 14] {
            assert_eq!(
                check_priority(Priority(p)),
                Err(ConfigError::InvalidPriority),
                "priority {p}"
            );
        }
    }

    #[test]
    fn spawn_rejects_bad_stacks() {
        let mut k = kernel(4);
        let err = k
            .spawn(ThreadSpec {
                stack: stack_words(8),
                ..spec(3)
            })
            .unwrap_err();
        assert_eq!(err, ConfigError::StackTooSmall);

        let big = stack();
        let err = k
            .spawn(ThreadSpec {
                stack: &mut big[4..],
                ..spec(3)
            })
            .unwrap_err();
        assert_eq!(err, ConfigError::StackMisaligned);
    }

    #[test]
    fn spawn_runs_out_of_slots() {
        let mut k = kernel(3);
        let _ = k.spawn(spec(3)).unwrap();
        let _ = k.spawn(spec(3)).unwrap();
        assert_eq!(k.spawn(spec(3)).unwrap_err(), ConfigError::NoFreeSlot);
        assert_eq!(Errno::from(ConfigError::NoFreeSlot), Errno::NoMem);
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut k = kernel(3);
        let (a, _) = k.spawn(spec(3)).unwrap();
        let _ = k.abort(a).unwrap();
        let (b, _) = k.spawn(spec(3)).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(k.resume(a), Err(Errno::NoThread.into()));
    }

    #[test]
    fn delayed_start_waits_for_ticks() {
        let mut k = kernel(3);
        let (t, _) = k
            .spawn(ThreadSpec {
                delay: Timeout::Ticks(5),
                ..spec(3)
            })
            .unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current_index(), IDLE_INDEX);
        sim.ticks(4);
        assert_eq!(sim.current_index(), IDLE_INDEX);
        sim.tick();
        assert_eq!(sim.current(), t);
    }

    #[test]
    fn start_releases_prestart_thread_and_preempts() {
        let mut k = kernel(4);
        let (low, _) = k.spawn(spec(10)).unwrap();
        let (high, _) = k
            .spawn(ThreadSpec {
                delay: Timeout::Forever,
                ..spec(1)
            })
            .unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current(), low);
        assert_eq!(sim.kernel.thread(high).state(), ThreadState::Prestart);

        // The more important thread takes over as the syscall returns.
        assert_eq!(sim.syscall(Sysnum::Start, [high.0.into(), 0, 0, 0]), None);
        assert_eq!(sim.current(), high);

        // Once it sleeps, the starter sees its syscall succeed.
        assert_eq!(sim.syscall(Sysnum::Sleep, [5, 0, 0, 0]), None);
        assert_eq!(sim.current(), low);
        assert_eq!(sim.result(), 0);
    }

    #[test]
    fn wakeup_reports_ticks_left() {
        let mut k = kernel(4);
        let (a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.syscall(Sysnum::Sleep, [50, 0, 0, 0]), None);
        assert_eq!(sim.current(), b);
        sim.ticks(20);
        assert_eq!(sim.syscall(Sysnum::Wakeup, [a.0.into(), 0, 0, 0]), None);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), 30);
    }

    #[test]
    fn sleep_expires_with_zero() {
        let mut k = kernel(3);
        let (a, _) = k.spawn(spec(3)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.syscall(Sysnum::Sleep, [3, 0, 0, 0]), None);
        sim.ticks(3);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), 0);
        assert_eq!(u64::from(sim.kernel.uptime()), 3);
    }

    #[test]
    fn suspended_waiter_is_still_handed_the_object() {
        let mut k = kernel(4);
        let sem = k.create(crate::sync::Object::semaphore(0, 1)).unwrap();
        let (a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(
            sim.syscall(Sysnum::SemTake, [sem.0.into(), 100, 0, 0]),
            None
        );
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::Suspend, [a.0.into(), 0, 0, 0]), Some(0));
        assert!(sim.kernel.thread(a).is_suspended());
        assert_eq!(sim.kernel.thread(a).deadline(), None);

        // Its timeout no longer fires, but the give still goes to it.
        sim.ticks(200);
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::SemGive, [sem.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.current(), b);
        assert_eq!(sim.kernel.sem_count(sem), Ok(0));
        assert_eq!(sim.kernel.thread(a).state(), ThreadState::Suspended);

        assert_eq!(sim.syscall(Sysnum::Resume, [a.0.into(), 0, 0, 0]), None);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), 0);
        sim.kernel.check_invariants();
    }

    #[test]
    fn resumed_waiter_keeps_waiting() {
        let mut k = kernel(4);
        let sem = k.create(crate::sync::Object::semaphore(0, 1)).unwrap();
        let (a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(
            sim.syscall(Sysnum::SemTake, [sem.0.into(), u32::MAX, 0, 0]),
            None
        );
        assert_eq!(sim.syscall(Sysnum::Suspend, [a.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.syscall(Sysnum::Resume, [a.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.current(), b);
        assert!(!sim.kernel.thread(a).is_suspended());
        assert!(matches!(sim.kernel.thread(a).state(), ThreadState::Blocked(_)));

        assert_eq!(sim.syscall(Sysnum::SemGive, [sem.0.into(), 0, 0, 0]), None);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), 0);
        sim.kernel.check_invariants();
    }

    #[test]
    fn suspending_a_sleeper_ends_its_sleep() {
        let mut k = kernel(4);
        let (a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.syscall(Sysnum::Sleep, [50, 0, 0, 0]), None);
        sim.ticks(10);
        assert_eq!(sim.syscall(Sysnum::Suspend, [a.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.kernel.thread(a).state(), ThreadState::Suspended);
        sim.ticks(100);
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::Resume, [a.0.into(), 0, 0, 0]), None);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), 40);
    }

    #[test]
    fn suspending_idle_is_refused() {
        let k = kernel(3);
        let mut sim = Sim::start(k);
        let idle = sim.kernel.thread_id(IDLE_INDEX);
        assert_eq!(
            sim.kernel.suspend(idle),
            Err(UserError::Recoverable(Errno::Perm, NextTask::Same))
        );
    }

    #[test]
    fn join_codes() {
        let mut k = kernel(5);
        let (a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(4)).unwrap();
        let (c, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current(), a);

        // Self-join deadlocks, NoWait on a live thread is busy, a short wait
        // times out.
        assert_eq!(
            sim.syscall(Sysnum::Join, [a.0.into(), u32::MAX, 0, 0]),
            Some(Errno::Deadlock.code())
        );
        assert_eq!(
            sim.syscall(Sysnum::Join, [b.0.into(), 0, 0, 0]),
            Some(Errno::Busy.code())
        );
        assert_eq!(sim.syscall(Sysnum::Join, [c.0.into(), 2, 0, 0]), None);
        assert_eq!(sim.current(), b);

        // b joins a, which is itself joining c.
        assert_eq!(sim.syscall(Sysnum::Join, [a.0.into(), u32::MAX, 0, 0]), None);
        assert_eq!(sim.current(), c);
        sim.ticks(2);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), Errno::Again.code());

        // b is joining a, so a joining b would deadlock.
        assert_eq!(
            sim.syscall(Sysnum::Join, [b.0.into(), u32::MAX, 0, 0]),
            Some(Errno::Deadlock.code())
        );

        // a exits; b sees success.
        assert_eq!(sim.syscall(Sysnum::Exit, [0; 4]), None);
        assert_eq!(sim.current(), b);
        assert_eq!(sim.result(), 0);

        // Joining a dead thread succeeds at once.
        assert_eq!(
            sim.syscall(Sysnum::Join, [a.0.into(), u32::MAX, 0, 0]),
            Some(0)
        );
        sim.kernel.check_invariants();
    }

    #[test]
    fn abort_of_blocked_thread_unlinks_everything() {
        let mut k = kernel(4);
        let sem = k.create(crate::sync::Object::semaphore(0, 1)).unwrap();
        let (a, _) = k.spawn(spec(3)).unwrap();
        let (b, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.syscall(Sysnum::SemTake, [sem.0.into(), 10, 0, 0]), None);
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::Abort, [a.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.kernel.thread(a).state(), ThreadState::Dead);
        sim.ticks(20);
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::Abort, [a.0.into(), 0, 0, 0]), Some(0));
        sim.kernel.check_invariants();
    }

    #[test]
    #[should_panic]
    fn essential_exit_is_fatal() {
        let mut k = kernel(3);
        let _ = k
            .spawn(ThreadSpec {
                flags: ThreadFlags::ESSENTIAL,
                ..spec(3)
            })
            .unwrap();
        let mut sim = Sim::start(k);
        sim.syscall(Sysnum::Exit, [0; 4]);
    }
}
