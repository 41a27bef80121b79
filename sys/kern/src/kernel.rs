// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel state aggregate.

use abi::{Priority, ThreadFlags, ThreadId, Timeout};
use kerncore::{List, ReadyQueue};

use crate::arch;
use crate::config::{SchedConfig, IDLE_PRIORITY, PRIORITY_LEVELS};
use crate::err::ConfigError;
use crate::irq::IrqState;
use crate::sync::Object;
use crate::thread::{QueueLink, Thread, ThreadSpec, TimeoutLink};
use crate::time::Timestamp;
use crate::trace::TraceBuf;

/// Slot of the idle thread, which exists from `Kernel::new` on and never
/// blocks.
pub const IDLE_INDEX: usize = 0;

/// Return value for operations that can have scheduling implications. This is
/// marked `must_use` because forgetting to actually update the scheduler after
/// performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever thread we were just running.
    Same,
    /// We need to switch threads, but this routine has not concluded which
    /// one should now run. The scheduler needs to figure it out.
    Other,
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*; // shorthand for patterns

        match (self, other) {
            (Other, _) | (_, Other) => Other,
            (Same, Same) => Same,
        }
    }
}

/// All scheduler state: the thread and object tables and the queues threaded
/// through them.
///
/// Every kernel operation takes `&mut Kernel`, which is what serializes them.
/// On hardware, that exclusive reference is handed out by
/// `startup::with_kernel` with interrupts masked at the kernel lock level.
pub struct Kernel<'a> {
    pub(crate) threads: &'a mut [Thread],
    pub(crate) objects: &'a mut [Object],
    pub(crate) ready: ReadyQueue<QueueLink, PRIORITY_LEVELS>,
    pub(crate) timeouts: List<TimeoutLink>,
    /// Index of the thread whose state is `Running`, or which was running
    /// when it last blocked.
    pub(crate) current: usize,
    /// Set by operations that must switch away from the current thread
    /// regardless of the hint they return.
    pub(crate) need_resched: bool,
    /// Send the running thread to the back of its level at the next pick.
    pub(crate) rotate_current: bool,
    pub(crate) now: Timestamp,
    pub(crate) config: SchedConfig,
    pub(crate) irq: IrqState,
    pub(crate) trace: TraceBuf,
}

impl<'a> Kernel<'a> {
    /// Builds a kernel over the given tables and creates the idle thread in
    /// slot `IDLE_INDEX`, running on `idle_stack`.
    ///
    /// Every thread slot is reset; objects are left as the caller made them,
    /// so a board can hand over a table with its objects already in place.
    pub fn new(
        threads: &'a mut [Thread],
        objects: &'a mut [Object],
        idle_stack: &'static mut [u8],
        config: SchedConfig,
    ) -> Result<Self, ConfigError> {
        if threads.is_empty()
            || threads.len() > usize::from(ThreadId::INDEX_MASK) + 1
            || objects.len() > usize::from(u16::MAX)
        {
            return Err(ConfigError::BadTableSize);
        }
        if let Some(ts) = config.time_slice {
            if ts.ticks == 0 {
                return Err(ConfigError::InvalidTimeSlice);
            }
        }
        for t in threads.iter_mut() {
            *t = Thread::default();
        }

        let mut k = Kernel {
            threads,
            objects,
            ready: ReadyQueue::new(),
            timeouts: List::new(),
            current: IDLE_INDEX,
            need_resched: false,
            rotate_current: false,
            now: Timestamp::ZERO,
            config,
            irq: IrqState::new(),
            trace: TraceBuf::new(),
        };
        if let Some(ts) = config.time_slice {
            k.time_slice_set(ts.ticks, ts.max_priority)?;
        }
        let _ = k.spawn_at(
            IDLE_INDEX,
            ThreadSpec {
                entry: arch::idle_main,
                args: [0; 3],
                stack: idle_stack,
                priority: IDLE_PRIORITY,
                flags: ThreadFlags::ESSENTIAL,
                delay: Timeout::NoWait,
            },
        )?;
        Ok(k)
    }

    /// Chooses the first thread to run. Called once, before the first trap
    /// exit.
    pub fn start(&mut self) -> usize {
        // Nothing is running yet, so the pick can't favor the idle slot.
        let first = self.pick();
        self.need_resched = false;
        first
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_id(&self) -> ThreadId {
        self.thread_id(self.current)
    }

    pub fn thread_id(&self, i: usize) -> ThreadId {
        ThreadId::for_index_and_gen(i, self.threads[i].generation)
    }

    /// Looks up a thread by id without checking that it is still alive.
    ///
    /// # Panics
    ///
    /// If the index is out of range.
    pub fn thread(&self, tid: ThreadId) -> &Thread {
        &self.threads[tid.index()]
    }

    pub fn threads(&self) -> &[Thread] {
        self.threads
    }

    pub fn objects(&self) -> &[Object] {
        self.objects
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched
    }

    pub fn in_isr(&self) -> bool {
        self.irq.depth > 0
    }

    pub fn trace(&self) -> &TraceBuf {
        &self.trace
    }

    /// Priority of the running thread.
    pub fn current_priority(&self) -> Priority {
        self.threads[self.current].priority
    }

    /// Checks the cross-structure invariants the rest of the kernel relies
    /// on. Tests call this after every step.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        use crate::sync::ObjectKind;
        use crate::thread::{level, Membership, QueueId};
        use abi::ThreadState;

        let mut running = 0;
        for (i, t) in self.threads.iter().enumerate() {
            match t.membership {
                Membership::Detached => assert!(
                    !matches!(t.state, ThreadState::Ready),
                    "ready thread {i} not queued"
                ),
                Membership::Ready => {
                    assert_eq!(t.state, ThreadState::Ready, "thread {i}");
                    assert!(self.ready.contains(self.threads, i));
                    assert!(self
                        .ready
                        .iter_level(self.threads, level(t.priority))
                        .any(|r| r == i));
                }
                Membership::Waiting(q) => {
                    assert!(
                        matches!(t.state, ThreadState::Blocked(_)),
                        "waiting thread {i} is {:?}",
                        t.state
                    );
                    assert!(self.queue(q).iter(self.threads).any(|w| w == i));
                }
            }
            assert_eq!(
                t.deadline.is_some(),
                self.timeouts.contains(self.threads, i),
                "thread {i} deadline and timeout queue disagree"
            );
            if t.state == ThreadState::Running {
                running += 1;
                assert_eq!(i, self.current);
                assert_eq!(t.membership, Membership::Detached);
            }
        }
        assert_eq!(running, 1, "exactly one thread runs");

        for (o, obj) in self.objects.iter().enumerate() {
            match &obj.kind {
                ObjectKind::Semaphore { count, limit } => {
                    assert!(count <= limit);
                    assert!(*count == 0 || obj.waiters.is_empty(), "object {o}");
                }
                ObjectKind::Fifo(items) => {
                    assert!(items.is_empty() || obj.waiters.is_empty(), "object {o}");
                }
                ObjectKind::Mutex { owner, count } => {
                    assert_eq!(owner.is_none(), *count == 0, "object {o}");
                }
                _ => (),
            }
            for w in obj.waiters.iter(self.threads) {
                assert_eq!(
                    self.threads[w].membership,
                    Membership::Waiting(QueueId::Object(abi::ObjectId(o as u16)))
                );
            }
        }

        let deadlines: Vec<_> = self
            .timeouts
            .iter(self.threads)
            .map(|i| self.threads[i].deadline)
            .collect();
        assert!(deadlines.windows(2).all(|w| w[0] <= w[1]), "{deadlines:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeSlice;
    use crate::testutil::*;
    use abi::ThreadState;

    #[test]
    fn combine_prefers_other() {
        assert_eq!(NextTask::Same.combine(NextTask::Same), NextTask::Same);
        assert_eq!(NextTask::Same.combine(NextTask::Other), NextTask::Other);
        assert_eq!(NextTask::Other.combine(NextTask::Same), NextTask::Other);
    }

    #[test]
    fn new_creates_idle() {
        let mut k = kernel(2);
        assert_eq!(k.start(), IDLE_INDEX);
        let idle = &k.threads()[IDLE_INDEX];
        assert_eq!(idle.state(), ThreadState::Running);
        assert_eq!(idle.priority(), IDLE_PRIORITY);
        assert!(idle.is_essential());
        k.check_invariants();
    }

    #[test]
    fn new_rejects_bad_shapes() {
        let threads: &'static mut [Thread] = Box::leak(Box::new([]));
        let objects: &'static mut [Object] = Box::leak(Box::new([]));
        assert_eq!(
            Kernel::new(threads, objects, stack(), SchedConfig::default()).err(),
            Some(ConfigError::BadTableSize)
        );

        let threads: &'static mut [Thread] = Box::leak(
            (0..2).map(|_| Thread::default()).collect::<Box<[_]>>(),
        );
        let objects: &'static mut [Object] = Box::leak(Box::new([]));
        let config = SchedConfig {
            time_slice: Some(TimeSlice {
                ticks: 0,
                max_priority: Priority(0),
            }),
            ..SchedConfig::default()
        };
        assert_eq!(
            Kernel::new(threads, objects, stack(), config).err(),
            Some(ConfigError::InvalidTimeSlice)
        );
    }

    #[test]
    fn start_picks_most_important() {
        let mut k = kernel(4);
        let _ = k.spawn(spec(7)).unwrap();
        let (b, _) = k.spawn(spec(2)).unwrap();
        assert_eq!(k.start(), b.index());
        assert_eq!(k.current_id(), b);
        k.check_invariants();
    }
}
