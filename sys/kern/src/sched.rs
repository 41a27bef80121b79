// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling policy.
//!
//! The ready queue holds every runnable thread *except* the running one. A
//! switch is decided in two places: operations that make a thread ready ask
//! `preempt_hint` whether the newcomer should take over, and `pick`, run on the
//! way out of a trap, chooses the next thread.

use abi::{Errno, Priority, ThreadId, ThreadState};

use crate::config::{PreemptPolicy, TimeSlice, IDLE_PRIORITY};
use crate::err::{ConfigError, UserError};
use crate::kernel::{Kernel, NextTask, IDLE_INDEX};
use crate::thread::{check_priority, level, Membership};
use crate::trace::Trace;

impl Kernel<'_> {
    /// Decides whether thread `woken`, just made ready, should preempt the
    /// running thread.
    pub(crate) fn preempt_hint(&mut self, woken: usize) -> NextTask {
        let cur = &self.threads[self.current];
        if cur.state != ThreadState::Running || !cur.is_preemptible() {
            return NextTask::Same;
        }
        let w = self.threads[woken].priority;
        match self.config.preempt {
            PreemptPolicy::Strict if w.is_more_important_than(cur.priority) => {
                NextTask::Other
            }
            PreemptPolicy::EqualOrHigher if w.is_at_least(cur.priority) => {
                if w == cur.priority {
                    self.rotate_current = true;
                }
                NextTask::Other
            }
            _ => NextTask::Same,
        }
    }

    /// Checks whether the head of the ready queue is strictly more important
    /// than a preemptible running thread.
    pub(crate) fn preemption_due(&self) -> bool {
        let cur = &self.threads[self.current];
        if cur.state != ThreadState::Running || !cur.is_preemptible() {
            return false;
        }
        self.ready.peek().is_some_and(|h| {
            self.threads[h].priority.is_more_important_than(cur.priority)
        })
    }

    /// Chooses the thread to run next and makes it current.
    ///
    /// A running thread keeps the CPU unless the head of the ready queue
    /// should preempt it. A preempted thread goes back to the *front* of its
    /// level, keeping its turn, except when it is being rotated for an
    /// equal-priority newcomer.
    ///
    /// # Panics
    ///
    /// If nothing is runnable, which means the idle thread has been lost.
    pub(crate) fn pick(&mut self) -> usize {
        let cur = self.current;
        let rotate = core::mem::take(&mut self.rotate_current);

        if self.threads[cur].state == ThreadState::Running {
            let Some(head) = self.ready.peek() else {
                return cur;
            };
            let c = &self.threads[cur];
            let h = self.threads[head].priority;
            let preempt = c.is_preemptible()
                && (h.is_more_important_than(c.priority)
                    || (rotate && h == c.priority));
            if !preempt {
                return cur;
            }
            let lvl = level(c.priority);
            let t = &mut self.threads[cur];
            t.state = ThreadState::Ready;
            t.membership = Membership::Ready;
            if rotate {
                self.ready.push_back(self.threads, lvl, cur);
            } else {
                self.ready.push_front(self.threads, lvl, cur);
            }
            kern_trace!(self, Trace::Preempt { thread: cur as u16 });
        }

        let Some(next) = self.ready.pop(self.threads) else {
            panic!("no runnable thread");
        };
        let slice = self.slice_budget();
        let t = &mut self.threads[next];
        t.membership = Membership::Detached;
        t.state = ThreadState::Running;
        t.slice_left = slice;
        self.current = next;
        next
    }

    fn slice_budget(&self) -> u32 {
        self.config.time_slice.map_or(0, |ts| ts.ticks)
    }

    /// Moves the caller behind any ready threads of its own priority.
    ///
    /// Does nothing if no such thread exists, so yielding with nothing else to
    /// run returns immediately.
    pub fn yield_now(&mut self) -> NextTask {
        let cur = self.current;
        let p = self.threads[cur].priority;
        if self.threads[cur].state != ThreadState::Running {
            return NextTask::Same;
        }
        let rival = self
            .ready
            .peek()
            .is_some_and(|h| self.threads[h].priority.is_at_least(p));
        if !rival {
            return NextTask::Same;
        }
        let t = &mut self.threads[cur];
        t.state = ThreadState::Ready;
        t.membership = Membership::Ready;
        self.ready.push_back(self.threads, level(p), cur);
        NextTask::Other
    }

    /// Spends one tick of the running thread's time slice, rotating it behind
    /// its peers when the slice runs out.
    pub(crate) fn slice_tick(&mut self) -> NextTask {
        let Some(ts) = self.config.time_slice else {
            return NextTask::Same;
        };
        let cur = self.current;
        let t = &mut self.threads[cur];
        if cur == IDLE_INDEX
            || t.state != ThreadState::Running
            || t.priority.is_cooperative()
            || t.priority.is_more_important_than(ts.max_priority)
        {
            return NextTask::Same;
        }
        t.slice_left = t.slice_left.saturating_sub(1);
        if t.slice_left > 0 || t.sched_locks > 0 {
            // A locked thread keeps an empty budget and rotates at the first
            // tick after it unlocks.
            return NextTask::Same;
        }
        let lvl = level(t.priority);
        if self.ready.level_len(lvl) == 0 {
            t.slice_left = ts.ticks;
            return NextTask::Same;
        }
        t.state = ThreadState::Ready;
        t.membership = Membership::Ready;
        self.ready.push_back(self.threads, lvl, cur);
        NextTask::Other
    }

    /// Enables round-robin among threads at or below `max_priority`, or
    /// disables it when `ticks` is zero.
    pub fn time_slice_set(
        &mut self,
        ticks: u32,
        max_priority: Priority,
    ) -> Result<(), ConfigError> {
        if ticks == 0 {
            self.config.time_slice = None;
            return Ok(());
        }
        if max_priority != IDLE_PRIORITY {
            check_priority(max_priority)
                .map_err(|_| ConfigError::InvalidTimeSlice)?;
        }
        self.config.time_slice = Some(TimeSlice {
            ticks,
            max_priority,
        });
        let cur = self.current;
        self.threads[cur].slice_left = ticks;
        Ok(())
    }

    pub fn set_preempt_policy(&mut self, policy: PreemptPolicy) {
        self.config.preempt = policy;
    }

    pub fn priority_get(&self, tid: ThreadId) -> Result<Priority, UserError> {
        let i = self.lookup(tid)?;
        Ok(self.threads[i].priority)
    }

    /// Changes the base priority of `tid`. Its effective priority may stay
    /// higher while it holds a contended mutex.
    pub fn priority_set(
        &mut self,
        tid: ThreadId,
        prio: Priority,
    ) -> Result<NextTask, UserError> {
        let i = self.lookup(tid)?;
        if i == IDLE_INDEX {
            return Err(Errno::Perm.into());
        }
        check_priority(prio)?;
        self.threads[i].base_priority = prio;
        Ok(self.refresh_priority(i))
    }

    /// Moves thread `i` to effective priority `p`, keeping whatever queue it
    /// is on correctly ordered.
    pub(crate) fn set_effective_priority(
        &mut self,
        i: usize,
        p: Priority,
    ) -> NextTask {
        let old = self.threads[i].priority;
        match self.threads[i].membership {
            Membership::Detached => self.threads[i].priority = p,
            Membership::Ready => {
                self.ready.remove(self.threads, level(old), i);
                self.threads[i].priority = p;
                self.ready.push_back(self.threads, level(p), i);
            }
            Membership::Waiting(q) => {
                self.with_queue(q, |queue, threads| {
                    queue.remove(threads, i);
                    threads[i].priority = p;
                    queue.insert(threads, i);
                });
            }
        }
        if i == self.current {
            if self.preemption_due() {
                NextTask::Other
            } else {
                NextTask::Same
            }
        } else if self.threads[i].state == ThreadState::Ready {
            self.preempt_hint(i)
        } else {
            NextTask::Same
        }
    }

    /// Keeps the calling thread from being preempted by other threads until
    /// the matching `sched_unlock`. Interrupts still run. Locks nest.
    pub fn sched_lock(&mut self) -> Result<(), UserError> {
        if self.in_isr() {
            return Err(Errno::Inval.into());
        }
        let cur = self.current;
        let t = &mut self.threads[cur];
        t.sched_locks = t.sched_locks.checked_add(1).ok_or(Errno::Inval)?;
        Ok(())
    }

    /// Drops one level of scheduler lock. Leaving the outermost level gives
    /// any more important ready thread the CPU.
    pub fn sched_unlock(&mut self) -> Result<NextTask, UserError> {
        if self.in_isr() {
            return Err(Errno::Inval.into());
        }
        let cur = self.current;
        let t = &mut self.threads[cur];
        if t.sched_locks == 0 {
            return Err(Errno::Perm.into());
        }
        t.sched_locks -= 1;
        Ok(if self.preemption_due() {
            NextTask::Other
        } else {
            NextTask::Same
        })
    }

    /// Checks whether the running thread can currently be preempted by another
    /// thread.
    pub fn is_preempt_thread(&self) -> bool {
        !self.in_isr() && self.threads[self.current].is_preemptible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedConfig;
    use crate::sync::Object;
    use crate::testutil::*;
    use abi::Sysnum;

    #[test]
    fn round_robin_with_one_tick_slices() {
        let config = SchedConfig {
            time_slice: Some(TimeSlice {
                ticks: 1,
                max_priority: Priority(0),
            }),
            ..SchedConfig::default()
        };
        let mut k = kernel_with(5, config);
        let (t1, _) = k.spawn(spec(5)).unwrap();
        let (t2, _) = k.spawn(spec(5)).unwrap();
        let (t3, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);

        let mut seen = vec![sim.current()];
        for _ in 0..5 {
            sim.tick();
            seen.push(sim.current());
        }
        assert_eq!(seen, [t1, t2, t3, t1, t2, t3]);
    }

    #[test]
    fn slices_only_apply_at_or_below_ceiling() {
        let config = SchedConfig {
            time_slice: Some(TimeSlice {
                ticks: 2,
                max_priority: Priority(6),
            }),
            ..SchedConfig::default()
        };
        let mut k = kernel_with(5, config);
        let (a, _) = k.spawn(spec(5)).unwrap();
        let (_b, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        sim.ticks(10);
        assert_eq!(sim.current(), a, "priority 5 is above the slice ceiling");
    }

    #[test]
    fn lone_thread_keeps_running_through_slice_expiry() {
        let mut k = kernel_with(
            3,
            SchedConfig {
                time_slice: Some(TimeSlice {
                    ticks: 1,
                    max_priority: Priority(0),
                }),
                ..SchedConfig::default()
            },
        );
        let (a, _) = k.spawn(spec(5)).unwrap();
        let mut sim = Sim::start(k);
        sim.ticks(3);
        assert_eq!(sim.current(), a);
    }

    #[test]
    fn yield_rotates_among_equals_only() {
        let mut k = kernel(5);
        let (a, _) = k.spawn(spec(4)).unwrap();
        let (b, _) = k.spawn(spec(4)).unwrap();
        let (_c, _) = k.spawn(spec(6)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.syscall(Sysnum::Yield, [0; 4]), None);
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::Yield, [0; 4]), None);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), 0);

        // With b gone, nothing at a's level: yield comes straight back.
        assert_eq!(sim.syscall(Sysnum::Suspend, [b.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.syscall(Sysnum::Yield, [0; 4]), Some(0));
    }

    #[test]
    fn strict_policy_waits_for_strictly_higher() {
        let mut k = kernel(4);
        let sem = k.create(Object::semaphore(0, 1)).unwrap();
        let (a, _) = k.spawn(spec(4)).unwrap();
        let (b, _) = k.spawn(spec(4)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.syscall(Sysnum::SemTake, [sem.0.into(), u32::MAX, 0, 0]), None);
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::SemGive, [sem.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.current(), b);
        assert_eq!(sim.kernel.thread(a).state(), ThreadState::Ready);
    }

    #[test]
    fn equal_or_higher_policy_rotates_on_equal_wake() {
        let mut k = kernel_with(
            4,
            SchedConfig {
                preempt: PreemptPolicy::EqualOrHigher,
                ..SchedConfig::default()
            },
        );
        let sem = k.create(Object::semaphore(0, 1)).unwrap();
        let (a, _) = k.spawn(spec(4)).unwrap();
        let (b, _) = k.spawn(spec(4)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.syscall(Sysnum::SemTake, [sem.0.into(), u32::MAX, 0, 0]), None);
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::SemGive, [sem.0.into(), 0, 0, 0]), None);
        assert_eq!(sim.current(), a);
        assert_eq!(sim.result(), 0);

        // b was rotated to the back of the level, not the front.
        let lvl = level(Priority(4));
        let queued: Vec<_> = sim
            .kernel
            .ready
            .iter_level(sim.kernel.threads(), lvl)
            .collect();
        assert_eq!(queued, [b.index()]);
    }

    #[test]
    fn deferred_policy_switches_at_next_tick() {
        let mut k = kernel_with(
            4,
            SchedConfig {
                preempt: PreemptPolicy::Deferred,
                ..SchedConfig::default()
            },
        );
        let (low, _) = k.spawn(spec(8)).unwrap();
        let (high, _) = k
            .spawn(crate::thread::ThreadSpec {
                delay: abi::Timeout::Forever,
                ..spec(2)
            })
            .unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.syscall(Sysnum::Start, [high.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.current(), low);
        sim.tick();
        assert_eq!(sim.current(), high);
    }

    #[test]
    fn cooperative_thread_is_not_preempted() {
        let mut k = kernel(4);
        let (coop, _) = k.spawn(spec(-1)).unwrap();
        let (other, _) = k
            .spawn(crate::thread::ThreadSpec {
                delay: abi::Timeout::Forever,
                ..spec(-5)
            })
            .unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current(), coop);
        assert_eq!(sim.syscall(Sysnum::Start, [other.0.into(), 0, 0, 0]), Some(0));
        sim.ticks(3);
        assert_eq!(sim.current(), coop);

        // It gives up the CPU when it blocks.
        assert_eq!(sim.syscall(Sysnum::Sleep, [1, 0, 0, 0]), None);
        assert_eq!(sim.current(), other);
    }

    #[test]
    fn sched_lock_defers_preemption_until_unlock() {
        let mut k = kernel(4);
        let (low, _) = k.spawn(spec(8)).unwrap();
        let (high, _) = k
            .spawn(crate::thread::ThreadSpec {
                delay: abi::Timeout::Forever,
                ..spec(2)
            })
            .unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.syscall(Sysnum::SchedLock, [0; 4]), Some(0));
        assert_eq!(sim.syscall(Sysnum::SchedLock, [0; 4]), Some(0));
        assert!(!sim.kernel.is_preempt_thread());
        assert_eq!(sim.syscall(Sysnum::Start, [high.0.into(), 0, 0, 0]), Some(0));
        sim.tick();
        assert_eq!(sim.current(), low);
        assert_eq!(sim.syscall(Sysnum::SchedUnlock, [0; 4]), Some(0));
        assert_eq!(sim.current(), low);
        assert_eq!(sim.syscall(Sysnum::SchedUnlock, [0; 4]), None);
        assert_eq!(sim.current(), high);
    }

    #[test]
    fn unbalanced_unlock_is_refused() {
        let mut k = kernel(3);
        let _ = k.spawn(spec(8)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(
            sim.syscall(Sysnum::SchedUnlock, [0; 4]),
            Some(Errno::Perm.code())
        );
    }

    #[test]
    fn priority_set_validates_and_reorders() {
        let mut k = kernel(4);
        let (a, _) = k.spawn(spec(4)).unwrap();
        let (b, _) = k.spawn(spec(6)).unwrap();
        let mut sim = Sim::start(k);
        assert_eq!(sim.current(), a);
        assert_eq!(
            sim.syscall(Sysnum::PrioritySet, [b.0.into(), IDLE_PRIORITY.0 as u32, 0, 0]),
            Some(Errno::Inval.code())
        );
        assert_eq!(
            sim.syscall(Sysnum::PrioritySet, [b.0.into(), 1, 0, 0]),
            None
        );
        assert_eq!(sim.current(), b);
        assert_eq!(sim.syscall(Sysnum::PriorityGet, [b.0.into(), 0, 0, 0]), Some(0));
        assert_eq!(sim.data(), 1);

        // Dropping our own priority below a hands the CPU back.
        assert_eq!(
            sim.syscall(Sysnum::PrioritySet, [b.0.into(), 9, 0, 0]),
            None
        );
        assert_eq!(sim.current(), a);
    }

    #[test]
    fn time_slice_set_checks_ceiling() {
        let mut k = kernel(3);
        assert_eq!(k.time_slice_set(5, Priority(3)), Ok(()));
        assert_eq!(
            k.time_slice_set(5, Priority(120)),
            Err(ConfigError::InvalidTimeSlice)
        );
        assert_eq!(k.time_slice_set(0, Priority(120)), Ok(()));
        assert_eq!(k.config().time_slice, None);
    }
}
