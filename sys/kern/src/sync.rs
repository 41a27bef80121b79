// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization objects.
//!
//! Objects live in a table supplied when the kernel is built and are named by
//! `ObjectId`. Each has a wait queue and a kind-specific payload; operations
//! match on the kind, and using an object as the wrong kind is a fault.
//!
//! A semaphore or fifo never has both pending data and waiters: a give or put
//! with a waiter present goes straight to the waiter.

use core::fmt;

use abi::{Errno, ObjectId, ThreadId, ThreadState, Timeout, UsageError, WaitReason};
use heapless::Deque;

use crate::arch::ArchState;
use crate::config::FIFO_DEPTH;
use crate::err::UserError;
use crate::kernel::{Kernel, NextTask};
use crate::thread::{Membership, QueueId, Relock};
use crate::wait::{Wait, WaitOrder, WaitQueue};

pub struct Object {
    pub(crate) waiters: WaitQueue,
    pub(crate) kind: ObjectKind,
}

pub enum ObjectKind {
    /// Unused slot.
    Free,
    Semaphore { count: u32, limit: u32 },
    Mutex {
        owner: Option<ThreadId>,
        /// Recursion depth; zero when unowned.
        count: u32,
    },
    CondVar,
    Fifo(Deque<u32, FIFO_DEPTH>),
    /// A bare wait queue for drivers to build their own primitives on.
    WaitQueue,
}

/// Object kinds, without their payloads.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Class {
    Semaphore,
    Mutex,
    CondVar,
    Fifo,
    WaitQueue,
}

impl ObjectKind {
    pub fn class(&self) -> Option<Class> {
        match self {
            Self::Free => None,
            Self::Semaphore { .. } => Some(Class::Semaphore),
            Self::Mutex { .. } => Some(Class::Mutex),
            Self::CondVar => Some(Class::CondVar),
            Self::Fifo(_) => Some(Class::Fifo),
            Self::WaitQueue => Some(Class::WaitQueue),
        }
    }
}

impl fmt::Debug for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("Free"),
            Self::Semaphore { count, limit } => f
                .debug_struct("Semaphore")
                .field("count", count)
                .field("limit", limit)
                .finish(),
            Self::Mutex { owner, count } => f
                .debug_struct("Mutex")
                .field("owner", owner)
                .field("count", count)
                .finish(),
            Self::CondVar => f.write_str("CondVar"),
            Self::Fifo(items) => f.debug_tuple("Fifo").field(&items.len()).finish(),
            Self::WaitQueue => f.write_str("WaitQueue"),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("waiters", &self.waiters.len())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::free()
    }
}

impl Object {
    pub const fn free() -> Self {
        Self::new(ObjectKind::Free)
    }

    const fn new(kind: ObjectKind) -> Self {
        Self {
            waiters: WaitQueue::new(WaitOrder::Priority),
            kind,
        }
    }

    pub const fn semaphore(initial: u32, limit: u32) -> Self {
        Self::new(ObjectKind::Semaphore {
            count: initial,
            limit,
        })
    }

    pub const fn mutex() -> Self {
        Self::new(ObjectKind::Mutex {
            owner: None,
            count: 0,
        })
    }

    pub const fn condvar() -> Self {
        Self::new(ObjectKind::CondVar)
    }

    pub const fn fifo() -> Self {
        Self::new(ObjectKind::Fifo(Deque::new()))
    }

    pub const fn wait_queue(order: WaitOrder) -> Self {
        Self {
            waiters: WaitQueue::new(order),
            kind: ObjectKind::WaitQueue,
        }
    }

    /// Changes the order in which waiters are released.
    pub fn with_order(mut self, order: WaitOrder) -> Self {
        self.waiters = WaitQueue::new(order);
        self
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    pub fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    fn validate(&self) -> Result<(), Errno> {
        match self.kind {
            ObjectKind::Semaphore { count, limit } => {
                if limit == 0 || count > limit || limit > i32::MAX as u32 {
                    return Err(Errno::Inval);
                }
            }
            ObjectKind::Free => return Err(Errno::Inval),
            _ => (),
        }
        if !self.waiters.is_empty() {
            return Err(Errno::Inval);
        }
        Ok(())
    }
}

impl Kernel<'_> {
    /// Installs `obj` in a free slot of the object table.
    pub fn create(&mut self, obj: Object) -> Result<ObjectId, Errno> {
        obj.validate()?;
        let slot = self
            .objects
            .iter()
            .position(|o| matches!(o.kind, ObjectKind::Free))
            .ok_or(Errno::NoMem)?;
        self.objects[slot] = obj;
        Ok(ObjectId(slot as u16))
    }

    /// Resolves `id`, checking that it names an object of class `want`.
    pub(crate) fn object(
        &self,
        id: ObjectId,
        want: Class,
    ) -> Result<usize, UserError> {
        let o = self
            .objects
            .get(id.index())
            .ok_or(UsageError::ObjectOutOfRange)?;
        if o.kind.class() != Some(want) {
            return Err(UsageError::WrongObjectKind.into());
        }
        Ok(id.index())
    }

    pub fn sem_take(
        &mut self,
        id: ObjectId,
        timeout: Timeout,
    ) -> Result<Wait<()>, UserError> {
        let o = self.object(id, Class::Semaphore)?;
        if let ObjectKind::Semaphore { count, .. } = &mut self.objects[o].kind {
            if *count > 0 {
                *count -= 1;
                return Ok(Wait::Done(()));
            }
        }
        self.check_blocking(timeout)?;
        self.pend_current(QueueId::Object(id), timeout);
        Ok(Wait::Blocked)
    }

    /// Releases one waiter, or bumps the count (up to the limit) if nobody is
    /// waiting.
    pub fn sem_give(&mut self, id: ObjectId) -> Result<NextTask, UserError> {
        let o = self.object(id, Class::Semaphore)?;
        if let Some((_, hint)) = self.wake_one(QueueId::Object(id), 0) {
            return Ok(hint);
        }
        if let ObjectKind::Semaphore { count, limit } = &mut self.objects[o].kind
        {
            if *count < *limit {
                *count += 1;
            }
        }
        Ok(NextTask::Same)
    }

    /// Zeroes the count and fails every waiter with `Canceled`.
    pub fn sem_reset(&mut self, id: ObjectId) -> Result<NextTask, UserError> {
        let o = self.object(id, Class::Semaphore)?;
        if let ObjectKind::Semaphore { count, .. } = &mut self.objects[o].kind {
            *count = 0;
        }
        let (_, hint) =
            self.wake_all(QueueId::Object(id), Errno::Canceled.code());
        Ok(hint)
    }

    pub fn sem_count(&self, id: ObjectId) -> Result<u32, UserError> {
        let o = self.object(id, Class::Semaphore)?;
        match self.objects[o].kind {
            ObjectKind::Semaphore { count, .. } => Ok(count),
            _ => Err(UsageError::WrongObjectKind.into()),
        }
    }

    /// Locks a mutex, recursively if the caller already owns it.
    ///
    /// While the caller waits, the owner runs at no less than the caller's
    /// priority.
    pub fn mutex_lock(
        &mut self,
        id: ObjectId,
        timeout: Timeout,
    ) -> Result<Wait<()>, UserError> {
        let o = self.object(id, Class::Mutex)?;
        if self.in_isr() {
            return Err(Errno::Inval.into());
        }
        let me = self.current_id();
        if let ObjectKind::Mutex { owner, count } = &mut self.objects[o].kind {
            match owner {
                None => {
                    *owner = Some(me);
                    *count = 1;
                    return Ok(Wait::Done(()));
                }
                Some(x) if *x == me => {
                    *count = count.checked_add(1).ok_or(Errno::Inval)?;
                    return Ok(Wait::Done(()));
                }
                Some(_) => (),
            }
        }
        self.check_blocking(timeout)?;
        self.pend_current(QueueId::Object(id), timeout);
        let _ = self.mutex_waiters_changed(o);
        Ok(Wait::Blocked)
    }

    pub fn mutex_unlock(&mut self, id: ObjectId) -> Result<NextTask, UserError> {
        let o = self.object(id, Class::Mutex)?;
        if self.in_isr() {
            return Err(Errno::Inval.into());
        }
        let me = self.current_id();
        if let ObjectKind::Mutex { owner, count } = &mut self.objects[o].kind {
            match owner {
                None => return Err(Errno::Inval.into()),
                Some(x) if *x != me => return Err(Errno::Perm.into()),
                Some(_) if *count > 1 => {
                    *count -= 1;
                    return Ok(NextTask::Same);
                }
                Some(_) => (),
            }
        }
        let hint = self.mutex_release(o);
        let cur = self.current;
        Ok(hint.combine(self.refresh_priority(cur)))
    }

    /// Gives up mutex `o` entirely, handing it to the most important waiter if
    /// there is one.
    fn mutex_release(&mut self, o: usize) -> NextTask {
        let id = ObjectId(o as u16);
        let Some(w) = self.pop_waiter(QueueId::Object(id)) else {
            if let ObjectKind::Mutex { owner, count } = &mut self.objects[o].kind
            {
                *owner = None;
                *count = 0;
            }
            return NextTask::Same;
        };

        // A condition waiter queued here to get its mutex back brings its
        // recursion depth and the result of its condition wait.
        let (depth, code) = match self.threads[w].relock.take() {
            Some(r) => (r.count, r.code.unwrap_or(0)),
            None => (1, 0),
        };
        let new_owner = self.thread_id(w);
        if let ObjectKind::Mutex { owner, count } = &mut self.objects[o].kind {
            *owner = Some(new_owner);
            *count = depth;
        }
        let hint = self.wake(w, code);
        hint.combine(self.refresh_priority(w))
    }

    /// Waits on a condition variable, releasing `mutex` (which the caller
    /// must hold) for the duration. The mutex is held again, at the same
    /// recursion depth, by the time the caller runs.
    pub fn cond_wait(
        &mut self,
        cond: ObjectId,
        mutex: ObjectId,
        timeout: Timeout,
    ) -> Result<Wait<()>, UserError> {
        self.object(cond, Class::CondVar)?;
        let m = self.object(mutex, Class::Mutex)?;
        if self.in_isr() {
            return Err(Errno::Inval.into());
        }
        let me = self.current_id();
        let depth = match self.objects[m].kind {
            ObjectKind::Mutex {
                owner: Some(x),
                count,
            } if x == me => count,
            _ => return Err(Errno::Perm.into()),
        };
        if timeout.is_no_wait() {
            return Err(Errno::Again.into());
        }
        self.check_may_block()?;

        let cur = self.current;
        let _ = self.mutex_release(m);
        self.pend_current(QueueId::Object(cond), timeout);
        self.threads[cur].relock = Some(Relock {
            mutex,
            count: depth,
            code: None,
        });
        let _ = self.refresh_priority(cur);
        Ok(Wait::Blocked)
    }

    pub fn cond_signal(&mut self, id: ObjectId) -> Result<NextTask, UserError> {
        self.object(id, Class::CondVar)?;
        Ok(self
            .wake_one(QueueId::Object(id), 0)
            .map_or(NextTask::Same, |(_, hint)| hint))
    }

    /// Wakes every waiter, returning how many there were.
    pub fn cond_broadcast(
        &mut self,
        id: ObjectId,
    ) -> Result<(usize, NextTask), UserError> {
        self.object(id, Class::CondVar)?;
        Ok(self.wake_all(QueueId::Object(id), 0))
    }

    /// Second half of waking a condition waiter: take the mutex back, or queue
    /// for it.
    pub(crate) fn relock(&mut self, i: usize, r: Relock, code: i32) -> NextTask {
        let m = r.mutex.index();
        let me = self.thread_id(i);
        let ObjectKind::Mutex { owner, count } = &mut self.objects[m].kind else {
            // The mutex was checked when the wait began and objects don't
            // change kind while in use.
            self.threads[i].save.set_result(code);
            return self.end_wait(i);
        };
        if owner.is_none() {
            *owner = Some(me);
            *count = r.count;
            self.threads[i].save.set_result(code);
            return self.end_wait(i);
        }
        let q = QueueId::Object(r.mutex);
        self.threads[i].relock = Some(Relock {
            code: Some(code),
            ..r
        });
        self.with_queue(q, |queue, threads| queue.insert(threads, i));
        let t = &mut self.threads[i];
        t.membership = Membership::Waiting(q);
        t.state = ThreadState::Blocked(WaitReason::Object(r.mutex));
        self.mutex_waiters_changed(m)
    }

    pub fn fifo_put(
        &mut self,
        id: ObjectId,
        item: u32,
    ) -> Result<NextTask, UserError> {
        let o = self.object(id, Class::Fifo)?;
        if let Some(w) = self.pop_waiter(QueueId::Object(id)) {
            self.threads[w].save.set_data(item);
            return Ok(self.wake(w, 0));
        }
        if let ObjectKind::Fifo(items) = &mut self.objects[o].kind {
            items.push_back(item).map_err(|_| Errno::NoMem)?;
        }
        Ok(NextTask::Same)
    }

    pub fn fifo_get(
        &mut self,
        id: ObjectId,
        timeout: Timeout,
    ) -> Result<Wait<u32>, UserError> {
        let o = self.object(id, Class::Fifo)?;
        if let ObjectKind::Fifo(items) = &mut self.objects[o].kind {
            if let Some(item) = items.pop_front() {
                return Ok(Wait::Done(item));
            }
        }
        self.check_blocking(timeout)?;
        self.pend_current(QueueId::Object(id), timeout);
        Ok(Wait::Blocked)
    }

    /// Fails the first waiting getter with `Canceled`.
    pub fn fifo_cancel_wait(
        &mut self,
        id: ObjectId,
    ) -> Result<NextTask, UserError> {
        self.object(id, Class::Fifo)?;
        Ok(self
            .wake_one(QueueId::Object(id), Errno::Canceled.code())
            .map_or(NextTask::Same, |(_, hint)| hint))
    }

    pub fn fifo_is_empty(&self, id: ObjectId) -> Result<bool, UserError> {
        let o = self.object(id, Class::Fifo)?;
        match &self.objects[o].kind {
            ObjectKind::Fifo(items) => Ok(items.is_empty()),
            _ => Err(UsageError::WrongObjectKind.into()),
        }
    }

    /// Follow-up for a thread that stopped waiting on something other than a
    /// wake (timeout, abort): if that something was a mutex, its
    /// owner may be owed less priority.
    pub(crate) fn waiter_left(&mut self, was: Membership) -> NextTask {
        match was {
            Membership::Waiting(QueueId::Object(id)) => {
                self.mutex_waiters_changed(id.index())
            }
            _ => NextTask::Same,
        }
    }

    /// Re-derives the owner's priority after the waiters of mutex `o`
    /// changed. Does nothing for objects that aren't owned mutexes.
    pub(crate) fn mutex_waiters_changed(&mut self, o: usize) -> NextTask {
        match self.mutex_owner_index(o) {
            Some(owner) => self.refresh_priority(owner),
            None => NextTask::Same,
        }
    }

    fn mutex_owner_index(&self, o: usize) -> Option<usize> {
        let ObjectKind::Mutex {
            owner: Some(owner), ..
        } = self.objects.get(o)?.kind
        else {
            return None;
        };
        let t = self.threads.get(owner.index())?;
        (t.generation == owner.generation() && t.state != ThreadState::Dead)
            .then_some(owner.index())
    }

    /// Priority thread `i` is owed: its base priority, raised to that of the
    /// most important waiter on any mutex it owns.
    fn owed_priority(&self, i: usize) -> abi::Priority {
        let me = self.thread_id(i);
        let mut best = self.threads[i].base_priority;
        for obj in self.objects.iter() {
            if let ObjectKind::Mutex {
                owner: Some(owner), ..
            } = obj.kind
            {
                if owner != me {
                    continue;
                }
                if let Some(h) = obj.waiters.head() {
                    let p = self.threads[h].priority;
                    if p.is_more_important_than(best) {
                        best = p;
                    }
                }
            }
        }
        best
    }

    /// Brings thread `i`'s effective priority in line with what it is owed,
    /// and carries the change along the chain of mutex owners it is waiting
    /// on.
    pub(crate) fn refresh_priority(&mut self, mut i: usize) -> NextTask {
        let mut hint = NextTask::Same;
        // A chain can't be longer than the thread table.
        for _ in 0..self.threads.len() {
            let owed = self.owed_priority(i);
            if owed == self.threads[i].priority {
                break;
            }
            hint = hint.combine(self.set_effective_priority(i, owed));
            let ThreadState::Blocked(WaitReason::Object(m)) =
                self.threads[i].state
            else {
                break;
            };
            match self.mutex_owner_index(m.index()) {
                Some(owner) => i = owner,
                None => break,
            }
        }
        hint
    }
}
