// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events, duration of
//! syscalls, and the like, as an aid to debugging or optimization work.
//!
//! The kernel doesn't assume any particular way of getting profiling
//! information out. A board that wants profiling populates an `EventsTable`
//! and hands it to `configure_events_table` from its startup routine. A
//! typical implementation sets or clears GPIOs for a logic analyzer to watch;
//! keep the handlers fast.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks that must be provided by the board setup code if it wants to enable
/// kernel profiling.
///
/// If you provide an `EventsTable`, you have to provide every hook. To ignore
/// one, use an empty closure:
///
/// ```ignore
///   isr_enter: || (),
/// ```
pub struct EventsTable {
    /// Called on entry to the syscall handler, with the syscall number.
    pub syscall_enter: fn(u32),
    pub syscall_exit: fn(),
    /// Called around the deferred context switch handler.
    pub pendsv_enter: fn(),
    pub pendsv_exit: fn(),
    /// Called around every kernel-managed interrupt.
    pub isr_enter: fn(),
    pub isr_exit: fn(),
    /// Called around tick processing.
    pub tick_enter: fn(),
    pub tick_exit: fn(),
    /// Called whenever the current thread changes, with the index of the new
    /// thread.
    pub context_switch: fn(usize),
    /// Called when a thread's timeout fires, with the thread's index.
    pub timeout_expired: fn(usize),
}

/// Supplies the kernel with an events table.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Written by `configure_events_table`; null means no table. All accesses are
/// `Relaxed`: it is written once at startup and read many times.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    // Only ever stored from a `&'static`.
    unsafe { p.as_ref() }
}

pub(crate) fn event_syscall_enter(nr: u32) {
    if let Some(t) = table() {
        (t.syscall_enter)(nr)
    }
}

pub(crate) fn event_syscall_exit() {
    if let Some(t) = table() {
        (t.syscall_exit)()
    }
}

pub(crate) fn event_pendsv_enter() {
    if let Some(t) = table() {
        (t.pendsv_enter)()
    }
}

pub(crate) fn event_pendsv_exit() {
    if let Some(t) = table() {
        (t.pendsv_exit)()
    }
}

/// Signals entry to an ISR. This is `pub` in case you write your own
/// non-kernel-managed ISR but you'd like to include it in ISR statistics.
pub fn event_isr_enter() {
    if let Some(t) = table() {
        (t.isr_enter)()
    }
}

/// Signals exit from an ISR.
pub fn event_isr_exit() {
    if let Some(t) = table() {
        (t.isr_exit)()
    }
}

pub(crate) fn event_tick_enter() {
    if let Some(t) = table() {
        (t.tick_enter)()
    }
}

pub(crate) fn event_tick_exit() {
    if let Some(t) = table() {
        (t.tick_exit)()
    }
}

pub(crate) fn event_context_switch(idx: usize) {
    if let Some(t) = table() {
        (t.context_switch)(idx)
    }
}

pub(crate) fn event_timeout_expired(idx: usize) {
    if let Some(t) = table() {
        (t.timeout_expired)(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use abi::Sysnum;
    use std::sync::atomic::AtomicUsize;

    static SWITCHES: AtomicUsize = AtomicUsize::new(0);
    static EXPIRED: AtomicUsize = AtomicUsize::new(0);

    static TABLE: EventsTable = EventsTable {
        syscall_enter: |_| (),
        syscall_exit: || (),
        pendsv_enter: || (),
        pendsv_exit: || (),
        isr_enter: || (),
        isr_exit: || (),
        tick_enter: || (),
        tick_exit: || (),
        context_switch: |_| {
            SWITCHES.fetch_add(1, Ordering::Relaxed);
        },
        timeout_expired: |_| {
            EXPIRED.fetch_add(1, Ordering::Relaxed);
        },
    };

    #[test]
    fn events_reach_the_table() {
        configure_events_table(&TABLE);
        let mut k = kernel(3);
        let _ = k.spawn(spec(3)).unwrap();
        let mut sim = Sim::start(k);
        let (s0, e0) = (
            SWITCHES.load(Ordering::Relaxed),
            EXPIRED.load(Ordering::Relaxed),
        );
        assert_eq!(sim.syscall(Sysnum::Sleep, [2, 0, 0, 0]), None);
        sim.ticks(2);
        // Other tests may be switching threads concurrently, so only check
        // that ours were counted.
        assert!(SWITCHES.load(Ordering::Relaxed) >= s0 + 2);
        assert!(EXPIRED.load(Ordering::Relaxed) > e0);
    }
}
