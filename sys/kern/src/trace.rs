// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-kernel event ring.
//!
//! Scheduling decisions are recorded into a small ring of `Trace` events held
//! in the kernel, for inspection by a debugger or by tests. Recording an event
//! identical to the previous one (same source line, same payload) bumps that
//! entry's `count` instead of consuming a new slot, so a thread spinning on
//! `yield` doesn't wash the ring clean.

use abi::WaitReason;

use crate::config::TRACE_DEPTH;
use crate::fail::FatalReason;

/// Records `$payload` into the trace ring of kernel `$k`, tagged with the
/// current source line.
macro_rules! kern_trace {
    ($k:expr, $payload:expr) => {
        $k.trace.record(line!() as u16, $payload)
    };
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    Switch { from: u16, to: u16 },
    Preempt { thread: u16 },
    Block { thread: u16, reason: WaitReason },
    Wake { thread: u16, code: i32 },
    Timeout { thread: u16 },
    Suspend { thread: u16 },
    Abort { thread: u16 },
    Irq(u32),
    Fatal(FatalReason),
}

#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: Trace,
}

impl TraceEntry {
    const EMPTY: Self = Self {
        line: 0,
        generation: 0,
        count: 0,
        payload: Trace::None,
    };
}

#[derive(Debug)]
pub struct TraceBuf {
    last: Option<usize>,
    buffer: [TraceEntry; TRACE_DEPTH],
}

impl Default for TraceBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBuf {
    pub const fn new() -> Self {
        Self {
            last: None,
            buffer: [TraceEntry::EMPTY; TRACE_DEPTH],
        }
    }

    pub fn record(&mut self, line: u16, payload: Trace) {
        // Treat "never written" as an out-of-range index, so the first entry
        // lands in slot 0 and can't be merged with anything.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = TraceEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.buffer.get(self.last?)
    }

    /// Walks the ring from the most recent entry backwards, skipping slots
    /// that have never been written.
    pub fn recent(&self) -> impl Iterator<Item = &TraceEntry> + '_ {
        let start = self.last.map_or(0, |l| l + 1);
        let n = self.buffer.len();
        (0..n)
            .map(move |k| &self.buffer[(start + n - 1 - k) % n])
            .filter(|e| e.count != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_counted_not_stored() {
        let mut t = TraceBuf::new();
        for _ in 0..5 {
            t.record(10, Trace::Preempt { thread: 1 });
        }
        let last = t.last().unwrap();
        assert_eq!(last.count, 5);
        assert_eq!(t.recent().count(), 1);

        // Same payload from a different line is a different event.
        t.record(11, Trace::Preempt { thread: 1 });
        assert_eq!(t.recent().count(), 2);
    }

    #[test]
    fn ring_wraps_and_bumps_generation() {
        let mut t = TraceBuf::new();
        for i in 0..(TRACE_DEPTH as u32 + 3) {
            t.record(1, Trace::Irq(i));
        }
        let recent: Vec<_> = t.recent().map(|e| e.payload).collect();
        assert_eq!(recent.len(), TRACE_DEPTH);
        assert_eq!(recent[0], Trace::Irq(TRACE_DEPTH as u32 + 2));
        assert_eq!(t.last().unwrap().generation, 2);
    }
}
