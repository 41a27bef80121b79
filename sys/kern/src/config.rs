// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel configuration.
//!
//! The table sizes and priority bands are fixed when the kernel is built; the
//! build script reads them from `$RTK_KERNEL_CONFIG` and generates the
//! constants below. Scheduling *policy* is chosen at runtime through
//! [`SchedConfig`], which boards usually deserialize out of their own
//! configuration documents.

use abi::Priority;
use serde::Deserialize;

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

/// Priority reserved for the idle thread: the least important preemptible
/// level.
pub const IDLE_PRIORITY: Priority = Priority((NUM_PREEMPT_PRIORITIES - 1) as i8);

/// Most important priority a thread may have.
pub const HIGHEST_PRIORITY: Priority = Priority(-(NUM_COOP_PRIORITIES as i16) as i8);

/// Decides whether a thread that becomes ready takes the CPU from the running
/// thread right away.
///
/// Whatever the policy, a running cooperative thread, or one holding the
/// scheduler lock, is never preempted by another thread.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub enum PreemptPolicy {
    /// Preempt when the woken thread is strictly more important.
    #[default]
    Strict,
    /// Preempt when the woken thread is at least as important. An
    /// equal-priority wake sends the running thread to the back of its level,
    /// as if it had yielded.
    EqualOrHigher,
    /// Never switch at wake time. The next tick, block or yield re-evaluates
    /// using the strict rule.
    Deferred,
}

/// Round-robin among equal-priority threads.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct TimeSlice {
    /// Budget, in ticks, a thread gets each time it is switched in.
    pub ticks: u32,
    /// Threads numerically at or above this priority are sliced; more
    /// important ones are not.
    pub max_priority: Priority,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    pub preempt: PreemptPolicy,
    pub time_slice: Option<TimeSlice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_is_least_important_level() {
        assert_eq!(
            usize::try_from(i16::from(IDLE_PRIORITY.0) + NUM_COOP_PRIORITIES as i16)
                .unwrap(),
            PRIORITY_LEVELS - 1,
        );
        assert!(HIGHEST_PRIORITY.is_cooperative());
    }

    #[test]
    fn default_policy_is_strict_without_slicing() {
        let c = SchedConfig::default();
        assert_eq!(c.preempt, PreemptPolicy::Strict);
        assert_eq!(c.time_slice, None);
    }
}
