// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Preemptive thread scheduler and context-switch engine.
//!
//! This is the portable core of a small real-time kernel: priority-based
//! preemptive scheduling with cooperative priority bands, wait queues with
//! timeouts, a handful of synchronization objects, and the machinery that
//! moves CPU state in and out of threads across traps.
//!
//! All kernel state lives in one [`Kernel`] value, which is passed by `&mut`
//! through every operation. On hardware it sits in a static behind
//! [`startup::with_kernel`]; on the host it is owned by the simulator in
//! `arch::sim`, which is how the test suite drives the real trap path.
//!
//! # Design principles
//!
//! 1. Static configuration. Table sizes and priority bands are fixed at build
//!    time (see `build.rs`); runtime policy is a small `SchedConfig`.
//! 2. A strong preference for safe code where reasonable. The only `unsafe`
//!    is in the architecture layer and in the static that holds the kernel.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms, except on the scheduling hot path, where the ready queue
//!    gives O(1) insert, remove and peek.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;
#[macro_use]
pub mod trace;

pub mod config;
pub mod err;
pub mod fail;
pub mod irq;
pub mod kernel;
pub mod profiling;
pub mod sched;
pub mod startup;
pub mod switch;
pub mod sync;
pub mod syscalls;
pub mod thread;
pub mod time;
pub mod timeout;
pub mod wait;

#[cfg(test)]
mod testutil;

pub use kernel::{Kernel, NextTask};
