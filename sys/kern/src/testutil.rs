// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures shared by the unit tests.
//!
//! Tables and stacks are leaked so that they satisfy the `'static` bounds the
//! kernel puts on them. Tests are short-lived processes; nobody misses them.

use abi::{Priority, ThreadFlags, Timeout};
use zerocopy::IntoBytes;

pub use crate::arch::Sim;
use crate::config::SchedConfig;
use crate::kernel::Kernel;
use crate::sync::Object;
use crate::thread::{Thread, ThreadSpec};

extern "C" fn body(_: u32, _: u32, _: u32) {}

/// A 512-byte, 8-aligned stack.
pub fn stack() -> &'static mut [u8] {
    stack_words(64)
}

/// A stack of `n` doubleword slots.
pub fn stack_words(n: usize) -> &'static mut [u8] {
    Box::leak(vec![0u64; n].into_boxed_slice()).as_mut_bytes()
}

/// A thread at priority `prio` that is ready as soon as it's spawned.
pub fn spec(prio: i8) -> ThreadSpec {
    ThreadSpec {
        entry: body,
        args: [0; 3],
        stack: stack(),
        priority: Priority(prio),
        flags: ThreadFlags::empty(),
        delay: Timeout::NoWait,
    }
}

/// A kernel with room for `n` threads (idle included) and eight objects.
pub fn kernel(n: usize) -> Kernel<'static> {
    kernel_with(n, SchedConfig::default())
}

pub fn kernel_with(n: usize, config: SchedConfig) -> Kernel<'static> {
    kernel_with_objects(n, 8, config)
}

pub fn kernel_with_objects(
    n: usize,
    n_objects: usize,
    config: SchedConfig,
) -> Kernel<'static> {
    let threads: &'static mut [Thread] =
        Box::leak((0..n).map(|_| Thread::default()).collect());
    let objects: &'static mut [Object] =
        Box::leak((0..n_objects).map(|_| Object::free()).collect());
    match Kernel::new(threads, objects, stack(), config) {
        Ok(k) => k,
        Err(e) => panic!("test kernel rejected: {e:?}"),
    }
}
