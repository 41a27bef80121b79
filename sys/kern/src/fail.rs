// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fatal error handling, and support for recording kernel crashes such that
//! they can be found by tooling.
//!
//! A fatal error attributed to an ordinary thread costs that thread its life
//! and nothing more. One raised in interrupt context, or by an essential
//! thread, or by idle, takes the system down through `die`.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is cleared to zero
//!   (false) before entry to kernel main, and set to one (true) if the kernel
//!   reaches the `die` function (either explicitly or as a result of a
//!   `panic!`). If it contains any other value, the kernel has either not yet
//!   booted, or has corrupted memory on the way down.
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine writes
//!   as much of the failure reason into this buffer (as UTF-8) as possible,
//!   truncating if the buffer fills. The number of bytes written isn't recorded
//!   anywhere; instead, for printing, trim off any trailing NUL bytes.

use core::fmt::{self, Display, Write};
use core::sync::atomic::{AtomicPtr, Ordering};

use abi::{FaultInfo, ThreadId};

use crate::kernel::{Kernel, NextTask, IDLE_INDEX};
use crate::trace::Trace;

/// Why the kernel gave up on a thread, or on everything.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FatalReason {
    /// A thread's saved stack pointer ran into its guard area or off its
    /// stack.
    StackOverflow,
    /// A thread faulted, either in hardware or by misusing a syscall.
    ThreadFault(FaultInfo),
    /// The kernel itself faulted or found its state inconsistent. The word is
    /// architecture-specific detail.
    KernelOops(u32),
    /// An interrupt fired with nothing connected to it.
    SpuriousIrq(u32),
    /// An essential thread exited or was aborted.
    EssentialExit,
}

impl Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => f.write_str("stack overflow"),
            Self::ThreadFault(info) => write!(f, "thread fault: {info:?}"),
            Self::KernelOops(code) => write!(f, "kernel oops {code:#x}"),
            Self::SpuriousIrq(irq) => write!(f, "spurious irq {irq}"),
            Self::EssentialExit => f.write_str("essential thread exited"),
        }
    }
}

/// What was running when a fatal error was raised.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Culprit {
    Isr,
    Thread(usize),
}

/// Board hook run on every fatal error, before the kernel acts on it.
///
/// The thread id is `None` for errors raised in interrupt context.
pub struct FatalHook {
    pub notify: fn(&FatalReason, Option<ThreadId>),
}

/// Installs a fatal error hook. Like the profiling table, this is expected to
/// be set once at startup.
pub fn configure_fatal_hook(hook: &'static FatalHook) {
    FATAL_HOOK.store(hook as *const _ as *mut _, Ordering::Relaxed);
}

static FATAL_HOOK: AtomicPtr<FatalHook> = AtomicPtr::new(core::ptr::null_mut());

fn hook() -> Option<&'static FatalHook> {
    let p = FATAL_HOOK.load(Ordering::Relaxed);
    // Only ever stored from a `&'static`.
    unsafe { p.as_ref() }
}

/// Handles a fatal error raised against `culprit`.
///
/// Returns the scheduling consequence when only a thread dies; does not
/// return when the system does.
pub fn fatal_error(
    k: &mut Kernel<'_>,
    reason: FatalReason,
    culprit: Culprit,
) -> NextTask {
    let tid = match culprit {
        Culprit::Thread(i) => Some(k.thread_id(i)),
        Culprit::Isr => None,
    };
    if let Some(h) = hook() {
        (h.notify)(&reason, tid);
    }
    kern_trace!(k, Trace::Fatal(reason));
    klog!("fatal: {} in {:?}", reason, culprit);

    match culprit {
        Culprit::Thread(i) if i != IDLE_INDEX && !k.threads[i].is_essential() => {
            k.abort_index(i)
        }
        _ => die(reason),
    }
}

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of
/// the event that caused the kernel to fail, padded with NULs.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: we only access this function from this one site, and only zero
    // or one times in practice -- and never from a context where concurrency
    // or interrupts are enabled.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Recursive failure. Panicking again would only make it worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only one execution of this function gets past the flag.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// On the host there is no debugger to leave an epitaph for; the test
/// harness sees a panic carrying the same text.
#[cfg(not(target_os = "none"))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let mut buf = [0; EPITAPH_LEN];
    let mut writer = Eulogist { dest: &mut buf };
    write!(writer, "{msg}").ok();
    let len = buf.iter().position(|&b| b == 0).unwrap_or(EPITAPH_LEN);
    panic!("kernel died: {}", String::from_utf8_lossy(&buf[..len]));
}

/// Writes into a fixed buffer, dropping whatever doesn't fit.
struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
