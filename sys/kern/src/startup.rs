// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.

use core::mem::MaybeUninit;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::kernel::Kernel;

/// Home of the kernel once it has started.
static mut KERNEL: MaybeUninit<Kernel<'static>> = MaybeUninit::uninit();

/// Tracks when a mutable reference to the kernel is floating around, to
/// prevent production of a second one. This forms a sort of ad-hoc Mutex
/// around `KERNEL`.
///
/// Notice that this begins life initialized to `true`. This prevents use of
/// `with_kernel` before the kernel is properly started. We set it to `false`
/// late in `start_kernel`.
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(true);

/// The main kernel entry point.
///
/// We expect an application to provide its own `main`-equivalent function,
/// which does basic hardware setup, builds a `Kernel` over its static tables
/// and spawns its threads, and then calls this function.
///
/// Parameters:
///
/// - `tick_divisor`: a platform-specific way of converting "machine ticks" into
///   "kernel ticks." On ARM M-profile, this is CPU cycles per tick, where a
///   tick is typically a millisecond.
/// - `kernel`: the kernel to run.
///
/// # Safety
///
/// This function has architecture-specific requirements for safe use -- on ARM,
/// for instance, it must be called from the main (interrupt) stack in
/// privileged mode.
///
/// This function may not be called reentrantly or from multiple cores.
pub unsafe fn start_kernel(tick_divisor: u32, mut kernel: Kernel<'static>) -> ! {
    // Set our clock frequency so debuggers can find it as needed
    arch::set_clock_freq(tick_divisor);

    let first = kernel.start();
    arch::apply_memory_protection(&kernel.threads()[first]);
    let save = kernel.threads()[first].save().clone();

    // Safety: `KERNEL_IN_USE` is still true, and the "only called once per
    // boot" contract means nobody else is writing here.
    unsafe {
        (*addr_of_mut!(KERNEL)).write(kernel);
    }
    KERNEL_IN_USE.store(false, Ordering::Release);

    arch::start_first_thread(tick_divisor, &save)
}

/// Runs `body` with a reference to the kernel, with kernel-visible interrupts
/// masked.
///
/// To preserve uniqueness of the `&mut` reference passed into `body`, this
/// function will detect any attempts to call it recursively and panic.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel<'static>) -> R) -> R {
    let key = arch::irq_lock();
    if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive use of with_kernel
    }
    // Safety: we have observed `KERNEL_IN_USE` being false, which means the
    // kernel is initialized (note that at reset it starts out true) and that
    // we're not already within a call to with_kernel. Thus, we can produce a
    // reference to it without aliasing.
    let k = unsafe { (*addr_of_mut!(KERNEL)).assume_init_mut() };

    let r = body(k);

    KERNEL_IN_USE.store(false, Ordering::Release);
    arch::irq_unlock(key);
    r
}
