// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names: `SavedState`, `STACK_ALIGN`, `STACK_GUARD`, `reinitialize`,
//! `apply_memory_protection`, `idle_main`, `irq_lock`/`irq_unlock`,
//! `start_first_thread`, and the `klog!` and `uassert!` macros.
//!
//! On anything that isn't an M-profile ARM, the kernel is built against a
//! simulated CPU so that the scheduler can be exercised on a development host.

pub use crate::thread::ArchState;

mod m_frame;

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        #[macro_use]
        pub mod sim;
        pub use sim::*;
    }
}
