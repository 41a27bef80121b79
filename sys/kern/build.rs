// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn main() -> Result<()> {
    build_util::expose_m_profile()?;

    let config: KernelConfig = build_util::kernel_config_or_default()?;
    config.check()?;
    generate_consts(&config)?;

    println!("cargo::rerun-if-changed=build.rs");
    Ok(())
}

/// Build-time kernel shape. Everything here ends up as a `const` in
/// `kconfig.rs`, because it sizes static tables.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct KernelConfig {
    /// Number of cooperative (negative) priority levels.
    coop_priorities: usize,
    /// Number of preemptible (zero and up) priority levels, including the one
    /// reserved for the idle thread.
    preempt_priorities: usize,
    ticks_per_second: u32,
    /// Capacity of each kernel fifo object, in words.
    fifo_depth: usize,
    /// Size of the interrupt action table. Must be a power of two.
    max_isrs: usize,
    /// Smallest stack, in bytes, a thread may be created with.
    min_stack_size: usize,
    /// Entries in the kernel trace ring.
    trace_depth: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            coop_priorities: 16,
            preempt_priorities: 15,
            ticks_per_second: 1000,
            fifo_depth: 8,
            max_isrs: 16,
            min_stack_size: 256,
            trace_depth: 32,
        }
    }
}

/// Largest number of levels the ready queue bitmap can track.
const MAX_PRIORITY_LEVELS: usize = 64;

/// Initial exception frame with FP state, plus the stack guard.
const SMALLEST_USABLE_STACK: usize = 104 + 32;

impl KernelConfig {
    fn check(&self) -> Result<()> {
        let levels = self.coop_priorities + self.preempt_priorities;
        if levels > MAX_PRIORITY_LEVELS {
            bail!(
                "{levels} priority levels configured, but at most \
                {MAX_PRIORITY_LEVELS} are supported"
            );
        }
        if self.coop_priorities > 128 {
            bail!("coop_priorities must fit in a negative i8");
        }
        if self.preempt_priorities < 2 || self.preempt_priorities > 127 {
            bail!(
                "preempt_priorities must be in 2..=127 (one level is \
                reserved for idle)"
            );
        }
        if self.ticks_per_second == 0 {
            bail!("ticks_per_second must be nonzero");
        }
        if self.fifo_depth == 0 {
            bail!("fifo_depth must be nonzero");
        }
        if !self.max_isrs.is_power_of_two() {
            bail!("max_isrs must be a power of two, not {}", self.max_isrs);
        }
        if self.min_stack_size < SMALLEST_USABLE_STACK
            || self.min_stack_size % 8 != 0
        {
            bail!(
                "min_stack_size must be a multiple of 8 and at least \
                {SMALLEST_USABLE_STACK}"
            );
        }
        if self.trace_depth == 0 {
            bail!("trace_depth must be nonzero");
        }
        Ok(())
    }
}

fn generate_consts(config: &KernelConfig) -> Result<()> {
    let out = &PathBuf::from(
        env::var_os("OUT_DIR").context("OUT_DIR not set by cargo")?,
    );
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(
        file,
        "pub const NUM_COOP_PRIORITIES: usize = {};",
        config.coop_priorities
    )?;
    writeln!(
        file,
        "pub const NUM_PREEMPT_PRIORITIES: usize = {};",
        config.preempt_priorities
    )?;
    writeln!(
        file,
        "pub const PRIORITY_LEVELS: usize = {};",
        config.coop_priorities + config.preempt_priorities
    )?;
    writeln!(
        file,
        "pub const TICKS_PER_SECOND: u32 = {};",
        config.ticks_per_second
    )?;
    writeln!(file, "pub const FIFO_DEPTH: usize = {};", config.fifo_depth)?;
    writeln!(file, "pub const MAX_ISRS: usize = {};", config.max_isrs)?;
    writeln!(
        file,
        "pub const MIN_STACK_SIZE: usize = {};",
        config.min_stack_size
    )?;
    writeln!(file, "pub const TRACE_DEPTH: usize = {};", config.trace_depth)?;

    Ok(())
}
