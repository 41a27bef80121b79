// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use std::env;

/// Environment variable holding the kernel's build-time configuration, as
/// TOML.
pub const KERNEL_CONFIG_VAR: &str = "RTK_KERNEL_CONFIG";

/// Exposes the CPU's M-profile architecture version. This isn't available in
/// rustc's standard environment.
///
/// This will set one of `cfg(armv6m`), `cfg(armv7m)`, or `cfg(armv8m)`
/// depending on the value of the `TARGET` environment variable. Targets that
/// aren't M-profile (the host, when running tests) get none of them, and the
/// kernel builds its simulated backend instead.
pub fn expose_m_profile() -> Result<()> {
    let target = env::var("TARGET")?;

    if let Some(cfg) = m_profile_for(&target) {
        println!("cargo::rustc-cfg={cfg}");
    }
    Ok(())
}

fn m_profile_for(target: &str) -> Option<&'static str> {
    if target.starts_with("thumbv6m") {
        Some("armv6m")
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        Some("armv7m")
    } else if target.starts_with("thumbv8m") {
        Some("armv8m")
    } else {
        None
    }
}

/// Pulls the kernel configuration for purposes of a build script. This will
/// fail if `RTK_KERNEL_CONFIG` is missing or can't parse.
///
/// `T` need not contain every field the configuration carries, only those
/// the caller cares about; so `deny_unknown_fields` should not be set on it.
pub fn kernel_config<T: DeserializeOwned>() -> Result<T> {
    println!("cargo::rerun-if-env-changed={KERNEL_CONFIG_VAR}");
    match env::var(KERNEL_CONFIG_VAR) {
        Ok(text) => parse_config(KERNEL_CONFIG_VAR, &text),
        Err(e) => bail!("${KERNEL_CONFIG_VAR}: {e}"),
    }
}

/// Equivalent to `kernel_config` but uses `T::default()` if the environment
/// variable is missing. If the environment variable fails to parse, this still
/// fails with `Err`.
pub fn kernel_config_or_default<T: DeserializeOwned + Default>() -> Result<T> {
    // We want to emit this whether or not the env var is present, so that we'll
    // be re-run if it becomes present.
    println!("cargo::rerun-if-env-changed={KERNEL_CONFIG_VAR}");

    match env::var(KERNEL_CONFIG_VAR) {
        Ok(text) => parse_config(KERNEL_CONFIG_VAR, &text),
        Err(_) => {
            println!("--- var ${KERNEL_CONFIG_VAR} not present, using default ---");
            Ok(T::default())
        }
    }
}

fn parse_config<T: DeserializeOwned>(var: &str, text: &str) -> Result<T> {
    println!("--- toml for ${var} ---");
    println!("{text}");
    Ok(toml::from_str(text)?)
}
