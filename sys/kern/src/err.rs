// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate that
//! concern using `Result`.

use abi::{Errno, FaultInfo, UsageError};

use crate::kernel::NextTask;

/// An error committed by user code when interacting with a kernel operation.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error. Recoverable errors are indicated to the errant
    /// thread by returning a negative error number. They may still cause a
    /// context switch, however, as indicated by the `NextTask`.
    Recoverable(Errno, NextTask),
    /// An unrecoverable error. Unrecoverable errors are translated to faults
    /// against the errant thread, which is aborted.
    Unrecoverable(FaultInfo),
}

/// Convenience conversion from `Errno`, for errors that don't switch.
impl From<Errno> for UserError {
    fn from(e: Errno) -> Self {
        Self::Recoverable(e, NextTask::Same)
    }
}

/// Convenience conversion from `FaultInfo`.
impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from `UsageError` (by way of `FaultInfo`).
impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}

/// Problems with the shape of a thread or kernel being set up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// Priority outside the configured bands, or the idle priority.
    InvalidPriority,
    /// Stack smaller than `config::MIN_STACK_SIZE`.
    StackTooSmall,
    /// Stack base not aligned to `arch::STACK_ALIGN`.
    StackMisaligned,
    /// Every thread slot is in use.
    NoFreeSlot,
    /// A table handed to `Kernel::new` is empty or has more entries than ids
    /// can name.
    BadTableSize,
    /// Time slice of zero ticks, or a slice ceiling outside the bands.
    InvalidTimeSlice,
}

impl From<ConfigError> for Errno {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::NoFreeSlot => Errno::NoMem,
            _ => Errno::Inval,
        }
    }
}

impl From<ConfigError> for UserError {
    fn from(e: ConfigError) -> Self {
        Errno::from(e).into()
    }
}
