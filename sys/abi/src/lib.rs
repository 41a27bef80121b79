// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and threads.

#![cfg_attr(not(test), no_std)]

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

/// Names a particular incarnation of a thread.
///
/// A `ThreadId` combines two fields, a slot index in the kernel's thread table
/// and a generation number. The generation number is bumped every time a slot
/// is reused for a new thread, so an ID held across the death of the thread it
/// named will not silently refer to its successor.
///
/// The slot index is in the lower `ThreadId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u16);

impl ThreadId {
    /// Number of bits in a `ThreadId` used to represent the slot index, rather
    /// than generation number.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `ThreadId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ThreadId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        const MASK: u16 = 0xFFFF << ThreadId::INDEX_BITS >> ThreadId::INDEX_BITS;
        Generation(self.0.wrapping_add(1) & MASK as u8)
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Indicates priority of a thread.
///
/// Priorities are small signed numbers. Numerically lower priorities are more
/// important. Negative priorities are *cooperative*: a thread running at a
/// negative priority is never preempted by another thread, only by interrupts,
/// and keeps the CPU until it blocks or yields. Zero and above are
/// *preemptible*.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater /
/// less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub i8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Checks if `self` is at least as important as `other`.
    pub fn is_at_least(self, other: Self) -> bool {
        self.0 <= other.0
    }

    pub fn is_cooperative(self) -> bool {
        self.0 < 0
    }
}

/// Names a kernel synchronization object (semaphore, mutex, ...) by its slot
/// in the kernel object table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u16);

impl ObjectId {
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

/// How long a blocking operation is willing to wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Timeout {
    /// Fail immediately rather than block.
    NoWait,
    /// Block for at most this many ticks.
    Ticks(u32),
    /// Block until the operation can complete.
    Forever,
}

impl Timeout {
    const RAW_FOREVER: u32 = u32::MAX;

    /// Builds a tick timeout, treating zero ticks as `NoWait`.
    pub fn ticks(n: u32) -> Self {
        Self::from_raw(n)
    }

    /// Encodes this timeout into a single syscall argument register.
    pub fn to_raw(self) -> u32 {
        match self {
            Self::NoWait => 0,
            // A literal tick count of u32::MAX can't be distinguished from
            // Forever; we round it down by one.
            Self::Ticks(n) => n.min(Self::RAW_FOREVER - 1),
            Self::Forever => Self::RAW_FOREVER,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::NoWait,
            Self::RAW_FOREVER => Self::Forever,
            n => Self::Ticks(n),
        }
    }

    pub fn is_no_wait(self) -> bool {
        matches!(self, Self::NoWait | Self::Ticks(0))
    }
}

/// Why a blocked thread is blocked.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum WaitReason {
    /// Waiting on a kernel object's wait queue.
    Object(ObjectId),
    /// Sleeping until a deadline or an explicit wakeup.
    Sleep,
    /// Waiting for another thread to exit.
    Join(ThreadId),
}

/// State used to make scheduling decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum ThreadState {
    /// Created with a start delay of `Forever`, waiting for an explicit start.
    Prestart,
    /// On the ready queue.
    Ready,
    /// Currently executing. Exactly one thread is in this state once the
    /// kernel is running.
    Running,
    /// Blocked, for the given reason.
    Blocked(WaitReason),
    /// Suspended until resumed.
    Suspended,
    /// Exited or aborted. The slot may be reused.
    Dead,
}

impl ThreadState {
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        ThreadState::Dead
    }
}

/// A record describing a fault taken by a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The thread has violated memory access rules.
    MemoryAccess {
        /// Problematic address, if the processor reported one.
        address: Option<u32>,
    },
    /// A thread has overflowed its stack into the guard region.
    StackOverflow { address: u32 },
    /// A thread has induced a bus error
    BusError { address: Option<u32> },
    /// Divide-by-zero
    DivideByZero,
    /// Attempt to execute non-executable memory
    IllegalText,
    /// Execution of an illegal instruction
    IllegalInstruction,
    /// Other invalid operation, with 32-bit code. On ARMv7/8-M the code is the
    /// bits of the Configurable Fault Status Register.
    InvalidOperation(u32),
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a thread used a syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A program used an undefined syscall number.
    BadSyscallNumber,
    /// A program named a thread ID whose slot does not exist.
    ThreadOutOfRange,
    /// A program named an object ID whose slot does not exist.
    ObjectOutOfRange,
    /// A program used an object as something it is not (say, giving a mutex
    /// as if it were a semaphore).
    WrongObjectKind,
    /// A program named an interrupt line the controller doesn't have.
    NoIrq,
    /// An argument was out of range for the operation (an unknown IRQ op, a
    /// priority outside the configured bands, and the like).
    BadArgument,
}

/// Error numbers returned by kernel operations.
///
/// These are carried through the syscall ABI as negative `i32`s, so a result
/// of zero or more always means success.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, ToPrimitive, Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum Errno {
    /// Caller does not own the resource (e.g. unlocking someone else's mutex)
    /// or the operation is not permitted in this state.
    Perm = -1,
    /// The named thread no longer exists.
    NoThread = -3,
    /// A blocking operation timed out.
    Again = -11,
    /// No free slot or buffer space.
    NoMem = -12,
    /// The resource is unavailable and the caller asked not to wait.
    Busy = -16,
    /// Invalid argument, or blocking from a context that can't block.
    Inval = -22,
    /// The operation would deadlock (e.g. joining yourself).
    Deadlock = -35,
    /// The wait was cancelled before it could complete.
    Canceled = -125,
}

impl Errno {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Interprets a raw result word, returning `Ok` for non-negative values.
    pub fn check(raw: u32) -> Result<u32, Errno> {
        let code = raw as i32;
        if code >= 0 {
            Ok(raw)
        } else {
            // An unknown negative code is a kernel/userlib mismatch; report
            // it as the most generic failure rather than inventing one.
            Err(Errno::from_i32(code).unwrap_or(Errno::Inval))
        }
    }
}

bitflags::bitflags! {
    /// Creation-time thread attributes.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct ThreadFlags: u32 {
        /// A fault in this thread takes the whole system down, rather than
        /// just the thread.
        const ESSENTIAL = 1 << 0;
        /// The thread starts with floating point context enabled, so its
        /// first switch-in restores an extended frame.
        const USES_FPU = 1 << 1;
    }

    /// Status of an interrupt line, as reported by the controller.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct IrqStatus: u32 {
        const ENABLED = 1 << 0;
        const PENDING = 1 << 1;
    }
}

/// Operations accepted by the `IrqControl` syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum IrqOp {
    Disable = 0,
    Enable = 1,
    Trigger = 2,
    ClearPending = 3,
    /// Sets the line's hardware priority from the third argument.
    SetPriority = 4,
}

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Sysnum {
    Yield = 0,
    Sleep = 1,
    Wakeup = 2,
    Suspend = 3,
    Resume = 4,
    Abort = 5,
    Join = 6,
    Start = 7,
    PrioritySet = 8,
    PriorityGet = 9,
    SchedLock = 10,
    SchedUnlock = 11,
    CurrentId = 12,
    Uptime = 13,
    SemTake = 14,
    SemGive = 15,
    SemReset = 16,
    SemCount = 17,
    MutexLock = 18,
    MutexUnlock = 19,
    CondWait = 20,
    CondSignal = 21,
    CondBroadcast = 22,
    FifoPut = 23,
    FifoGet = 24,
    FifoCancelWait = 25,
    WaitqPend = 26,
    WaitqWakeOne = 27,
    WaitqWakeAll = 28,
    IrqControl = 29,
    IrqStatus = 30,
    Exit = 31,
}

impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        Self::from_u32(x).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn thread_id_packs_index_and_generation() {
        let id = ThreadId::for_index_and_gen(37, Generation::from(5));
        assert_eq!(id.index(), 37);
        assert_eq!(id.generation(), Generation::from(5));
    }

    #[test]
    fn generation_wraps_within_its_bits() {
        let mut g = Generation::ZERO;
        for _ in 0..64 {
            g = g.next();
        }
        assert_eq!(g, Generation::ZERO, "6-bit generation should wrap at 64");
    }

    #[test]
    fn cooperative_priorities_are_negative() {
        assert!(Priority(-1).is_cooperative());
        assert!(!Priority(0).is_cooperative());
        assert!(Priority(-3).is_more_important_than(Priority(2)));
        assert!(!Priority(2).is_more_important_than(Priority(2)));
        assert!(Priority(2).is_at_least(Priority(2)));
    }

    #[test]
    fn timeout_sentinels() {
        assert_eq!(Timeout::from_raw(0), Timeout::NoWait);
        assert_eq!(Timeout::from_raw(u32::MAX), Timeout::Forever);
        assert_eq!(Timeout::ticks(100), Timeout::Ticks(100));
        assert_eq!(Timeout::Ticks(u32::MAX).to_raw(), u32::MAX - 1);
        assert!(Timeout::Ticks(0).is_no_wait());
    }

    #[test]
    fn errno_check_splits_on_sign() {
        assert_eq!(Errno::check(7), Ok(7));
        assert_eq!(Errno::check(Errno::Again.code() as u32), Err(Errno::Again));
        assert_eq!(Errno::check(-9999i32 as u32), Err(Errno::Inval));
    }

    #[test]
    fn sysnum_rejects_unknown_numbers() {
        assert_eq!(Sysnum::try_from(14), Ok(Sysnum::SemTake));
        assert_eq!(Sysnum::try_from(31), Ok(Sysnum::Exit));
        assert_eq!(Sysnum::try_from(32), Err(()));
    }

    proptest! {
        #[test]
        fn timeout_raw_encoding_is_stable(raw in any::<u32>()) {
            prop_assert_eq!(Timeout::from_raw(raw).to_raw(), raw);
        }
    }
}
