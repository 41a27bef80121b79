// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ARMv7-M/ARMv8-M exception frame, and the fake one a new thread starts
//! from.
//!
//! This is plain data manipulation on a byte slice, so it is shared between
//! the real backend and the simulator, and tested on the host.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::err::ConfigError;

/// Registers stacked by hardware on exception entry.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct BaseExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// Frame stacked when the interrupted code had live floating point state.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ExtendedExceptionFrame {
    pub base: BaseExceptionFrame,
    pub fpu_regs: [u32; 16],
    pub fpscr: u32,
    pub reserved: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<BaseExceptionFrame>(), 32);
static_assertions::const_assert_eq!(core::mem::size_of::<ExtendedExceptionFrame>(), 104);

/// Return to thread mode, process stack, with an extended frame.
pub const EXC_RETURN_FP: u32 = 0xFFFF_FFED;
/// Return to thread mode, process stack, with a basic frame.
pub const EXC_RETURN_NO_FP: u32 = 0xFFFF_FFFD;

/// Exception priorities; lower is more urgent.
///
/// BASEPRI while the kernel is locked. Masks every interrupt that can touch
/// kernel state.
pub const KERNEL_LOCK_PRIORITY: u8 = 0x80;
/// Most urgent priority a device interrupt may be given.
pub const MOST_URGENT_IRQ_PRIORITY: u8 = KERNEL_LOCK_PRIORITY;
/// PendSV, SysTick and device interrupts start out here.
pub const LEAST_URGENT_PRIORITY: u8 = 0xFF;

/// xPSR with only the Thumb bit set.
pub const INITIAL_PSR: u32 = 1 << 24;

/// Written over a fresh stack, so that how deep it ever got can be read back
/// later.
pub const STACK_FILL: u32 = 0xbadd_cafe;

/// What goes into a new thread's first frame.
#[derive(Copy, Clone, Debug)]
pub struct InitialFrame {
    /// Thread body address; lands in `r0` for the trampoline.
    pub entry: u32,
    /// Arguments for the body, in `r1`-`r3`.
    pub args: [u32; 3],
    /// Where the thread starts executing.
    pub trampoline: u32,
}

/// Fills `stack` and writes an exception frame at its top such that an
/// exception return into it starts the thread at the trampoline.
///
/// `stack` must start at a real address; the frame's location is computed
/// from where the slice lives, because the hardware cares about 8-byte
/// alignment of the actual stack pointer. Returns the initial stack pointer.
pub fn write_initial_frame(
    stack: &mut [u8],
    init: &InitialFrame,
    fp: bool,
    guard: usize,
) -> Result<usize, ConfigError> {
    for word in stack.chunks_exact_mut(4) {
        word.copy_from_slice(&STACK_FILL.to_le_bytes());
    }

    let base = stack.as_ptr() as usize;
    let top = (base + stack.len()) & !7;
    let frame_size = if fp {
        core::mem::size_of::<ExtendedExceptionFrame>()
    } else {
        core::mem::size_of::<BaseExceptionFrame>()
    };
    let sp = top
        .checked_sub(frame_size)
        .filter(|&sp| sp >= base + guard)
        .ok_or(ConfigError::StackTooSmall)?;

    let frame_base = BaseExceptionFrame {
        r0: init.entry,
        r1: init.args[0],
        r2: init.args[1],
        r3: init.args[2],
        r12: 0,
        // Returning from the trampoline is a bug; make it fault.
        lr: 0xFFFF_FFFF,
        // The trampoline is Thumb code.
        pc: init.trampoline | 1,
        xpsr: INITIAL_PSR,
    };
    let at = sp - base;
    if fp {
        let frame = ExtendedExceptionFrame {
            base: frame_base,
            ..ExtendedExceptionFrame::default()
        };
        stack[at..at + frame_size].copy_from_slice(frame.as_bytes());
    } else {
        stack[at..at + frame_size].copy_from_slice(frame_base.as_bytes());
    }
    Ok(sp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> Vec<u64> {
        vec![0u64; n]
    }

    const INIT: InitialFrame = InitialFrame {
        entry: 0x0800_1234,
        args: [1, 2, 3],
        trampoline: 0x0800_4000,
    };

    #[test]
    fn base_frame_sits_at_aligned_top() {
        let mut buf = words(32);
        let stack = buf.as_mut_bytes();
        let base = stack.as_ptr() as usize;
        let sp = write_initial_frame(stack, &INIT, false, 32).unwrap();
        assert_eq!(sp, base + 256 - 32);
        assert_eq!(sp % 8, 0);

        let (frame, _) =
            BaseExceptionFrame::read_from_prefix(&stack[sp - base..]).unwrap();
        assert_eq!(frame.r0, INIT.entry);
        assert_eq!([frame.r1, frame.r2, frame.r3], INIT.args);
        assert_eq!(frame.pc, 0x0800_4001);
        assert_eq!(frame.xpsr, INITIAL_PSR);
        assert_eq!(frame.lr, 0xFFFF_FFFF);

        // Below the frame, the fill pattern.
        assert_eq!(&stack[..4], &STACK_FILL.to_le_bytes());
    }

    #[test]
    fn extended_frame_has_clean_fp_state() {
        let mut buf = words(32);
        let stack = buf.as_mut_bytes();
        let base = stack.as_ptr() as usize;
        let sp = write_initial_frame(stack, &INIT, true, 32).unwrap();
        assert_eq!(sp, base + 256 - 104);
        let (frame, _) =
            ExtendedExceptionFrame::read_from_prefix(&stack[sp - base..]).unwrap();
        assert_eq!(frame.fpu_regs, [0; 16]);
        assert_eq!(frame.fpscr, 0);
        assert_eq!(frame.base.r0, INIT.entry);
    }

    #[test]
    fn unaligned_length_is_rounded_down() {
        let mut buf = words(32);
        let stack = &mut buf.as_mut_bytes()[..252];
        let base = stack.as_ptr() as usize;
        let sp = write_initial_frame(stack, &INIT, false, 32).unwrap();
        assert_eq!(sp, base + 248 - 32);
    }

    #[test]
    fn frame_must_clear_the_guard() {
        let mut buf = words(16);
        let stack = buf.as_mut_bytes();
        assert_eq!(
            write_initial_frame(stack, &INIT, true, 32),
            Err(ConfigError::StackTooSmall)
        );
        assert!(write_initial_frame(stack, &INIT, false, 32).is_ok());
    }
}
