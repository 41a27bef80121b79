// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscalls on a development host, where there is no kernel to trap into.

use std::cell::RefCell;

use abi::Sysnum;

type TrapHook = Box<dyn FnMut(Sysnum, &mut [u32; 4])>;

thread_local! {
    static HOOK: RefCell<Option<TrapHook>> = const { RefCell::new(None) };
}

/// Routes this host thread's syscalls to `hook`.
///
/// The hook sees the syscall number and the four argument words, and
/// replaces the first three with the status, data and high data words.
pub fn set_trap_hook(hook: impl FnMut(Sysnum, &mut [u32; 4]) + 'static) {
    HOOK.with(|h| *h.borrow_mut() = Some(Box::new(hook)));
}

pub fn clear_trap_hook() {
    HOOK.with(|h| *h.borrow_mut() = None);
}

pub(crate) fn trap(nr: Sysnum, regs: &mut [u32; 4]) {
    HOOK.with(|h| match h.borrow_mut().as_mut() {
        Some(hook) => hook(nr, regs),
        None => panic!("{nr:?} syscall with no trap hook installed"),
    })
}
