// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation.
///
/// This is measured in ticks since boot; see `config::TICKS_PER_SECOND`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// The moment `ticks` after this one.
    pub fn after(self, ticks: u32) -> Self {
        Self(self.0.saturating_add(u64::from(ticks)))
    }

    /// Ticks from `self` until `later`, or zero if `later` has passed.
    pub fn ticks_until(self, later: Self) -> u64 {
        later.0.saturating_sub(self.0)
    }

    pub(crate) fn advance(&mut self) {
        // A u64 of ticks doesn't wrap within the life of any hardware we will
        // run on; reaching the end means the counter was corrupted.
        self.0 = self.0.wrapping_add(1);
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self::from(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

impl From<Timestamp> for [u32; 2] {
    fn from(v: Timestamp) -> Self {
        [v.0 as u32, (v.0 >> 32) as u32]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_words_round_trip() {
        let t = Timestamp::from(0x1234_5678_9abc_def0);
        let words: [u32; 2] = t.into();
        assert_eq!(words, [0x9abc_def0, 0x1234_5678]);
        assert_eq!(Timestamp::from(words), t);
    }

    #[test]
    fn ticks_until_saturates() {
        let t = Timestamp::from(10);
        assert_eq!(t.ticks_until(t.after(5)), 5);
        assert_eq!(t.after(5).ticks_until(t), 0);
    }
}
