//! Tick-based time keeping.
//!
//! Timestamps come straight from a free-running 32-bit hardware counter, so
//! every operation wraps. Differences are only meaningful while the two
//! instants are less than 2^31 ticks apart (~44 s at 48 MHz).

use core::ops::{Add, AddAssign, Sub};

/// Point in time, in timer ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamp(pub u32);

/// Signed tick difference between two [`Timestamp`]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeDelta(pub i32);

impl Timestamp {
    pub const fn ticks(self) -> u32 {
        self.0
    }

    /// `self - earlier`, wrapping.
    pub fn since(self, earlier: Timestamp) -> TimeDelta {
        TimeDelta(self.0.wrapping_sub(earlier.0) as i32)
    }

    /// True if `self` happened strictly before `other`.
    pub fn is_before(self, other: Timestamp) -> bool {
        other.since(self).0 > 0
    }
}

impl TimeDelta {
    pub const ZERO: TimeDelta = TimeDelta(0);

    pub const fn ticks(self) -> i32 {
        self.0
    }

    pub const fn abs(self) -> TimeDelta {
        TimeDelta(self.0.wrapping_abs())
    }

    pub const fn mul(self, n: i32) -> TimeDelta {
        TimeDelta(self.0.wrapping_mul(n))
    }

    pub const fn half(self) -> TimeDelta {
        TimeDelta(self.0 / 2)
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: TimeDelta) -> Timestamp {
        Timestamp(self.0.wrapping_add(rhs.0 as u32))
    }
}

impl AddAssign<TimeDelta> for Timestamp {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: TimeDelta) -> Timestamp {
        Timestamp(self.0.wrapping_sub(rhs.0 as u32))
    }
}

impl Sub for Timestamp {
    type Output = TimeDelta;

    fn sub(self, rhs: Timestamp) -> TimeDelta {
        self.since(rhs)
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;

    fn add(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(self.0.wrapping_sub(rhs.0))
    }
}
