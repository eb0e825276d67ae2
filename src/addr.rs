//! Addresses inside a target process
//!
//! An [`Addr`] is always 64 bits wide, no matter whether the inspecting or
//! the inspected process is 32- or 64-bit. The all-ones value is reserved as
//! the definitely-invalid sentinel, see [`Addr::INVALID`].

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::Serialize;

#[derive(Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Addr(u64);

impl Addr {
    /// Reserved sentinel for "definitely not a valid address"
    pub const INVALID: Addr = Addr(u64::MAX);
    /// The zero address, invalid as a frame pointer
    pub const NULL: Addr = Addr(0);

    #[must_use]
    pub fn u64(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn usize(&self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Whether this address is a multiple of `align` (which must be a power
    /// of two)
    #[must_use]
    pub fn is_aligned(&self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// Addition that saturates into [`Addr::INVALID`] instead of wrapping
    #[must_use]
    pub fn checked_add(&self, rhs: u64) -> Addr {
        match self.0.checked_add(rhs) {
            Some(v) => Addr(v),
            None => Addr::INVALID,
        }
    }

    /// Offsets a link-time address by a signed slide
    #[must_use]
    pub fn slid(&self, slide: i64) -> Addr {
        Addr(self.0.wrapping_add(slide as u64))
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", { self.0 })
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl Add<u64> for Addr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for Addr {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for Addr {
    type Output = u64;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Sub<u64> for Addr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl SubAssign<u64> for Addr {
    fn sub_assign(&mut self, rhs: u64) {
        self.0 -= rhs;
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value)
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Addr(value as u64)
    }
}

impl From<Addr> for u64 {
    fn from(value: Addr) -> Self {
        value.0
    }
}
