//! RAM quantities.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// An amount of RAM in whole megabytes (1 GB = 1024 MB).
///
/// Integer units keep every capacity invariant exact. Fractional GB values
/// such as script costs of 1.75 GB convert exactly.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ram(u64);

impl Ram {
    /// No RAM.
    pub const ZERO: Self = Self(0);

    /// Megabytes per gigabyte.
    pub const MB_PER_GB: u64 = 1024;

    /// Creates a quantity from megabytes.
    #[must_use]
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb)
    }

    /// Creates a quantity from whole gigabytes.
    #[must_use]
    pub const fn from_gb(gb: u64) -> Self {
        Self(gb * Self::MB_PER_GB)
    }

    /// Creates a quantity from fractional gigabytes, rounding to the nearest
    /// megabyte. Negative and non-finite inputs become zero.
    #[must_use]
    pub fn from_gb_f64(gb: f64) -> Self {
        if !gb.is_finite() || gb <= 0.0 {
            return Self::ZERO;
        }
        Self((gb * Self::MB_PER_GB as f64).round() as u64)
    }

    /// Returns the quantity in megabytes.
    #[must_use]
    pub const fn as_mb(&self) -> u64 {
        self.0
    }

    /// Returns the quantity in gigabytes.
    #[must_use]
    pub fn as_gb(&self) -> f64 {
        self.0 as f64 / Self::MB_PER_GB as f64
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[must_use]
    pub const fn checked_sub(self, rhs: Self) -> Option<Self> {
        match self.0.checked_sub(rhs.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `count` copies of this quantity, saturating at `u64::MAX` MB.
    #[must_use]
    pub const fn times(self, count: u64) -> Self {
        Self(self.0.saturating_mul(count))
    }

    /// How many whole `chunk`s fit in this quantity. Zero for a zero chunk.
    #[must_use]
    pub const fn chunks_of(self, chunk: Self) -> u64 {
        if chunk.0 == 0 {
            0
        } else {
            self.0 / chunk.0
        }
    }

    /// Smallest number of `chunk`s whose total is at least this quantity.
    #[must_use]
    pub const fn chunks_covering(self, chunk: Self) -> u64 {
        if chunk.0 == 0 {
            0
        } else {
            self.0.div_ceil(chunk.0)
        }
    }
}

impl Add for Ram {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Ram {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Ram {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Ram> for Ram {
    fn sum<I: Iterator<Item = &'a Ram>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl fmt::Display for Ram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}GB", self.as_gb())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fractional_gb_is_exact() {
        assert_eq!(Ram::from_gb_f64(1.75).as_mb(), 1792);
        assert_eq!(Ram::from_gb_f64(1.7).as_mb(), 1741);
        assert_eq!(Ram::from_gb_f64(-3.0), Ram::ZERO);
        assert_eq!(Ram::from_gb_f64(f64::NAN), Ram::ZERO);
    }

    #[test]
    fn test_chunk_math() {
        let free = Ram::from_gb(10);
        assert_eq!(free.chunks_of(Ram::from_gb(3)), 3);
        assert_eq!(free.chunks_covering(Ram::from_gb(3)), 4);
        assert_eq!(free.chunks_of(Ram::ZERO), 0);
        assert_eq!(Ram::ZERO.chunks_covering(Ram::from_gb(3)), 0);
    }

    #[test]
    fn test_sum_and_display() {
        let total: Ram = [Ram::from_gb(1), Ram::from_mb(512)].iter().sum();
        assert_eq!(total.to_string(), "1.50GB");
        assert_eq!(serde_json::to_string(&total).unwrap(), "1536");
    }
}
