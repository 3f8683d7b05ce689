//! Core fixed-point types for the chart services

use crate::constants::fixed_point::SCALE_4;
use crate::constants::time::{NANOS_PER_MILLI, NANOS_PER_SEC};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a traded instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub u32);

impl Symbol {
    /// Create a new Symbol with given ID
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SYM_{}", self.0)
    }
}

/// Price type (stored as i64 ticks for determinism, 4 decimal places)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Px(i64); // Internal: price in ticks (1 tick = 0.0001)

impl Px {
    /// Zero price
    pub const ZERO: Self = Self(0);

    /// Create from i64 ticks
    #[must_use]
    pub const fn from_i64(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Create from whole currency units
    #[must_use]
    pub const fn from_units(units: i64) -> Self {
        Self(units * SCALE_4)
    }

    /// Get price as i64 ticks
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// True for strictly positive prices
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Notional value of `units` traded at this price, in ticks x units.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub const fn checked_notional(self, units: u64) -> Option<Notional> {
        // SAFETY: both widen losslessly into i128
        let value = (self.0 as i128).checked_mul(units as i128);
        match value {
            Some(v) => Some(Notional(v)),
            None => None,
        }
    }
}

impl fmt::Display for Px {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / SCALE_4;
        let frac = (self.0 % SCALE_4).abs();
        if self.0 < 0 && whole == 0 {
            write!(f, "-{whole}.{frac:04}")
        } else {
            write!(f, "{whole}.{frac:04}")
        }
    }
}

/// Traded notional (price ticks x quantity units)
///
/// Wide enough that a single interval cannot realistically overflow it;
/// arithmetic is still checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Notional(i128);

impl Notional {
    /// Zero notional
    pub const ZERO: Self = Self(0);

    /// Create from raw ticks x units
    #[must_use]
    pub const fn from_raw(raw: i128) -> Self {
        Self(raw)
    }

    /// Raw ticks x units
    #[must_use]
    pub const fn raw(&self) -> i128 {
        self.0
    }

    /// Check if notional is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for Notional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = i128::from(SCALE_4);
        let whole = self.0 / scale;
        let frac = (self.0 % scale).abs();
        write!(f, "{whole}.{frac:04}")
    }
}

/// Timestamp in nanoseconds since UNIX epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ts(pub u64);

impl Ts {
    /// Get current timestamp
    #[must_use]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        // Use as_secs and subsec_nanos to avoid u128
        let nanos = duration.as_secs() * NANOS_PER_SEC + u64::from(duration.subsec_nanos());
        Self(nanos)
    }

    /// Create timestamp from nanoseconds
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create timestamp from whole seconds
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * NANOS_PER_SEC)
    }

    /// Get timestamp as nanoseconds
    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get timestamp as milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Get timestamp as whole seconds
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0 / NANOS_PER_SEC
    }
}

impl fmt::Display for Ts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}
