//! Time-related types and wraparound-safe timestamp arithmetic
//!
//! UWB radios timestamp frames with a free-running 40-bit counter that ticks
//! at 499.2 MHz × 128 (one "device time unit", or DTU, is about 15.65 ps). The
//! counter wraps roughly every 17.2 seconds. Ranging frames often only carry
//! the lower 32 bits of those timestamps, which wrap about every 67 ms.
//!
//! Because of that, timestamps must never be compared or subtracted as plain
//! integers. Every difference in this crate goes through [`elapsed32`],
//! [`elapsed40`] or [`Instant::duration_since`], which compute the difference
//! modulo 2^W.
//!
//! Many protocol quantities (periods, delays, timeouts) are configured in
//! "UWB microseconds" (UUS). One UUS is 0x10000 DTU, which is slightly longer
//! than a real microsecond (1 UUS ≈ 1.0256 µs).
//!
//! [`elapsed32`]: fn.elapsed32.html
//! [`elapsed40`]: fn.elapsed40.html
//! [`Instant::duration_since`]: struct.Instant.html#method.duration_since

use core::ops::{Add, Sub};

use fixed::types::U48F16;
use serde::{Deserialize, Serialize};

/// The maximum value of 40-bit system time stamps.
pub const TIME_MAX: u64 = 0xff_ffff_ffff;

/// Mask selecting the 40 bits of a full device timestamp
pub const MASK40: u64 = TIME_MAX;

/// Mask selecting the 32 bits carried in ranging frames
pub const MASK32: u64 = 0xffff_ffff;

/// Number of bits a UUS value is shifted to become a DTU value
pub const UUS_SHIFT: u32 = 16;

/// Device time unit frequency in Hz
pub const DTU_FREQ_HZ: f64 = 499.2e6 * 128.0;

/// Duration of one device time unit in seconds
pub const DTU_PERIOD_S: f64 = 1.0 / DTU_FREQ_HZ;

/// Real microseconds per UUS
const USECS_PER_UUS: f64 = 65536.0 / 63897.6;

/// Returns `later - earlier` modulo 2^32
///
/// `earlier` and `later` must lie within one wrap period of each other. This
/// is not checked: the counter has no way of telling how often it wrapped.
///
/// # Example
///
/// ``` rust
/// use uwb_core::time::elapsed32;
///
/// assert_eq!(elapsed32(10, 25), 15);
/// assert_eq!(elapsed32(0xffff_fff0, 0x10), 0x20);
/// ```
pub fn elapsed32(earlier: u32, later: u32) -> u32 {
    later.wrapping_sub(earlier)
}

/// Returns `later - earlier` modulo 2^40
///
/// Both arguments are masked to 40 bits first, so callers can pass raw
/// register values that carry junk in the upper bits.
///
/// # Example
///
/// ``` rust
/// use uwb_core::time::{elapsed40, TIME_MAX};
///
/// assert_eq!(elapsed40(TIME_MAX - 49, 50), 100);
/// ```
pub fn elapsed40(earlier: u64, later: u64) -> u64 {
    (later & MASK40).wrapping_sub(earlier & MASK40) & MASK40
}

/// Converts UUS to DTU
pub fn uus_to_dtu(uus: u64) -> u64 {
    uus << UUS_SHIFT
}

/// Converts DTU to fixed-point UUS, keeping the sub-UUS fraction
///
/// # Example
///
/// ``` rust
/// use uwb_core::time::dtu_to_uus;
///
/// let uus = dtu_to_uus(0x18000);
/// assert_eq!(uus.to_num::<f64>(), 1.5);
/// ```
pub fn dtu_to_uus(dtu: u64) -> U48F16 {
    U48F16::from_bits(dtu)
}

/// Converts UUS to real microseconds
pub fn dwt_usecs_to_usecs(uus: f64) -> f64 {
    uus * USECS_PER_UUS
}

/// Converts real microseconds to UUS
pub fn usecs_to_dwt_usecs(usecs: f64) -> f64 {
    usecs / USECS_PER_UUS
}

/// Represents an instant in device time
///
/// Internally uses the same 40-bit timestamps that the radio uses.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(C)]
pub struct Instant(u64);

impl Instant {
    /// Creates a new instance of `Instant`
    ///
    /// The given value must fit in a 40-bit timestamp, so:
    /// 0 <= `value` <= 2^40 - 1
    ///
    /// Returns `Some(...)`, if `value` is within the valid range, `None` if it
    /// isn't.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use uwb_core::time::{
    ///     TIME_MAX,
    ///     Instant,
    /// };
    ///
    /// let valid_instant   = Instant::new(TIME_MAX);
    /// let invalid_instant = Instant::new(TIME_MAX + 1);
    ///
    /// assert!(valid_instant.is_some());
    /// assert!(invalid_instant.is_none());
    /// ```
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Instant(value))
        } else {
            None
        }
    }

    /// Creates an `Instant` from a raw register value, dropping the upper bits
    pub fn from_masked(value: u64) -> Self {
        Instant(value & MASK40)
    }

    /// Returns the raw 40-bit timestamp
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the lower 32 bits, as carried in ranging frames
    pub fn lo32(&self) -> u32 {
        (self.0 & MASK32) as u32
    }

    /// Returns the amount of time passed between the two `Instant`s
    ///
    /// Assumes that `&self` represents a later time than the argument
    /// `earlier`. Timestamps wrap, so comparing their numerical values says
    /// nothing about order.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use uwb_core::time::{
    ///     TIME_MAX,
    ///     Instant,
    /// };
    ///
    /// let instant_1 = Instant::new(TIME_MAX - 50).unwrap();
    /// let instant_2 = Instant::new(TIME_MAX).unwrap();
    /// let instant_3 = Instant::new(49).unwrap();
    ///
    /// assert_eq!(instant_2.duration_since(instant_1).value(), 50);
    /// assert_eq!(instant_3.duration_since(instant_2).value(), 50);
    /// ```
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(elapsed40(earlier.0, self.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        // Both operands hold 40-bit values, so the sum fits easily in a u64.
        Instant((self.0 + rhs.0) & MASK40)
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Instant(self.0.wrapping_sub(rhs.0) & MASK40)
    }
}

/// A duration between two instants in device time
///
/// Internally uses the same 40-bit timestamps that the radio uses.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(C)]
pub struct Duration(u64);

impl Duration {
    /// Creates a new instance of `Duration`
    ///
    /// Returns `None`, if `value` doesn't fit in 40 bits.
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Duration(value))
        } else {
            None
        }
    }

    /// Creates a `Duration` from UUS
    ///
    /// Values too large for 40 bits wrap.
    pub fn from_uus(uus: u32) -> Self {
        Duration(uus_to_dtu(u64::from(uus)) & MASK40)
    }

    /// Creates a `Duration` from nanoseconds
    ///
    /// One DTU is roughly 15.65 ps, so a nanosecond is roughly 64 DTU. The
    /// approximation is good enough for transmission delays.
    pub fn from_nanos(nanos: u32) -> Self {
        // `nanos` takes up at most 32 bits, so the shifted value fits in 40.
        Duration(u64::from(nanos) << 6)
    }

    /// Returns the raw 40-bit duration value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the duration in whole UUS, rounded down
    pub fn as_uus(&self) -> u64 {
        self.0 >> UUS_SHIFT
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Duration((self.0 + rhs.0) & MASK40)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn elapsed32_handles_wrap() {
        assert_eq!(elapsed32(u32::MAX, 0), 1);
        assert_eq!(elapsed32(5, 5), 0);
        assert_eq!(elapsed32(100, 10), u32::MAX - 89);
    }

    #[test]
    fn elapsed40_ignores_upper_bits() {
        let junk = 0xab00_0000_0000_0000;
        assert_eq!(elapsed40(junk | 10, 20), 10);
        assert_eq!(elapsed40(TIME_MAX, 0), 1);
    }

    #[test]
    fn instant_arithmetic_wraps_at_40_bits() {
        let start = Instant::new(TIME_MAX - 9).unwrap();
        let later = start + Duration::from_uus(1);

        assert_eq!(later.value(), 0x10000 - 10);
        assert_eq!(later.duration_since(start), Duration::from_uus(1));
        assert_eq!(later - Duration::from_uus(1), start);
    }

    #[test]
    fn uus_conversions() {
        assert_eq!(uus_to_dtu(1), 0x10000);
        assert_eq!(Duration::from_uus(3).as_uus(), 3);
        assert!((dwt_usecs_to_usecs(63897.6) - 65536.0).abs() < 1e-6);
        assert!((usecs_to_dwt_usecs(dwt_usecs_to_usecs(1234.5)) - 1234.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn elapsed32_is_offset_invariant(a: u32, delta: u32, k: u32) {
            let b = a.wrapping_add(delta);
            prop_assert_eq!(
                elapsed32(a, b),
                elapsed32(a.wrapping_add(k), b.wrapping_add(k))
            );
        }

        #[test]
        fn elapsed40_is_offset_invariant(a in 0..=TIME_MAX, delta in 0..=TIME_MAX, k in 0..=TIME_MAX) {
            let b = (a + delta) & MASK40;
            prop_assert_eq!(elapsed40(a, b), delta);
            prop_assert_eq!(elapsed40(a, b), elapsed40((a + k) & MASK40, (b + k) & MASK40));
        }
    }
}
