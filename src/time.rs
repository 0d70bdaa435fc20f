//! Minimal time units and strongly-typed durations/timestamps.
//!
//! The receive path deals in two clocks: the 32-bit sender timestamp carried
//! by every packet (microseconds, wraps at 2^32) and the local monotonic
//! clock. Local readings are strongly typed so a millisecond count can never
//! be added to a microsecond one.

use core::fmt;
use core::marker::PhantomData;

/// Marker trait for a time unit.
pub trait TimeUnit {
    /// Human-readable name for debugging/metrics.
    const NAME: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Micros {}
impl TimeUnit for Micros {
    const NAME: &'static str = "us";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Millis {}
impl TimeUnit for Millis {
    const NAME: &'static str = "ms";
}

/// Strongly-typed duration in a given unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Duration<U: TimeUnit>(u64, PhantomData<U>);

/// Strongly-typed timestamp in a given unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Timestamp<U: TimeUnit>(u64, PhantomData<U>);

/// Local monotonic time with microsecond resolution.
pub type MonoTime = Timestamp<Micros>;

impl<U: TimeUnit> Duration<U> {
    /// Create a new duration.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    /// Return the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Duration<Micros> {
    /// Convenience constructor from microseconds.
    #[inline]
    #[must_use]
    pub const fn from_micros(value: u64) -> Self {
        Self::new(value)
    }

    /// Convenience constructor from milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(value: u64) -> Self {
        Self::new(value * 1_000)
    }

    /// Whole milliseconds in this duration.
    #[inline]
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000
    }
}

impl<U: TimeUnit> Timestamp<U> {
    /// Create a new timestamp.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    /// Return the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Shift by a signed amount, clamping at the epoch.
    #[inline]
    #[must_use]
    pub fn offset(self, delta: i64) -> Self {
        Self::new((self.0 as i64).saturating_add(delta).max(0) as u64)
    }
}

impl<U: TimeUnit> core::ops::Add<Duration<U>> for Timestamp<U> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Duration<U>) -> Self::Output {
        Timestamp::new(self.0 + rhs.0)
    }
}

impl<U: TimeUnit> core::ops::Sub<Duration<U>> for Timestamp<U> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Duration<U>) -> Self::Output {
        Timestamp::new(self.0 - rhs.0)
    }
}

impl<U: TimeUnit> core::ops::Sub for Timestamp<U> {
    type Output = Duration<U>;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        Duration::new(self.0 - rhs.0)
    }
}

impl<U: TimeUnit> fmt::Display for Duration<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0, U::NAME)
    }
}

impl<U: TimeUnit> fmt::Display for Timestamp<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0, U::NAME)
    }
}

/// Monotonic clock anchored at construction time.
///
/// Readings are microseconds since the anchor, so they start near zero and
/// stay well clear of `u64` overflow for any realistic session lifetime.
#[derive(Debug)]
pub struct MonoClock {
    origin: minstant::Instant,
}

impl MonoClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: minstant::Instant::now(),
        }
    }

    /// Current reading of the clock.
    #[must_use]
    pub fn now(&self) -> MonoTime {
        MonoTime::new(self.origin.elapsed().as_micros() as u64)
    }
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_sub_durations() {
        let t = MonoTime::new(1_000);
        let d = Duration::<Micros>::from_micros(250);
        assert_eq!((t + d).as_u64(), 1_250);
        assert_eq!((t + d) - d, t);
        assert_eq!((t + d) - t, d);
    }

    #[test]
    fn millis_conversion() {
        let d = Duration::<Micros>::from_millis(3);
        assert_eq!(d.as_u64(), 3_000);
        assert_eq!(d.as_millis(), 3);
    }

    #[test]
    fn signed_offset_clamps_at_epoch() {
        let t = MonoTime::new(100);
        assert_eq!(t.offset(50).as_u64(), 150);
        assert_eq!(t.offset(-80).as_u64(), 20);
        assert_eq!(t.offset(-500).as_u64(), 0);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = MonoClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn display_carries_unit() {
        assert_eq!(Duration::<Micros>::new(42).to_string(), "42us");
        assert_eq!(Timestamp::<Millis>::new(7).to_string(), "7ms");
    }
}
