//! Timestamps and time ranges.
//!
//! [`Timestamp`] is a nanosecond-resolution instant on the trace timeline.
//! [`TimeRange`] is an inclusive interval of timestamps; [`TimeRange::ETERNITY`]
//! spans the whole timeline and accepts every event. Both are small `Copy`
//! value objects — range arithmetic (`union`, `intersects`) always returns a
//! new value rather than mutating in place.

use std::fmt;

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// A point on the trace timeline, in nanoseconds.
///
/// The underlying representation is a signed 64-bit count so that sources
/// with epochs before the process start (or synthetic negative clocks) are
/// representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The earliest representable instant.
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    /// The latest representable instant.
    pub const MAX: Timestamp = Timestamp(i64::MAX);
    /// The timeline origin.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Returns the raw nanosecond value.
    #[inline]
    #[must_use]
    pub fn nanos(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(nanos: i64) -> Self {
        Timestamp(nanos)
    }
}

// ---------------------------------------------------------------------------
// TimeRange
// ---------------------------------------------------------------------------

/// An inclusive interval `[start, end]` of [`Timestamp`]s.
///
/// A range never has `start > end`; the constructor orders its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    start: Timestamp,
    end: Timestamp,
}

impl TimeRange {
    /// The universal range: contains every representable timestamp.
    pub const ETERNITY: TimeRange = TimeRange {
        start: Timestamp::MIN,
        end: Timestamp::MAX,
    };

    /// Creates a range spanning `[start, end]`, swapping the bounds if they
    /// are given out of order.
    #[must_use]
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Returns the lower bound (inclusive).
    #[inline]
    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Returns the upper bound (inclusive).
    #[inline]
    #[must_use]
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Returns `true` if `ts` falls inside the range, bounds included.
    #[inline]
    #[must_use]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Returns `true` if this range is [`TimeRange::ETERNITY`].
    #[inline]
    #[must_use]
    pub fn is_eternity(&self) -> bool {
        *self == Self::ETERNITY
    }

    /// Returns the smallest range covering both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Returns `true` if the two ranges share at least one timestamp.
    #[must_use]
    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::ETERNITY
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
