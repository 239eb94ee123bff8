//! # Temporal Module
//!
//! Instants and half-open intervals over a data source's timeline.
//! All times are UTC epoch milliseconds; intervals are `[start, end)` so
//! that adjacent time chunks tile the timeline without gaps or overlap.

use crate::errors::CoordError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// A temporal instant as UTC epoch milliseconds.
pub type Instant = i64;

/// Sentinel for an unbounded interval start.
pub const NEG_INF: Instant = i64::MIN;

/// Sentinel for an unbounded interval end.
pub const POS_INF: Instant = i64::MAX;

/// Fixed-width UTC render used for version strings and segment ids.
/// Exactly three subsecond digits so lexicographic order equals time order.
const UTC_MILLIS_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

/// Format an instant as `1999-01-01T00:00:00.000Z`.
///
/// Instants outside the calendar range supported by `time` (including the
/// infinity sentinels) fall back to their raw millisecond value.
pub fn format_instant(instant: Instant) -> String {
    if instant == NEG_INF {
        return "-inf".to_string();
    }
    if instant == POS_INF {
        return "+inf".to_string();
    }
    OffsetDateTime::from_unix_timestamp_nanos(instant as i128 * 1_000_000)
        .ok()
        .and_then(|dt| dt.format(UTC_MILLIS_FORMAT).ok())
        .unwrap_or_else(|| instant.to_string())
}

/// Parse an instant rendered by [`format_instant`]. Returns `None` for
/// anything that does not match the fixed-width UTC form.
pub fn parse_instant(value: &str) -> Option<Instant> {
    let parsed = time::PrimitiveDateTime::parse(value, UTC_MILLIS_FORMAT).ok()?;
    let millis = parsed.assume_utc().unix_timestamp_nanos() / 1_000_000;
    Some(millis as Instant)
}

/// Convert a UTC datetime to an instant.
pub fn instant_from_datetime(dt: OffsetDateTime) -> Instant {
    (dt.unix_timestamp_nanos() / 1_000_000) as Instant
}

/// A half-open interval `[start, end)` with strictly positive duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    /// Start instant (inclusive).
    pub start: Instant,
    /// End instant (exclusive).
    pub end: Instant,
}

impl Interval {
    /// Create a new interval, rejecting empty or inverted ranges.
    pub fn new(start: Instant, end: Instant) -> Result<Self, CoordError> {
        if start >= end {
            return Err(CoordError::EmptyInterval {
                interval: Interval { start, end },
            });
        }
        Ok(Self { start, end })
    }

    /// Construct without validation. Only for sorted-map probe keys, where a
    /// zero-length "interval" is used as a range bound and never stored.
    pub(crate) fn probe(start: Instant, end: Instant) -> Self {
        Self { start, end }
    }

    /// Interval covering the entire timeline.
    pub fn eternity() -> Self {
        Self {
            start: NEG_INF,
            end: POS_INF,
        }
    }

    /// Duration in milliseconds; saturates for unbounded intervals.
    pub fn duration_millis(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// True when the interval has no duration. Validated constructors make
    /// this impossible for stored intervals, but journals can hold anything.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True when `instant` falls inside `[start, end)`.
    pub fn contains(&self, instant: Instant) -> bool {
        self.start <= instant && instant < self.end
    }

    /// True when `other` lies entirely inside this interval.
    pub fn encloses(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// True when the two half-open intervals share any instant.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Compute the intersection of two intervals, if any.
pub fn intersect(a: &Interval, b: &Interval) -> Option<Interval> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    if start < end {
        Some(Interval { start, end })
    } else {
        None
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_instant(self.start),
            format_instant(self.end)
        )
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered by start, ties broken by end. This is the key order of the
/// lockbox's interval maps; the overlap query depends on it.
impl Ord for Interval {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.start.cmp(&other.start) {
            Ordering::Equal => self.end.cmp(&other.end),
            ordering => ordering,
        }
    }
}
