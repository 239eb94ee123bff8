//! Time-bucketing granularities.
//!
//! A granularity maps an instant to the time chunk that contains it. The
//! allocator walks candidate granularities from its preferred one down to
//! the finest standard one when deciding which chunk a new segment lands in.

use crate::temporal::{Instant, Interval, NEG_INF, POS_INF};
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// The standard time-bucket periods, coarsest to finest.
///
/// `All` collapses the whole timeline into one bucket and `None` buckets
/// each millisecond by itself; neither participates in segment-granularity
/// candidate walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    All,
    Year,
    Month,
    Week,
    Day,
    SixHour,
    Hour,
    ThirtyMinute,
    FifteenMinute,
    TenMinute,
    FiveMinute,
    Minute,
    Second,
    None,
}

impl Granularity {
    /// Fineness rank; greater means finer buckets.
    fn rank(&self) -> u8 {
        match self {
            Granularity::All => 0,
            Granularity::Year => 1,
            Granularity::Month => 2,
            Granularity::Week => 3,
            Granularity::Day => 4,
            Granularity::SixHour => 5,
            Granularity::Hour => 6,
            Granularity::ThirtyMinute => 7,
            Granularity::FifteenMinute => 8,
            Granularity::TenMinute => 9,
            Granularity::FiveMinute => 10,
            Granularity::Minute => 11,
            Granularity::Second => 12,
            Granularity::None => 13,
        }
    }

    /// True when this granularity produces smaller buckets than `other`.
    pub fn is_finer_than(&self, other: Granularity) -> bool {
        self.rank() > other.rank()
    }

    /// Fixed period in milliseconds, for the granularities that have one.
    fn fixed_period_millis(&self) -> Option<i64> {
        match self {
            Granularity::Second => Some(MILLIS_PER_SECOND),
            Granularity::Minute => Some(MILLIS_PER_MINUTE),
            Granularity::FiveMinute => Some(5 * MILLIS_PER_MINUTE),
            Granularity::TenMinute => Some(10 * MILLIS_PER_MINUTE),
            Granularity::FifteenMinute => Some(15 * MILLIS_PER_MINUTE),
            Granularity::ThirtyMinute => Some(30 * MILLIS_PER_MINUTE),
            Granularity::Hour => Some(MILLIS_PER_HOUR),
            Granularity::SixHour => Some(6 * MILLIS_PER_HOUR),
            Granularity::Day => Some(MILLIS_PER_DAY),
            _ => Option::None,
        }
    }

    /// The time chunk containing `instant`.
    pub fn bucket(&self, instant: Instant) -> Interval {
        match self {
            Granularity::All => Interval::probe(NEG_INF, POS_INF),
            Granularity::None => Interval::probe(instant, instant.saturating_add(1)),
            Granularity::Week => {
                // Epoch day 0 was a Thursday; align buckets to Monday.
                let day = instant.div_euclid(MILLIS_PER_DAY);
                let monday = day - (day + 3).rem_euclid(7);
                let start = monday * MILLIS_PER_DAY;
                Interval::probe(start, start + 7 * MILLIS_PER_DAY)
            }
            Granularity::Month => calendar_bucket(instant, false),
            Granularity::Year => calendar_bucket(instant, true),
            _ => {
                let period = self
                    .fixed_period_millis()
                    .expect("fixed-period granularity");
                let start = instant.div_euclid(period) * period;
                Interval::probe(start, start.saturating_add(period))
            }
        }
    }

    /// Truncate an instant to the start of its bucket.
    pub fn truncate(&self, instant: Instant) -> Instant {
        self.bucket(instant).start
    }

    /// Candidate segment granularities no coarser than `preferred`, in
    /// coarsest-first order. `Week` never appears because week chunks do not
    /// nest inside the calendar granularities; `All` and `None` are not
    /// segment granularities.
    pub fn finer_or_equal_candidates(preferred: Granularity) -> Vec<Granularity> {
        const ORDERED: [Granularity; 11] = [
            Granularity::Year,
            Granularity::Month,
            Granularity::Day,
            Granularity::SixHour,
            Granularity::Hour,
            Granularity::ThirtyMinute,
            Granularity::FifteenMinute,
            Granularity::TenMinute,
            Granularity::FiveMinute,
            Granularity::Minute,
            Granularity::Second,
        ];
        ORDERED
            .into_iter()
            .filter(|g| g.rank() >= preferred.rank())
            .collect()
    }
}

/// Month/year buckets need real calendar math; out-of-range instants fall
/// back to an eternity bucket rather than panicking on journal garbage.
fn calendar_bucket(instant: Instant, yearly: bool) -> Interval {
    let Ok(dt) = OffsetDateTime::from_unix_timestamp_nanos(instant as i128 * 1_000_000) else {
        return Interval::probe(NEG_INF, POS_INF);
    };
    let (start_year, start_month) = if yearly {
        (dt.year(), Month::January)
    } else {
        (dt.year(), dt.month())
    };
    let (end_year, end_month) = if yearly {
        (start_year + 1, Month::January)
    } else if start_month == Month::December {
        (start_year + 1, Month::January)
    } else {
        (start_year, start_month.next())
    };
    let start = month_start_millis(start_year, start_month);
    let end = month_start_millis(end_year, end_month);
    Interval::probe(start, end)
}

fn month_start_millis(year: i32, month: Month) -> Instant {
    Date::from_calendar_date(year, month, 1)
        .map(|d| d.midnight().assume_utc().unix_timestamp() * MILLIS_PER_SECOND)
        .unwrap_or(NEG_INF)
}
