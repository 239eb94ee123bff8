//! Clock and version minting.
//!
//! Versions are ISO-8601 UTC strings whose lexicographic order reflects
//! acquisition order for an interval. The versioner keeps a per-interval
//! high-water mark so that two grants landing in the same wall-clock
//! millisecond still mint strictly increasing versions.

use crate::model::DataSource;
use crate::temporal::{format_instant, parse_instant, Instant, Interval};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Source of wall-clock time, swapped out for a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Instant;
}

/// The system UTC clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Instant {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as Instant
    }
}

/// Mints version strings that are strictly increasing per
/// `(data_source, interval)` within one process instance.
///
/// The minimum tick between two versions on the same interval is one
/// millisecond; monotonicity across restarts relies on the wall clock
/// moving forward between process epochs.
pub struct Versioner {
    clock: Arc<dyn Clock>,
    high_water: Mutex<FxHashMap<(DataSource, Interval), Instant>>,
}

impl Versioner {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            high_water: Mutex::new(FxHashMap::default()),
        }
    }

    /// Mint the next version for an interval: `max(now, last + 1ms)`.
    pub fn mint(&self, data_source: &DataSource, interval: &Interval) -> String {
        let mut high_water = self.high_water.lock();
        let now = self.clock.now_millis();
        let key = (data_source.clone(), *interval);
        let minted = match high_water.get(&key) {
            Some(last) => now.max(last.saturating_add(1)),
            None => now,
        };
        high_water.insert(key, minted);
        format_instant(minted)
    }

    /// Record an externally supplied version (preferred versions, journal
    /// replay) so later mints stay above it. Unparseable versions are
    /// ignored; the caller owns their ordering contract.
    pub fn observe(&self, data_source: &DataSource, interval: &Interval, version: &str) {
        let Some(instant) = parse_instant(version) else {
            return;
        };
        let mut high_water = self.high_water.lock();
        let key = (data_source.clone(), *interval);
        let entry = high_water.entry(key).or_insert(instant);
        if *entry < instant {
            *entry = instant;
        }
    }
}
