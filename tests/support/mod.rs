//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use shardlock::journal::{InMemoryJournal, InMemorySegmentIndex, InMemoryTaskCatalog};
use shardlock::lockbox::Lockbox;
use shardlock::temporal::instant_from_datetime;
use shardlock::{DataSource, Granularity, Instant, Interval, Task};
use std::sync::Arc;
use time::macros::datetime;
use uuid::Uuid;

pub const WIKI: &str = "wiki";

/// 1999-01-01T00:00:00Z, the party timestamp of most scenarios.
pub fn party_time() -> Instant {
    instant_from_datetime(datetime!(1999-01-01 00:00:00 UTC))
}

/// 3000-01-01T00:00:00Z, far enough out to land on a distinct chunk.
pub fn the_distant_future() -> Instant {
    instant_from_datetime(datetime!(3000-01-01 00:00:00 UTC))
}

pub fn hour_of(instant: Instant) -> Interval {
    Granularity::Hour.bucket(instant)
}

pub fn data_source() -> DataSource {
    DataSource::from(WIKI)
}

pub fn task(priority: i32) -> Task {
    let id = format!("task_{}", Uuid::new_v4());
    let group = format!("group_{id}");
    Task::new(id, group, WIKI, priority)
}

pub fn task_in_group(group: &str, priority: i32) -> Task {
    Task::new(format!("task_{}", Uuid::new_v4()), group, WIKI, priority)
}

pub struct Harness {
    pub journal: Arc<InMemoryJournal>,
    pub catalog: Arc<InMemoryTaskCatalog>,
    pub segments: Arc<InMemorySegmentIndex>,
    pub lockbox: Arc<Lockbox>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeout(1_000)
    }

    pub fn with_timeout(lock_timeout_millis: u64) -> Self {
        let journal = Arc::new(InMemoryJournal::new());
        let catalog = Arc::new(InMemoryTaskCatalog::new());
        let segments = Arc::new(InMemorySegmentIndex::new());
        let lockbox = Arc::new(Lockbox::new(
            journal.clone(),
            catalog.clone(),
            segments.clone(),
            lock_timeout_millis,
        ));
        Self {
            journal,
            catalog,
            segments,
            lockbox,
        }
    }

    /// Register a task with both the catalog and the lockbox.
    pub fn activate(&self, task: &Task) {
        self.catalog.register(task.clone());
        self.lockbox.add(task);
    }
}
