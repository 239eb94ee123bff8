//! External collaborators of the lockbox: the durable lock journal, the
//! task catalog, and the historical segment index.
//!
//! The coordinator only consumes these interfaces; durability and high
//! availability are the implementations' contracts. In-memory versions
//! back tests and single-process deployments, and a RocksDB-backed
//! journal lives in [`crate::persistence`].

use crate::errors::CoordError;
use crate::model::{DataSegment, DataSource, Lease, Task, TaskId};
use crate::shard::{ShardSpec, OVERWRITE_PARTITION_START};
use crate::temporal::Interval;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One journaled record: a lease owned by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub task_id: TaskId,
    pub lease: Lease,
}

/// Append-only log of lease records. Ordering within one task id is by
/// lease version.
pub trait LockJournal: Send + Sync {
    fn append(&self, task_id: &TaskId, lease: &Lease) -> Result<(), CoordError>;

    /// Replace `old` with `new` atomically; replacing a record that is not
    /// present is a no-op the lockbox logs on its side.
    fn replace(&self, task_id: &TaskId, old: &Lease, new: &Lease) -> Result<(), CoordError>;

    fn remove(&self, task_id: &TaskId, lease: &Lease) -> Result<(), CoordError>;

    /// Leases held by one task, sorted by version.
    fn leases_for_task(&self, task_id: &TaskId) -> Result<Vec<Lease>, CoordError>;
}

/// Lookup of task descriptors and enumeration of active tasks at startup.
pub trait TaskCatalog: Send + Sync {
    fn task_by_id(&self, id: &TaskId) -> Option<Task>;
    fn active_tasks(&self) -> Vec<Task>;
}

/// Read-only view of segments already published to the timeline.
pub trait SegmentIndex: Send + Sync {
    /// Root-generation shard spec with the maximum partition number among
    /// segments occupying exactly `interval`.
    fn max_partition_spec(&self, data_source: &DataSource, interval: &Interval)
        -> Option<ShardSpec>;

    /// Overwrite-generation shard spec with the maximum partition number
    /// among segments occupying exactly `interval`.
    fn max_overwrite_partition_spec(
        &self,
        data_source: &DataSource,
        interval: &Interval,
    ) -> Option<ShardSpec>;

    /// All published segments overlapping `interval`, used to snap a
    /// preferred granularity onto existing time chunks.
    fn segments_overlapping(
        &self,
        data_source: &DataSource,
        interval: &Interval,
    ) -> Vec<DataSegment>;
}

/// Journal keeping every record in process memory. Durability: none.
#[derive(Default)]
pub struct InMemoryJournal {
    records: Mutex<HashMap<TaskId, Vec<Lease>>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of journaled leases, for tests.
    pub fn len(&self) -> usize {
        self.records.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LockJournal for InMemoryJournal {
    fn append(&self, task_id: &TaskId, lease: &Lease) -> Result<(), CoordError> {
        self.records
            .lock()
            .entry(task_id.clone())
            .or_default()
            .push(lease.clone());
        Ok(())
    }

    fn replace(&self, task_id: &TaskId, old: &Lease, new: &Lease) -> Result<(), CoordError> {
        let mut records = self.records.lock();
        if let Some(leases) = records.get_mut(task_id) {
            if let Some(slot) = leases.iter_mut().find(|l| *l == old) {
                *slot = new.clone();
            }
        }
        Ok(())
    }

    fn remove(&self, task_id: &TaskId, lease: &Lease) -> Result<(), CoordError> {
        let mut records = self.records.lock();
        if let Some(leases) = records.get_mut(task_id) {
            leases.retain(|l| l != lease);
            if leases.is_empty() {
                records.remove(task_id);
            }
        }
        Ok(())
    }

    fn leases_for_task(&self, task_id: &TaskId) -> Result<Vec<Lease>, CoordError> {
        let mut leases = self
            .records
            .lock()
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        leases.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(leases)
    }
}

/// Task catalog keeping registrations in process memory.
#[derive(Default)]
pub struct InMemoryTaskCatalog {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl InMemoryTaskCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }

    pub fn deactivate(&self, id: &TaskId) {
        self.tasks.lock().remove(id);
    }
}

impl TaskCatalog for InMemoryTaskCatalog {
    fn task_by_id(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }

    fn active_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

/// Segment index over announced segments, for tests and small deployments.
#[derive(Default)]
pub struct InMemorySegmentIndex {
    segments: Mutex<HashMap<DataSource, Vec<DataSegment>>>,
}

impl InMemorySegmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announce(&self, segment: DataSegment) {
        self.segments
            .lock()
            .entry(segment.data_source.clone())
            .or_default()
            .push(segment);
    }

    pub fn announce_all(&self, segments: impl IntoIterator<Item = DataSegment>) {
        for segment in segments {
            self.announce(segment);
        }
    }

    fn max_in_space(
        &self,
        data_source: &DataSource,
        interval: &Interval,
        overwrite: bool,
    ) -> Option<ShardSpec> {
        self.segments
            .lock()
            .get(data_source)?
            .iter()
            .filter(|s| s.interval == *interval)
            .filter(|s| (s.shard_spec.partition_num() >= OVERWRITE_PARTITION_START) == overwrite)
            .max_by_key(|s| s.shard_spec.partition_num())
            .map(|s| s.shard_spec.clone())
    }
}

impl SegmentIndex for InMemorySegmentIndex {
    fn max_partition_spec(
        &self,
        data_source: &DataSource,
        interval: &Interval,
    ) -> Option<ShardSpec> {
        self.max_in_space(data_source, interval, false)
    }

    fn max_overwrite_partition_spec(
        &self,
        data_source: &DataSource,
        interval: &Interval,
    ) -> Option<ShardSpec> {
        self.max_in_space(data_source, interval, true)
    }

    fn segments_overlapping(
        &self,
        data_source: &DataSource,
        interval: &Interval,
    ) -> Vec<DataSegment> {
        self.segments
            .lock()
            .get(data_source)
            .map(|segments| {
                segments
                    .iter()
                    .filter(|s| s.interval.overlaps(interval))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupId, LockGranularity, LockKind};

    fn lease(version: &str) -> Lease {
        Lease {
            kind: LockKind::Exclusive,
            granularity: LockGranularity::TimeChunk,
            group_id: GroupId::from("g1"),
            data_source: DataSource::from("wiki"),
            interval: Interval::new(0, 3_600_000).unwrap(),
            partitions: None,
            version: version.to_string(),
            priority: 50,
            revoked: false,
            upgraded: false,
        }
    }

    #[test]
    fn test_in_memory_journal_lists_by_version() {
        let journal = InMemoryJournal::new();
        let task = TaskId::from("t1");
        journal.append(&task, &lease("2024-01-01T00:00:00.002Z")).unwrap();
        journal.append(&task, &lease("2024-01-01T00:00:00.001Z")).unwrap();

        let leases = journal.leases_for_task(&task).unwrap();
        assert_eq!(leases.len(), 2);
        assert!(leases[0].version < leases[1].version);
    }

    #[test]
    fn test_in_memory_journal_replace_and_remove() {
        let journal = InMemoryJournal::new();
        let task = TaskId::from("t1");
        let original = lease("2024-01-01T00:00:00.001Z");
        journal.append(&task, &original).unwrap();

        let revoked = original.revoke();
        journal.replace(&task, &original, &revoked).unwrap();
        let leases = journal.leases_for_task(&task).unwrap();
        assert!(leases[0].revoked);

        journal.remove(&task, &revoked).unwrap();
        assert!(journal.leases_for_task(&task).unwrap().is_empty());
        assert!(journal.is_empty());
    }

    #[test]
    fn test_segment_index_separates_partition_spaces() {
        use crate::shard::ShardSpec;

        let index = InMemorySegmentIndex::new();
        let ds = DataSource::from("wiki");
        let interval = Interval::new(0, 3_600_000).unwrap();
        index.announce(DataSegment::new(
            ds.clone(),
            interval,
            "v1",
            ShardSpec::Numbered {
                partition_num: 4,
                num_core_partitions: 2,
            },
        ));
        index.announce(DataSegment::new(
            ds.clone(),
            interval,
            "v2",
            ShardSpec::NumberedOverwrite {
                partition_num: OVERWRITE_PARTITION_START + 1,
                start_root_partition_id: 0,
                end_root_partition_id: 4,
                minor_version: 1,
            },
        ));

        let root_max = index.max_partition_spec(&ds, &interval).unwrap();
        assert_eq!(root_max.partition_num(), 4);
        let overwrite_max = index.max_overwrite_partition_spec(&ds, &interval).unwrap();
        assert_eq!(overwrite_max.partition_num(), OVERWRITE_PARTITION_START + 1);
    }

    #[test]
    fn test_segment_index_overlap_query() {
        use crate::shard::ShardSpec;

        let index = InMemorySegmentIndex::new();
        let ds = DataSource::from("wiki");
        index.announce(DataSegment::new(
            ds.clone(),
            Interval::new(0, 3_600_000).unwrap(),
            "v1",
            ShardSpec::Linear { partition_num: 0 },
        ));

        let hits = index.segments_overlapping(&ds, &Interval::new(1_000, 2_000).unwrap());
        assert_eq!(hits.len(), 1);
        let misses =
            index.segments_overlapping(&ds, &Interval::new(3_600_000, 7_200_000).unwrap());
        assert!(misses.is_empty());
    }
}
