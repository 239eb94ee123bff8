//! # Data Model
//!
//! Core identities for the coordinator: tasks and their grouping, leases
//! over timeline intervals, input rows, and the segment identities minted
//! for them. Wire names follow the journal's JSON contract so that records
//! round-trip across implementations.

use crate::shard::ShardSpec;
use crate::temporal::{format_instant, Instant, Interval};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of a running job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.to_string())
    }
}

/// Identifier of a task group; tasks in one group share leases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(value: &str) -> Self {
        GroupId(value.to_string())
    }
}

/// A named timeline of immutable segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSource(pub String);

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DataSource {
    fn from(value: &str) -> Self {
        DataSource(value.to_string())
    }
}

/// Descriptor of a running job as the lockbox sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub group_id: GroupId,
    pub data_source: DataSource,
    pub priority: i32,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        group_id: impl Into<String>,
        data_source: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            id: TaskId(id.into()),
            group_id: GroupId(group_id.into()),
            data_source: DataSource(data_source.into()),
            priority,
        }
    }
}

/// Whether a lease admits co-writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// What a lease covers: a whole time chunk or individual partition slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockGranularity {
    TimeChunk,
    Segment,
}

impl fmt::Display for LockGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockGranularity::TimeChunk => write!(f, "TIME_CHUNK"),
            LockGranularity::Segment => write!(f, "SEGMENT"),
        }
    }
}

/// A time- and priority-bounded grant entitling a task group to publish
/// segments into an interval. Journaled verbatim; field names are part of
/// the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub kind: LockKind,
    pub granularity: LockGranularity,
    pub group_id: GroupId,
    pub data_source: DataSource,
    pub interval: Interval,
    /// Partition numbers covered by a SEGMENT-granularity lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<BTreeSet<i32>>,
    pub version: String,
    pub priority: i32,
    pub revoked: bool,
    pub upgraded: bool,
}

impl Lease {
    /// Copy with the sticky revoked flag set.
    pub fn revoke(&self) -> Self {
        Self {
            revoked: true,
            ..self.clone()
        }
    }

    /// Copy with the upgraded flag set; upgraded leases cannot be revoked.
    pub fn upgrade(&self) -> Self {
        Self {
            upgraded: true,
            ..self.clone()
        }
    }

    /// Copy with the upgraded flag cleared.
    pub fn downgrade(&self) -> Self {
        Self {
            upgraded: false,
            ..self.clone()
        }
    }

    /// True when a request at `priority` may preempt this lease.
    pub fn is_revocable_by(&self, priority: i32) -> bool {
        self.priority < priority && !self.upgraded
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{} lock on {}{} version [{}] priority {}",
            self.kind, self.granularity, self.data_source, self.interval, self.version, self.priority
        )
    }
}

/// One row of input, reduced to the pieces the coordinator routes on:
/// a timestamp and multi-valued string dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRow {
    pub timestamp: Instant,
    pub dimensions: BTreeMap<String, Vec<String>>,
}

impl InputRow {
    pub fn new(timestamp: Instant) -> Self {
        Self {
            timestamp,
            dimensions: BTreeMap::new(),
        }
    }

    /// Builder-style dimension attachment, used heavily in tests.
    pub fn with_dimension(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        self.dimensions
            .insert(name.into(), values.iter().map(|v| v.to_string()).collect());
        self
    }

    /// All values of a dimension; absent dimensions are empty.
    pub fn dimension(&self, name: &str) -> &[String] {
        self.dimensions.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single value of a dimension. Multi-valued or absent dimensions
    /// yield `None`, which range routing treats as the first bucket.
    pub fn dimension_value(&self, name: &str) -> Option<&str> {
        match self.dimensions.get(name) {
            Some(values) if values.len() == 1 => Some(values[0].as_str()),
            _ => None,
        }
    }
}

/// The fully-resolved identity of a segment about to be published.
/// Unique per `(data_source, interval, version, partition_num)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentIdWithShardSpec {
    pub data_source: DataSource,
    pub interval: Interval,
    pub version: String,
    pub shard_spec: ShardSpec,
}

impl SegmentIdWithShardSpec {
    pub fn new(
        data_source: DataSource,
        interval: Interval,
        version: impl Into<String>,
        shard_spec: ShardSpec,
    ) -> Self {
        Self {
            data_source,
            interval,
            version: version.into(),
            shard_spec,
        }
    }

    /// Canonical string form, used as the `previousSegmentId` chain pointer.
    /// Partition zero is omitted, matching the published naming scheme.
    pub fn id_string(&self) -> String {
        let mut id = format!(
            "{}_{}_{}_{}",
            self.data_source,
            format_instant(self.interval.start),
            format_instant(self.interval.end),
            self.version
        );
        let partition = self.shard_spec.partition_num();
        if partition > 0 {
            id.push('_');
            id.push_str(&partition.to_string());
        }
        id
    }
}

impl fmt::Display for SegmentIdWithShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id_string())
    }
}

/// A segment already published to the timeline, as reported by the
/// historical segment index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSegment {
    pub data_source: DataSource,
    pub interval: Interval,
    pub version: String,
    pub shard_spec: ShardSpec,
}

impl DataSegment {
    pub fn new(
        data_source: DataSource,
        interval: Interval,
        version: impl Into<String>,
        shard_spec: ShardSpec,
    ) -> Self {
        Self {
            data_source,
            interval,
            version: version.into(),
            shard_spec,
        }
    }
}
