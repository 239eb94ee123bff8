//! Segment allocators: the per-row and bulk entry points that turn a
//! partition analysis plus the lockbox into minted segment identities.

use crate::analysis::PartitionAnalysis;
use crate::errors::CoordError;
use crate::granularity::Granularity;
use crate::lockbox::{
    Lockbox, NewSegmentsRequest, NewSegmentsResult, SegmentAllocateRequest,
};
use crate::model::{
    DataSource, InputRow, Lease, LockGranularity, LockKind, SegmentIdWithShardSpec, Task, TaskId,
};
use crate::shard::{bucket_for_row, PartialShardSpec};
use crate::temporal::Interval;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Root-generation bounds cached by overwriting jobs, used to shape
/// `numbered_overwrite` partials under segment locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverwriteRootGeneration {
    pub start_root_partition_id: i32,
    pub end_root_partition_id: i32,
    pub minor_version: i32,
}

/// Per-row segment allocator.
///
/// Dispatches on the job's partition analysis and lock granularity to build
/// a partial shard spec for each row, then submits an allocation action to
/// the lockbox. A `None` return signals that nothing can be allocated under
/// the current lease shape; the caller decides whether that is fatal.
pub struct SegmentAllocator {
    lockbox: Arc<Lockbox>,
    data_source: DataSource,
    query_granularity: Granularity,
    segment_granularity: Granularity,
    lock_kind: LockKind,
    lock_granularity: LockGranularity,
    analysis: PartitionAnalysis,
    append_to_existing: bool,
    overwrite_root_generation: Option<OverwriteRootGeneration>,
}

impl SegmentAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lockbox: Arc<Lockbox>,
        data_source: DataSource,
        query_granularity: Granularity,
        segment_granularity: Granularity,
        lock_kind: LockKind,
        lock_granularity: LockGranularity,
        analysis: PartitionAnalysis,
        append_to_existing: bool,
        overwrite_root_generation: Option<OverwriteRootGeneration>,
    ) -> Self {
        Self {
            lockbox,
            data_source,
            query_granularity,
            segment_granularity,
            lock_kind,
            lock_granularity,
            analysis,
            append_to_existing,
            overwrite_root_generation,
        }
    }

    pub fn data_source(&self) -> &DataSource {
        &self.data_source
    }

    /// Allocate an identity for one row within its sequence.
    pub fn allocate(
        &self,
        task: &Task,
        row: &InputRow,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
        skip_lineage_check: bool,
    ) -> Result<Option<SegmentIdWithShardSpec>, CoordError> {
        let partial = self.build_partial(row)?;
        let request = SegmentAllocateRequest {
            timestamp: row.timestamp,
            query_granularity: self.query_granularity,
            preferred_segment_granularity: self.segment_granularity,
            sequence_name: sequence_name.to_string(),
            previous_segment_id: previous_segment_id.map(str::to_string),
            skip_lineage_check,
            partial,
            lock_kind: self.lock_kind,
            lock_granularity: self.lock_granularity,
        };
        self.lockbox.allocate_segment(task, &request)
    }

    /// Choose the partial shard spec factory for a row, per the partition
    /// analysis and lock granularity. Hash and range schemes pre-commit to
    /// a bucket layout per chunk, which segment-level locking cannot honor.
    fn build_partial(&self, row: &InputRow) -> Result<PartialShardSpec, CoordError> {
        match (&self.analysis, self.lock_granularity) {
            (PartitionAnalysis::Linear(_), LockGranularity::Segment)
                if !self.append_to_existing =>
            {
                let bounds = self.overwrite_root_generation.ok_or_else(|| {
                    CoordError::state_conflict(
                        "overwriting under segment locks requires cached root-generation bounds",
                    )
                })?;
                Ok(PartialShardSpec::NumberedOverwrite {
                    start_root_partition_id: bounds.start_root_partition_id,
                    end_root_partition_id: bounds.end_root_partition_id,
                    minor_version: bounds.minor_version,
                })
            }
            (PartitionAnalysis::Linear(_), _) => Ok(PartialShardSpec::Numbered),
            (PartitionAnalysis::Hashed(_), LockGranularity::Segment) => Err(
                CoordError::unsupported("hash partitioning cannot be used with segment locking"),
            ),
            (PartitionAnalysis::Hashed(analysis), _) => {
                let chunk = self.segment_granularity.bucket(row.timestamp);
                let num_buckets = analysis.num_buckets(&chunk).ok_or_else(|| {
                    CoordError::state_conflict(format!(
                        "no bucket count analyzed for chunk {chunk}"
                    ))
                })?;
                if num_buckets <= 0 {
                    return Err(CoordError::state_conflict(format!(
                        "analyzed bucket count [{num_buckets}] for chunk {chunk}"
                    )));
                }
                let dimensions = analysis.partition_dimensions().to_vec();
                let bucket_id = bucket_for_row(&dimensions, row, num_buckets);
                Ok(PartialShardSpec::Hashed {
                    partition_dimensions: dimensions,
                    bucket_id,
                    num_buckets,
                })
            }
            (PartitionAnalysis::Range(_), LockGranularity::Segment) => Err(
                CoordError::unsupported("range partitioning cannot be used with segment locking"),
            ),
            (PartitionAnalysis::Range(analysis), _) => {
                let chunk = self.segment_granularity.bucket(row.timestamp);
                let boundaries = analysis.boundaries(&chunk).ok_or_else(|| {
                    CoordError::state_conflict(format!(
                        "no partition boundaries analyzed for chunk {chunk}"
                    ))
                })?;
                if boundaries.is_empty() {
                    return Err(CoordError::state_conflict(format!(
                        "empty partition boundaries analyzed for chunk {chunk}"
                    )));
                }
                let values = row.dimension(analysis.partition_dimension());
                let key = match values {
                    [] => None,
                    [single] => Some(single.as_str()),
                    _ => {
                        return Err(CoordError::UnparseableRow {
                            message: format!(
                                "multiple values for partition dimension [{}]",
                                analysis.partition_dimension()
                            ),
                        })
                    }
                };
                let bucket = boundaries.bucket_for(key);
                let (start, end) = boundaries.bounds_of(bucket);
                Ok(PartialShardSpec::SingleDim {
                    dimension: analysis.partition_dimension().to_string(),
                    start: start.map(str::to_string),
                    end: end.map(str::to_string),
                    bucket_id: bucket as i32,
                    num_buckets: boundaries.num_buckets() as i32,
                })
            }
        }
    }
}

/// One interval's worth of a bulk allocation: a factory plus per-ordinal
/// partials, shaped up-front by the batch planner.
#[derive(Debug, Clone)]
pub struct BulkAllocateSpec {
    pub interval: Interval,
    pub partials: Vec<PartialShardSpec>,
}

/// Request allocating every interval of a batch phase in one lockbox
/// critical section per interval.
#[derive(Debug, Clone)]
pub struct BulkAllocateRequest {
    pub specs: Vec<BulkAllocateSpec>,
    pub base_sequence_name: String,
    /// Root partitions being overwritten, per interval; informational for
    /// append phases, required context when partials are overwrite-flavored.
    pub overshadowing_partitions: FxHashMap<Interval, BTreeSet<i32>>,
}

/// Allocates N contiguous identities per interval under one fresh
/// EXCLUSIVE lease each, failing the whole batch on revocation or count
/// mismatch.
pub struct BulkAllocator {
    lockbox: Arc<Lockbox>,
    lock_granularity: LockGranularity,
}

impl BulkAllocator {
    pub fn new(lockbox: Arc<Lockbox>, lock_granularity: LockGranularity) -> Self {
        Self {
            lockbox,
            lock_granularity,
        }
    }

    pub fn allocate(
        &self,
        task: &Task,
        request: &BulkAllocateRequest,
    ) -> Result<Vec<(Interval, Vec<SegmentIdWithShardSpec>)>, CoordError> {
        let mut allocated = Vec::with_capacity(request.specs.len());
        for spec in &request.specs {
            let requested = spec.partials.len();
            let result = self.lockbox.try_lock_for_new_segments(
                task,
                &NewSegmentsRequest {
                    kind: LockKind::Exclusive,
                    granularity: self.lock_granularity,
                    interval: spec.interval,
                    partials: spec.partials.clone(),
                    base_sequence_name: request.base_sequence_name.clone(),
                },
            )?;
            match result {
                NewSegmentsResult::Fail { revoked: true } => {
                    return Err(CoordError::Revoked {
                        task_id: task.id.clone(),
                        interval: spec.interval,
                    });
                }
                NewSegmentsResult::Fail { revoked: false } => {
                    return Err(CoordError::Contention {
                        interval: spec.interval,
                    });
                }
                NewSegmentsResult::Granted { segments, .. } => {
                    if segments.len() != requested {
                        return Err(CoordError::PartitionMismatch {
                            requested,
                            allocated: segments.len(),
                        });
                    }
                    allocated.push((spec.interval, segments));
                }
            }
        }
        Ok(allocated)
    }
}

/// Thin wrapper annotating allocations with the supervising task that
/// routed them, for audit trails. Outcomes are unchanged.
pub struct SupervisedSegmentAllocator {
    supervisor_task_id: TaskId,
    inner: SegmentAllocator,
}

impl SupervisedSegmentAllocator {
    pub fn new(supervisor_task_id: TaskId, inner: SegmentAllocator) -> Self {
        Self {
            supervisor_task_id,
            inner,
        }
    }

    pub fn supervisor_task_id(&self) -> &TaskId {
        &self.supervisor_task_id
    }

    pub fn allocate(
        &self,
        task: &Task,
        row: &InputRow,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
        skip_lineage_check: bool,
    ) -> Result<Option<SegmentIdWithShardSpec>, CoordError> {
        debug!(
            supervisor = %self.supervisor_task_id,
            task = %task.id,
            sequence = sequence_name,
            "allocation routed through supervisor"
        );
        self.inner
            .allocate(task, row, sequence_name, previous_segment_id, skip_lineage_check)
    }
}

/// Find the version of the lease containing an interval, the way bulk
/// phases resolve the version for pre-shaped identities.
pub fn find_version_for(leases: &[Lease], interval: &Interval) -> Option<String> {
    leases
        .iter()
        .find(|lease| lease.interval.encloses(interval))
        .map(|lease| lease.version.clone())
}
