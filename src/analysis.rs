//! Partition analyses: the per-interval plan a batch job computes before
//! asking for segment identities.
//!
//! Linear partitioning is decided at allocation time, so its analysis only
//! records intervals. Hash and range partitioning are decided up front; the
//! analysis carries the bucket count or boundary table the allocator needs
//! to shape partial shard specs.

use crate::boundaries::PartitionBoundaries;
use crate::model::{DataSource, SegmentIdWithShardSpec};
use crate::shard::ShardSpec;
use crate::temporal::Interval;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Wire form of a job's partitioning scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PartitionsSpec {
    /// Size-driven append partitioning.
    Dynamic {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_rows_per_segment: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_total_rows: Option<i64>,
    },
    /// Hash partitioning over a dimension tuple.
    Hashed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_shards: Option<i32>,
        #[serde(default)]
        partition_dimensions: Vec<String>,
    },
    /// Range partitioning on one dimension.
    SingleDim {
        partition_dimension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_rows_per_segment: Option<i64>,
        #[serde(default)]
        assume_grouped: bool,
    },
}

/// Plan computed before allocation, one flavor per partitioning scheme.
#[derive(Debug, Clone)]
pub enum PartitionAnalysis {
    Linear(LinearPartitionAnalysis),
    Hashed(HashPartitionAnalysis),
    Range(RangePartitionAnalysis),
}

impl PartitionAnalysis {
    pub fn intervals(&self) -> Vec<Interval> {
        match self {
            PartitionAnalysis::Linear(a) => a.intervals().collect(),
            PartitionAnalysis::Hashed(a) => a.intervals().collect(),
            PartitionAnalysis::Range(a) => a.intervals().collect(),
        }
    }

    pub fn num_time_partitions(&self) -> usize {
        self.intervals().len()
    }
}

/// Analysis for linear partitioning: segments are cut by size during
/// indexing, so only the interval set is known in advance.
#[derive(Debug, Clone, Default)]
pub struct LinearPartitionAnalysis {
    intervals: BTreeSet<Interval>,
}

impl LinearPartitionAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_bucket(&mut self, interval: Interval) {
        self.intervals.insert(interval);
    }

    pub fn contains(&self, interval: &Interval) -> bool {
        self.intervals.contains(interval)
    }

    pub fn intervals(&self) -> impl Iterator<Item = Interval> + '_ {
        self.intervals.iter().copied()
    }
}

/// Analysis for hash partitioning: a bucket count per interval.
#[derive(Debug, Clone)]
pub struct HashPartitionAnalysis {
    partition_dimensions: Vec<String>,
    interval_to_num_buckets: HashMap<Interval, i32>,
}

impl HashPartitionAnalysis {
    pub fn new(partition_dimensions: Vec<String>) -> Self {
        Self {
            partition_dimensions,
            interval_to_num_buckets: HashMap::new(),
        }
    }

    pub fn partition_dimensions(&self) -> &[String] {
        &self.partition_dimensions
    }

    pub fn update_bucket(&mut self, interval: Interval, num_buckets: i32) {
        self.interval_to_num_buckets.insert(interval, num_buckets);
    }

    pub fn num_buckets(&self, interval: &Interval) -> Option<i32> {
        self.interval_to_num_buckets.get(interval).copied()
    }

    pub fn intervals(&self) -> impl Iterator<Item = Interval> + '_ {
        self.interval_to_num_buckets.keys().copied()
    }
}

/// Analysis for range partitioning: a boundary table per interval.
#[derive(Debug, Clone)]
pub struct RangePartitionAnalysis {
    partition_dimension: String,
    interval_to_boundaries: HashMap<Interval, PartitionBoundaries>,
}

impl RangePartitionAnalysis {
    pub fn new(partition_dimension: impl Into<String>) -> Self {
        Self {
            partition_dimension: partition_dimension.into(),
            interval_to_boundaries: HashMap::new(),
        }
    }

    pub fn partition_dimension(&self) -> &str {
        &self.partition_dimension
    }

    pub fn update_bucket(&mut self, interval: Interval, boundaries: PartitionBoundaries) {
        self.interval_to_boundaries.insert(interval, boundaries);
    }

    pub fn boundaries(&self, interval: &Interval) -> Option<&PartitionBoundaries> {
        self.interval_to_boundaries.get(interval)
    }

    pub fn intervals(&self) -> impl Iterator<Item = Interval> + '_ {
        self.interval_to_boundaries.keys().copied()
    }

    /// Translate every interval's boundaries into the full set of segment
    /// identities a parallel batch phase will produce, with the version
    /// supplied per interval by the caller's lock lookup. Every worker
    /// computes the identical set for the same analysis.
    pub fn to_interval_segment_ids<F>(
        &self,
        data_source: &DataSource,
        version_finder: F,
    ) -> Vec<(Interval, Vec<SegmentIdWithShardSpec>)>
    where
        F: Fn(&Interval) -> String,
    {
        let mut out = Vec::with_capacity(self.interval_to_boundaries.len());
        for (interval, boundaries) in &self.interval_to_boundaries {
            if boundaries.is_empty() {
                continue;
            }
            let version = version_finder(interval);
            let num_buckets = boundaries.num_buckets();
            let ids = (0..num_buckets)
                .map(|bucket| {
                    let (start, end) = boundaries.bounds_of(bucket);
                    SegmentIdWithShardSpec::new(
                        data_source.clone(),
                        *interval,
                        version.clone(),
                        ShardSpec::SingleDim {
                            dimension: self.partition_dimension.clone(),
                            start: start.map(str::to_string),
                            end: end.map(str::to_string),
                            partition_num: bucket as i32,
                            num_buckets: Some(num_buckets as i32),
                        },
                    )
                })
                .collect();
            out.push((*interval, ids));
        }
        out.sort_by_key(|(interval, _)| *interval);
        out
    }
}
