//! # Shardlock
//!
//! A temporal lease and segment-allocation coordinator for distributed
//! batch-indexing pipelines.
//!
//! Shardlock decides, in one atomic step, whether a job may write into an
//! interval of a data source's timeline, which existing leases that
//! decision preempts, and what version and partition identity each newly
//! published segment receives. Rows route into partitions under a
//! pluggable scheme: linear append, hash by dimensions, or range by a
//! single dimension.
//!
//! Durable state lives behind the [`journal::LockJournal`] trait; the
//! coordinator itself is a single process whose in-memory picture is
//! rebuilt from the journal on startup.

pub mod allocator;
pub mod analysis;
pub mod boundaries;
pub mod config;
pub mod errors;
pub mod granularity;
pub mod journal;
pub mod lockbox;
pub mod model;
pub mod persistence;
pub mod sampler;
pub mod shard;
pub mod temporal;
pub mod version;

// Re-export the types most callers touch.
pub use allocator::{BulkAllocator, SegmentAllocator, SupervisedSegmentAllocator};
pub use analysis::{PartitionAnalysis, PartitionsSpec};
pub use boundaries::PartitionBoundaries;
pub use config::{ConfigOverrides, CoordinatorConfig};
pub use errors::CoordError;
pub use granularity::Granularity;
pub use journal::{LockJournal, SegmentIndex, TaskCatalog};
pub use lockbox::{LockResult, Lockbox};
pub use model::{
    DataSegment, DataSource, GroupId, InputRow, Lease, LockGranularity, LockKind,
    SegmentIdWithShardSpec, Task, TaskId,
};
pub use sampler::{Sampler, SamplerConfig, SamplerResponse};
pub use shard::{PartialShardSpec, ShardSpec};
pub use temporal::{Instant, Interval};

use std::sync::Arc;

/// Convenience bundle wiring a lockbox to its collaborators under one
/// configuration.
pub struct Coordinator {
    config: CoordinatorConfig,
    lockbox: Arc<Lockbox>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        journal: Arc<dyn LockJournal>,
        catalog: Arc<dyn TaskCatalog>,
        segments: Arc<dyn SegmentIndex>,
    ) -> Self {
        let lockbox = Arc::new(Lockbox::new(
            journal,
            catalog,
            segments,
            config.lock_timeout_millis,
        ));
        Self { config, lockbox }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn lockbox(&self) -> &Arc<Lockbox> {
        &self.lockbox
    }

    /// Rebuild the in-memory lock state from the journal, as done once at
    /// process start.
    pub fn sync_from_storage(&self) -> Result<(), CoordError> {
        self.lockbox.sync_from_storage()
    }
}
