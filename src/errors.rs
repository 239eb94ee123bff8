//! Error kinds surfaced by the coordinator.
//!
//! Failures that are part of normal lock-protocol traffic (contention,
//! preemption) travel as [`LockResult`](crate::lockbox::LockResult) values;
//! the variants here are reserved for conditions the caller must handle
//! explicitly or that indicate a broken invariant.

use crate::model::TaskId;
use crate::temporal::Interval;

/// Tagged error kinds for lock and allocation operations.
///
/// The core never retries on its own; every variant carries enough context
/// (task id, interval) for the caller to decide whether to retry or abort.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// A lock was requested by a task the lockbox has not seen via `add`.
    #[error("cannot grant lock to inactive task [{task_id}]")]
    InactiveTask { task_id: TaskId },

    /// The interval has non-positive duration.
    #[error("interval {interval} is empty")]
    EmptyInterval { interval: Interval },

    /// The lease the caller held, or asked about, has been preempted.
    #[error("lease on {interval} held by task [{task_id}] was revoked")]
    Revoked { task_id: TaskId, interval: Interval },

    /// The request cannot be granted right now; the caller may retry.
    #[error("cannot acquire lock on {interval}: held at equal or higher priority")]
    Contention { interval: Interval },

    /// The durable journal refused a write; the in-memory grant was rolled
    /// back before this was surfaced.
    #[error("journal write failed: {source}")]
    JournalFailure {
        #[from]
        source: anyhow::Error,
    },

    /// A bulk allocation produced fewer identities than requested.
    #[error("requested {requested} segment ids but allocated {allocated}")]
    PartitionMismatch { requested: usize, allocated: usize },

    /// Hash or range partitioning was combined with segment-level locking.
    #[error("unsupported combination: {detail}")]
    UnsupportedCombination { detail: String },

    /// A timestamp or dimension could not be derived from a row.
    #[error("unparseable row: {message}")]
    UnparseableRow { message: String },

    /// The lockbox observed state that violates its own invariants, or a
    /// request that is ill-formed beyond repair (e.g. zero hash buckets).
    #[error("lock state conflict: {detail}")]
    StateConflict { detail: String },
}

impl CoordError {
    pub(crate) fn state_conflict(detail: impl Into<String>) -> Self {
        CoordError::StateConflict {
            detail: detail.into(),
        }
    }

    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        CoordError::UnsupportedCombination {
            detail: detail.into(),
        }
    }
}
