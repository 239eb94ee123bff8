//! # Lockbox
//!
//! Remembers which active tasks have locked which intervals of which data
//! sources. Tasks may lock an interval when no task outside their group
//! holds a conflicting lease on an overlapping interval; every grant is
//! assigned a version string the task uses to publish segments.
//!
//! All public operations serialize on one process-wide mutex. A condition
//! variable signalled on every release wakes blocked [`Lockbox::lock`]
//! callers. Journal writes happen synchronously inside the critical
//! section; a failed write rolls the in-memory grant back before the
//! caller sees the failure.

use crate::errors::CoordError;
use crate::granularity::Granularity;
use crate::journal::{LockJournal, SegmentIndex, TaskCatalog};
use crate::model::{
    DataSource, Lease, LockGranularity, LockKind, SegmentIdWithShardSpec, Task, TaskId,
};
use crate::shard::{PartialShardSpec, ShardSpec};
use crate::temporal::{Instant, Interval, POS_INF};
use crate::version::{Clock, SystemClock, Versioner};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Bound::Excluded;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tracing::{debug, error, info, warn};

/// Outcome of a lock attempt that is part of normal protocol traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    Ok(Lease),
    Fail { revoked: bool },
}

impl LockResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, LockResult::Ok(_))
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self, LockResult::Fail { revoked: true })
    }

    pub fn lease(&self) -> Option<&Lease> {
        match self {
            LockResult::Ok(lease) => Some(lease),
            LockResult::Fail { .. } => None,
        }
    }
}

/// Per-row allocation request submitted by a segment allocator.
#[derive(Debug, Clone)]
pub struct SegmentAllocateRequest {
    pub timestamp: Instant,
    pub query_granularity: Granularity,
    pub preferred_segment_granularity: Granularity,
    pub sequence_name: String,
    pub previous_segment_id: Option<String>,
    pub skip_lineage_check: bool,
    pub partial: PartialShardSpec,
    pub lock_kind: LockKind,
    pub lock_granularity: LockGranularity,
}

/// Bulk request: one lease over `interval` plus `partials.len()` contiguous
/// identities minted in the same critical section.
#[derive(Debug, Clone)]
pub struct NewSegmentsRequest {
    pub kind: LockKind,
    pub granularity: LockGranularity,
    pub interval: Interval,
    pub partials: Vec<PartialShardSpec>,
    pub base_sequence_name: String,
}

/// Outcome of a bulk new-segments request.
#[derive(Debug, Clone)]
pub enum NewSegmentsResult {
    Granted {
        lease: Lease,
        segments: Vec<SegmentIdWithShardSpec>,
    },
    Fail {
        revoked: bool,
    },
}

/// The in-memory record binding a lease to its current holder tasks.
#[derive(Debug, Clone)]
pub struct LockPosse {
    pub lease: Lease,
    pub task_ids: HashSet<TaskId>,
}

/// Memo key for allocations that skip lineage checks: replicas sharing a
/// sequence name must mint the identical identity for the same chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SequenceChunkKey {
    sequence: String,
    interval: Interval,
}

#[derive(Default)]
struct LockboxState {
    /// data source -> interval (sorted by start then end) -> posses.
    /// Revoked posses stay here so later requests observe the preemption.
    running: HashMap<DataSource, BTreeMap<Interval, Vec<LockPosse>>>,
    active: HashSet<TaskId>,
    /// Allocation memo for lineage-free sequences, per chunk.
    pending_by_chunk: FxHashMap<(DataSource, SequenceChunkKey), SegmentIdWithShardSpec>,
    /// Tail identity per sequence, for lineage checks.
    sequence_tails: FxHashMap<(DataSource, String), SegmentIdWithShardSpec>,
    /// Identities minted but not yet published, per time chunk. Counted
    /// alongside the historical index when computing "previous maximum".
    pending_by_interval: FxHashMap<(DataSource, Interval), Vec<SegmentIdWithShardSpec>>,
}

type PosseRef = (Interval, usize);

pub struct Lockbox {
    state: Mutex<LockboxState>,
    released: Condvar,
    journal: Arc<dyn LockJournal>,
    catalog: Arc<dyn TaskCatalog>,
    segments: Arc<dyn SegmentIndex>,
    versioner: Versioner,
    lock_timeout_millis: u64,
}

impl Lockbox {
    pub fn new(
        journal: Arc<dyn LockJournal>,
        catalog: Arc<dyn TaskCatalog>,
        segments: Arc<dyn SegmentIndex>,
        lock_timeout_millis: u64,
    ) -> Self {
        Self::with_clock(
            journal,
            catalog,
            segments,
            lock_timeout_millis,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        journal: Arc<dyn LockJournal>,
        catalog: Arc<dyn TaskCatalog>,
        segments: Arc<dyn SegmentIndex>,
        lock_timeout_millis: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(LockboxState::default()),
            released: Condvar::new(),
            journal,
            catalog,
            segments,
            versioner: Versioner::new(clock),
            lock_timeout_millis,
        }
    }

    /// Mark a task active. Only active tasks are granted leases.
    pub fn add(&self, task: &Task) {
        let mut st = self.state.lock();
        info!(task = %task.id, "adding task to active set");
        st.active.insert(task.id.clone());
    }

    /// Release every lease owned by a task, then clear its active flag.
    /// Idempotent.
    pub fn remove(&self, task: &Task) {
        let mut st = self.state.lock();
        info!(task = %task.id, "removing task from active set");
        let intervals: Vec<Interval> = Self::posses_for_task(&st, task)
            .into_iter()
            .map(|(interval, _)| interval)
            .collect();
        for interval in intervals {
            self.unlock_locked(&mut st, task, &interval);
        }
        st.active.remove(&task.id);
    }

    /// Attempt to acquire a lease without blocking. Safe to call repeatedly
    /// until the lease is preempted.
    pub fn try_lock(
        &self,
        task: &Task,
        kind: LockKind,
        interval: &Interval,
    ) -> Result<LockResult, CoordError> {
        let mut st = self.state.lock();
        self.try_lock_locked(&mut st, task, kind, interval, None)
    }

    /// Acquire a lease, blocking up to the configured timeout for
    /// conflicting leases to be released. A zero timeout waits forever.
    pub fn lock(
        &self,
        task: &Task,
        kind: LockKind,
        interval: &Interval,
    ) -> Result<LockResult, CoordError> {
        let deadline = StdInstant::now() + Duration::from_millis(self.lock_timeout_millis);
        let mut st = self.state.lock();
        loop {
            let result = self.try_lock_locked(&mut st, task, kind, interval, None)?;
            if result.is_ok() {
                return Ok(result);
            }
            if self.lock_timeout_millis == 0 {
                self.released.wait(&mut st);
            } else if self.released.wait_until(&mut st, deadline).timed_out() {
                info!(
                    task = %task.id,
                    interval = %interval,
                    timeout_millis = self.lock_timeout_millis,
                    "lock not acquired within timeout"
                );
                return Ok(result);
            }
        }
    }

    /// Current leases held by a task.
    pub fn find_locks_for_task(&self, task: &Task) -> Vec<Lease> {
        let st = self.state.lock();
        Self::posses_for_task(&st, task)
            .into_iter()
            .map(|(interval, idx)| st.running[&task.data_source][&interval][idx].lease.clone())
            .collect()
    }

    /// Every lease currently known for a data source, revoked included,
    /// sorted by interval then version.
    pub fn leases_for_data_source(&self, data_source: &DataSource) -> Vec<Lease> {
        let st = self.state.lock();
        let mut leases: Vec<Lease> = st
            .running
            .get(data_source)
            .map(|ds_map| {
                ds_map
                    .values()
                    .flatten()
                    .map(|posse| posse.lease.clone())
                    .collect()
            })
            .unwrap_or_default();
        leases.sort_by(|a, b| a.interval.cmp(&b.interval).then(a.version.cmp(&b.version)));
        leases
    }

    /// Set the upgraded flag on an EXCLUSIVE lease, protecting it from
    /// preemption. Upgrading a revoked lease fails with `revoked = true`.
    pub fn upgrade(&self, task: &Task, interval: &Interval) -> Result<LockResult, CoordError> {
        let mut st = self.state.lock();
        let (key, idx) = Self::only_posse_containing(&st, task, interval)?;
        let posse = Self::posse_mut(&mut st, &task.data_source, &key, idx);

        if posse.lease.kind == LockKind::Shared {
            return Err(CoordError::state_conflict("shared lock cannot be upgraded"));
        }
        if posse.lease.revoked {
            return Ok(LockResult::Fail { revoked: true });
        }
        if posse.lease.upgraded {
            warn!(lease = %posse.lease, "lease is already upgraded");
            return Ok(LockResult::Ok(posse.lease.clone()));
        }

        info!(task = %task.id, lease = %posse.lease, "upgrading lease");
        let old = posse.lease.clone();
        let upgraded = old.upgrade();
        posse.lease = upgraded.clone();
        let holders: Vec<TaskId> = posse.task_ids.iter().cloned().collect();
        self.replace_journaled(&holders, &old, &upgraded);
        Ok(LockResult::Ok(upgraded))
    }

    /// Clear the upgraded flag on an EXCLUSIVE lease.
    pub fn downgrade(&self, task: &Task, interval: &Interval) -> Result<Lease, CoordError> {
        let mut st = self.state.lock();
        let (key, idx) = Self::only_posse_containing(&st, task, interval)?;
        let posse = Self::posse_mut(&mut st, &task.data_source, &key, idx);

        if posse.lease.kind == LockKind::Shared {
            return Err(CoordError::state_conflict(
                "shared lock cannot be downgraded",
            ));
        }
        if !posse.lease.upgraded {
            warn!(lease = %posse.lease, "lease is already downgraded");
            return Ok(posse.lease.clone());
        }

        info!(task = %task.id, lease = %posse.lease, "downgrading lease");
        let old = posse.lease.clone();
        let downgraded = old.downgrade();
        posse.lease = downgraded.clone();
        let holders: Vec<TaskId> = posse.task_ids.iter().cloned().collect();
        self.replace_journaled(&holders, &old, &downgraded);
        Ok(downgraded)
    }

    /// Release the lease a task holds on an exact interval. Unknown
    /// intervals are a logged no-op.
    pub fn unlock(&self, task: &Task, interval: &Interval) {
        let mut st = self.state.lock();
        self.unlock_locked(&mut st, task, interval);
    }

    /// Per-row allocation under the giant lock: select or create a lease on
    /// a chunk aligned with existing segments, complete the partial shard
    /// spec against the previous maximum, and remember the identity for
    /// sequence resume. Returns `None` when nothing can be allocated under
    /// the current lease and chunk shape.
    pub fn allocate_segment(
        &self,
        task: &Task,
        request: &SegmentAllocateRequest,
    ) -> Result<Option<SegmentIdWithShardSpec>, CoordError> {
        let mut st = self.state.lock();
        if !st.active.contains(&task.id) {
            return Err(CoordError::InactiveTask {
                task_id: task.id.clone(),
            });
        }

        let ds = task.data_source.clone();
        let row_interval = request.query_granularity.bucket(request.timestamp);
        let published = self.segments.segments_overlapping(&ds, &row_interval);

        // Candidate chunks, coarsest first. When the row's neighborhood
        // already holds segments the only candidate is their chunk; a
        // query granularity coarser than that chunk finds no candidate.
        let candidates: Vec<Interval> = if published.is_empty() {
            Granularity::finer_or_equal_candidates(request.preferred_segment_granularity)
                .into_iter()
                .map(|g| g.bucket(request.timestamp))
                .filter(|bucket| bucket.encloses(&row_interval))
                .collect()
        } else {
            published
                .iter()
                .find(|s| s.interval.encloses(&row_interval))
                .map(|s| vec![s.interval])
                .unwrap_or_default()
        };

        // A sequence chains successive rows onto one chunk. When the row
        // still falls in the chain's current chunk, the caller's previous
        // pointer must be the tail; a stale pointer means the sequence has
        // forked and the caller gets a null. A row landing on a different
        // chunk starts a fresh link there.
        let candidates = if request.skip_lineage_check {
            candidates
        } else {
            let tail = st
                .sequence_tails
                .get(&(ds.clone(), request.sequence_name.clone()));
            match tail {
                Some(tail) if candidates.contains(&tail.interval) => {
                    if request.previous_segment_id.as_deref() != Some(tail.id_string().as_str()) {
                        debug!(sequence = %request.sequence_name, "sequence forked");
                        return Ok(None);
                    }
                    vec![tail.interval]
                }
                Some(_) => candidates,
                None => {
                    if request.previous_segment_id.is_some() {
                        debug!(
                            sequence = %request.sequence_name,
                            "previous segment pointer for unknown sequence"
                        );
                        return Ok(None);
                    }
                    candidates
                }
            }
        };

        for candidate in candidates {
            if request.skip_lineage_check {
                let memo_key = (
                    ds.clone(),
                    SequenceChunkKey {
                        sequence: request.sequence_name.clone(),
                        interval: candidate,
                    },
                );
                if let Some(existing) = st.pending_by_chunk.get(&memo_key) {
                    return Ok(Some(existing.clone()));
                }
            }

            let Some(posse_ref) = self.create_or_find_posse(
                &mut st,
                task,
                &candidate,
                request.lock_kind,
                None,
                request.lock_granularity,
            )?
            else {
                continue;
            };
            let lease = match self.attach_and_journal(&mut st, task, posse_ref)? {
                LockResult::Ok(lease) => lease,
                LockResult::Fail { .. } => continue,
            };

            let overwrite = request.partial.is_overwrite();
            let historical = if overwrite {
                self.segments.max_overwrite_partition_spec(&ds, &candidate)
            } else {
                self.segments.max_partition_spec(&ds, &candidate)
            };
            if let Some(prev) = &historical {
                if !request.partial.can_follow(prev) {
                    debug!(
                        interval = %candidate,
                        "cannot extend chunk: existing shard scheme is incompatible"
                    );
                    return Ok(None);
                }
            }

            let prev = Self::max_with_pending(&st, &ds, &candidate, historical, overwrite);
            let spec = request.partial.complete(prev.as_ref())?;

            // Appending to an existing chunk reuses its version so the new
            // partition joins the visible generation; fresh chunks carry
            // the lease version.
            let version = published
                .iter()
                .filter(|s| s.interval == candidate)
                .map(|s| s.version.clone())
                .max()
                .unwrap_or_else(|| lease.version.clone());

            if request.lock_granularity == LockGranularity::Segment {
                self.extend_segment_lease(&mut st, &ds, &posse_ref, &[spec.partition_num()]);
            }

            let id = SegmentIdWithShardSpec::new(ds.clone(), candidate, version, spec);
            if request.skip_lineage_check {
                let memo_key = SequenceChunkKey {
                    sequence: request.sequence_name.clone(),
                    interval: candidate,
                };
                st.pending_by_chunk
                    .insert((ds.clone(), memo_key), id.clone());
            } else {
                st.sequence_tails
                    .insert((ds.clone(), request.sequence_name.clone()), id.clone());
            }
            st.pending_by_interval
                .entry((ds.clone(), candidate))
                .or_default()
                .push(id.clone());
            return Ok(Some(id));
        }

        Ok(None)
    }

    /// Lock an interval and mint a batch of contiguous identities in one
    /// critical section. Time-chunk grants restart partition numbering at
    /// zero; segment grants continue from the previous maximum.
    pub fn try_lock_for_new_segments(
        &self,
        task: &Task,
        request: &NewSegmentsRequest,
    ) -> Result<NewSegmentsResult, CoordError> {
        let mut st = self.state.lock();
        if !st.active.contains(&task.id) {
            return Err(CoordError::InactiveTask {
                task_id: task.id.clone(),
            });
        }
        if request.interval.is_empty() {
            return Err(CoordError::EmptyInterval {
                interval: request.interval,
            });
        }

        let ds = task.data_source.clone();
        let requested = request.partials.len();

        let Some(posse_ref) = self.create_or_find_posse(
            &mut st,
            task,
            &request.interval,
            request.kind,
            None,
            request.granularity,
        )?
        else {
            return Ok(NewSegmentsResult::Fail { revoked: false });
        };
        let lease = match self.attach_and_journal(&mut st, task, posse_ref)? {
            LockResult::Ok(lease) => lease,
            LockResult::Fail { revoked } => return Ok(NewSegmentsResult::Fail { revoked }),
        };

        let specs: Vec<ShardSpec> = if request.granularity == LockGranularity::TimeChunk {
            request
                .partials
                .iter()
                .enumerate()
                .map(|(ordinal, partial)| partial.complete_with_partition(ordinal as i32))
                .collect()
        } else {
            let mut completed = Vec::with_capacity(requested);
            let overwrite = request
                .partials
                .first()
                .map(|p| p.is_overwrite())
                .unwrap_or(false);
            let historical = if overwrite {
                self.segments
                    .max_overwrite_partition_spec(&ds, &request.interval)
            } else {
                self.segments.max_partition_spec(&ds, &request.interval)
            };
            let mut prev = Self::max_with_pending(&st, &ds, &request.interval, historical, overwrite);
            for partial in &request.partials {
                if let Some(prev_spec) = &prev {
                    if !partial.can_follow(prev_spec) {
                        break;
                    }
                }
                let spec = partial.complete(prev.as_ref())?;
                prev = Some(spec.clone());
                completed.push(spec);
            }
            completed
        };

        if specs.len() != requested {
            return Err(CoordError::PartitionMismatch {
                requested,
                allocated: specs.len(),
            });
        }

        if request.granularity == LockGranularity::Segment {
            let partitions: Vec<i32> = specs.iter().map(|s| s.partition_num()).collect();
            self.extend_segment_lease(&mut st, &ds, &posse_ref, &partitions);
        }

        let version = lease.version.clone();
        let segments: Vec<SegmentIdWithShardSpec> = specs
            .into_iter()
            .map(|spec| {
                SegmentIdWithShardSpec::new(ds.clone(), request.interval, version.clone(), spec)
            })
            .collect();

        st.pending_by_interval
            .entry((ds.clone(), request.interval))
            .or_default()
            .extend(segments.iter().cloned());

        debug!(
            task = %task.id,
            interval = %request.interval,
            sequence = %request.base_sequence_name,
            count = segments.len(),
            "bulk-allocated segment identities"
        );
        Ok(NewSegmentsResult::Granted { lease, segments })
    }

    /// Wipe the in-memory state and rebuild it from the catalog and the
    /// journal, replaying leases in version order. Per-lease reattach
    /// mismatches are logged and tolerated.
    pub fn sync_from_storage(&self) -> Result<(), CoordError> {
        let mut st = self.state.lock();

        let tasks = self.catalog.active_tasks();
        let mut stored: Vec<(Task, Lease)> = Vec::new();
        for task in &tasks {
            for lease in self.journal.leases_for_task(&task.id)? {
                stored.push((task.clone(), lease));
            }
        }
        stored.sort_by(|a, b| a.1.version.cmp(&b.1.version).then(a.0.id.cmp(&b.0.id)));

        *st = LockboxState::default();
        st.active = tasks.iter().map(|t| t.id.clone()).collect();

        let total = stored.len();
        let mut reattached = 0usize;
        for (task, saved) in &stored {
            if saved.interval.is_empty() {
                warn!(task = %task.id, "ignoring journaled lease with empty interval");
                continue;
            }
            self.versioner
                .observe(&saved.data_source, &saved.interval, &saved.version);
            match self.create_or_find_posse(
                &mut st,
                task,
                &saved.interval,
                saved.kind,
                Some(&saved.version),
                saved.granularity,
            ) {
                Ok(Some((key, idx))) => {
                    let posse = Self::posse_mut(&mut st, &task.data_source, &key, idx);
                    posse.task_ids.insert(task.id.clone());
                    if posse.lease.version == saved.version {
                        posse.lease.revoked |= saved.revoked;
                        posse.lease.upgraded |= saved.upgraded;
                        if let Some(saved_partitions) = &saved.partitions {
                            posse
                                .lease
                                .partitions
                                .get_or_insert_with(BTreeSet::new)
                                .extend(saved_partitions.iter().copied());
                        }
                        info!(
                            task = %task.id,
                            interval = %saved.interval,
                            version = %saved.version,
                            "reacquired lease"
                        );
                    } else {
                        info!(
                            task = %task.id,
                            interval = %saved.interval,
                            saved_version = %saved.version,
                            got_version = %posse.lease.version,
                            "reacquired lease under a different version"
                        );
                    }
                    reattached += 1;
                }
                Ok(None) => {
                    warn!(
                        task = %task.id,
                        interval = %saved.interval,
                        version = %saved.version,
                        "could not reacquire journaled lease"
                    );
                }
                Err(e) => {
                    warn!(
                        task = %task.id,
                        interval = %saved.interval,
                        error = %e,
                        "error reattaching journaled lease"
                    );
                }
            }
        }
        info!(
            leases = reattached,
            tasks = st.active.len(),
            ignored = total - reattached,
            "synced lockbox from storage"
        );
        Ok(())
    }

    // ---- internals, all under the giant lock ----

    fn try_lock_locked(
        &self,
        st: &mut LockboxState,
        task: &Task,
        kind: LockKind,
        interval: &Interval,
        preferred_version: Option<&str>,
    ) -> Result<LockResult, CoordError> {
        if !st.active.contains(&task.id) {
            return Err(CoordError::InactiveTask {
                task_id: task.id.clone(),
            });
        }
        if interval.is_empty() {
            return Err(CoordError::EmptyInterval {
                interval: *interval,
            });
        }

        match self.create_or_find_posse(
            st,
            task,
            interval,
            kind,
            preferred_version,
            LockGranularity::TimeChunk,
        )? {
            Some(posse_ref) => self.attach_and_journal(st, task, posse_ref),
            None => Ok(LockResult::Fail { revoked: false }),
        }
    }

    /// The grant algorithm. Returns the posse to use, or `None` when the
    /// request cannot be granted against the current landscape.
    fn create_or_find_posse(
        &self,
        st: &mut LockboxState,
        task: &Task,
        interval: &Interval,
        kind: LockKind,
        preferred_version: Option<&str>,
        granularity: LockGranularity,
    ) -> Result<Option<PosseRef>, CoordError> {
        let ds = &task.data_source;
        let found = Self::posses_overlapping(st, ds, interval);

        if found.is_empty() {
            return Ok(Some(self.mint_posse(
                st,
                task,
                interval,
                kind,
                preferred_version,
                granularity,
            )));
        }

        // A posse this task (or its group) held that has since been revoked
        // is returned as-is, so the caller observes `revoked = true` and can
        // tell preemption from plain contention.
        let own_revoked = found.iter().find(|(key, idx)| {
            let posse = &st.running[ds][key][*idx];
            posse.lease.revoked
                && (posse.task_ids.contains(&task.id)
                    || (posse.lease.group_id == task.group_id
                        && posse.lease.interval.encloses(interval)))
        });
        if let Some(posse_ref) = own_revoked {
            return Ok(Some(*posse_ref));
        }

        let all_shared = found.iter().all(|(key, idx)| {
            st.running[ds][key][*idx].lease.kind == LockKind::Shared
        });

        if kind == LockKind::Shared && all_shared {
            let reusable: Vec<PosseRef> = found
                .iter()
                .filter(|(key, idx)| {
                    let lease = &st.running[ds][key][*idx].lease;
                    lease.group_id == task.group_id && lease.interval.encloses(interval)
                })
                .cloned()
                .collect();
            return match reusable.len() {
                0 => Ok(Some(self.mint_posse(
                    st,
                    task,
                    interval,
                    kind,
                    preferred_version,
                    granularity,
                ))),
                1 => Ok(Some(reusable[0])),
                _ => Err(CoordError::state_conflict(format!(
                    "task group [{}] has multiple shared locks for interval {}",
                    task.group_id, interval
                ))),
            };
        }

        if found.len() == 1 {
            let (key, idx) = found[0];
            let lease = &st.running[ds][&key][idx].lease;
            if lease.group_id == task.group_id && lease.interval.encloses(interval) {
                if lease.kind == kind {
                    return Ok(Some((key, idx)));
                }
                return Err(CoordError::state_conflict(format!(
                    "task [{}] already holds a lock on {} of a different kind",
                    task.id, interval
                )));
            }
        }

        let all_revocable = found.iter().all(|(key, idx)| {
            st.running[ds][key][*idx]
                .lease
                .is_revocable_by(task.priority)
        });
        if all_revocable {
            for posse_ref in &found {
                self.revoke_posse(st, ds, posse_ref);
            }
            return Ok(Some(self.mint_posse(
                st,
                task,
                interval,
                kind,
                preferred_version,
                granularity,
            )));
        }

        info!(
            task = %task.id,
            interval = %interval,
            "cannot grant: conflicting leases at equal or higher priority"
        );
        Ok(None)
    }

    fn mint_posse(
        &self,
        st: &mut LockboxState,
        task: &Task,
        interval: &Interval,
        kind: LockKind,
        preferred_version: Option<&str>,
        granularity: LockGranularity,
    ) -> PosseRef {
        let ds = &task.data_source;
        let version = match preferred_version {
            // Trust the caller's monotonicity contract, but keep our own
            // high-water mark in sync with it.
            Some(version) => {
                self.versioner.observe(ds, interval, version);
                version.to_string()
            }
            None => self.versioner.mint(ds, interval),
        };

        let posse = LockPosse {
            lease: Lease {
                kind,
                granularity,
                group_id: task.group_id.clone(),
                data_source: ds.clone(),
                interval: *interval,
                partitions: None,
                version,
                priority: task.priority,
                revoked: false,
                upgraded: false,
            },
            task_ids: HashSet::new(),
        };
        let posses = st
            .running
            .entry(ds.clone())
            .or_default()
            .entry(*interval)
            .or_default();
        posses.push(posse);
        (*interval, posses.len() - 1)
    }

    /// Add the task to a posse and journal the lease. Journal failures roll
    /// the grant back and surface as a plain (non-revoked) failure.
    fn attach_and_journal(
        &self,
        st: &mut LockboxState,
        task: &Task,
        (key, idx): PosseRef,
    ) -> Result<LockResult, CoordError> {
        let ds = task.data_source.clone();
        let posse = Self::posse_mut(st, &ds, &key, idx);

        if posse.lease.revoked {
            return Ok(LockResult::Fail { revoked: true });
        }
        if posse.task_ids.contains(&task.id) {
            debug!(task = %task.id, lease = %posse.lease, "task already present in posse");
            return Ok(LockResult::Ok(posse.lease.clone()));
        }
        if posse.lease.group_id != task.group_id || posse.lease.priority != task.priority {
            return Err(CoordError::state_conflict(format!(
                "task [{}] does not match posse group [{}] at priority {}",
                task.id, posse.lease.group_id, posse.lease.priority
            )));
        }

        posse.task_ids.insert(task.id.clone());
        let lease = posse.lease.clone();
        info!(task = %task.id, lease = %lease, "added task to lease");

        if let Err(e) = self.journal.append(&task.id, &lease) {
            error!(
                task = %task.id,
                data_source = %lease.data_source,
                interval = %lease.interval,
                version = %lease.version,
                error = %e,
                "failed to persist lease; rolling grant back"
            );
            self.unlock_locked(st, task, &key);
            return Ok(LockResult::Fail { revoked: false });
        }
        Ok(LockResult::Ok(lease))
    }

    /// Mark a posse revoked. The posse is kept in the map and the journal
    /// so holders observe the preemption; it disappears once every holder
    /// releases.
    fn revoke_posse(&self, st: &mut LockboxState, ds: &DataSource, (key, idx): &PosseRef) {
        let posse = Self::posse_mut(st, ds, key, *idx);
        if posse.lease.revoked {
            warn!(lease = %posse.lease, "lease is already revoked");
            return;
        }
        info!(lease = %posse.lease, "revoking lease");
        let old = posse.lease.clone();
        posse.lease = old.revoke();
        let revoked = posse.lease.clone();
        let holders: Vec<TaskId> = posse.task_ids.iter().cloned().collect();
        self.replace_journaled(&holders, &old, &revoked);
    }

    fn replace_journaled(&self, holders: &[TaskId], old: &Lease, new: &Lease) {
        for task_id in holders {
            if let Err(e) = self.journal.replace(task_id, old, new) {
                error!(
                    task = %task_id,
                    interval = %old.interval,
                    error = %e,
                    "failed to replace journaled lease"
                );
            }
        }
    }

    /// Record freshly minted partition numbers on a SEGMENT-granularity
    /// lease and replace the journaled copies.
    fn extend_segment_lease(
        &self,
        st: &mut LockboxState,
        ds: &DataSource,
        (key, idx): &PosseRef,
        partitions: &[i32],
    ) {
        let posse = Self::posse_mut(st, ds, key, *idx);
        let old = posse.lease.clone();
        posse
            .lease
            .partitions
            .get_or_insert_with(BTreeSet::new)
            .extend(partitions.iter().copied());
        if posse.lease.partitions == old.partitions {
            return;
        }
        let new = posse.lease.clone();
        let holders: Vec<TaskId> = posse.task_ids.iter().cloned().collect();
        self.replace_journaled(&holders, &old, &new);
    }

    fn unlock_locked(&self, st: &mut LockboxState, task: &Task, interval: &Interval) {
        let ds = task.data_source.clone();
        let Some(ds_map) = st.running.get_mut(&ds) else {
            debug!(task = %task.id, interval = %interval, "unlock of unknown data source");
            return;
        };
        let Some(posses) = ds_map.get_mut(interval) else {
            debug!(task = %task.id, interval = %interval, "unlock of unknown interval");
            return;
        };

        let mut released: Vec<Lease> = Vec::new();
        for posse in posses.iter_mut() {
            if posse.task_ids.remove(&task.id) {
                info!(task = %task.id, lease = %posse.lease, "removing task from lease");
                released.push(posse.lease.clone());
            }
        }
        if released.is_empty() {
            warn!(task = %task.id, interval = %interval, "lock release without acquire");
            return;
        }

        posses.retain(|posse| !posse.task_ids.is_empty());
        if posses.is_empty() {
            ds_map.remove(interval);
        }
        if ds_map.is_empty() {
            st.running.remove(&ds);
        }

        // Wake blocked lock() waiters.
        self.released.notify_all();

        for lease in released {
            if let Err(e) = self.journal.remove(&task.id, &lease) {
                error!(
                    task = %task.id,
                    data_source = %lease.data_source,
                    interval = %lease.interval,
                    version = %lease.version,
                    error = %e,
                    "failed to clean released lease from journal"
                );
            }
        }
    }

    /// All posses whose interval overlaps the search interval. The interval
    /// map is sorted by start-then-end, so the candidates are the floor
    /// entry relative to `[start, +inf)` plus every key starting strictly
    /// inside the search interval, filtered by a real overlap check.
    fn posses_overlapping(
        st: &LockboxState,
        ds: &DataSource,
        interval: &Interval,
    ) -> Vec<PosseRef> {
        let Some(ds_map) = st.running.get(ds) else {
            return Vec::new();
        };

        let floor_probe = Interval::probe(interval.start, POS_INF);
        // The floor entry plus its same-start siblings: revoked posses can
        // share a start with the lease that displaced them.
        let mut floor_keys: Vec<Interval> = Vec::new();
        {
            let mut backwards = ds_map.range(..=floor_probe).rev();
            if let Some((first, _)) = backwards.next() {
                floor_keys.push(*first);
                let anchor = first.start;
                floor_keys.extend(
                    backwards
                        .take_while(|(key, _)| key.start == anchor)
                        .map(|(key, _)| *key),
                );
            }
        }
        let interior = ds_map
            .range((
                Excluded(floor_probe),
                Excluded(Interval::probe(interval.end, interval.end)),
            ))
            .map(|(key, _)| *key);

        floor_keys
            .into_iter()
            .chain(interior)
            .filter(|key| key.overlaps(interval))
            .flat_map(|key| {
                let count = ds_map[&key].len();
                (0..count).map(move |idx| (key, idx))
            })
            .collect()
    }

    fn posses_for_task(st: &LockboxState, task: &Task) -> Vec<PosseRef> {
        let Some(ds_map) = st.running.get(&task.data_source) else {
            return Vec::new();
        };
        ds_map
            .iter()
            .flat_map(|(key, posses)| {
                posses
                    .iter()
                    .enumerate()
                    .filter(|(_, posse)| posse.task_ids.contains(&task.id))
                    .map(|(idx, _)| (*key, idx))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// The single posse holding `task` whose lease interval encloses the
    /// requested interval. Zero or several is a consistency fault.
    fn only_posse_containing(
        st: &LockboxState,
        task: &Task,
        interval: &Interval,
    ) -> Result<PosseRef, CoordError> {
        let ds = &task.data_source;
        let matching: Vec<PosseRef> = Self::posses_overlapping(st, ds, interval)
            .into_iter()
            .filter(|(key, idx)| {
                let posse = &st.running[ds][key][*idx];
                posse.lease.interval.encloses(interval) && posse.task_ids.contains(&task.id)
            })
            .collect();
        match matching.len() {
            1 => Ok(matching[0]),
            0 => Err(CoordError::state_conflict(format!(
                "cannot find lock for task [{}] and interval {}",
                task.id, interval
            ))),
            _ => Err(CoordError::state_conflict(format!(
                "multiple lock posses for task [{}] and interval {}",
                task.id, interval
            ))),
        }
    }

    fn posse_mut<'a>(
        st: &'a mut LockboxState,
        ds: &DataSource,
        key: &Interval,
        idx: usize,
    ) -> &'a mut LockPosse {
        st.running
            .get_mut(ds)
            .and_then(|ds_map| ds_map.get_mut(key))
            .and_then(|posses| posses.get_mut(idx))
            .expect("posse reference is valid under the giant lock")
    }

    fn max_with_pending(
        st: &LockboxState,
        ds: &DataSource,
        interval: &Interval,
        historical: Option<ShardSpec>,
        overwrite: bool,
    ) -> Option<ShardSpec> {
        let pending = st
            .pending_by_interval
            .get(&(ds.clone(), *interval))
            .into_iter()
            .flatten()
            .map(|id| &id.shard_spec)
            .filter(|spec| spec.is_overwrite() == overwrite)
            .max_by_key(|spec| spec.partition_num())
            .cloned();
        match (historical, pending) {
            (Some(h), Some(p)) => {
                if h.partition_num() >= p.partition_num() {
                    Some(h)
                } else {
                    Some(p)
                }
            }
            (h, p) => h.or(p),
        }
    }
}
