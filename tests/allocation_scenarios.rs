//! End-to-end allocation scenarios: sequence chains, granularity snapping,
//! and routing consistency across the partitioning schemes.

mod support;

use shardlock::analysis::{
    HashPartitionAnalysis, LinearPartitionAnalysis, PartitionAnalysis, RangePartitionAnalysis,
};
use shardlock::boundaries::PartitionBoundaries;
use shardlock::shard::{bucket_for_row, ShardSpec};
use shardlock::temporal::format_instant;
use shardlock::{
    DataSegment, Granularity, InputRow, Instant, LockGranularity, LockKind, SegmentAllocator,
    SegmentIdWithShardSpec, Task,
};
use support::{data_source, hour_of, party_time, the_distant_future, Harness};

fn linear_allocator(
    harness: &Harness,
    query: Granularity,
    preferred: Granularity,
) -> SegmentAllocator {
    SegmentAllocator::new(
        harness.lockbox.clone(),
        data_source(),
        query,
        preferred,
        LockKind::Exclusive,
        LockGranularity::TimeChunk,
        PartitionAnalysis::Linear(LinearPartitionAnalysis::new()),
        true,
        None,
    )
}

fn allocate(
    harness: &Harness,
    task: &Task,
    timestamp: Instant,
    query: Granularity,
    preferred: Granularity,
    sequence: &str,
    previous: Option<&SegmentIdWithShardSpec>,
) -> Option<SegmentIdWithShardSpec> {
    let row = InputRow::new(timestamp);
    let previous_id = previous.map(|id| id.id_string());
    linear_allocator(harness, query, preferred)
        .allocate(task, &row, sequence, previous_id.as_deref(), false)
        .unwrap()
}

fn announce_numbered(harness: &Harness, interval: shardlock::Interval, version: &str, count: i32) {
    for partition in 0..count {
        harness.segments.announce(DataSegment::new(
            data_source(),
            interval,
            version,
            ShardSpec::Numbered {
                partition_num: partition,
                num_core_partitions: count,
            },
        ));
    }
}

#[test]
fn test_many_segments_one_interval() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    let id1 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        None,
    )
    .expect("first allocation");
    let id2 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        Some(&id1),
    )
    .expect("second allocation");
    let id3 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        Some(&id2),
    )
    .expect("third allocation");

    let expected_interval = hour_of(party_time());
    for (ordinal, id) in [(0, &id1), (1, &id2), (2, &id3)] {
        assert_eq!(id.interval, expected_interval);
        assert_eq!(id.shard_spec.partition_num(), ordinal);
        assert_eq!(id.version, id1.version, "identities share one version");
    }
}

#[test]
fn test_stale_previous_pointer_forks_sequence() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    let id1 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        None,
    )
    .unwrap();
    let id2 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        Some(&id1),
    )
    .unwrap();
    let _id3 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        Some(&id2),
    )
    .unwrap();

    // The tail has moved past id1: resuming from it on the same chunk is a
    // fork and yields null.
    let forked = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        Some(&id1),
    );
    assert!(forked.is_none());

    // A row on a distant chunk starts a fresh link there regardless of the
    // stale pointer.
    let distant = allocate(
        &harness,
        &task,
        the_distant_future(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        Some(&id1),
    )
    .expect("allocation on a distinct interval");
    assert_eq!(distant.interval, hour_of(the_distant_future()));
    assert_ne!(distant.interval, id1.interval);
    assert_eq!(distant.shard_spec.partition_num(), 0);
}

#[test]
fn test_multiple_sequences_interleave_partitions() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    let id1 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        None,
    )
    .unwrap();
    let id2 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s2",
        None,
    )
    .unwrap();
    let id3 = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        Some(&id1),
    )
    .unwrap();

    assert_eq!(id1.shard_spec.partition_num(), 0);
    assert_eq!(id2.shard_spec.partition_num(), 1);
    assert_eq!(id3.shard_spec.partition_num(), 2);
    assert_eq!(id1.version, id2.version);
}

#[test]
fn test_snap_to_existing_coarser_preference() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    let hour = hour_of(party_time());
    let version = format_instant(party_time());
    announce_numbered(&harness, hour, &version, 2);

    // Preferred DAY snaps down to the existing hour chunk and appends.
    let id = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Day,
        "s1",
        None,
    )
    .expect("snapped allocation");
    assert_eq!(id.interval, hour);
    assert_eq!(id.version, version);
    assert_eq!(id.shard_spec.partition_num(), 2);
    assert_eq!(id.shard_spec.num_core_partitions(), 2);
}

#[test]
fn test_snap_to_existing_finer_preference() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    let hour = hour_of(party_time());
    announce_numbered(&harness, hour, &format_instant(party_time()), 2);

    // Preferred MINUTE snaps up to the existing coarser hour chunk.
    let id = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Minute,
        "s1",
        None,
    )
    .expect("snapped allocation");
    assert_eq!(id.interval, hour);
    assert_eq!(id.shard_spec.partition_num(), 2);
}

#[test]
fn test_coarser_query_granularity_cannot_allocate() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    announce_numbered(&harness, hour_of(party_time()), &format_instant(party_time()), 2);

    // The day-wide row interval cannot fit in the existing hour chunk.
    let id = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::Day,
        Granularity::Day,
        "s1",
        None,
    );
    assert!(id.is_none());
}

#[test]
fn test_query_granularity_coarser_than_preferred_segment() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    // No existing segments: still nothing can hold a day-wide row interval
    // inside hour-or-finer chunks.
    let id = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::Day,
        Granularity::Hour,
        "s1",
        None,
    );
    assert!(id.is_none());
}

#[test]
fn test_cannot_append_to_range_partitioned_chunk() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    let hour = hour_of(party_time());
    let version = format_instant(party_time());
    harness.segments.announce(DataSegment::new(
        data_source(),
        hour,
        &version,
        ShardSpec::SingleDim {
            dimension: "foo".to_string(),
            start: None,
            end: Some("bar".to_string()),
            partition_num: 0,
            num_buckets: None,
        },
    ));
    harness.segments.announce(DataSegment::new(
        data_source(),
        hour,
        &version,
        ShardSpec::SingleDim {
            dimension: "foo".to_string(),
            start: Some("bar".to_string()),
            end: None,
            partition_num: 1,
            num_buckets: None,
        },
    ));

    let id = allocate(
        &harness,
        &task,
        party_time(),
        Granularity::None,
        Granularity::Hour,
        "s1",
        None,
    );
    assert!(id.is_none());
}

#[test]
fn test_hash_routing_consistency() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    let hour = hour_of(party_time());
    let num_buckets = 3;
    let dimensions = vec!["dim1".to_string()];
    let mut analysis = HashPartitionAnalysis::new(dimensions.clone());
    analysis.update_bucket(hour, num_buckets);

    let allocator = SegmentAllocator::new(
        harness.lockbox.clone(),
        data_source(),
        Granularity::None,
        Granularity::Hour,
        LockKind::Exclusive,
        LockGranularity::TimeChunk,
        PartitionAnalysis::Hashed(analysis),
        true,
        None,
    );

    let mut last_partition = -1;
    for (i, value) in ["alpha", "bravo", "charlie", "delta"].into_iter().enumerate() {
        let row = InputRow::new(party_time()).with_dimension("dim1", &[value]);
        let id = allocator
            .allocate(&task, &row, &format!("s{i}"), None, true)
            .unwrap()
            .expect("hashed allocation");

        let expected_bucket = bucket_for_row(&dimensions, &row, num_buckets);
        assert_eq!(id.shard_spec.bucket_id(), Some(expected_bucket));
        assert!(id.shard_spec.accepts(&row));
        // Partition numbers strictly increase in completion order.
        assert!(id.shard_spec.partition_num() > last_partition);
        last_partition = id.shard_spec.partition_num();
    }
}

#[test]
fn test_range_routing_consistency() {
    let harness = Harness::new();
    let task = support::task(50);
    harness.activate(&task);

    let hour = hour_of(party_time());
    let boundaries = PartitionBoundaries::from_values(["a", "c", "f", "z"]);
    let mut analysis = RangePartitionAnalysis::new("dim");
    analysis.update_bucket(hour, boundaries.clone());

    let allocator = SegmentAllocator::new(
        harness.lockbox.clone(),
        data_source(),
        Granularity::None,
        Granularity::Hour,
        LockKind::Exclusive,
        LockGranularity::TimeChunk,
        PartitionAnalysis::Range(analysis),
        true,
        None,
    );

    let expected = [
        ("b", 0, None, Some("c")),
        ("d", 1, Some("c"), Some("f")),
        ("g", 2, Some("f"), None),
    ];
    for (i, (value, bucket, start, end)) in expected.into_iter().enumerate() {
        assert_eq!(boundaries.bucket_for(Some(value)), bucket);

        let row = InputRow::new(party_time()).with_dimension("dim", &[value]);
        let id = allocator
            .allocate(&task, &row, &format!("s{i}"), None, true)
            .unwrap()
            .expect("range allocation");
        match &id.shard_spec {
            ShardSpec::SingleDim {
                start: got_start,
                end: got_end,
                ..
            } => {
                assert_eq!(got_start.as_deref(), start);
                assert_eq!(got_end.as_deref(), end);
            }
            other => panic!("expected single_dim spec, got {other:?}"),
        }
        assert!(id.shard_spec.accepts(&row));
    }
}

#[test]
fn test_skip_lineage_replicas_mint_identical_identity() {
    let harness = Harness::new();
    let t1 = support::task_in_group("replica_group", 50);
    let t2 = support::task_in_group("replica_group", 50);
    harness.activate(&t1);
    harness.activate(&t2);

    let row = InputRow::new(party_time());
    let a = linear_allocator(&harness, Granularity::None, Granularity::Hour)
        .allocate(&t1, &row, "base_seq", None, true)
        .unwrap()
        .expect("replica one");
    let b = linear_allocator(&harness, Granularity::None, Granularity::Hour)
        .allocate(&t2, &row, "base_seq", None, true)
        .unwrap()
        .expect("replica two");

    assert_eq!(a, b);
}
