//! Shard specs: the routing descriptors that both name a segment's
//! partition and decide whether a row belongs in it.
//!
//! A [`PartialShardSpec`] describes a *potential* shard; completing it
//! against the previous-maximum partition identity of an interval yields
//! the final [`ShardSpec`]. Completion is pure: the same inputs always
//! mint the same identity.

use crate::errors::CoordError;
use crate::model::InputRow;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// First partition number of the non-root generation. Overwrite segments
/// shadow a root-generation range and live in their own id space so the
/// two never collide.
pub const OVERWRITE_PARTITION_START: i32 = 32768;

/// Fully-resolved routing descriptor of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ShardSpec {
    /// Size-based append partitioning with no core set.
    Linear { partition_num: i32 },
    /// Append partitioning with a known core partition set.
    Numbered {
        partition_num: i32,
        num_core_partitions: i32,
    },
    /// Hash partitioning over a dimension tuple.
    Hashed {
        partition_num: i32,
        num_core_partitions: i32,
        bucket_id: i32,
        num_buckets: i32,
        partition_dimensions: Vec<String>,
    },
    /// Range partitioning on one dimension; `None` bounds are the
    /// -inf / +inf sentinels.
    SingleDim {
        dimension: String,
        start: Option<String>,
        end: Option<String>,
        partition_num: i32,
        num_buckets: Option<i32>,
    },
    /// A minor generation shadowing a contiguous root-generation range.
    NumberedOverwrite {
        partition_num: i32,
        start_root_partition_id: i32,
        end_root_partition_id: i32,
        minor_version: i32,
    },
}

impl ShardSpec {
    pub fn partition_num(&self) -> i32 {
        match self {
            ShardSpec::Linear { partition_num }
            | ShardSpec::Numbered { partition_num, .. }
            | ShardSpec::Hashed { partition_num, .. }
            | ShardSpec::SingleDim { partition_num, .. }
            | ShardSpec::NumberedOverwrite { partition_num, .. } => *partition_num,
        }
    }

    pub fn num_core_partitions(&self) -> i32 {
        match self {
            ShardSpec::Numbered {
                num_core_partitions,
                ..
            }
            | ShardSpec::Hashed {
                num_core_partitions,
                ..
            } => *num_core_partitions,
            _ => 0,
        }
    }

    /// Bucket identity for the schemes that have one.
    pub fn bucket_id(&self) -> Option<i32> {
        match self {
            ShardSpec::Hashed { bucket_id, .. } => Some(*bucket_id),
            ShardSpec::SingleDim {
                partition_num,
                num_buckets,
                ..
            } => Some(match num_buckets {
                Some(n) if *n > 0 => partition_num % n,
                _ => *partition_num,
            }),
            _ => None,
        }
    }

    /// True for specs in the overwrite (non-root) partition id space.
    pub fn is_overwrite(&self) -> bool {
        matches!(self, ShardSpec::NumberedOverwrite { .. })
    }

    /// Whether a row routes into this shard. Append shards accept
    /// everything; hashed and range shards check bucket membership.
    pub fn accepts(&self, row: &InputRow) -> bool {
        match self {
            ShardSpec::Linear { .. }
            | ShardSpec::Numbered { .. }
            | ShardSpec::NumberedOverwrite { .. } => true,
            ShardSpec::Hashed {
                bucket_id,
                num_buckets,
                partition_dimensions,
                ..
            } => {
                *num_buckets > 0
                    && bucket_for_row(partition_dimensions, row, *num_buckets) == *bucket_id
            }
            ShardSpec::SingleDim {
                dimension,
                start,
                end,
                ..
            } => range_accepts(
                start.as_deref(),
                end.as_deref(),
                row.dimension_value(dimension),
            ),
        }
    }
}

fn range_accepts(start: Option<&str>, end: Option<&str>, value: Option<&str>) -> bool {
    match value {
        None => start.is_none(),
        Some(v) => {
            let above_start = match start {
                None => true,
                Some(s) => v >= s,
            };
            let below_end = match end {
                None => true,
                Some(e) => v < e,
            };
            above_start && below_end
        }
    }
}

/// Deterministic hash of a row's partition dimensions. With no explicit
/// dimensions, the timestamp and the full dimension map are hashed so that
/// identical rows always land in the same bucket.
pub fn hash_row_dimensions(partition_dimensions: &[String], row: &InputRow) -> u64 {
    let mut hasher = DefaultHasher::new();
    if partition_dimensions.is_empty() {
        row.timestamp.hash(&mut hasher);
        for (name, values) in &row.dimensions {
            name.hash(&mut hasher);
            values.hash(&mut hasher);
        }
    } else {
        for dimension in partition_dimensions {
            row.dimension(dimension).hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Hash bucket of a row under `num_buckets` buckets.
pub fn bucket_for_row(partition_dimensions: &[String], row: &InputRow, num_buckets: i32) -> i32 {
    (hash_row_dimensions(partition_dimensions, row) % num_buckets as u64) as i32
}

/// A potential shard, waiting for the previous-maximum partition identity
/// of its interval to become final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PartialShardSpec {
    Numbered,
    Hashed {
        partition_dimensions: Vec<String>,
        bucket_id: i32,
        num_buckets: i32,
    },
    SingleDim {
        dimension: String,
        start: Option<String>,
        end: Option<String>,
        bucket_id: i32,
        num_buckets: i32,
    },
    NumberedOverwrite {
        start_root_partition_id: i32,
        end_root_partition_id: i32,
        minor_version: i32,
    },
}

impl PartialShardSpec {
    /// True for partials allocating in the overwrite id space.
    pub fn is_overwrite(&self) -> bool {
        matches!(self, PartialShardSpec::NumberedOverwrite { .. })
    }

    /// Whether this partial may extend a chunk whose current maximum
    /// partition carries `prev`. Append schemes cannot extend range-routed
    /// chunks: the new shard would have no place in the boundary order.
    pub fn can_follow(&self, prev: &ShardSpec) -> bool {
        match self {
            PartialShardSpec::Numbered | PartialShardSpec::Hashed { .. } => matches!(
                prev,
                ShardSpec::Linear { .. } | ShardSpec::Numbered { .. } | ShardSpec::Hashed { .. }
            ),
            PartialShardSpec::SingleDim { dimension, .. } => {
                matches!(prev, ShardSpec::SingleDim { dimension: d, .. } if d == dimension)
            }
            PartialShardSpec::NumberedOverwrite { .. } => prev.is_overwrite(),
        }
    }

    /// Complete into a full spec given the previous maximum in the same
    /// id space, or `None` when the interval holds nothing yet.
    pub fn complete(&self, prev: Option<&ShardSpec>) -> Result<ShardSpec, CoordError> {
        match self {
            PartialShardSpec::Numbered => Ok(ShardSpec::Numbered {
                partition_num: prev.map(|p| p.partition_num() + 1).unwrap_or(0),
                num_core_partitions: prev.map(|p| p.num_core_partitions()).unwrap_or(0),
            }),
            PartialShardSpec::Hashed {
                partition_dimensions,
                bucket_id,
                num_buckets,
            } => {
                if *num_buckets <= 0 {
                    return Err(CoordError::state_conflict(format!(
                        "hashed partial shard spec with numBuckets [{num_buckets}]"
                    )));
                }
                // Next partition at or above prev + 1 that is congruent to
                // the bucket id, so partition -> bucket stays derivable.
                let partition_num = match prev {
                    None => *bucket_id,
                    Some(p) => {
                        let base = p.partition_num() + 1;
                        base + (bucket_id - base).rem_euclid(*num_buckets)
                    }
                };
                Ok(ShardSpec::Hashed {
                    partition_num,
                    num_core_partitions: prev.map(|p| p.num_core_partitions()).unwrap_or(0),
                    bucket_id: *bucket_id,
                    num_buckets: *num_buckets,
                    partition_dimensions: partition_dimensions.clone(),
                })
            }
            PartialShardSpec::SingleDim {
                dimension,
                start,
                end,
                bucket_id: _,
                num_buckets,
            } => {
                if *num_buckets <= 0 {
                    return Err(CoordError::state_conflict(format!(
                        "single-dim partial shard spec with numBuckets [{num_buckets}]"
                    )));
                }
                Ok(ShardSpec::SingleDim {
                    dimension: dimension.clone(),
                    start: start.clone(),
                    end: end.clone(),
                    partition_num: prev.map(|p| p.partition_num() + 1).unwrap_or(0),
                    num_buckets: Some(*num_buckets),
                })
            }
            PartialShardSpec::NumberedOverwrite {
                start_root_partition_id,
                end_root_partition_id,
                minor_version,
            } => Ok(ShardSpec::NumberedOverwrite {
                partition_num: prev
                    .map(|p| (p.partition_num() + 1).max(OVERWRITE_PARTITION_START))
                    .unwrap_or(OVERWRITE_PARTITION_START),
                start_root_partition_id: *start_root_partition_id,
                end_root_partition_id: *end_root_partition_id,
                minor_version: *minor_version,
            }),
        }
    }

    /// Complete with an explicit ordinal, used by bulk grants that reset
    /// partition numbering within a fresh time-chunk lease.
    pub fn complete_with_partition(&self, partition_num: i32) -> ShardSpec {
        match self {
            PartialShardSpec::Numbered => ShardSpec::Numbered {
                partition_num,
                num_core_partitions: 0,
            },
            PartialShardSpec::Hashed {
                partition_dimensions,
                bucket_id,
                num_buckets,
            } => ShardSpec::Hashed {
                partition_num,
                num_core_partitions: 0,
                bucket_id: *bucket_id,
                num_buckets: *num_buckets,
                partition_dimensions: partition_dimensions.clone(),
            },
            PartialShardSpec::SingleDim {
                dimension,
                start,
                end,
                bucket_id: _,
                num_buckets,
            } => ShardSpec::SingleDim {
                dimension: dimension.clone(),
                start: start.clone(),
                end: end.clone(),
                partition_num,
                num_buckets: Some(*num_buckets),
            },
            PartialShardSpec::NumberedOverwrite {
                start_root_partition_id,
                end_root_partition_id,
                minor_version,
            } => ShardSpec::NumberedOverwrite {
                partition_num: OVERWRITE_PARTITION_START + partition_num,
                start_root_partition_id: *start_root_partition_id,
                end_root_partition_id: *end_root_partition_id,
                minor_version: *minor_version,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InputRow;

    #[test]
    fn test_numbered_completion_from_empty_interval() {
        let spec = PartialShardSpec::Numbered.complete(None).unwrap();
        assert_eq!(
            spec,
            ShardSpec::Numbered {
                partition_num: 0,
                num_core_partitions: 0
            }
        );
    }

    #[test]
    fn test_numbered_completion_carries_core_partitions() {
        let prev = ShardSpec::Numbered {
            partition_num: 1,
            num_core_partitions: 2,
        };
        let spec = PartialShardSpec::Numbered.complete(Some(&prev)).unwrap();
        assert_eq!(
            spec,
            ShardSpec::Numbered {
                partition_num: 2,
                num_core_partitions: 2
            }
        );
    }

    #[test]
    fn test_numbered_follows_linear() {
        let prev = ShardSpec::Linear { partition_num: 1 };
        assert!(PartialShardSpec::Numbered.can_follow(&prev));
        let spec = PartialShardSpec::Numbered.complete(Some(&prev)).unwrap();
        assert_eq!(spec.partition_num(), 2);
        assert_eq!(spec.num_core_partitions(), 0);
    }

    #[test]
    fn test_numbered_cannot_follow_single_dim() {
        let prev = ShardSpec::SingleDim {
            dimension: "foo".to_string(),
            start: None,
            end: Some("bar".to_string()),
            partition_num: 0,
            num_buckets: None,
        };
        assert!(!PartialShardSpec::Numbered.can_follow(&prev));
    }

    #[test]
    fn test_hashed_completion_is_congruent_to_bucket() {
        let partial = PartialShardSpec::Hashed {
            partition_dimensions: vec!["dim1".to_string()],
            bucket_id: 1,
            num_buckets: 3,
        };

        let first = partial.complete(None).unwrap();
        assert_eq!(first.partition_num(), 1);

        let prev = ShardSpec::Hashed {
            partition_num: 2,
            num_core_partitions: 0,
            bucket_id: 2,
            num_buckets: 3,
            partition_dimensions: vec!["dim1".to_string()],
        };
        let next = partial.complete(Some(&prev)).unwrap();
        // Smallest partition >= 3 congruent to 1 (mod 3) is 4.
        assert_eq!(next.partition_num(), 4);
        assert_eq!(next.bucket_id(), Some(1));
    }

    #[test]
    fn test_hashed_completion_is_deterministic() {
        let partial = PartialShardSpec::Hashed {
            partition_dimensions: vec![],
            bucket_id: 0,
            num_buckets: 2,
        };
        let prev = ShardSpec::Numbered {
            partition_num: 4,
            num_core_partitions: 0,
        };
        let a = partial.complete(Some(&prev)).unwrap();
        let b = partial.complete(Some(&prev)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hashed_rejects_zero_buckets() {
        let partial = PartialShardSpec::Hashed {
            partition_dimensions: vec![],
            bucket_id: 0,
            num_buckets: 0,
        };
        assert!(partial.complete(None).is_err());
    }

    #[test]
    fn test_overwrite_completion_starts_at_non_root_space() {
        let partial = PartialShardSpec::NumberedOverwrite {
            start_root_partition_id: 0,
            end_root_partition_id: 3,
            minor_version: 1,
        };
        let first = partial.complete(None).unwrap();
        assert_eq!(first.partition_num(), OVERWRITE_PARTITION_START);

        let next = partial.complete(Some(&first)).unwrap();
        assert_eq!(next.partition_num(), OVERWRITE_PARTITION_START + 1);
        assert!(next.is_overwrite());
    }

    #[test]
    fn test_hashed_accepts_matches_bucket_assignment() {
        let dims = vec!["dim1".to_string()];
        let num_buckets = 3;
        let row = InputRow::new(0).with_dimension("dim1", &["abc"]);
        let bucket = bucket_for_row(&dims, &row, num_buckets);

        for bucket_id in 0..num_buckets {
            let spec = ShardSpec::Hashed {
                partition_num: bucket_id,
                num_core_partitions: 0,
                bucket_id,
                num_buckets,
                partition_dimensions: dims.clone(),
            };
            assert_eq!(spec.accepts(&row), bucket_id == bucket);
        }
    }

    #[test]
    fn test_single_dim_accepts_half_open_range() {
        let spec = ShardSpec::SingleDim {
            dimension: "country".to_string(),
            start: Some("c".to_string()),
            end: Some("f".to_string()),
            partition_num: 1,
            num_buckets: Some(3),
        };
        assert!(spec.accepts(&InputRow::new(0).with_dimension("country", &["c"])));
        assert!(spec.accepts(&InputRow::new(0).with_dimension("country", &["d"])));
        assert!(!spec.accepts(&InputRow::new(0).with_dimension("country", &["f"])));
        assert!(!spec.accepts(&InputRow::new(0).with_dimension("country", &["b"])));
        // Missing value routes to the first bucket only.
        assert!(!spec.accepts(&InputRow::new(0)));
    }

    #[test]
    fn test_single_dim_first_bucket_accepts_missing_values() {
        let spec = ShardSpec::SingleDim {
            dimension: "country".to_string(),
            start: None,
            end: Some("c".to_string()),
            partition_num: 0,
            num_buckets: Some(3),
        };
        assert!(spec.accepts(&InputRow::new(0)));
        assert!(spec.accepts(&InputRow::new(0).with_dimension("country", &["a"])));
    }

    #[test]
    fn test_wire_discriminators() {
        let json = serde_json::to_string(&ShardSpec::Linear { partition_num: 1 }).unwrap();
        assert!(json.contains("\"type\":\"linear\""));

        let json = serde_json::to_string(&ShardSpec::NumberedOverwrite {
            partition_num: OVERWRITE_PARTITION_START,
            start_root_partition_id: 0,
            end_root_partition_id: 2,
            minor_version: 1,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"numbered_overwrite\""));
        assert!(json.contains("\"startRootPartitionId\":0"));

        let json = serde_json::to_string(&PartialShardSpec::Hashed {
            partition_dimensions: vec!["dim1".to_string()],
            bucket_id: 0,
            num_buckets: 2,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"hashed\""));

        let back: PartialShardSpec =
            serde_json::from_str("{\"type\":\"numbered\"}").unwrap();
        assert_eq!(back, PartialShardSpec::Numbered);
    }
}
