//! Sorted range-partition boundaries for a string dimension.
//!
//! Positions 0 and `size - 1` are structurally `None`, standing in for
//! -inf and +inf; the middle entries are distinct and strictly increasing.
//! `num_buckets = size - 1`, and bucket `b` covers
//! `boundaries[b] <= key < boundaries[b + 1]` with sentinel comparisons
//! always true.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionBoundaries {
    boundaries: Vec<Option<String>>,
}

impl PartitionBoundaries {
    /// Boundaries with no buckets at all.
    pub fn empty() -> Self {
        Self { boundaries: vec![] }
    }

    /// Build from observed cut points: distinct-sort, then overwrite both
    /// ends with sentinels. A single distinct value produces one unbounded
    /// bucket.
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deduped: Vec<String> = values.into_iter().map(Into::into).collect();
        deduped.sort();
        deduped.dedup();
        if deduped.is_empty() {
            return Self::empty();
        }

        let mut boundaries: Vec<Option<String>> = deduped.into_iter().map(Some).collect();
        boundaries[0] = None;
        if boundaries.len() == 1 {
            boundaries.push(None);
        } else {
            let last = boundaries.len() - 1;
            boundaries[last] = None;
        }
        Self { boundaries }
    }

    pub fn size(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    pub fn num_buckets(&self) -> usize {
        self.boundaries.len().saturating_sub(1)
    }

    /// Boundary at position `i`; `None` is a sentinel.
    pub fn get(&self, i: usize) -> Option<&str> {
        self.boundaries.get(i).and_then(|b| b.as_deref())
    }

    /// The `[start, end)` pair delimiting `bucket`.
    pub fn bounds_of(&self, bucket: usize) -> (Option<&str>, Option<&str>) {
        (self.get(bucket), self.get(bucket + 1))
    }

    /// Bucket containing `key`. Absent keys belong to the first bucket.
    ///
    /// The returned `b` satisfies `boundaries[b] <= key < boundaries[b+1]`
    /// under sentinel semantics. Must not be called on empty boundaries.
    pub fn bucket_for(&self, key: Option<&str>) -> usize {
        assert!(
            !self.is_empty(),
            "cannot find bucket for key [{key:?}] in empty boundaries"
        );
        let Some(key) = key else {
            return 0;
        };

        // Binary search over the inner, fully-populated range.
        let inner = &self.boundaries[1..self.boundaries.len() - 1];
        match inner.binary_search_by(|b| b.as_deref().cmp(&Some(key))) {
            // Hit on boundary i+1 opens bucket i+1.
            Ok(i) => i + 1,
            // Miss: key sorts below inner boundary at insertion point.
            Err(insertion) => insertion,
        }
    }
}
