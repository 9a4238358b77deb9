//! An ordered set of disjoint, non-adjacent byte ranges.
//!
//! [RangeSet] is the ledger of which spans of a remote object are held locally. Every insert
//! merges the new range with any range it overlaps or touches, so the set is always in its
//! minimal form:
//!
//! - Ranges are sorted by `start`.
//! - No two ranges overlap.
//! - No two ranges are adjacent (`a.end == b.start` is always merged into one range).
//!
//! Because of this, "is `[a, b)` fully covered" reduces to finding the single range that starts
//! at or before `a` and checking whether it extends to `b`.
//!
//! # Example
//!
//! ```rust
//! use streamdisk_storage::rset::RangeSet;
//!
//! let mut set = RangeSet::new();
//! set.insert(0, 10);
//! set.insert(10, 20);
//! assert_eq!(set.ranges().len(), 1);
//! assert!(set.contains_range(5, 15));
//!
//! set.remove(8, 12);
//! assert!(!set.contains_range(5, 15));
//! assert_eq!(set.total_len(), 16);
//! ```

use serde::{Deserialize, Serialize};

/// A half-open interval `[start, end)` over the byte space of a remote object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered by the range.
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// An ordered collection of disjoint, non-adjacent [ByteRange]s.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Rebuild a set from ranges that are already in minimal form.
    ///
    /// Returns `None` if any range is empty, or if the ranges are unsorted, overlapping, or
    /// adjacent. Persisted ranges are expected to have been produced by a [RangeSet], so anything
    /// else indicates the record was not written by us (or was damaged).
    pub fn from_normalized(ranges: Vec<ByteRange>) -> Option<Self> {
        for range in &ranges {
            if range.is_empty() {
                return None;
            }
        }
        for pair in ranges.windows(2) {
            if pair[0].end >= pair[1].start {
                return None;
            }
        }
        Some(Self { ranges })
    }

    /// Add `[start, end)`, merging it with every range it overlaps or touches.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let mut merged = ByteRange::new(start, end);
        let mut placed = false;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for range in std::mem::take(&mut self.ranges) {
            if range.end < merged.start {
                out.push(range);
            } else if range.start > merged.end {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(range);
            } else {
                merged.start = merged.start.min(range.start);
                merged.end = merged.end.max(range.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Remove `[start, end)`, splitting any range that straddles it.
    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for range in std::mem::take(&mut self.ranges) {
            if range.end <= start || range.start >= end {
                out.push(range);
                continue;
            }
            if range.start < start {
                out.push(ByteRange::new(range.start, start));
            }
            if range.end > end {
                out.push(ByteRange::new(end, range.end));
            }
        }
        self.ranges = out;
    }

    /// Returns true if a single range fully contains `[start, end)`.
    ///
    /// An empty query is vacuously contained.
    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }

        // Find the last range starting at or before `start`.
        let idx = self.ranges.partition_point(|r| r.start <= start);
        if idx == 0 {
            return false;
        }
        self.ranges[idx - 1].end >= end
    }

    /// Total number of bytes covered.
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// The ranges in ascending order.
    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
