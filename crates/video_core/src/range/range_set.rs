//! Coalescing interval set.
//!
//! Intervals are stored in a `BTreeMap` keyed by their first address. Adjacent
//! and overlapping insertions are merged so the map always holds the minimal
//! set of disjoint, non-touching intervals.

use std::collections::BTreeMap;

use crate::common::addr::{AddrRange, VAddr};

/// A set of disjoint half-open address intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// Interval start -> interval end.
    ranges: BTreeMap<VAddr, VAddr>,
}

impl RangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the set holds no addresses.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the number of disjoint intervals.
    pub fn interval_count(&self) -> usize {
        self.ranges.len()
    }

    /// Returns the total number of bytes covered.
    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(|(b, e)| e - b).sum()
    }

    /// Removes every interval.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Iterates the intervals in address order.
    pub fn iter(&self) -> impl Iterator<Item = AddrRange> + '_ {
        self.ranges.iter().map(|(&b, &e)| AddrRange::new(b, e))
    }

    /// Adds `range`, merging it with any overlapping or touching interval.
    ///
    /// # Arguments
    ///
    /// * `range` - The interval to add; empty ranges are ignored.
    pub fn add(&mut self, range: AddrRange) {
        if range.is_empty() {
            return;
        }
        let mut begin = range.begin;
        let mut end = range.end;

        if let Some((&prev_begin, &prev_end)) = self.ranges.range(..=begin).next_back()
            && prev_end >= begin
        {
            begin = prev_begin;
            end = end.max(prev_end);
        }

        let absorbed: Vec<VAddr> = self.ranges.range(begin..=end).map(|(&b, _)| b).collect();
        for start in absorbed {
            if let Some(old_end) = self.ranges.remove(&start) {
                end = end.max(old_end);
            }
        }
        let _ = self.ranges.insert(begin, end);
    }

    /// Removes `range` from the set, splitting intervals that straddle it.
    ///
    /// # Arguments
    ///
    /// * `range` - The interval to remove; empty ranges are ignored.
    pub fn subtract(&mut self, range: AddrRange) {
        if range.is_empty() {
            return;
        }
        let overlapping: Vec<(VAddr, VAddr)> = self
            .ranges
            .range(..range.end)
            .rev()
            .take_while(|&(_, &e)| e > range.begin)
            .map(|(&b, &e)| (b, e))
            .collect();

        for (b, e) in overlapping {
            let _ = self.ranges.remove(&b);
            if b < range.begin {
                let _ = self.ranges.insert(b, range.begin);
            }
            if e > range.end {
                let _ = self.ranges.insert(range.end, e);
            }
        }
    }

    /// Removes every interval of `other` from this set.
    pub fn subtract_set(&mut self, other: &Self) {
        for range in other.iter() {
            self.subtract(range);
        }
    }

    /// Returns `true` if any address of `range` is in the set.
    pub fn intersects(&self, range: AddrRange) -> bool {
        if range.is_empty() {
            return false;
        }
        self.ranges
            .range(..range.end)
            .next_back()
            .is_some_and(|(_, &e)| e > range.begin)
    }

    /// Returns `true` if every address of `range` is in the set.
    pub fn contains(&self, range: AddrRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .range(..=range.begin)
            .next_back()
            .is_some_and(|(_, &e)| e >= range.end)
    }

    /// Returns the parts of the set that fall inside `range`, clipped to it.
    pub fn intersection(&self, range: AddrRange) -> Vec<AddrRange> {
        let mut out = Vec::new();
        self.for_each_in_range(range, |r| out.push(r));
        out
    }

    /// Calls `func` for every interval piece inside `range`, in address order.
    pub fn for_each_in_range(&self, range: AddrRange, mut func: impl FnMut(AddrRange)) {
        if range.is_empty() {
            return;
        }
        let start = self
            .ranges
            .range(..=range.begin)
            .next_back()
            .map_or(range.begin, |(&b, _)| b);
        for (&b, &e) in self.ranges.range(start..range.end) {
            if let Some(piece) = AddrRange::new(b, e).intersect(&range) {
                func(piece);
            }
        }
    }

    /// Returns the set of addresses in `self` but not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.subtract_set(other);
        out
    }
}

impl FromIterator<AddrRange> for RangeSet {
    fn from_iter<I: IntoIterator<Item = AddrRange>>(iter: I) -> Self {
        let mut set = Self::new();
        for range in iter {
            set.add(range);
        }
        set
    }
}
