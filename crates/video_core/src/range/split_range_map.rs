//! Interval map that splits entries on partial overwrite.
//!
//! Each entry maps a disjoint half-open interval to a value. Adding an
//! interval overwrites whatever it covers: entries that straddle its bounds
//! are split and keep their value outside the new interval.

use std::collections::BTreeMap;

use crate::common::addr::{AddrRange, VAddr};

/// Ordered map from disjoint address intervals to values.
#[derive(Debug, Clone)]
pub struct SplitRangeMap<T> {
    /// Interval start -> (interval end, value).
    entries: BTreeMap<VAddr, (VAddr, T)>,
}

impl<T> Default for SplitRangeMap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Copy + PartialEq> SplitRangeMap<T> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (AddrRange, T)> + '_ {
        self.entries
            .iter()
            .map(|(&b, &(e, v))| (AddrRange::new(b, e), v))
    }

    /// Maps `range` to `value`, splitting any entries it partially covers.
    ///
    /// # Arguments
    ///
    /// * `range` - The interval to assign; empty ranges are ignored.
    /// * `value` - The value stored for the whole interval.
    pub fn add(&mut self, range: AddrRange, value: T) {
        if range.is_empty() {
            return;
        }
        self.subtract(range);
        let _ = self.entries.insert(range.begin, (range.end, value));
        debug_assert!(self.is_disjoint(), "range index entries overlap after add");
    }

    /// Removes `range`, trimming or splitting entries that straddle it.
    pub fn subtract(&mut self, range: AddrRange) {
        if range.is_empty() {
            return;
        }
        let hit: Vec<(VAddr, VAddr, T)> = self
            .entries
            .range(..range.end)
            .rev()
            .take_while(|&(_, &(e, _))| e > range.begin)
            .map(|(&b, &(e, v))| (b, e, v))
            .collect();

        for (b, e, v) in hit {
            let _ = self.entries.remove(&b);
            if b < range.begin {
                let _ = self.entries.insert(b, (range.begin, v));
            }
            if e > range.end {
                let _ = self.entries.insert(range.end, (e, v));
            }
        }
    }

    /// Returns the entry containing `addr`.
    pub fn get(&self, addr: VAddr) -> Option<(AddrRange, T)> {
        self.entries
            .range(..=addr)
            .next_back()
            .filter(|&(_, &(e, _))| e > addr)
            .map(|(&b, &(e, v))| (AddrRange::new(b, e), v))
    }

    /// Returns the value of the single entry that fully covers `range`, if any.
    pub fn find_covering(&self, range: AddrRange) -> Option<T> {
        self.get(range.begin)
            .filter(|(entry, _)| entry.contains(&range))
            .map(|(_, v)| v)
    }

    /// Calls `func` with every entry that intersects `range`, in address order.
    ///
    /// The entry's full interval is passed, not the clipped piece.
    pub fn for_each_in_range(&self, range: AddrRange, mut func: impl FnMut(AddrRange, T)) {
        if range.is_empty() {
            return;
        }
        let start = self
            .entries
            .range(..=range.begin)
            .next_back()
            .map_or(range.begin, |(&b, _)| b);
        for (&b, &(e, v)) in self.entries.range(start..range.end) {
            if e > range.begin {
                func(AddrRange::new(b, e), v);
            }
        }
    }

    /// Collects the distinct values intersecting `range`, in address order.
    pub fn values_in_range(&self, range: AddrRange) -> Vec<T> {
        let mut out: Vec<T> = Vec::new();
        self.for_each_in_range(range, |_, v| {
            if !out.contains(&v) {
                out.push(v);
            }
        });
        out
    }

    /// Returns `true` if no two entries overlap.
    pub fn is_disjoint(&self) -> bool {
        let mut prev_end = 0;
        for (&b, &(e, _)) in &self.entries {
            if b < prev_end || e <= b {
                return false;
            }
            prev_end = e;
        }
        true
    }
}
