//! A mutable [IntervalVector] backed by an ordered map.

use crate::{Attachment, Interval, IntervalVector, EMPTY};
use std::collections::BTreeMap;

/// A mutable [IntervalVector] keyed by interval start.
///
/// Each insert touches only the entries overlapping the inserted range (plus at most two
/// neighbors for joining), so this is the representation used for the live `cur` and `next`
/// vectors of a file.
#[derive(Clone, Debug)]
pub struct TreeVector<A = ()> {
    intervals: BTreeMap<u64, Interval<A>>,
    max_version: i64,
    overwrites: usize,
}

impl TreeVector {
    /// Create an empty vector.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A: Attachment> Default for TreeVector<A> {
    fn default() -> Self {
        Self {
            intervals: BTreeMap::new(),
            max_version: EMPTY,
            overwrites: 0,
        }
    }
}

impl<A: Attachment> TreeVector<A> {
    /// Create a vector by inserting `intervals` in order.
    pub fn from_intervals(intervals: impl IntoIterator<Item = Interval<A>>) -> Self {
        let mut vector = Self::default();
        for interval in intervals {
            vector.insert(interval);
        }
        vector
    }

    /// Number of stored intervals that were entirely replaced by later inserts since the last
    /// call to [TreeVector::reset_overwrites].
    pub fn overwrites(&self) -> usize {
        self.overwrites
    }

    /// Restart counting overwrites (after compacting the persisted form, for example).
    pub fn reset_overwrites(&mut self) {
        self.overwrites = 0;
    }

    /// Start of the first stored interval overlapping `start`, if any.
    fn floor(&self, start: u64) -> Option<u64> {
        self.intervals
            .range(..=start)
            .next_back()
            .filter(|(_, interval)| interval.end() > start)
            .map(|(key, _)| *key)
    }
}

impl<A: Attachment> IntervalVector<A> for TreeVector<A> {
    fn insert(&mut self, interval: Interval<A>) {
        let (start, end) = (interval.start(), interval.end());
        if start == end {
            return;
        }
        self.max_version = self.max_version.max(interval.version());

        // Remove everything overlapping the new interval, keeping the parts outside of it
        let overlapping: Vec<u64> = self
            .intervals
            .range(..end)
            .rev()
            .take_while(|(_, existing)| existing.end() > start)
            .map(|(key, _)| *key)
            .collect();
        for key in overlapping {
            let Some(existing) = self.intervals.remove(&key) else {
                continue;
            };
            if existing.start() >= start && existing.end() <= end {
                self.overwrites += 1;
                continue;
            }
            if existing.start() < start {
                self.intervals
                    .insert(existing.start(), existing.clip(existing.start(), start));
            }
            if existing.end() > end {
                self.intervals.insert(end, existing.clip(end, existing.end()));
            }
        }

        // Join with neighbors
        let mut merged = interval;
        let left = self
            .intervals
            .range(..start)
            .next_back()
            .filter(|(_, left)| left.joins(&merged))
            .map(|(key, _)| *key);
        if let Some(mut left) = left.and_then(|key| self.intervals.remove(&key)) {
            left.absorb(&merged);
            merged = left;
        }
        let joins_right = self
            .intervals
            .get(&end)
            .is_some_and(|right| merged.joins(right));
        if joins_right {
            if let Some(right) = self.intervals.remove(&end) {
                merged.absorb(&right);
            }
        }
        self.intervals.insert(merged.start(), merged);
    }

    fn truncate(&mut self, max: u64) {
        let straddling = self.floor(max).filter(|key| *key < max);
        drop(self.intervals.split_off(&max));
        if let Some(key) = straddling {
            if let Some(interval) = self.intervals.get_mut(&key) {
                *interval = interval.clip(key, max);
            }
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Interval<A>> + '_> {
        Box::new(self.intervals.values())
    }

    fn range(&self, start: u64, end: u64) -> Box<dyn Iterator<Item = &Interval<A>> + '_> {
        if start >= end {
            return Box::new(std::iter::empty());
        }
        let first = self.floor(start).unwrap_or(start);
        Box::new(self.intervals.range(first..end).map(|(_, interval)| interval))
    }

    fn len(&self) -> usize {
        self.intervals.len()
    }

    fn max_version(&self) -> i64 {
        self.max_version
    }
}

impl<A: Attachment> PartialEq for TreeVector<A> {
    fn eq(&self, other: &Self) -> bool {
        self.serialize() == other.serialize()
    }
}
