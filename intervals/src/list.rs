//! An [IntervalVector] stored as a flat sorted list.

use crate::{push_joined, Attachment, Error, Interval, IntervalVector, EMPTY};

/// An [IntervalVector] stored as a sorted list.
///
/// Built once from an ordered list of intervals (for example, a vector received from a peer or
/// read back from disk) and queried with binary search. Inserts splice the list and are linear in
/// its length.
#[derive(Clone, Debug)]
pub struct ListVector<A = ()> {
    intervals: Vec<Interval<A>>,
    max_version: i64,
}

impl<A: Attachment> Default for ListVector<A> {
    fn default() -> Self {
        Self {
            intervals: Vec::new(),
            max_version: EMPTY,
        }
    }
}

impl<A: Attachment> ListVector<A> {
    /// The stored intervals.
    pub fn as_slice(&self) -> &[Interval<A>] {
        &self.intervals
    }

    /// Consume the vector, returning the stored intervals.
    pub fn into_inner(self) -> Vec<Interval<A>> {
        self.intervals
    }

    /// Index range of the stored intervals overlapping `[start, end)`.
    fn bounds(&self, start: u64, end: u64) -> (usize, usize) {
        let low = self
            .intervals
            .partition_point(|interval| interval.end() <= start);
        let high = self
            .intervals
            .partition_point(|interval| interval.start() < end);
        (low, high.max(low))
    }
}

impl<A: Attachment> TryFrom<Vec<Interval<A>>> for ListVector<A> {
    type Error = Error;

    /// Build a vector from intervals that are sorted and pairwise disjoint.
    ///
    /// Adjacent intervals of the same group are joined.
    fn try_from(intervals: Vec<Interval<A>>) -> Result<Self, Self::Error> {
        let mut joined = Vec::with_capacity(intervals.len());
        let mut max_version = EMPTY;
        let mut previous_end = 0;
        for interval in intervals {
            if interval.start() >= interval.end() {
                return Err(Error::Malformed {
                    start: interval.start(),
                    end: interval.end(),
                    op_start: interval.op_start(),
                    op_end: interval.op_end(),
                });
            }
            if interval.start() < previous_end {
                return Err(Error::Unsorted {
                    previous_end,
                    start: interval.start(),
                });
            }
            previous_end = interval.end();
            max_version = max_version.max(interval.version());
            push_joined(&mut joined, interval);
        }
        Ok(Self {
            intervals: joined,
            max_version,
        })
    }
}

impl<A: Attachment> IntervalVector<A> for ListVector<A> {
    fn insert(&mut self, interval: Interval<A>) {
        let (start, end) = (interval.start(), interval.end());
        if start == end {
            return;
        }
        self.max_version = self.max_version.max(interval.version());

        // Widen the replaced range to the neighbors the new interval may join with
        let (mut low, mut high) = self.bounds(start, end);
        if low > 0 && self.intervals[low - 1].end() == start {
            low -= 1;
        }
        if high < self.intervals.len() && self.intervals[high].start() == end {
            high += 1;
        }

        let mut replacement = Vec::with_capacity(high - low + 1);
        let mut pending = Some(interval);
        for existing in &self.intervals[low..high] {
            if existing.start() < start {
                push_joined(&mut replacement, existing.clip(existing.start(), start));
            }
            if existing.end() > end {
                if let Some(interval) = pending.take() {
                    push_joined(&mut replacement, interval);
                }
                push_joined(&mut replacement, existing.clip(end, existing.end()));
            }
        }
        if let Some(interval) = pending {
            push_joined(&mut replacement, interval);
        }
        self.intervals.splice(low..high, replacement);
    }

    fn truncate(&mut self, max: u64) {
        let keep = self
            .intervals
            .partition_point(|interval| interval.start() < max);
        self.intervals.truncate(keep);
        if let Some(last) = self.intervals.last_mut() {
            if last.end() > max {
                *last = last.clip(last.start(), max);
            }
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Interval<A>> + '_> {
        Box::new(self.intervals.iter())
    }

    fn range(&self, start: u64, end: u64) -> Box<dyn Iterator<Item = &Interval<A>> + '_> {
        if start >= end {
            return Box::new(std::iter::empty());
        }
        let (low, high) = self.bounds(start, end);
        Box::new(self.intervals[low..high].iter())
    }

    fn len(&self) -> usize {
        self.intervals.len()
    }

    fn max_version(&self) -> i64 {
        self.max_version
    }
}

impl<A: Attachment> PartialEq for ListVector<A> {
    fn eq(&self, other: &Self) -> bool {
        self.serialize() == other.serialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TreeVector;

    #[test]
    fn test_try_from_joins() {
        let list = ListVector::try_from(vec![
            Interval::with_op(0, 6, 1, 1, 0, 12),
            Interval::with_op(6, 12, 1, 1, 0, 12),
            Interval::new(12, 20, 2, 2),
        ])
        .unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.as_slice()[0].is_op_complete());
        assert_eq!(list.max_version(), 2);
    }

    #[test]
    fn test_try_from_rejects_overlap() {
        let result = ListVector::try_from(vec![Interval::new(0, 6, 1, 1), Interval::new(4, 8, 1, 2)]);
        assert!(matches!(
            result,
            Err(Error::Unsorted {
                previous_end: 6,
                start: 4
            })
        ));
    }

    #[test]
    fn test_try_from_rejects_zero_length() {
        let result = ListVector::try_from(vec![Interval::new(4, 4, 1, 1)]);
        assert!(matches!(result, Err(Error::Malformed { start: 4, end: 4, .. })));
    }

    #[test]
    fn test_insert_matches_tree() {
        let inserts = [
            Interval::new(0, 2048, 0, 0),
            Interval::new(512, 1536, 1, 1),
            Interval::new(1000, 3000, 1, 2),
            Interval::empty(100, 200),
            Interval::new(0, 512, 0, 0),
            Interval::new(2000, 2100, 2, 3),
        ];
        let mut list = ListVector::default();
        let mut tree = TreeVector::new();
        for interval in inserts {
            list.insert(interval.clone());
            tree.insert(interval);
            assert_eq!(list.serialize(), tree.serialize());
            assert_eq!(list.len(), tree.len());
        }
        assert_eq!(
            list.serialize(),
            vec![
                Interval::new(0, 512, 0, 0),
                Interval::new(512, 1000, 1, 1),
                Interval::new(1000, 2000, 1, 2),
                Interval::new(2000, 2100, 2, 3),
                Interval::new(2100, 3000, 1, 2),
            ]
        );
    }

    #[test]
    fn test_insert_within_single() {
        let mut list = ListVector::try_from(vec![Interval::new(0, 12, 1, 1)]).unwrap();
        list.insert(Interval::new(4, 8, 2, 2));
        assert_eq!(
            list.into_inner(),
            vec![
                Interval::new(0, 4, 1, 1),
                Interval::new(4, 8, 2, 2),
                Interval::new(8, 12, 1, 1),
            ]
        );
    }

    #[test]
    fn test_truncate() {
        let mut list = ListVector::try_from(vec![
            Interval::new(0, 10, 1, 1),
            Interval::new(10, 20, 1, 2),
        ])
        .unwrap();
        list.truncate(15);
        assert_eq!(
            list.serialize(),
            vec![Interval::new(0, 10, 1, 1), Interval::new(10, 15, 1, 2)]
        );
        list.truncate(0);
        assert!(list.is_empty());
    }

    #[test]
    fn test_range() {
        let list = ListVector::try_from(vec![
            Interval::new(0, 10, 1, 1),
            Interval::new(20, 30, 1, 2),
        ])
        .unwrap();
        assert_eq!(list.range(5, 25).count(), 2);
        assert_eq!(list.range(10, 20).count(), 0);
        assert_eq!(list.range(25, 25).count(), 0);
        assert_eq!(list.get_slice(10, 20), vec![Interval::empty(10, 20)]);
    }
}
