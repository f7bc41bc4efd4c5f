//! Track versioned byte ranges of striped files.
//!
//! # Overview
//!
//! Every write to an erasure-coded file is tagged with a `version` (the write generation of the
//! file) and an `id` (a logical clock that only ever increases). The bytes a write touched are
//! recorded as an [Interval]. An [IntervalVector] is the ordered, non-overlapping collection of
//! such intervals describing which write produced each byte of a file's tracked prefix.
//!
//! Inserting into a vector is last-write-wins: the inserted interval unconditionally replaces
//! whatever it overlaps. Deciding _which_ write should win is left to the callers of this crate.
//!
//! # Representations
//!
//! Two interchangeable implementations exist behind the [IntervalVector] trait:
//!
//! - [TreeVector]: an ordered map keyed by start offset, updated incrementally. Used for the
//!   `cur` (committed) and `next` (provisional) vectors of a live file.
//! - [ListVector]: a flat sorted list built once, typically from intervals received from a peer
//!   or read back from disk.
//!
//! # Format
//!
//! Vectors are persisted with [encode] and read back with [decode]:
//!
//! ```text
//! +--------+---------+---------+---------+---------+------------+----------+-----+
//! | 0..4   | 4..12   | 12..20  | 20..28  | 28..36  | 36..44     | 44..52   | ... |
//! +--------+---------+---------+---------+---------+------------+----------+-----+
//! | Count  | Start   | End     | Version | Id      | Op Start   | Op End   | ... |
//! | (u32)  | (u64)   | (u64)   | (i64)   | (i64)   | (u64)      | (u64)    |     |
//! +--------+---------+---------+---------+---------+------------+----------+-----+
//! ```
//!
//! Decoding never silently repairs a vector: truncated, unordered, or overlapping input is
//! rejected with an [Error].
//!
//! # Example
//!
//! ```rust
//! use ecstore_intervals::{Interval, IntervalVector, TreeVector};
//!
//! let mut vector = TreeVector::new();
//! vector.insert(Interval::new(0, 2048, 0, 0));
//! vector.insert(Interval::new(512, 1536, 1, 1));
//!
//! assert_eq!(
//!     vector.serialize(),
//!     vec![
//!         Interval::new(0, 512, 0, 0),
//!         Interval::new(512, 1536, 1, 1),
//!         Interval::new(1536, 2048, 0, 0),
//!     ]
//! );
//! ```

use thiserror::Error;

mod encoding;
pub use encoding::{decode, encode};
mod interval;
pub use interval::{push_joined, Attachment, Interval, IntervalBuilder, EMPTY};
mod list;
pub use list::ListVector;
mod tree;
pub use tree::TreeVector;

/// Errors that can occur when building or decoding an [IntervalVector].
#[derive(Debug, Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("interval starts at {start} before the previous one ends at {previous_end}")]
    Unsorted { previous_end: u64, start: u64 },
    #[error("malformed interval: [{start}, {end}) in span [{op_start}, {op_end})")]
    Malformed {
        start: u64,
        end: u64,
        op_start: u64,
        op_end: u64,
    },
    #[error("too many intervals: {0}")]
    TooManyIntervals(usize),
    #[error("trailing bytes: {0}")]
    TrailingBytes(usize),
}

/// An ordered collection of non-overlapping [Interval]s.
///
/// Stored intervals are sorted by start, pairwise disjoint, and adjacent intervals written by
/// the same operation (with the same attachment) are joined. Gaps are not stored; views that
/// need a contiguous cover ([IntervalVector::serialize], [IntervalVector::get_slice],
/// [IntervalVector::overlapping]) fill them with empty sentinels.
pub trait IntervalVector<A: Attachment = ()> {
    /// Overlay `interval`, replacing whatever it overlaps.
    ///
    /// Zero-length intervals are ignored.
    fn insert(&mut self, interval: Interval<A>);

    /// Drop everything at or after `max`.
    fn truncate(&mut self, max: u64);

    /// Iterate over the stored intervals in order.
    fn iter(&self) -> Box<dyn Iterator<Item = &Interval<A>> + '_>;

    /// Iterate over the stored intervals that overlap `[start, end)`, in order and unclipped.
    fn range(&self, start: u64, end: u64) -> Box<dyn Iterator<Item = &Interval<A>> + '_>;

    /// Number of stored intervals.
    fn len(&self) -> usize;

    /// Returns `true` if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest version ever inserted, or [EMPTY].
    fn max_version(&self) -> i64;

    /// End of the last non-empty interval, or 0.
    fn end(&self) -> u64 {
        self.iter()
            .filter(|interval| !interval.is_empty())
            .last()
            .map_or(0, |interval| interval.end())
    }

    /// The contiguous cover of `[0, end())`.
    ///
    /// Gaps (including a leading gap) are filled with empty sentinels and trailing empty
    /// intervals are dropped.
    fn serialize(&self) -> Vec<Interval<A>> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = 0;
        for interval in self.iter() {
            if interval.start() > cursor {
                push_joined(&mut out, Interval::sentinel(cursor, interval.start()));
            }
            cursor = interval.end();
            push_joined(&mut out, interval.clone());
        }

        // Remove empty intervals from the end
        while out.last().is_some_and(|interval| interval.is_empty()) {
            out.pop();
        }
        out
    }

    /// The intervals covering `[start, end)`, clipped to the range.
    ///
    /// Parts of the range without data are returned as empty sentinels, so the result covers
    /// the range exactly. An empty range yields an empty list.
    fn get_slice(&self, start: u64, end: u64) -> Vec<Interval<A>> {
        let mut out = Vec::new();
        if start >= end {
            return out;
        }
        let mut cursor = start;
        for interval in self.range(start, end) {
            let clipped = interval.clip(start, end);
            if clipped.start() > cursor {
                push_joined(&mut out, Interval::sentinel(cursor, clipped.start()));
            }
            cursor = clipped.end();
            push_joined(&mut out, clipped);
        }
        if cursor < end {
            push_joined(&mut out, Interval::sentinel(cursor, end));
        }
        out
    }

    /// The intervals overlapping `[start, end)`, unclipped.
    ///
    /// Leading and trailing empty intervals are dropped and the result is then padded with
    /// empty sentinels so that it reaches from `start` to `end`.
    fn overlapping(&self, start: u64, end: u64) -> Vec<Interval<A>> {
        let mut out: Vec<Interval<A>> = Vec::new();
        if start >= end {
            return out;
        }
        for interval in self.range(start, end) {
            if let Some(last) = out.last() {
                if interval.start() > last.end() {
                    let gap = Interval::sentinel(last.end(), interval.start());
                    push_joined(&mut out, gap);
                }
            }
            push_joined(&mut out, interval.clone());
        }

        // Remove empty intervals from both ends
        while out.last().is_some_and(|interval| interval.is_empty()) {
            out.pop();
        }
        let leading = out.iter().take_while(|interval| interval.is_empty()).count();
        out.drain(..leading);

        // Pad to the requested range
        let (first_start, last_end) = match (out.first(), out.last()) {
            (Some(first), Some(last)) => (first.start(), last.end()),
            _ => return vec![Interval::sentinel(start, end)],
        };
        if first_start > start {
            out.insert(0, Interval::sentinel(start, first_start));
        }
        if last_end < end {
            out.push(Interval::sentinel(last_end, end));
        }
        out
    }
}
