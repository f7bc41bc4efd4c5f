//! Versioned half-open byte ranges.

use bytes::BufMut;
use commonware_codec::{FixedSize, Write};
use std::fmt;

/// Version and id of the empty sentinel.
pub const EMPTY: i64 = -1;

/// Payload carried alongside an [Interval] through merges.
///
/// Attachments record provenance (for example, the donor that supplied an interval during
/// recovery). They take part in coalescing but never in [Interval] equality.
pub trait Attachment: Clone + PartialEq + Default + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Default + fmt::Debug + Send + Sync + 'static> Attachment for T {}

/// A half-open byte range `[start, end)` written by a single operation.
///
/// The operation span `[op_start, op_end)` is the full range the originating write intended to
/// cover. It always contains `[start, end)` and is preserved when an interval is split.
///
/// Two intervals are equal if their ranges, versions, and ids match. The operation span and the
/// attachment are not part of equality.
#[derive(Clone, Debug)]
pub struct Interval<A = ()> {
    start: u64,
    end: u64,
    version: i64,
    id: i64,
    op_start: u64,
    op_end: u64,
    attachment: A,
}

impl Interval {
    /// Create an interval whose operation span equals its range.
    ///
    /// # Panics
    ///
    /// Panics if `end < start`.
    pub fn new(start: u64, end: u64, version: i64, id: i64) -> Self {
        Self::with_op(start, end, version, id, start, end)
    }

    /// Create an interval that covers part of a larger operation.
    ///
    /// # Panics
    ///
    /// Panics if `end < start` or if `[op_start, op_end)` does not contain `[start, end)`.
    pub fn with_op(start: u64, end: u64, version: i64, id: i64, op_start: u64, op_end: u64) -> Self {
        assert!(start <= end, "interval end before start: {start} > {end}");
        assert!(
            op_start <= start && end <= op_end,
            "operation span [{op_start}, {op_end}) does not contain [{start}, {end})"
        );
        Self {
            start,
            end,
            version,
            id,
            op_start,
            op_end,
            attachment: (),
        }
    }

    /// Create an empty sentinel over `[start, end)`.
    pub fn empty(start: u64, end: u64) -> Self {
        Self::new(start, end, EMPTY, EMPTY)
    }

    /// Like [Interval::with_op] but returns `None` instead of panicking on malformed bounds.
    pub(crate) fn checked(
        start: u64,
        end: u64,
        version: i64,
        id: i64,
        op_start: u64,
        op_end: u64,
    ) -> Option<Self> {
        if start >= end || op_start > start || end > op_end {
            return None;
        }
        Some(Self::with_op(start, end, version, id, op_start, op_end))
    }
}

impl<A: Attachment> Interval<A> {
    /// Create an empty sentinel over `[start, end)` carrying the default attachment.
    pub fn sentinel(start: u64, end: u64) -> Self {
        Interval::empty(start, end).with_attachment(A::default())
    }

    /// Replace the attachment.
    pub fn with_attachment<B>(self, attachment: B) -> Interval<B> {
        Interval {
            start: self.start,
            end: self.end,
            version: self.version,
            id: self.id,
            op_start: self.op_start,
            op_end: self.op_end,
            attachment,
        }
    }

    /// Drop the attachment.
    pub fn detach(&self) -> Interval {
        Interval {
            start: self.start,
            end: self.end,
            version: self.version,
            id: self.id,
            op_start: self.op_start,
            op_end: self.op_end,
            attachment: (),
        }
    }

    /// First byte of the range.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Version of the write, or [EMPTY].
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Id of the write (unique per file), or [EMPTY].
    pub fn id(&self) -> i64 {
        self.id
    }

    /// First byte of the originating operation.
    pub fn op_start(&self) -> u64 {
        self.op_start
    }

    /// One past the last byte of the originating operation.
    pub fn op_end(&self) -> u64 {
        self.op_end
    }

    /// Data carried alongside the interval (for example, the donor holding it).
    pub fn attachment(&self) -> &A {
        &self.attachment
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if this is the empty sentinel ("no authoritative data").
    pub fn is_empty(&self) -> bool {
        self.version == EMPTY && self.id == EMPTY
    }

    /// Returns `true` if this interval alone covers its whole operation span.
    pub fn is_op_complete(&self) -> bool {
        self.start == self.op_start && self.end == self.op_end
    }

    /// Returns `true` if both intervals were written by the same operation.
    pub fn same_group<B>(&self, other: &Interval<B>) -> bool {
        self.version == other.version && self.id == other.id
    }

    /// Returns `true` if `other` holds this write or a newer one.
    ///
    /// A byte of an operation span counts as present when it still holds the operation or was
    /// overwritten later. Empty sentinels never cover anything.
    pub fn is_covered_by<B: Attachment>(&self, other: &Interval<B>) -> bool {
        !other.is_empty() && (self.same_group(other) || other.id > self.id)
    }

    /// Returns `true` if `[start, end)` shares at least one byte with this interval.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// Returns `true` if `[start, end)` lies within this interval.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        self.start <= start && end <= self.end
    }

    /// Narrow the interval to its intersection with `[start, end)`.
    ///
    /// The operation span is preserved, except for empty sentinels whose span always tracks
    /// their range.
    ///
    /// # Panics
    ///
    /// Panics if the intersection is empty.
    pub fn clip(&self, start: u64, end: u64) -> Self {
        let start = self.start.max(start);
        let end = self.end.min(end);
        assert!(start < end, "clip outside of interval");
        let mut clipped = self.clone();
        clipped.start = start;
        clipped.end = end;
        if clipped.is_empty() {
            clipped.op_start = start;
            clipped.op_end = end;
        }
        clipped
    }

    /// Returns `true` if `next` directly follows this interval and both can be stored as one.
    pub(crate) fn joins(&self, next: &Self) -> bool {
        self.end == next.start && self.same_group(next) && self.attachment == next.attachment
    }

    /// Extend this interval to cover `next` (see [Interval::joins]).
    pub(crate) fn absorb(&mut self, next: &Self) {
        debug_assert!(self.joins(next));
        self.end = next.end;
        self.op_start = self.op_start.min(next.op_start);
        self.op_end = self.op_end.max(next.op_end);
    }
}

impl<A, B> PartialEq<Interval<B>> for Interval<A> {
    fn eq(&self, other: &Interval<B>) -> bool {
        self.start == other.start
            && self.end == other.end
            && self.version == other.version
            && self.id == other.id
    }
}

impl<A> Eq for Interval<A> {}

impl<A> fmt::Display for Interval<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{} v{} #{}]",
            self.start, self.end, self.version, self.id
        )
    }
}

impl Write for Interval {
    fn write(&self, buf: &mut impl BufMut) {
        self.start.write(buf);
        self.end.write(buf);
        self.version.write(buf);
        self.id.write(buf);
        self.op_start.write(buf);
        self.op_end.write(buf);
    }
}

impl FixedSize for Interval {
    const SIZE: usize = 4 * u64::SIZE + 2 * i64::SIZE;
}

/// A mutable interval used while an interval list is being assembled.
///
/// Builders are cheap to reshape (grow, shrink, reassign) and are converted into immutable
/// [Interval]s once assembly is complete.
#[derive(Clone, Debug, PartialEq)]
pub struct IntervalBuilder<A = ()> {
    pub start: u64,
    pub end: u64,
    pub version: i64,
    pub id: i64,
    pub op_start: u64,
    pub op_end: u64,
    pub attachment: A,
}

impl<A: Attachment> IntervalBuilder<A> {
    /// Returns `true` if this builder describes the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.version == EMPTY && self.id == EMPTY
    }

    /// Returns `true` if `next` directly follows this builder and both describe the same data.
    pub fn joins(&self, next: &Self) -> bool {
        self.end == next.start
            && self.version == next.version
            && self.id == next.id
            && self.attachment == next.attachment
    }

    /// Freeze the builder.
    ///
    /// # Panics
    ///
    /// Panics if the builder holds a malformed range.
    pub fn build(self) -> Interval<A> {
        assert!(self.start <= self.end, "builder end before start");
        let (op_start, op_end) = if self.is_empty() {
            (self.start, self.end)
        } else {
            (self.op_start.min(self.start), self.op_end.max(self.end))
        };
        Interval {
            start: self.start,
            end: self.end,
            version: self.version,
            id: self.id,
            op_start,
            op_end,
            attachment: self.attachment,
        }
    }
}

impl<A: Clone> From<&Interval<A>> for IntervalBuilder<A> {
    fn from(interval: &Interval<A>) -> Self {
        Self {
            start: interval.start,
            end: interval.end,
            version: interval.version,
            id: interval.id,
            op_start: interval.op_start,
            op_end: interval.op_end,
            attachment: interval.attachment.clone(),
        }
    }
}

/// Append `interval` to `out`, joining it with the last element when both describe the same data.
pub fn push_joined<A: Attachment>(out: &mut Vec<Interval<A>>, interval: Interval<A>) {
    if interval.start == interval.end {
        return;
    }
    if let Some(last) = out.last_mut() {
        if last.joins(&interval) {
            last.absorb(&interval);
            return;
        }
    }
    out.push(interval);
}
