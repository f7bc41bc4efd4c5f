//! Persisted form of an [IntervalVector].

use crate::{Attachment, Error, Interval, IntervalVector, ListVector};
use bytes::{Buf, Bytes, BytesMut};
use commonware_codec::{FixedSize, ReadExt, Write};

/// Encode the stored intervals of `vector`.
///
/// Attachments are not persisted.
pub fn encode<A: Attachment>(vector: &dyn IntervalVector<A>) -> Bytes {
    let mut buf = BytesMut::with_capacity(u32::SIZE + vector.len() * Interval::SIZE);
    (vector.len() as u32).write(&mut buf);
    for interval in vector.iter() {
        interval.detach().write(&mut buf);
    }
    buf.freeze()
}

/// Decode a vector previously written with [encode].
///
/// Fails if `buf` holds more than `max` intervals, if any interval is malformed, if intervals
/// are unsorted or overlap, or if bytes remain after the last interval.
pub fn decode(mut buf: impl Buf, max: usize) -> Result<ListVector, Error> {
    let count = u32::read(&mut buf)? as usize;
    if count > max {
        return Err(Error::TooManyIntervals(count));
    }
    let mut intervals = Vec::with_capacity(count);
    for _ in 0..count {
        let start = u64::read(&mut buf)?;
        let end = u64::read(&mut buf)?;
        let version = i64::read(&mut buf)?;
        let id = i64::read(&mut buf)?;
        let op_start = u64::read(&mut buf)?;
        let op_end = u64::read(&mut buf)?;
        let interval = Interval::checked(start, end, version, id, op_start, op_end).ok_or(
            Error::Malformed {
                start,
                end,
                op_start,
                op_end,
            },
        )?;
        intervals.push(interval);
    }
    if buf.has_remaining() {
        return Err(Error::TrailingBytes(buf.remaining()));
    }
    ListVector::try_from(intervals)
}
