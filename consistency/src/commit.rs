//! Decide which provisional intervals become durable.
//!
//! A commit request lists, for a range of the file, the `(version, id)` of the write that is
//! expected to own every byte (gaps are empty sentinels). Each node compares the request against
//! its own `cur` and `next` vectors:
//!
//! - Ranges already held by `cur` at the requested version are skipped.
//! - Ranges where `cur` holds a newer version than requested mean the requester's view is older
//!   than durable state. This never happens in a correct deployment and aborts the whole commit
//!   with [Error::OutdatedRequest].
//! - Remaining ranges must be found in `next` with the requested `(version, id)`. If they are not,
//!   the node never received the write and the decision is marked `failed` (the caller retries or
//!   falls back to reconstruction).
//! - Ranges found in `next` are only committed once their whole operation landed on this node
//!   (pending in `next`, already committed in `cur`, or since overwritten by a newer write).
//!   Partially received operations stay pending.

use crate::Error;
use ecstore_intervals::{push_joined, Interval, IntervalVector, TreeVector};
use tracing::{debug, error, trace};

/// Outcome of [calculate_intervals_to_commit].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitDecision {
    /// Intervals to move from `next` to `cur`, in order.
    pub committed: Vec<Interval>,
    /// Set if some requested write is not present on this node.
    ///
    /// When set, `committed` only holds what was found before the missing write and should not
    /// be applied.
    pub failed: bool,
}

/// Outcome of [calculate_intervals_to_commit_abort].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbortDecision {
    /// Intervals to move from `next` to `cur`, in order.
    pub committed: Vec<Interval>,
    /// Intervals to discard from `next`, in order.
    pub aborted: Vec<Interval>,
    /// Set if some requested write is not present on this node (see [CommitDecision::failed]).
    pub failed: bool,
}

/// Compute the intervals of `next` to commit for the request `req`.
///
/// `req_interval` is the interval that was just flushed, if any. When it belongs to the same write
/// as a pending interval, that write is considered complete as soon as `req_interval` is covered,
/// instead of requiring the full operation span to be covered.
pub fn calculate_intervals_to_commit(
    req: &[Interval],
    req_interval: Option<&Interval>,
    cur: &dyn IntervalVector,
    next: &dyn IntervalVector,
) -> Result<CommitDecision, Error> {
    let mut committed = Vec::new();
    for requested in req {
        if requested.is_empty() || requested.len() == 0 {
            continue;
        }
        for piece in cur.get_slice(requested.start(), requested.end()) {
            if !piece.is_empty() && piece.version() > requested.version() {
                error!(
                    start = piece.start(),
                    end = piece.end(),
                    requested = requested.version(),
                    committed = piece.version(),
                    "request older than committed state"
                );
                return Err(Error::OutdatedRequest {
                    start: piece.start(),
                    end: piece.end(),
                    requested: requested.version(),
                    committed: piece.version(),
                });
            }
            if piece.version() == requested.version() && piece.id() >= requested.id() {
                trace!(
                    start = piece.start(),
                    end = piece.end(),
                    version = piece.version(),
                    id = piece.id(),
                    "already committed"
                );
                continue;
            }

            // The write must have landed in next
            let pending = next.get_slice(piece.start(), piece.end());
            if let Some(missing) = pending.iter().find(|p| !p.same_group(requested)) {
                debug!(
                    start = missing.start(),
                    end = missing.end(),
                    version = requested.version(),
                    id = requested.id(),
                    "requested write not found"
                );
                return Ok(CommitDecision {
                    committed,
                    failed: true,
                });
            }
            for interval in pending {
                if !is_complete(&interval, req_interval, cur, next) {
                    trace!(
                        start = interval.start(),
                        end = interval.end(),
                        op_start = interval.op_start(),
                        op_end = interval.op_end(),
                        "operation incomplete"
                    );
                    continue;
                }
                push_joined(&mut committed, interval);
            }
        }
    }
    Ok(CommitDecision {
        committed,
        failed: false,
    })
}

/// Compute the intervals of `next` to commit and to abort for the request `req`.
///
/// `committed` always equals the output of [calculate_intervals_to_commit] for the same request
/// (without a flushed interval). `aborted` holds every other non-empty part of `next` within
/// the requested range: writes that lost to the requested ones and writes that never completed.
/// Nothing is aborted when the decision failed.
pub fn calculate_intervals_to_commit_abort(
    req: &[Interval],
    cur: &dyn IntervalVector,
    next: &dyn IntervalVector,
) -> Result<AbortDecision, Error> {
    let CommitDecision { committed, failed } =
        calculate_intervals_to_commit(req, None, cur, next)?;
    let (Some(first), Some(last), false) = (req.first(), req.last(), failed) else {
        return Ok(AbortDecision {
            committed,
            aborted: Vec::new(),
            failed,
        });
    };

    // Everything provisional in the requested range that is not committed is aborted
    let mut remaining = TreeVector::new();
    for interval in next.get_slice(first.start(), last.end()) {
        if !interval.is_empty() {
            remaining.insert(interval);
        }
    }
    for interval in &committed {
        remaining.insert(Interval::empty(interval.start(), interval.end()));
    }
    let aborted = remaining
        .iter()
        .filter(|interval| !interval.is_empty())
        .cloned()
        .collect();
    Ok(AbortDecision {
        committed,
        aborted,
        failed,
    })
}

/// Returns `true` if every byte of the operation that wrote `interval` is pending in `next`,
/// already committed in `cur`, or overwritten by a newer write in either.
fn is_complete(
    interval: &Interval,
    req_interval: Option<&Interval>,
    cur: &dyn IntervalVector,
    next: &dyn IntervalVector,
) -> bool {
    let (start, end) = match req_interval {
        Some(flushed) if flushed.same_group(interval) => (flushed.start(), flushed.end()),
        _ => (interval.op_start(), interval.op_end()),
    };
    next.get_slice(start, end).iter().all(|pending| {
        interval.is_covered_by(pending)
            || cur
                .get_slice(pending.start(), pending.end())
                .iter()
                .all(|committed| interval.is_covered_by(committed))
    })
}
