//! Merge the committed history of several donors into a reconstruction plan.
//!
//! When a node lost (or never received) part of a file, it asks other nodes (donors) for their
//! `cur` vectors. Each donor may itself be missing writes, so no single answer can be trusted.
//! Instead, every byte is assigned to the write with the highest `id` any donor reports for it.
//! Ids are unique and only ever increase, so the newest write always wins.
//!
//! A donor only vouches for a write if every byte of the write's operation span still holds the
//! write or was overwritten by a newer one in its own vector. Pieces of operations that a donor
//! only holds partially (with gaps or older data elsewhere in the span) are replaced by empty
//! sentinels before merging: the donor cannot tell what the rest of the operation looked like.
//!
//! The merge is a pointwise maximum, so the resulting plan does not depend on the order donors are
//! folded in, nor on whether they are folded one at a time or all at once. Each interval of the plan
//! is attached to the donor it was taken from (the smallest donor, if several hold the same write).

use crate::Error;
use ecstore_intervals::{
    push_joined, Interval, IntervalBuilder, IntervalVector, ListVector, TreeVector, EMPTY,
};
use futures::{stream::FuturesUnordered, StreamExt};
use std::{fmt, future::Future};
use tracing::{debug, trace, warn};

/// Identity of a donor.
pub trait Donor: Clone + Ord + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Ord + fmt::Debug + Send + Sync + 'static> Donor for T {}

/// An incremental merge of donor vectors.
#[derive(Clone, Debug)]
pub struct Recovery<D: Donor> {
    merged: TreeVector<Option<D>>,
    donors: Vec<(D, Vec<Interval>)>,
}

impl<D: Donor> Default for Recovery<D> {
    fn default() -> Self {
        Self {
            merged: TreeVector::default(),
            donors: Vec::new(),
        }
    }
}

impl<D: Donor> Recovery<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the vector of `donor` into the plan.
    pub fn fold(&mut self, donor: D, vector: &dyn IntervalVector) {
        let intervals = vector.serialize();
        for interval in &intervals {
            self.overlay(classify(&donor, interval, vector));
        }
        self.donors.push((donor, intervals));
    }

    /// Merge the vectors of several donors into the plan.
    pub fn fold_all<'a>(&mut self, donors: impl IntoIterator<Item = (D, &'a dyn IntervalVector)>) {
        for (donor, vector) in donors {
            self.fold(donor, vector);
        }
    }

    /// Donors folded so far, in fold order.
    pub fn donors(&self) -> impl Iterator<Item = &D> + '_ {
        self.donors.iter().map(|(donor, _)| donor)
    }

    pub fn finish(self) -> RecoveryPlan<D> {
        RecoveryPlan {
            intervals: self.merged.serialize(),
            donors: self.donors,
        }
    }

    /// Replace every part of the plan that `candidate` beats.
    fn overlay(&mut self, candidate: Interval<Option<D>>) {
        for existing in self.merged.get_slice(candidate.start(), candidate.end()) {
            let wins = candidate.id() > existing.id()
                || (candidate.id() == existing.id() && candidate.attachment() < existing.attachment());
            if wins {
                self.merged
                    .insert(candidate.clip(existing.start(), existing.end()));
            }
        }
    }
}

/// Attach `donor` to `interval`, or degrade it to an empty sentinel if `vector` is missing part of
/// the operation that wrote it.
fn classify<D: Donor>(
    donor: &D,
    interval: &Interval,
    vector: &dyn IntervalVector,
) -> Interval<Option<D>> {
    let mut builder = IntervalBuilder {
        start: interval.start(),
        end: interval.end(),
        version: interval.version(),
        id: interval.id(),
        op_start: interval.op_start(),
        op_end: interval.op_end(),
        attachment: Some(donor.clone()),
    };
    let complete = !interval.is_empty()
        && vector
            .get_slice(interval.op_start(), interval.op_end())
            .iter()
            .all(|piece| interval.is_covered_by(piece));
    if !complete {
        if !interval.is_empty() {
            trace!(
                ?donor,
                start = interval.start(),
                end = interval.end(),
                id = interval.id(),
                "ignoring incomplete operation"
            );
        }
        builder.version = EMPTY;
        builder.id = EMPTY;
        builder.attachment = None;
    }
    builder.build()
}

/// Fold `donors` into `existing` (or into a new merge).
pub fn recover_vector<'a, D: Donor>(
    donors: impl IntoIterator<Item = (D, &'a dyn IntervalVector)>,
    existing: Option<Recovery<D>>,
) -> Recovery<D> {
    let mut recovery = existing.unwrap_or_default();
    recovery.fold_all(donors);
    recovery
}

/// Request the vectors of all donors concurrently and merge them as they arrive.
///
/// Donors whose request fails are excluded. Fails with [Error::InsufficientDonors] if fewer than
/// `required` donors responded.
pub async fn recover_from_donors<D, V, E, F>(
    requests: impl IntoIterator<Item = (D, F)>,
    required: usize,
) -> Result<RecoveryPlan<D>, Error>
where
    D: Donor,
    V: IntervalVector,
    E: fmt::Display,
    F: Future<Output = Result<V, E>>,
{
    let mut responses: FuturesUnordered<_> = requests
        .into_iter()
        .map(|(donor, request)| async move { (donor, request.await) })
        .collect();
    let mut recovery = Recovery::new();
    let mut responded = 0;
    while let Some((donor, response)) = responses.next().await {
        match response {
            Ok(vector) => {
                debug!(?donor, intervals = vector.len(), "folding donor");
                recovery.fold(donor, &vector);
                responded += 1;
            }
            Err(err) => warn!(?donor, %err, "donor failed"),
        }
    }
    if responded < required {
        return Err(Error::InsufficientDonors {
            responded,
            required,
        });
    }
    Ok(recovery.finish())
}

/// The authoritative history of a file, as merged from its donors.
#[derive(Clone, Debug)]
pub struct RecoveryPlan<D: Donor> {
    intervals: Vec<Interval<Option<D>>>,
    donors: Vec<(D, Vec<Interval>)>,
}

impl<D: Donor> RecoveryPlan<D> {
    /// The merged intervals, each attached to the donor that holds it (`None` for empty
    /// sentinels).
    pub fn intervals(&self) -> &[Interval<Option<D>>] {
        &self.intervals
    }

    /// The plan without donor attachments.
    pub fn to_vector(&self) -> ListVector {
        let mut vector = ListVector::default();
        for interval in &self.intervals {
            vector.insert(interval.detach());
        }
        vector
    }

    /// Donors whose vector differs from the plan.
    pub fn stale_donors(&self) -> Vec<&D> {
        let expected = self.to_vector().serialize();
        self.donors
            .iter()
            .filter(|(_, intervals)| *intervals != expected)
            .map(|(donor, _)| donor)
            .collect()
    }

    /// Returns `true` if some donor must commit the plan to agree with it.
    pub fn needs_commit(&self) -> bool {
        !self.stale_donors().is_empty()
    }

    /// The parts of the plan where `local` disagrees with it.
    pub fn missing(&self, local: &dyn IntervalVector) -> Vec<Interval<Option<D>>> {
        let mut missing = Vec::new();
        for planned in &self.intervals {
            for piece in local.get_slice(planned.start(), planned.end()) {
                if !piece.same_group(planned) {
                    push_joined(&mut missing, planned.clip(piece.start(), piece.end()));
                }
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use futures::{executor::block_on, future::ready};
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    fn vector(intervals: &[Interval]) -> TreeVector {
        TreeVector::from_intervals(intervals.iter().cloned())
    }

    /// Four donors holding a shared write, two of them with newer partial overwrites.
    fn donors() -> Vec<(char, TreeVector)> {
        let base = Interval::new(0, 12, 1, 1);
        vec![
            ('A', vector(&[base.clone()])),
            ('B', vector(&[base.clone(), Interval::new(0, 2, 2, 2)])),
            ('C', vector(&[base.clone()])),
            (
                'D',
                vector(&[base, Interval::new(0, 2, 2, 2), Interval::new(10, 12, 2, 3)]),
            ),
        ]
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for rest in permutations(n - 1) {
            for i in 0..=rest.len() {
                let mut permutation = rest.clone();
                permutation.insert(i, n - 1);
                out.push(permutation);
            }
        }
        out
    }

    fn attachments<D: Donor>(plan: &RecoveryPlan<D>) -> Vec<Option<D>> {
        plan.intervals()
            .iter()
            .map(|interval| interval.attachment().clone())
            .collect()
    }

    #[test_traced]
    fn test_newest_write_wins() {
        let donors = donors();
        let plan = recover_vector(donors.iter().map(|(d, v)| (*d, v as &dyn IntervalVector)), None)
            .finish();
        assert_eq!(
            plan.intervals(),
            &[
                Interval::new(0, 2, 2, 2),
                Interval::new(2, 10, 1, 1),
                Interval::new(10, 12, 2, 3),
            ]
        );
        assert_eq!(attachments(&plan), vec![Some('B'), Some('A'), Some('D')]);
    }

    #[test]
    fn test_donor_order_independent() {
        let donors = donors();
        let expected = recover_vector(donors.iter().map(|(d, v)| (*d, v as &dyn IntervalVector)), None)
            .finish();
        for permutation in permutations(donors.len()) {
            // All at once
            let ordered = permutation
                .iter()
                .map(|i| (donors[*i].0, &donors[*i].1 as &dyn IntervalVector));
            let plan = recover_vector(ordered, None).finish();
            assert_eq!(plan.intervals(), expected.intervals());
            assert_eq!(attachments(&plan), attachments(&expected));

            // One at a time
            let mut recovery = None;
            for i in &permutation {
                let (donor, vector) = &donors[*i];
                recovery = Some(recover_vector(
                    [(*donor, vector as &dyn IntervalVector)],
                    recovery,
                ));
            }
            let plan = recovery.unwrap().finish();
            assert_eq!(plan.intervals(), expected.intervals());
            assert_eq!(attachments(&plan), attachments(&expected));
        }
    }

    #[test_traced]
    fn test_incomplete_operation_excluded() {
        // Only donor 1 holds the newest write, and only part of it
        let donors = [
            (1u8, vector(&[Interval::new(0, 12, 1, 1)])),
            (
                2u8,
                vector(&[Interval::new(0, 12, 1, 1), Interval::with_op(0, 6, 2, 2, 0, 12)]),
            ),
        ];
        let plan = recover_vector(donors.iter().map(|(d, v)| (*d, v as &dyn IntervalVector)), None)
            .finish();
        assert_eq!(plan.intervals(), &[Interval::new(0, 12, 1, 1)]);
        assert_eq!(attachments(&plan), vec![Some(1)]);

        // Without another source, the range of the partial write is unknown
        let alone = recover_vector([(2u8, &donors[1].1 as &dyn IntervalVector)], None).finish();
        assert_eq!(
            alone.intervals(),
            &[Interval::empty(0, 6), Interval::new(6, 12, 1, 1)]
        );
        assert_eq!(attachments(&alone), vec![None, Some(2)]);
    }

    #[test_traced]
    fn test_overwritten_write_survives() {
        // Every donor holds the same history: a write partly overwritten by a newer one
        let history = vector(&[Interval::new(0, 12, 1, 1), Interval::new(0, 2, 2, 2)]);
        let donors = [(1u8, history.clone()), (2, history.clone()), (3, history.clone())];
        let plan = recover_vector(donors.iter().map(|(d, v)| (*d, v as &dyn IntervalVector)), None)
            .finish();
        let expected = [Interval::new(0, 2, 2, 2), Interval::new(2, 12, 1, 1)];
        assert_eq!(plan.intervals(), &expected);
        assert_eq!(attachments(&plan), vec![Some(1), Some(1)]);
        assert!(!plan.needs_commit());

        // A fresh node rebuilds everything
        assert_eq!(plan.missing(&TreeVector::new()), expected);

        // Recovering from the plan itself loses nothing
        let replayed = TreeVector::from_intervals(plan.to_vector().into_inner());
        let again = recover_vector([(1u8, &replayed as &dyn IntervalVector)], None).finish();
        assert_eq!(again.intervals(), &expected);
    }

    #[test]
    fn test_gaps_and_trailing_empties() {
        let donors = [
            (1u8, vector(&[Interval::new(4, 8, 1, 1)])),
            (2u8, vector(&[Interval::new(12, 16, 1, 2), Interval::empty(16, 32)])),
        ];
        let plan = recover_vector(donors.iter().map(|(d, v)| (*d, v as &dyn IntervalVector)), None)
            .finish();
        assert_eq!(
            plan.intervals(),
            &[
                Interval::empty(0, 4),
                Interval::new(4, 8, 1, 1),
                Interval::empty(8, 12),
                Interval::new(12, 16, 1, 2),
            ]
        );
    }

    #[test]
    fn test_random_donors_order_independent() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            // Donors see random subsets of a shared write history
            let writes: Vec<Interval> = (0..10)
                .map(|id| {
                    let start = rng.gen_range(0..63);
                    let end = rng.gen_range(start + 1..=64);
                    Interval::new(start, end, id / 4, id)
                })
                .collect();
            let mut donors: Vec<(u8, TreeVector)> = (0..5)
                .map(|donor| {
                    let mut vector = TreeVector::new();
                    for write in &writes {
                        if rng.gen_bool(0.7) {
                            vector.insert(write.clone());
                        }
                    }
                    (donor, vector)
                })
                .collect();

            let expected = recover_vector(
                donors.iter().map(|(d, v)| (*d, v as &dyn IntervalVector)),
                None,
            )
            .finish();
            for _ in 0..5 {
                donors.shuffle(&mut rng);
                let split = rng.gen_range(0..=donors.len());
                let partial = recover_vector(
                    donors[..split]
                        .iter()
                        .map(|(d, v)| (*d, v as &dyn IntervalVector)),
                    None,
                );
                let plan = recover_vector(
                    donors[split..]
                        .iter()
                        .map(|(d, v)| (*d, v as &dyn IntervalVector)),
                    Some(partial),
                )
                .finish();
                assert_eq!(plan.intervals(), expected.intervals());
                assert_eq!(attachments(&plan), attachments(&expected));
            }
        }
    }

    #[test]
    fn test_stale_donors() {
        let donors = donors();
        let plan = recover_vector(donors.iter().map(|(d, v)| (*d, v as &dyn IntervalVector)), None)
            .finish();
        assert!(plan.needs_commit());
        assert_eq!(plan.stale_donors(), vec![&'A', &'B', &'C']);

        // A donor that already holds the plan is up to date
        let synced = TreeVector::from_intervals(plan.to_vector().into_inner());
        let plan = recover_vector([('E', &synced as &dyn IntervalVector)], None).finish();
        assert!(!plan.needs_commit());
    }

    #[test]
    fn test_missing() {
        let donors = donors();
        let plan = recover_vector(donors.iter().map(|(d, v)| (*d, v as &dyn IntervalVector)), None)
            .finish();

        // A replacement node starts from nothing
        let missing = plan.missing(&TreeVector::new());
        assert_eq!(missing, plan.intervals());

        // A node that only missed the last write
        let local = vector(&[Interval::new(0, 12, 1, 1), Interval::new(0, 2, 2, 2)]);
        let missing = plan.missing(&local);
        assert_eq!(missing, vec![Interval::new(10, 12, 2, 3)]);
        assert_eq!(missing[0].attachment(), &Some('D'));
    }

    #[test_traced]
    fn test_recover_from_donors() {
        let donors = donors();
        let requests = donors
            .iter()
            .map(|(donor, vector)| (*donor, ready(Ok::<_, String>(vector.clone()))))
            .chain([('E', ready(Err("timeout".to_string())))]);
        let plan = block_on(recover_from_donors(requests, 3)).unwrap();
        assert_eq!(plan.donors.len(), 4);
        assert_eq!(
            plan.intervals(),
            &[
                Interval::new(0, 2, 2, 2),
                Interval::new(2, 10, 1, 1),
                Interval::new(10, 12, 2, 3),
            ]
        );
    }

    #[test_traced]
    fn test_recover_from_donors_insufficient() {
        let requests = [
            (1u8, ready(Ok::<_, String>(vector(&[Interval::new(0, 12, 1, 1)])))),
            (2u8, ready(Err("unreachable".to_string()))),
            (3u8, ready(Err("unreachable".to_string()))),
        ];
        let result = block_on(recover_from_donors(requests, 2));
        assert!(matches!(
            result,
            Err(Error::InsufficientDonors {
                responded: 1,
                required: 2
            })
        ));
    }
}
