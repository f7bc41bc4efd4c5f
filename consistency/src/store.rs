//! Per-file commit state backed by a [Persistence] layer.
//!
//! A [Store] keeps the `cur` and `next` vectors of every file it has touched in memory, loading
//! them from [Persistence] on first use. All operations on one file are serialized by a per-file
//! lock, so the policy functions always see a consistent pair of vectors. Operations on different
//! files proceed in parallel.
//!
//! Every change is persisted before it is applied in memory: if [Persistence] fails, the in-memory
//! state is left untouched.

use crate::{
    calculate_intervals_to_commit, calculate_intervals_to_commit_abort, plan_stripes,
    AbortDecision, CommitDecision, Config, Donor, Error, FileId, Metrics, RecoveryPlan,
    StripePlan, StripingPolicy,
};
use bytes::Bytes;
use ecstore_coding::Codec;
use ecstore_intervals::{
    decode, encode, Attachment, Interval, IntervalVector, ListVector, TreeVector, EMPTY,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn};

/// Changes to the vectors of a file that must be applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    /// Intervals moved from `next` to `cur`.
    pub committed: Vec<Interval>,
    /// Intervals removed from `next`.
    pub aborted: Vec<Interval>,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.aborted.is_empty()
    }
}

impl From<CommitDecision> for Transaction {
    fn from(decision: CommitDecision) -> Self {
        Self {
            committed: decision.committed,
            aborted: Vec::new(),
        }
    }
}

impl From<AbortDecision> for Transaction {
    fn from(decision: AbortDecision) -> Self {
        Self {
            committed: decision.committed,
            aborted: decision.aborted,
        }
    }
}

/// The committed (`cur`) and provisional (`next`) vectors of a file.
#[derive(Clone, Debug, Default)]
pub struct FileVectors {
    pub cur: TreeVector,
    pub next: TreeVector,
}

impl FileVectors {
    pub fn from_lists(cur: ListVector, next: ListVector) -> Self {
        Self {
            cur: TreeVector::from_intervals(cur.into_inner()),
            next: TreeVector::from_intervals(next.into_inner()),
        }
    }

    /// Record a write that has not been committed yet.
    pub fn write_provisional(&mut self, interval: Interval) {
        self.next.insert(interval);
    }

    /// Move committed intervals into `cur` and clear both committed and aborted ranges from
    /// `next`.
    pub fn apply(&mut self, transaction: &Transaction) {
        for interval in &transaction.committed {
            self.cur.insert(interval.clone());
            self.next
                .insert(Interval::empty(interval.start(), interval.end()));
        }
        for interval in &transaction.aborted {
            self.next
                .insert(Interval::empty(interval.start(), interval.end()));
        }
    }
}

/// Durable storage for the vectors of each file.
pub trait Persistence: Send + Sync {
    /// Load the `(cur, next)` vectors of `file`, if it was ever written.
    fn load(&self, file: &FileId) -> Result<Option<(ListVector, ListVector)>, Error>;

    /// Durably record a provisional write.
    fn write_next(&self, file: &FileId, interval: &Interval) -> Result<(), Error>;

    /// Atomically apply `transaction` (see [FileVectors::apply]).
    fn apply(&self, file: &FileId, transaction: &Transaction) -> Result<(), Error>;
}

impl<P: Persistence + ?Sized> Persistence for Arc<P> {
    fn load(&self, file: &FileId) -> Result<Option<(ListVector, ListVector)>, Error> {
        (**self).load(file)
    }

    fn write_next(&self, file: &FileId, interval: &Interval) -> Result<(), Error> {
        (**self).write_next(file, interval)
    }

    fn apply(&self, file: &FileId, transaction: &Transaction) -> Result<(), Error> {
        (**self).apply(file, transaction)
    }
}

/// A [Persistence] that keeps the encoded vectors of each file in memory.
pub struct MemoryPersistence {
    max_intervals: usize,
    files: Mutex<HashMap<FileId, (Bytes, Bytes)>>,
}

impl MemoryPersistence {
    /// Create an empty store that refuses to decode vectors with more than `max_intervals`
    /// intervals.
    pub fn new(max_intervals: usize) -> Self {
        Self {
            max_intervals,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the vectors of `file`.
    pub fn import(&self, file: FileId, cur: &dyn IntervalVector, next: &dyn IntervalVector) {
        self.files
            .lock()
            .unwrap()
            .insert(file, (encode(cur), encode(next)));
    }

    fn decode(&self, cur: &Bytes, next: &Bytes) -> Result<FileVectors, Error> {
        let cur = decode(cur.clone(), self.max_intervals)?;
        let next = decode(next.clone(), self.max_intervals)?;
        Ok(FileVectors::from_lists(cur, next))
    }

    fn update(&self, file: &FileId, f: impl FnOnce(&mut FileVectors)) -> Result<(), Error> {
        let mut files = self.files.lock().unwrap();
        let mut vectors = match files.get(file) {
            Some((cur, next)) => self.decode(cur, next)?,
            None => FileVectors::default(),
        };
        f(&mut vectors);
        files.insert(
            file.clone(),
            (encode(&vectors.cur), encode(&vectors.next)),
        );
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self, file: &FileId) -> Result<Option<(ListVector, ListVector)>, Error> {
        let files = self.files.lock().unwrap();
        let Some((cur, next)) = files.get(file) else {
            return Ok(None);
        };
        let cur = decode(cur.clone(), self.max_intervals)?;
        let next = decode(next.clone(), self.max_intervals)?;
        Ok(Some((cur, next)))
    }

    fn write_next(&self, file: &FileId, interval: &Interval) -> Result<(), Error> {
        self.update(file, |vectors| vectors.write_provisional(interval.clone()))
    }

    fn apply(&self, file: &FileId, transaction: &Transaction) -> Result<(), Error> {
        self.update(file, |vectors| vectors.apply(transaction))
    }
}

/// Tells a node whether it currently coordinates a file.
pub trait Lease: Send + Sync {
    fn is_authoritative_for(&self, file: &FileId) -> bool;
}

impl<F: Fn(&FileId) -> bool + Send + Sync> Lease for F {
    fn is_authoritative_for(&self, file: &FileId) -> bool {
        self(file)
    }
}

/// Allocates `(version, id)` pairs for new writes to a file.
///
/// Ids strictly increase across versions, so they alone order all writes to a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteClock {
    version: i64,
    id: i64,
}

impl Default for WriteClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteClock {
    pub fn new() -> Self {
        Self {
            version: 0,
            id: EMPTY,
        }
    }

    /// Resume after the highest version and id stored in either vector.
    pub fn from_vectors(cur: &dyn IntervalVector, next: &dyn IntervalVector) -> Self {
        let mut clock = Self::new();
        for interval in cur.iter().chain(next.iter()) {
            clock.observe(interval);
        }
        clock
    }

    /// Ensure future allocations follow `interval`.
    pub fn observe(&mut self, interval: &Interval) {
        self.version = self.version.max(interval.version());
        self.id = self.id.max(interval.id());
    }

    /// Allocate the next `(version, id)`.
    pub fn next_id(&mut self) -> (i64, i64) {
        self.id += 1;
        (self.version, self.id)
    }

    /// Start a new version. Ids keep increasing.
    pub fn bump_version(&mut self) -> i64 {
        self.version += 1;
        self.version
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// The last allocated (or observed) id.
    pub fn id(&self) -> i64 {
        self.id
    }
}

struct FileState {
    vectors: FileVectors,
    clock: WriteClock,
}

/// Commit state of all files held by a node.
pub struct Store<P: Persistence, L: Lease> {
    persistence: P,
    lease: L,
    striping: StripingPolicy,
    codec: Codec,

    files: Mutex<HashMap<FileId, Arc<Mutex<FileState>>>>,

    metrics: Metrics,
}

impl<P: Persistence, L: Lease> Store<P, L> {
    /// Create a store over `persistence`.
    ///
    /// Files are loaded lazily on first access.
    pub fn init(cfg: Config, persistence: P, lease: L) -> Result<Self, Error> {
        let striping = cfg.striping();
        let codec = Codec::create(cfg.coding)?;
        let metrics = Metrics::init(&mut cfg.registry.lock().unwrap());
        Ok(Self {
            persistence,
            lease,
            striping,
            codec,
            files: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn striping(&self) -> &StripingPolicy {
        &self.striping
    }

    fn state(&self, file: &FileId) -> Result<Arc<Mutex<FileState>>, Error> {
        let mut files = self.files.lock().unwrap();
        if let Some(state) = files.get(file) {
            return Ok(state.clone());
        }
        let vectors = match self.persistence.load(file)? {
            Some((cur, next)) => FileVectors::from_lists(cur, next),
            None => FileVectors::default(),
        };
        let clock = WriteClock::from_vectors(&vectors.cur, &vectors.next);
        debug!(
            %file,
            cur = vectors.cur.len(),
            next = vectors.next.len(),
            id = clock.id(),
            "loaded file"
        );
        let state = Arc::new(Mutex::new(FileState { vectors, clock }));
        files.insert(file.clone(), state.clone());
        self.metrics.files.set(files.len() as i64);
        Ok(state)
    }

    fn check_lease(&self, file: &FileId) -> Result<(), Error> {
        if !self.lease.is_authoritative_for(file) {
            return Err(Error::NotAuthoritative(file.clone()));
        }
        Ok(())
    }

    fn apply(
        &self,
        file: &FileId,
        state: &mut FileState,
        transaction: &Transaction,
    ) -> Result<(), Error> {
        if transaction.is_empty() {
            return Ok(());
        }
        self.persistence.apply(file, transaction)?;
        state.vectors.apply(transaction);
        self.metrics
            .commits
            .inc_by(transaction.committed.len() as u64);
        self.metrics.aborts.inc_by(transaction.aborted.len() as u64);
        Ok(())
    }

    /// Record a provisional write to `file`.
    pub fn write(&self, file: &FileId, interval: Interval) -> Result<(), Error> {
        let state = self.state(file)?;
        let mut state = state.lock().unwrap();
        self.persistence.write_next(file, &interval)?;
        state.clock.observe(&interval);
        state.vectors.write_provisional(interval);
        Ok(())
    }

    /// Commit the parts of `req` that are fully present in `next`.
    ///
    /// Nothing is applied if the decision failed.
    pub fn commit(
        &self,
        file: &FileId,
        req: &[Interval],
        req_interval: Option<&Interval>,
    ) -> Result<CommitDecision, Error> {
        let state = self.state(file)?;
        let mut state = state.lock().unwrap();
        let decision = calculate_intervals_to_commit(
            req,
            req_interval,
            &state.vectors.cur,
            &state.vectors.next,
        )
        .inspect_err(|err| self.record_error(err))?;
        if decision.failed {
            self.metrics.commit_failures.inc();
            warn!(%file, committed = decision.committed.len(), "commit failed");
            return Ok(decision);
        }
        self.apply(file, &mut state, &Transaction::from(decision.clone()))?;
        Ok(decision)
    }

    /// Commit the parts of `req` present in `next` and abort everything else provisional in the
    /// requested range.
    ///
    /// Only the coordinator of `file` may reconcile it.
    pub fn reconcile(&self, file: &FileId, req: &[Interval]) -> Result<AbortDecision, Error> {
        self.check_lease(file)?;
        let state = self.state(file)?;
        let mut state = state.lock().unwrap();
        let decision =
            calculate_intervals_to_commit_abort(req, &state.vectors.cur, &state.vectors.next)
                .inspect_err(|err| self.record_error(err))?;
        if decision.failed {
            self.metrics.commit_failures.inc();
            warn!(%file, committed = decision.committed.len(), "reconcile failed");
            return Ok(decision);
        }
        self.apply(file, &mut state, &Transaction::from(decision.clone()))?;
        debug!(
            %file,
            committed = decision.committed.len(),
            aborted = decision.aborted.len(),
            "reconciled"
        );
        Ok(decision)
    }

    fn record_error(&self, err: &Error) {
        if matches!(err, Error::OutdatedRequest { .. }) {
            self.metrics.outdated_requests.inc();
        }
    }

    /// A snapshot of the `(cur, next)` vectors of `file`, in serialized form.
    pub fn vectors(&self, file: &FileId) -> Result<(ListVector, ListVector), Error> {
        let state = self.state(file)?;
        let state = state.lock().unwrap();
        let cur = ListVector::try_from(state.vectors.cur.serialize())?;
        let next = ListVector::try_from(state.vectors.next.serialize())?;
        Ok((cur, next))
    }

    /// Allocate the `(version, id)` of a new write to `file`.
    ///
    /// Only the coordinator of `file` may allocate ids.
    pub fn allocate(&self, file: &FileId) -> Result<(i64, i64), Error> {
        self.check_lease(file)?;
        let state = self.state(file)?;
        let mut state = state.lock().unwrap();
        Ok(state.clock.next_id())
    }

    /// Start a new version of `file`.
    pub fn bump_version(&self, file: &FileId) -> Result<i64, Error> {
        self.check_lease(file)?;
        let state = self.state(file)?;
        let mut state = state.lock().unwrap();
        let version = state.clock.bump_version();
        info!(%file, version, "bumped version");
        Ok(version)
    }

    /// Stripes to decode for this node (at `position` in each stripe) to catch up with `plan`.
    pub fn plan_rebuild<D: Donor>(
        &self,
        file: &FileId,
        plan: &RecoveryPlan<D>,
        position: u64,
    ) -> Result<Vec<StripePlan>, Error> {
        let state = self.state(file)?;
        let state = state.lock().unwrap();
        let missing = plan.missing(&state.vectors.cur);
        Ok(plan_stripes(&self.striping, &missing, position))
    }

    /// Commit rebuilt `intervals` directly into `cur`.
    ///
    /// Empty sentinels are skipped.
    pub fn install<A: Attachment>(
        &self,
        file: &FileId,
        intervals: &[Interval<A>],
    ) -> Result<(), Error> {
        let state = self.state(file)?;
        let mut state = state.lock().unwrap();
        let transaction = Transaction {
            committed: intervals
                .iter()
                .filter(|interval| !interval.is_empty())
                .map(Interval::detach)
                .collect(),
            aborted: Vec::new(),
        };
        self.apply(file, &mut state, &transaction)?;
        for interval in &transaction.committed {
            state.clock.observe(interval);
        }
        self.metrics
            .recoveries
            .inc_by(transaction.committed.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recover_vector;
    use commonware_macros::test_traced;
    use prometheus_client::{encoding::text::encode as encode_metrics, registry::Registry};
    use std::{
        num::{NonZeroU16, NonZeroU64},
        thread,
    };

    fn config() -> Config {
        Config {
            coding: ecstore_coding::Config {
                data_shards: NonZeroU16::new(3).unwrap(),
                parity_shards: 2,
            },
            chunk_size: NonZeroU64::new(4).unwrap(),
            max_intervals: 1024,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    fn authoritative(_: &FileId) -> bool {
        true
    }

    type TestStore = Store<Arc<MemoryPersistence>, fn(&FileId) -> bool>;

    fn store(persistence: &Arc<MemoryPersistence>) -> TestStore {
        Store::init(config(), persistence.clone(), authoritative as fn(&FileId) -> bool).unwrap()
    }

    #[test_traced]
    fn test_commit_and_reload() {
        let persistence = Arc::new(MemoryPersistence::new(1024));
        let store = store(&persistence);
        let file = FileId::from("file");

        // First write
        let (version, id) = store.allocate(&file).unwrap();
        assert_eq!((version, id), (0, 0));
        store.write(&file, Interval::new(0, 10, version, id)).unwrap();
        let decision = store
            .commit(&file, &[Interval::new(0, 10, version, id)], None)
            .unwrap();
        assert_eq!(decision.committed, vec![Interval::new(0, 10, 0, 0)]);

        // An overwrite that wins and one that never completes
        store.write(&file, Interval::new(5, 15, 0, 1)).unwrap();
        store.write(&file, Interval::new(20, 30, 0, 2)).unwrap();
        let decision = store
            .reconcile(
                &file,
                &[
                    Interval::new(0, 5, 0, 0),
                    Interval::new(5, 15, 0, 1),
                    Interval::empty(15, 30),
                ],
            )
            .unwrap();
        assert_eq!(decision.committed, vec![Interval::new(5, 15, 0, 1)]);
        assert_eq!(decision.aborted, vec![Interval::new(20, 30, 0, 2)]);

        let (cur, next) = store.vectors(&file).unwrap();
        assert_eq!(
            cur.serialize(),
            vec![Interval::new(0, 5, 0, 0), Interval::new(5, 15, 0, 1)]
        );
        assert!(next.serialize().is_empty());

        // A fresh store sees the persisted state and resumes the clock
        let reloaded = self::store(&persistence);
        let (reloaded_cur, reloaded_next) = reloaded.vectors(&file).unwrap();
        assert_eq!(reloaded_cur, cur);
        assert_eq!(reloaded_next, next);

        // The aborted id is no longer stored anywhere
        assert_eq!(reloaded.allocate(&file).unwrap(), (0, 2));
    }

    #[test_traced]
    fn test_failed_commit_not_applied() {
        let persistence = Arc::new(MemoryPersistence::new(1024));
        let store = store(&persistence);
        let file = FileId::from("file");

        // Only the first half of the requested write arrived
        store.write(&file, Interval::new(0, 4, 0, 0)).unwrap();
        let decision = store
            .commit(
                &file,
                &[Interval::new(0, 4, 0, 0), Interval::new(4, 8, 0, 1)],
                None,
            )
            .unwrap();
        assert!(decision.failed);
        assert_eq!(decision.committed, vec![Interval::new(0, 4, 0, 0)]);

        let (cur, next) = store.vectors(&file).unwrap();
        assert!(cur.is_empty());
        assert_eq!(next.serialize(), vec![Interval::new(0, 4, 0, 0)]);
    }

    #[test_traced]
    fn test_outdated_request() {
        let persistence = Arc::new(MemoryPersistence::new(1024));
        persistence.import(
            FileId::from("file"),
            &TreeVector::from_intervals([Interval::new(0, 8, 2, 5)]),
            &TreeVector::new(),
        );
        let store = store(&persistence);
        let result = store.commit(&FileId::from("file"), &[Interval::new(0, 8, 1, 6)], None);
        assert!(matches!(
            result,
            Err(Error::OutdatedRequest {
                requested: 1,
                committed: 2,
                ..
            })
        ));
    }

    #[test_traced]
    fn test_not_authoritative() {
        let persistence = Arc::new(MemoryPersistence::new(1024));
        let store = Store::init(config(), persistence, |file: &FileId| {
            file == &FileId::from("mine")
        })
        .unwrap();
        let theirs = FileId::from("theirs");
        assert!(matches!(
            store.reconcile(&theirs, &[Interval::new(0, 4, 0, 0)]),
            Err(Error::NotAuthoritative(file)) if file == theirs
        ));
        assert!(matches!(
            store.allocate(&theirs),
            Err(Error::NotAuthoritative(_))
        ));
        assert!(matches!(
            store.bump_version(&theirs),
            Err(Error::NotAuthoritative(_))
        ));
        assert_eq!(store.allocate(&FileId::from("mine")).unwrap(), (0, 0));

        // Non-coordinators still accept writes and commits
        store.write(&theirs, Interval::new(0, 4, 0, 0)).unwrap();
        store
            .commit(&theirs, &[Interval::new(0, 4, 0, 0)], None)
            .unwrap();
    }

    #[test_traced]
    fn test_corrupt_vector() {
        let persistence = Arc::new(MemoryPersistence::new(1024));
        let file = FileId::from("file");
        persistence.files.lock().unwrap().insert(
            file.clone(),
            (Bytes::from_static(&[0, 0, 0, 1, 0]), Bytes::new()),
        );
        let store = store(&persistence);
        assert!(matches!(store.vectors(&file), Err(Error::Intervals(_))));
        assert!(matches!(
            store.write(&file, Interval::new(0, 4, 0, 0)),
            Err(Error::Intervals(_))
        ));
    }

    #[test]
    fn test_clock() {
        let cur = TreeVector::from_intervals([Interval::new(0, 4, 1, 3)]);
        let next = TreeVector::from_intervals([Interval::new(4, 8, 1, 7)]);
        let mut clock = WriteClock::from_vectors(&cur, &next);
        assert_eq!(clock.next_id(), (1, 8));
        assert_eq!(clock.next_id(), (1, 9));
        assert_eq!(clock.bump_version(), 2);
        assert_eq!(clock.next_id(), (2, 10));

        // Observed writes are never reallocated
        clock.observe(&Interval::new(0, 1, 2, 20));
        assert_eq!(clock.next_id(), (2, 21));

        let mut empty = WriteClock::new();
        assert_eq!(empty.next_id(), (0, 0));
    }

    #[test_traced]
    fn test_recover_and_install() {
        let persistence = Arc::new(MemoryPersistence::new(1024));
        let store = store(&persistence);
        let file = FileId::from("file");

        // Donors committed two writes, this node only the first
        let donor = TreeVector::from_intervals([
            Interval::new(0, 12, 0, 0),
            Interval::new(12, 20, 0, 1),
        ]);
        store.write(&file, Interval::new(0, 12, 0, 0)).unwrap();
        store
            .commit(&file, &[Interval::new(0, 12, 0, 0)], None)
            .unwrap();

        let plan = recover_vector([(1u8, &donor as &dyn IntervalVector)], None).finish();
        let stripes = store.plan_rebuild(&file, &plan, 0).unwrap();
        assert_eq!(
            stripes,
            vec![StripePlan {
                stripe: 1,
                needs_data: true
            }]
        );

        let (cur, _) = store.vectors(&file).unwrap();
        let missing = plan.missing(&cur);
        store.install(&file, &missing).unwrap();
        let (cur, _) = store.vectors(&file).unwrap();
        assert_eq!(cur.serialize(), donor.serialize());
        assert!(store.plan_rebuild(&file, &plan, 0).unwrap().is_empty());
        assert_eq!(store.allocate(&file).unwrap(), (0, 2));
    }

    #[test_traced]
    fn test_metrics() {
        let cfg = config();
        let registry = cfg.registry.clone();
        let persistence = Arc::new(MemoryPersistence::new(1024));
        let store = Store::init(cfg, persistence, authoritative as fn(&FileId) -> bool).unwrap();
        let file = FileId::from("file");
        store.write(&file, Interval::new(0, 4, 0, 0)).unwrap();
        store.write(&file, Interval::new(8, 12, 0, 1)).unwrap();
        store
            .reconcile(&file, &[Interval::new(0, 4, 0, 0), Interval::empty(4, 12)])
            .unwrap();
        store
            .commit(&file, &[Interval::new(4, 8, 0, 2)], None)
            .unwrap();

        let mut buffer = String::new();
        encode_metrics(&mut buffer, &registry.lock().unwrap()).unwrap();
        assert!(buffer.contains("commits_total 1"));
        assert!(buffer.contains("aborts_total 1"));
        assert!(buffer.contains("commit_failures_total 1"));
        assert!(buffer.contains("files 1"));
    }

    #[test_traced]
    fn test_concurrent_writes() {
        let persistence = Arc::new(MemoryPersistence::new(1024));
        let store = store(&persistence);
        let file = FileId::from("file");
        thread::scope(|scope| {
            for worker in 0..4u64 {
                let store = &store;
                let file = &file;
                scope.spawn(move || {
                    for i in 0..8u64 {
                        let start = (worker * 8 + i) * 4;
                        let (version, id) = store.allocate(file).unwrap();
                        let interval = Interval::new(start, start + 4, version, id);
                        store.write(file, interval.clone()).unwrap();
                        store.commit(file, &[interval], None).unwrap();
                    }
                });
            }
        });

        // Every write committed with a distinct id
        let (cur, next) = store.vectors(&file).unwrap();
        assert!(next.is_empty());
        assert_eq!(cur.len(), 32);
        let mut ids: Vec<i64> = cur.iter().map(|interval| interval.id()).collect();
        ids.sort();
        assert_eq!(ids, (0..32).collect::<Vec<_>>());
        assert_eq!(cur.end(), 128);
    }
}
