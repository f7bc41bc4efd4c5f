//! Decide which provisional byte ranges of an erasure-coded file become durable.
//!
//! # Overview
//!
//! Every node holding a chunk of an erasure-coded file tracks two
//! [IntervalVector](ecstore_intervals::IntervalVector)s for it:
//!
//! - `cur`: the committed ranges of the chunk (durable truth).
//! - `next`: the ranges written provisionally but not yet committed (a write-ahead area).
//!
//! Writes first land in `next`. Once a writer (or the file's coordinator) knows the final state of
//! a range, it sends that state as a request vector and each node decides, with
//! [calculate_intervals_to_commit] or [calculate_intervals_to_commit_abort], which provisional
//! ranges to promote to `cur` and which to discard. The resulting [Transaction] is applied
//! atomically by a [Persistence] layer.
//!
//! After a node fails, [Recovery] merges the `cur` vectors of several donors into a single plan
//! describing, for every byte of the file, which write is authoritative and which donor holds it.
//! [plan_stripes] and [StripeRebuild] then drive the [ecstore_coding] codec to rebuild the chunk.
//!
//! # Concurrency
//!
//! The policy functions are pure: they never mutate the vectors they are given and can run on any
//! thread. [Store] serializes all operations on a single file behind a per-file lock, and defers
//! coordinator-only operations to an injected [Lease].

use prometheus_client::registry::Registry;
use std::{
    fmt,
    num::NonZeroU64,
    sync::{Arc, Mutex},
};
use thiserror::Error;

mod commit;
pub use commit::{
    calculate_intervals_to_commit, calculate_intervals_to_commit_abort, AbortDecision,
    CommitDecision,
};
mod metrics;
pub use metrics::Metrics;
mod reconstruction;
pub use reconstruction::{plan_stripes, StripePlan, StripeRebuild, StripingPolicy};
mod recovery;
pub use recovery::{recover_from_donors, recover_vector, Donor, Recovery, RecoveryPlan};
mod store;
pub use store::{FileVectors, Lease, MemoryPersistence, Persistence, Store, Transaction, WriteClock};

/// Identifier of a file.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that can occur when committing, recovering, or rebuilding a file.
#[derive(Debug, Error)]
pub enum Error {
    #[error("request for [{start}, {end}) at version {requested} is older than committed version {committed}")]
    OutdatedRequest {
        start: u64,
        end: u64,
        requested: i64,
        committed: i64,
    },
    #[error("not authoritative for file: {0}")]
    NotAuthoritative(FileId),
    #[error("insufficient donors: {responded} < {required}")]
    InsufficientDonors { responded: usize, required: usize },
    #[error("invalid chunk at position {position}: {length} bytes")]
    InvalidChunk { position: usize, length: usize },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("intervals error: {0}")]
    Intervals(#[from] ecstore_intervals::Error),
    #[error("coding error: {0}")]
    Coding(#[from] ecstore_coding::Error),
}

/// Configuration for a [Store].
#[derive(Clone)]
pub struct Config {
    /// Stripe layout of the files managed by the store.
    pub coding: ecstore_coding::Config,

    /// Size of a single chunk (the per-node portion of a stripe), in bytes.
    pub chunk_size: NonZeroU64,

    /// Maximum number of intervals accepted when decoding a persisted vector.
    pub max_intervals: usize,

    /// Registry for metrics.
    pub registry: Arc<Mutex<Registry>>,
}

impl Config {
    /// Striping arithmetic for this configuration.
    pub fn striping(&self) -> StripingPolicy {
        StripingPolicy {
            chunk_size: self.chunk_size.get(),
            data_shards: self.coding.data_shards.get() as u64,
            parity_shards: self.coding.parity_shards as u64,
        }
    }
}

