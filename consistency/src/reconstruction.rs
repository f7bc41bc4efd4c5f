//! Plan and execute the rebuild of a lost chunk from the stripes that hold it.
//!
//! A file is striped across `k + m` nodes. Byte `offset` of the file lives in stripe
//! `offset / (k * chunk_size)`, in the data chunk `(offset / chunk_size) % k` of that stripe. Every
//! stripe has one chunk (of `chunk_size` bytes) per node, so rebuilding the chunk held by node
//! `position` requires decoding every stripe that intersects a missing range.

use crate::Error;
use ecstore_coding::{Code, Codec};
use ecstore_intervals::{Attachment, Interval};
use std::collections::BTreeMap;
use tracing::debug;

/// Arithmetic mapping file offsets to stripes and chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StripingPolicy {
    pub chunk_size: u64,
    pub data_shards: u64,
    pub parity_shards: u64,
}

impl StripingPolicy {
    /// Number of data bytes in a stripe.
    pub fn stripe_size(&self) -> u64 {
        self.chunk_size * self.data_shards
    }

    /// Number of chunks in a stripe.
    pub fn total_shards(&self) -> u64 {
        self.data_shards + self.parity_shards
    }

    /// Stripe holding `offset`.
    pub fn stripe_of(&self, offset: u64) -> u64 {
        offset / self.stripe_size()
    }

    /// File range `[start, end)` covered by the data chunks of `stripe`.
    pub fn stripe_range(&self, stripe: u64) -> (u64, u64) {
        let start = stripe * self.stripe_size();
        (start, start + self.stripe_size())
    }

    /// Data chunk (within its stripe) holding `offset`.
    pub fn chunk_of(&self, offset: u64) -> u64 {
        (offset / self.chunk_size) % self.data_shards
    }

    /// File range `[start, end)` held by data chunk `position` of `stripe`.
    ///
    /// Parity chunks hold no file range of their own.
    pub fn chunk_range(&self, stripe: u64, position: u64) -> Option<(u64, u64)> {
        if position >= self.data_shards {
            return None;
        }
        let start = self.stripe_range(stripe).0 + position * self.chunk_size;
        Some((start, start + self.chunk_size))
    }
}

/// A stripe that must be decoded to rebuild a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripePlan {
    pub stripe: u64,

    /// Whether the rebuilt chunk holds any missing bytes of this stripe (rather than only
    /// being decoded alongside them).
    pub needs_data: bool,
}

/// Stripes intersecting the non-empty, non-zero-length `missing` ranges, in ascending order.
///
/// A parity chunk depends on every byte of its stripe, so any missing byte marks the stripe. A
/// data chunk only needs the stripe if a missing range falls within the chunk itself.
pub fn plan_stripes<A: Attachment>(
    policy: &StripingPolicy,
    missing: &[Interval<A>],
    position: u64,
) -> Vec<StripePlan> {
    let mut stripes = BTreeMap::new();
    for interval in missing
        .iter()
        .filter(|interval| !interval.is_empty() && interval.len() > 0)
    {
        let first = policy.stripe_of(interval.start());
        let last = policy.stripe_of(interval.end() - 1);
        for stripe in first..=last {
            let needs_data = match policy.chunk_range(stripe, position) {
                Some((start, end)) => interval.overlaps(start, end),
                None => true,
            };
            *stripes.entry(stripe).or_insert(false) |= needs_data;
        }
    }
    stripes
        .into_iter()
        .map(|(stripe, needs_data)| StripePlan { stripe, needs_data })
        .collect()
}

/// Collects the surviving chunks of a stripe and decodes the rest.
pub struct StripeRebuild {
    stripe: u64,
    chunk_size: usize,
    chunks: Vec<Vec<u8>>,
    present: Vec<bool>,
}

impl StripeRebuild {
    pub fn new(policy: &StripingPolicy, stripe: u64) -> Self {
        let total = policy.total_shards() as usize;
        let chunk_size = policy.chunk_size as usize;
        Self {
            stripe,
            chunk_size,
            chunks: vec![vec![0; chunk_size]; total],
            present: vec![false; total],
        }
    }

    /// Add the chunk held by `position`.
    ///
    /// Chunks shorter than `chunk_size` (the tail of a file) are zero-padded.
    pub fn add(&mut self, position: usize, chunk: &[u8]) -> Result<(), Error> {
        if position >= self.chunks.len() || chunk.len() > self.chunk_size {
            return Err(Error::InvalidChunk {
                position,
                length: chunk.len(),
            });
        }
        let buffer = &mut self.chunks[position];
        buffer[..chunk.len()].copy_from_slice(chunk);
        buffer[chunk.len()..].fill(0);
        self.present[position] = true;
        Ok(())
    }

    /// Number of chunks added.
    pub fn present(&self) -> usize {
        self.present.iter().filter(|present| **present).count()
    }

    /// Decode the missing chunks and return every chunk of the stripe.
    pub fn finish(mut self, codec: &Codec) -> Result<Vec<Vec<u8>>, Error> {
        debug!(
            stripe = self.stripe,
            present = self.present(),
            "reconstructing stripe"
        );
        let mut shards: Vec<&mut [u8]> = self.chunks.iter_mut().map(Vec::as_mut_slice).collect();
        codec.reconstruct(&mut shards, &self.present)?;
        Ok(self.chunks)
    }
}
