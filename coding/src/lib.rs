//! Compute and recover parity of erasure-coded stripes.
//!
//! # Overview
//!
//! A stripe is split into `k` data shards and protected by `m` parity shards. Any `k` of the
//! `k + m` shards are enough to recover the rest. [ReedSolomon] implements the general case over
//! GF(2^8) and [Xor] implements the `m = 1` case as a plain bytewise XOR. [Codec] selects between
//! them based on a [Config].
//!
//! Every operation works on caller-owned shard buffers in place. Shards are passed in stripe
//! order (data shards first, then parity shards) and must all have the same length.
//!
//! # Example
//!
//! ```rust
//! use ecstore_coding::{Code, Codec, Config};
//! use std::num::NonZeroU16;
//!
//! let config = Config {
//!     data_shards: NonZeroU16::new(2).unwrap(),
//!     parity_shards: 2,
//! };
//! let codec = Codec::create(config).unwrap();
//!
//! let mut buffers = vec![b"abcd".to_vec(), b"efgh".to_vec(), vec![0; 4], vec![0; 4]];
//! let mut shards: Vec<&mut [u8]> = buffers.iter_mut().map(Vec::as_mut_slice).collect();
//! codec.encode_parity(&mut shards, 0, 4).unwrap();
//!
//! // Lose both data shards
//! shards[0].fill(0);
//! shards[1].fill(0);
//! codec.reconstruct(&mut shards, &[false, false, true, true]).unwrap();
//! assert_eq!(&shards[0][..], b"abcd");
//! assert_eq!(&shards[1][..], b"efgh");
//! ```

use std::num::NonZeroU16;
use thiserror::Error;

mod reed_solomon;
pub use reed_solomon::ReedSolomon;
mod xor;
pub use xor::{xor, xor_in_place, Xor};

/// Largest number of shards a GF(2^8) code can address.
pub const MAX_SHARDS: usize = 256;

/// Errors that can occur when encoding or reconstructing shards.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameters: {data} data shards, {parity} parity shards")]
    InvalidParameters { data: usize, parity: usize },
    #[error("too few shards present: {present} < {required}")]
    TooFewShards { present: usize, required: usize },
    #[error("wrong shard count: expected {expected}, found {found}")]
    ShardCount { expected: usize, found: usize },
    #[error("shards differ in size")]
    ShardSize,
    #[error("range [{offset}, {offset}+{length}) exceeds shard size {size}")]
    OutOfRange {
        offset: usize,
        length: usize,
        size: usize,
    },
    #[error("invalid data shard index: {index} >= {data}")]
    InvalidIndex { index: usize, data: usize },
    #[error("backend error: {0}")]
    Backend(#[from] reed_solomon_erasure::Error),
}

/// Configuration of a stripe layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Config {
    /// The number of data shards (`k`) in a stripe.
    pub data_shards: NonZeroU16,
    /// The number of parity shards (`m`) in a stripe.
    ///
    /// Must be at least 1.
    pub parity_shards: u16,
}

impl Config {
    /// Returns the total number of shards in a stripe.
    pub fn total_shards(&self) -> usize {
        self.data_shards.get() as usize + self.parity_shards as usize
    }

    fn validate(&self) -> Result<(), Error> {
        if self.parity_shards == 0 || self.total_shards() > MAX_SHARDS {
            return Err(Error::InvalidParameters {
                data: self.data_shards.get() as usize,
                parity: self.parity_shards as usize,
            });
        }
        Ok(())
    }
}

/// A systematic erasure code over fixed-size shards.
pub trait Code: Send + Sync {
    /// Number of data shards (`k`).
    fn data_shards(&self) -> usize;

    /// Number of parity shards (`m`).
    fn parity_shards(&self) -> usize;

    /// Compute the parity shards for bytes `[offset, offset + length)` of the data shards.
    ///
    /// `shards` holds the `k` data shards followed by the `m` parity shards. Only the given
    /// range of the parity shards is written.
    fn encode_parity(&self, shards: &mut [&mut [u8]], offset: usize, length: usize)
        -> Result<(), Error>;

    /// Recover the shards not marked `present`, in place.
    ///
    /// Fails with [Error::TooFewShards] if fewer than `k` shards are present. Nothing is
    /// written in that case.
    fn reconstruct(&self, shards: &mut [&mut [u8]], present: &[bool]) -> Result<(), Error>;

    /// Compute the change to each parity shard caused by updating data shard `index`.
    ///
    /// `diff` is the XOR of the new and the old content of the data shard. XORing each of the
    /// returned `parity_deltas` into the corresponding parity shard yields the parity of the
    /// updated stripe.
    fn encode_diff_parity(
        &self,
        index: usize,
        diff: &[u8],
        parity_deltas: &mut [&mut [u8]],
    ) -> Result<(), Error> {
        let (data, parity) = (self.data_shards(), self.parity_shards());
        check_diff(index, data, parity, diff, parity_deltas)?;

        // The code is linear, so the parity of the diff alone is the parity delta
        let mut buffers = vec![vec![0u8; diff.len()]; data + parity];
        buffers[index].copy_from_slice(diff);
        let mut shards: Vec<&mut [u8]> = buffers.iter_mut().map(Vec::as_mut_slice).collect();
        self.encode_parity(&mut shards, 0, diff.len())?;
        for (delta, parity) in parity_deltas.iter_mut().zip(&buffers[data..]) {
            delta.copy_from_slice(parity);
        }
        Ok(())
    }
}

/// An erasure code chosen from a [Config].
#[derive(Clone, Debug)]
pub enum Codec {
    Xor(Xor),
    ReedSolomon(ReedSolomon),
}

impl Codec {
    /// Create the code described by `config`.
    ///
    /// Configurations with a single parity shard use the [Xor] fast path.
    pub fn create(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let data = config.data_shards.get() as usize;
        if config.parity_shards == 1 {
            return Ok(Self::Xor(Xor::new(data)));
        }
        Ok(Self::ReedSolomon(ReedSolomon::new(
            data,
            config.parity_shards as usize,
        )?))
    }

    fn inner(&self) -> &dyn Code {
        match self {
            Self::Xor(code) => code,
            Self::ReedSolomon(code) => code,
        }
    }
}

impl Code for Codec {
    fn data_shards(&self) -> usize {
        self.inner().data_shards()
    }

    fn parity_shards(&self) -> usize {
        self.inner().parity_shards()
    }

    fn encode_parity(
        &self,
        shards: &mut [&mut [u8]],
        offset: usize,
        length: usize,
    ) -> Result<(), Error> {
        self.inner().encode_parity(shards, offset, length)
    }

    fn reconstruct(&self, shards: &mut [&mut [u8]], present: &[bool]) -> Result<(), Error> {
        self.inner().reconstruct(shards, present)
    }

    fn encode_diff_parity(
        &self,
        index: usize,
        diff: &[u8],
        parity_deltas: &mut [&mut [u8]],
    ) -> Result<(), Error> {
        self.inner().encode_diff_parity(index, diff, parity_deltas)
    }
}

/// Ensure `shards` holds a full stripe of equally sized shards covering `[offset, offset + length)`.
fn check_range(
    shards: &[&mut [u8]],
    total: usize,
    offset: usize,
    length: usize,
) -> Result<(), Error> {
    let size = check_shards(shards, total)?;
    if offset.checked_add(length).is_none_or(|end| end > size) {
        return Err(Error::OutOfRange {
            offset,
            length,
            size,
        });
    }
    Ok(())
}

/// Ensure `shards` holds a full stripe of equally sized shards, returning the shard size.
fn check_shards(shards: &[&mut [u8]], total: usize) -> Result<usize, Error> {
    if shards.len() != total {
        return Err(Error::ShardCount {
            expected: total,
            found: shards.len(),
        });
    }
    let size = shards.first().map_or(0, |shard| shard.len());
    if shards.iter().any(|shard| shard.len() != size) {
        return Err(Error::ShardSize);
    }
    Ok(size)
}

/// Ensure `present` flags a full stripe with at least `required` shards available, returning the
/// number of present shards.
fn check_present(present: &[bool], total: usize, required: usize) -> Result<usize, Error> {
    if present.len() != total {
        return Err(Error::ShardCount {
            expected: total,
            found: present.len(),
        });
    }
    let count = present.iter().filter(|present| **present).count();
    if count < required {
        return Err(Error::TooFewShards {
            present: count,
            required,
        });
    }
    Ok(count)
}

fn check_diff(
    index: usize,
    data: usize,
    parity: usize,
    diff: &[u8],
    parity_deltas: &[&mut [u8]],
) -> Result<(), Error> {
    if index >= data {
        return Err(Error::InvalidIndex { index, data });
    }
    if parity_deltas.len() != parity {
        return Err(Error::ShardCount {
            expected: parity,
            found: parity_deltas.len(),
        });
    }
    if parity_deltas.iter().any(|delta| delta.len() != diff.len()) {
        return Err(Error::ShardSize);
    }
    Ok(())
}
