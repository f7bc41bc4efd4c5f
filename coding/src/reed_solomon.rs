//! Systematic Reed-Solomon coding over GF(2^8).

use crate::{check_present, check_range, check_shards, Code, Error};
use reed_solomon_erasure::galois_8;
use std::{fmt, sync::Arc};

/// A Reed-Solomon code with `k` data shards and `m` parity shards.
#[derive(Clone)]
pub struct ReedSolomon {
    inner: Arc<galois_8::ReedSolomon>,
}

impl fmt::Debug for ReedSolomon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReedSolomon")
            .field("data_shards", &self.inner.data_shard_count())
            .field("parity_shards", &self.inner.parity_shard_count())
            .finish()
    }
}

impl ReedSolomon {
    /// Create a code for `data_shards + parity_shards <= 256` shards.
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, Error> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(Error::InvalidParameters {
                data: data_shards,
                parity: parity_shards,
            });
        }
        Ok(Self {
            inner: Arc::new(galois_8::ReedSolomon::new(data_shards, parity_shards)?),
        })
    }
}

impl Code for ReedSolomon {
    fn data_shards(&self) -> usize {
        self.inner.data_shard_count()
    }

    fn parity_shards(&self) -> usize {
        self.inner.parity_shard_count()
    }

    fn encode_parity(
        &self,
        shards: &mut [&mut [u8]],
        offset: usize,
        length: usize,
    ) -> Result<(), Error> {
        check_range(shards, self.inner.total_shard_count(), offset, length)?;
        if length == 0 {
            return Ok(());
        }
        let mut window: Vec<&mut [u8]> = shards
            .iter_mut()
            .map(|shard| &mut shard[offset..offset + length])
            .collect();
        self.inner.encode(&mut window)?;
        Ok(())
    }

    fn reconstruct(&self, shards: &mut [&mut [u8]], present: &[bool]) -> Result<(), Error> {
        let total = self.inner.total_shard_count();
        let size = check_shards(shards, total)?;
        let count = check_present(present, total, self.data_shards())?;
        if count == total || size == 0 {
            return Ok(());
        }
        let mut flagged: Vec<(&mut [u8], bool)> = shards
            .iter_mut()
            .zip(present)
            .map(|(shard, present)| (&mut **shard, *present))
            .collect();
        self.inner.reconstruct(&mut flagged)?;
        Ok(())
    }
}
