//! Single parity shard computed as the XOR of all data shards.

use crate::{check_diff, check_present, check_range, check_shards, Code, Error};

/// XOR `a` and `b` into `dst`.
///
/// Operands shorter than `dst` are treated as if padded with zeros, so bytes of `dst` beyond
/// both operands are zeroed.
pub fn xor(dst: &mut [u8], a: &[u8], b: &[u8]) {
    for (i, byte) in dst.iter_mut().enumerate() {
        *byte = a.get(i).copied().unwrap_or(0) ^ b.get(i).copied().unwrap_or(0);
    }
}

/// XOR `src` into `dst`.
///
/// Bytes of `dst` beyond the end of `src` are left unchanged (XOR with zero).
pub fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (byte, other) in dst.iter_mut().zip(src) {
        *byte ^= other;
    }
}

/// A code with `k` data shards and one parity shard.
#[derive(Clone, Debug)]
pub struct Xor {
    data_shards: usize,
}

impl Xor {
    pub fn new(data_shards: usize) -> Self {
        Self { data_shards }
    }

    fn total_shards(&self) -> usize {
        self.data_shards + 1
    }
}

impl Code for Xor {
    fn data_shards(&self) -> usize {
        self.data_shards
    }

    fn parity_shards(&self) -> usize {
        1
    }

    fn encode_parity(
        &self,
        shards: &mut [&mut [u8]],
        offset: usize,
        length: usize,
    ) -> Result<(), Error> {
        check_range(shards, self.total_shards(), offset, length)?;
        let range = offset..offset + length;
        let (data, parity) = shards.split_at_mut(self.data_shards);
        let parity = &mut parity[0][range.clone()];
        parity.fill(0);
        for shard in data.iter() {
            xor_in_place(parity, &shard[range.clone()]);
        }
        Ok(())
    }

    fn reconstruct(&self, shards: &mut [&mut [u8]], present: &[bool]) -> Result<(), Error> {
        check_shards(shards, self.total_shards())?;
        let count = check_present(present, self.total_shards(), self.data_shards)?;
        if count == self.total_shards() {
            return Ok(());
        }

        // Exactly one shard is missing: it is the XOR of all others
        let Some(missing) = present.iter().position(|present| !present) else {
            return Ok(());
        };
        let mut rebuilt = vec![0u8; shards[missing].len()];
        for (index, shard) in shards.iter().enumerate() {
            if index != missing {
                xor_in_place(&mut rebuilt, shard);
            }
        }
        shards[missing].copy_from_slice(&rebuilt);
        Ok(())
    }

    fn encode_diff_parity(
        &self,
        index: usize,
        diff: &[u8],
        parity_deltas: &mut [&mut [u8]],
    ) -> Result<(), Error> {
        check_diff(index, self.data_shards, 1, diff, parity_deltas)?;
        parity_deltas[0].copy_from_slice(diff);
        Ok(())
    }
}
