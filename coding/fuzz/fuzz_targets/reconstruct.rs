#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use ecstore_coding::{Code, Codec, Config, Error};
use libfuzzer_sys::fuzz_target;
use std::num::NonZeroU16;

#[derive(Debug)]
struct FuzzInput {
    data: u16,
    parity: u16,
    chunk: Vec<Vec<u8>>,
    present: Vec<bool>,
}

impl<'a> Arbitrary<'a> for FuzzInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let data = u.int_in_range(1..=32)?;
        let parity = u.int_in_range(1..=8)?;
        let chunk_size = u.int_in_range(0..=256)?;
        let mut chunk = Vec::with_capacity(data as usize);
        for _ in 0..data {
            chunk.push(u.bytes(chunk_size)?.to_vec());
        }
        let mut present = Vec::with_capacity((data + parity) as usize);
        for _ in 0..data + parity {
            present.push(u.arbitrary()?);
        }
        Ok(FuzzInput {
            data,
            parity,
            chunk,
            present,
        })
    }
}

fn fuzz(input: FuzzInput) {
    let codec = Codec::create(Config {
        data_shards: NonZeroU16::new(input.data).unwrap(),
        parity_shards: input.parity,
    })
    .unwrap();
    let chunk_size = input.chunk[0].len();
    let mut original = input.chunk;
    original.resize(codec.data_shards() + codec.parity_shards(), vec![0; chunk_size]);
    let mut shards: Vec<&mut [u8]> = original.iter_mut().map(Vec::as_mut_slice).collect();
    codec.encode_parity(&mut shards, 0, chunk_size).unwrap();

    // Corrupt every shard that is not present
    let mut damaged = original.clone();
    for (shard, present) in damaged.iter_mut().zip(&input.present) {
        if !present {
            shard.iter_mut().for_each(|byte| *byte = !*byte);
        }
    }
    let mut shards: Vec<&mut [u8]> = damaged.iter_mut().map(Vec::as_mut_slice).collect();
    let available = input.present.iter().filter(|present| **present).count();
    match codec.reconstruct(&mut shards, &input.present) {
        Ok(()) => {
            assert!(available >= codec.data_shards());
            assert_eq!(damaged, original);
        }
        Err(Error::TooFewShards { present, required }) => {
            assert_eq!(present, available);
            assert_eq!(required, codec.data_shards());
        }
        Err(err) => panic!("unexpected error: {err}"),
    }
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
