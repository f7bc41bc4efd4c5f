#![no_main]

use arbitrary::Arbitrary;
use ecstore_intervals::{decode, encode, Interval, IntervalVector, ListVector, TreeVector, EMPTY};
use libfuzzer_sys::fuzz_target;

/// Offsets are kept small so the reference model stays cheap.
const SIZE: u64 = 512;

#[derive(Arbitrary, Debug, Clone)]
enum VectorOperation {
    Insert { start: u16, len: u16, version: u8 },
    InsertEmpty { start: u16, len: u16 },
    Truncate(u16),
    Slice { start: u16, end: u16 },
    Overlapping { start: u16, end: u16 },
    Persist,
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    operations: Vec<VectorOperation>,
}

fn bounds(start: u16, len: u16) -> (u64, u64) {
    let start = start as u64 % SIZE;
    let end = (start + len as u64 % SIZE).min(SIZE);
    (start, end)
}

fn fuzz(data: FuzzInput) {
    if data.operations.is_empty() || data.operations.len() > 128 {
        return;
    }
    let mut tree = TreeVector::new();
    let mut list = ListVector::default();
    let mut model = vec![(EMPTY, EMPTY); SIZE as usize];
    let mut next_id = 0;

    for op in &data.operations {
        match op {
            VectorOperation::Insert {
                start,
                len,
                version,
            } => {
                let (start, end) = bounds(*start, *len);
                let interval = Interval::new(start, end, *version as i64, next_id);
                next_id += 1;
                for byte in start..end {
                    model[byte as usize] = (interval.version(), interval.id());
                }
                tree.insert(interval.clone());
                list.insert(interval);
            }
            VectorOperation::InsertEmpty { start, len } => {
                let (start, end) = bounds(*start, *len);
                for byte in start..end {
                    model[byte as usize] = (EMPTY, EMPTY);
                }
                tree.insert(Interval::empty(start, end));
                list.insert(Interval::empty(start, end));
            }
            VectorOperation::Truncate(max) => {
                let max = *max as u64 % SIZE;
                for byte in max..SIZE {
                    model[byte as usize] = (EMPTY, EMPTY);
                }
                tree.truncate(max);
                list.truncate(max);
            }
            VectorOperation::Slice { start, end } => {
                let (start, end) = (*start as u64 % SIZE, *end as u64 % SIZE);
                let slice = tree.get_slice(start, end);
                assert_eq!(slice, list.get_slice(start, end));
                if start >= end {
                    assert!(slice.is_empty());
                    continue;
                }
                let mut cursor = start;
                for interval in &slice {
                    assert_eq!(interval.start(), cursor, "slice must be contiguous");
                    for byte in interval.start()..interval.end() {
                        assert_eq!(
                            model[byte as usize],
                            (interval.version(), interval.id()),
                            "byte {byte} disagrees with slice {interval}"
                        );
                    }
                    cursor = interval.end();
                }
                assert_eq!(cursor, end);
            }
            VectorOperation::Overlapping { start, end } => {
                let (start, end) = (*start as u64 % SIZE, *end as u64 % SIZE);
                let overlapping = tree.overlapping(start, end);
                assert_eq!(overlapping, list.overlapping(start, end));
                if start < end {
                    assert!(overlapping.first().is_some_and(|i| i.start() <= start));
                    assert!(overlapping.last().is_some_and(|i| i.end() >= end));
                }
            }
            VectorOperation::Persist => {
                let restored = decode(encode(&tree), usize::MAX).expect("encoded vector decodes");
                assert_eq!(restored.serialize(), tree.serialize());
                list = restored;
            }
        }

        // Both representations always agree with the model
        let serialized = tree.serialize();
        assert_eq!(serialized, list.serialize());
        let mut cursor = 0;
        for interval in &serialized {
            assert_eq!(interval.start(), cursor);
            for byte in interval.start()..interval.end() {
                assert_eq!(model[byte as usize], (interval.version(), interval.id()));
            }
            cursor = interval.end();
        }
        assert!(model[cursor as usize..].iter().all(|entry| *entry == (EMPTY, EMPTY)));
    }
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
