use std::path::Path;

use corekit::extsort::extsort;
use corekit::order::NaturalOrder;
use corekit::record_io::{Record, RecordFile};

use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_log::test;

fn write_records(path: &Path, records: &[i64]) {
    let mut f = RecordFile::<i64>::create(path).unwrap();
    f.write(records).unwrap();
}

fn read_records(path: &Path) -> Vec<i64> {
    let mut f = RecordFile::<i64>::open(path).unwrap();
    let mut out = Vec::new();
    let mut buf = [0i64; 1024];
    loop {
        let n = f.read(&mut buf).unwrap();
        out.extend_from_slice(&buf[..n]);
        if n == 0 || f.eof() {
            return out;
        }
    }
}

/// 10,000 shuffled integers through a 16-record buffer and 4-way merges:
/// the output is the same multiset, ascending.
#[test]
fn sorts_ten_thousand_shuffled_integers() {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut records: Vec<i64> = (0..10_000).collect();
    records.shuffle(&mut rng);

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    write_records(&input, &records);

    extsort::<i64, _>(&input, &output, 16, 4, NaturalOrder).unwrap();

    let sorted = read_records(&output);
    assert_eq!(sorted.len(), 10_000);
    assert_eq!(sorted, (0..10_000).collect::<Vec<i64>>());
}

#[test]
fn sorts_with_duplicates_and_negatives() {
    let seed: u64 = 0xD15C0;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut records: Vec<i64> = (0..2_000).map(|_| (rng.next_u64() % 97) as i64 - 48).collect();

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    write_records(&input, &records);

    extsort::<i64, _>(&input, &output, 40, 4, NaturalOrder).unwrap();

    let sorted = read_records(&output);
    records.sort_unstable();
    assert_eq!(sorted, records);
}

/// Inputs that fit in the buffer skip the merge but still come out
/// sorted, including the empty file.
#[test]
fn small_inputs_bypass_the_merge() {
    let dir = tempfile::tempdir().unwrap();

    for len in [0usize, 1, 15, 16] {
        let input = dir.path().join(format!("in{}", len));
        let output = dir.path().join(format!("out{}", len));
        let records: Vec<i64> = (0..len as i64).rev().collect();
        write_records(&input, &records);

        extsort::<i64, _>(&input, &output, 16, 4, NaturalOrder).unwrap();

        let sorted = read_records(&output);
        assert_eq!(sorted, (0..len as i64).collect::<Vec<_>>(), "len {}", len);
    }
}

/// A custom comparator flips the output order.
#[test]
fn sorts_descending_with_a_closure() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    let records: Vec<i64> = (0..500).collect();
    write_records(&input, &records);

    extsort::<i64, _>(&input, &output, 16, 4, |a: &i64, b: &i64| a > b).unwrap();

    let sorted = read_records(&output);
    assert_eq!(sorted, (0..500).rev().collect::<Vec<_>>());
}

/// An input whose size is not a whole number of records is refused.
#[test]
fn misaligned_input_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    std::fs::write(&input, [1u8, 2, 3]).unwrap();

    let err = extsort::<i64, _>(&input, &output, 16, 4, NaturalOrder).unwrap_err();
    assert!(err.to_string().contains("not a multiple"), "got: {err}");
}

/// The generic machinery works for narrower record types too.
#[test]
fn sorts_u32_records() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let output = dir.path().join("output");

    let mut records: Vec<u32> = (0..3_000).map(|i| (i * 2654435761u64 % 10_007) as u32).collect();
    let mut f = RecordFile::<u32>::create(&input).unwrap();
    f.write(&records).unwrap();
    drop(f);

    extsort::<u32, _>(&input, &output, 24, 3, NaturalOrder).unwrap();

    let mut f = RecordFile::<u32>::open(&output).unwrap();
    let mut buf = [0u32; 512];
    let mut sorted = Vec::new();
    loop {
        let n = f.read(&mut buf).unwrap();
        sorted.extend_from_slice(&buf[..n]);
        if n == 0 || f.eof() {
            break;
        }
    }
    records.sort_unstable();
    assert_eq!(sorted, records);
    assert_eq!(u32::SIZE, 4);
}
