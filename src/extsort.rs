//! A k-way external merge sort for files that outgrow memory.
//!
//! The sorter owns one RAM buffer of `buf_len` records and never more.
//! Phase 1 fills the buffer from the input, sorts it, and deals the
//! resulting runs round-robin across `ways` temp files. Phase 2 then
//! loops: the previous output files become sources, the buffer is split
//! into `ways` reader windows (lower half) and one window per destination
//! (upper half), and a [`MergeHeap`] merges one run from every source per
//! wave. Each pass turns `R` runs of length `L` into `ceil(R/ways)` runs
//! of length `L*ways`; the pass that would produce a single run writes
//! straight to the output file.
//!
//! Temp files are anonymous and die with their pass, so at most `2*ways`
//! exist at any moment.

use std::path::Path;

use log::{debug, info};

use crate::order::Comparator;
use crate::record_io::{BarrieredReader, Record, RecordFile, RecordWriter};

pub use crate::record_io::SortError;

struct HeapEntry<T> {
    way: usize,
    value: T,
}

/// A merge heap over `ways` barriered readers.
///
/// One *wave* merges the current run of every source: [`make`]
/// (MergeHeap::make) re-arms the barriers and primes the heap, then
/// [`pop`](MergeHeap::pop) drains the globally smallest record until every
/// reader in the wave is at its barrier or at end of input. The heap is a
/// plain array min-heap under the caller's comparator.
pub struct MergeHeap<'buf, T, C> {
    entries: Vec<HeapEntry<T>>,
    readers: Vec<BarrieredReader<'buf, T>>,
    cmp: &'buf C,
    /// Some reader ran dry mid-wave: the wave being drained is the last.
    last_wave: bool,
    /// Set between waves; [`pop`](MergeHeap::pop) yields nothing until
    /// the next [`make`](MergeHeap::make).
    make_required: bool,
}

impl<'buf, T: Record, C: Comparator<T>> MergeHeap<'buf, T, C> {
    /// Builds the heap over `files`, splitting `window` into one private
    /// reader window per file. `run_len` is the record count of a sorted
    /// run in this pass.
    ///
    /// `run_len` must be a multiple of the per-file window size, so that
    /// a short read can only happen on the dataset's final, partial run.
    /// The driver's buffer geometry (`buf_len % 2*ways == 0`, runs sized
    /// `buf_len * ways^p`) guarantees this.
    pub fn new(files: Vec<RecordFile<T>>, run_len: u64, window: &'buf mut [T], cmp: &'buf C) -> Self {
        let ways = files.len();
        assert!(window.len() >= ways, "window too small to split across ways");

        let total = window.len();
        let mut rest = window;
        let mut bound = 0;
        let mut readers = Vec::with_capacity(ways);
        for (i, file) in files.into_iter().enumerate() {
            let next_bound = ((i + 1) * total) / ways;
            let (win, tail) = rest.split_at_mut(next_bound - bound);
            bound = next_bound;
            rest = tail;
            readers.push(BarrieredReader::new(file, run_len, win));
        }

        MergeHeap {
            entries: Vec::with_capacity(ways),
            readers,
            cmp,
            last_wave: false,
            make_required: true,
        }
    }

    /// Starts the next wave: re-arms every blocked reader and primes the
    /// heap with one record per live source. False when no source has
    /// anything left.
    pub fn make(&mut self) -> Result<bool, SortError> {
        debug_assert!(self.make_required, "make while a wave is still draining");
        if self.last_wave {
            return Ok(false);
        }

        self.entries.clear();
        for way in 0..self.readers.len() {
            let reader = &mut self.readers[way];
            if reader.at_barrier() && !reader.eof() {
                reader.advance_past_barrier();
            }
            let mut value = T::default();
            if reader.get(&mut value)? {
                self.entries.push(HeapEntry { way, value });
            }
        }

        if self.entries.is_empty() {
            return Ok(false);
        }
        for i in (0..self.entries.len() / 2).rev() {
            self.sift_down(i);
        }
        self.make_required = false;
        Ok(true)
    }

    /// Pops the smallest record of the wave into `out` and refills from
    /// the reader it came from. False once the wave is exhausted, after
    /// which [`make`](MergeHeap::make) must run again.
    pub fn pop(&mut self, out: &mut T) -> Result<bool, SortError> {
        if self.entries.is_empty() {
            self.make_required = true;
            return Ok(false);
        }

        *out = self.entries[0].value;
        let way = self.entries[0].way;

        let mut next = T::default();
        if self.readers[way].get(&mut next)? {
            self.entries[0].value = next;
            self.sift_down(0);
        } else {
            if self.readers[way].eof() {
                self.last_wave = true;
            }
            let last = self
                .entries
                .pop()
                .expect("heap was checked non-empty above");
            if !self.entries.is_empty() {
                self.entries[0] = last;
                self.sift_down(0);
            }
        }
        Ok(true)
    }

    fn sift_down(&mut self, mut at: usize) {
        let n = self.entries.len();
        loop {
            let left = 2 * at + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let mut min = left;
            if right < n && self.cmp.less(&self.entries[right].value, &self.entries[left].value) {
                min = right;
            }
            if self.cmp.less(&self.entries[min].value, &self.entries[at].value) {
                self.entries.swap(at, min);
                at = min;
            } else {
                break;
            }
        }
    }
}

/// Sorts the records of `input` into `output` using at most `buf_len`
/// records of RAM and `ways`-way merging.
///
/// `buf_len` must be a positive multiple of `2 * ways` so the buffer
/// halves split evenly into windows. An input that fits in one buffer is
/// sorted and written directly, skipping the merge machinery entirely.
pub fn extsort<T, C>(
    input: &Path,
    output: &Path,
    buf_len: usize,
    ways: usize,
    cmp: C,
) -> Result<(), SortError>
where
    T: Record,
    C: Comparator<T>,
{
    if ways == 0 || buf_len == 0 || buf_len % (2 * ways) != 0 {
        return Err(SortError::Config { buf_len, ways });
    }

    let mut buf: Vec<T> = vec![T::default(); buf_len];

    // Phase 1: deal sorted runs round-robin across the temp files.
    let mut dst = temp_set(ways)?;
    let mut runs: usize = 0;
    let mut last_len = 0;
    {
        let mut src = RecordFile::<T>::open(input)?;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            buf[..n].sort_unstable_by(|a, b| cmp.ordering(a, b));
            dst[runs % ways].write(&buf[..n])?;
            runs += 1;
            last_len = n;
            if src.eof() {
                break;
            }
        }
    }
    debug!("extsort: phase 1 produced {} runs", runs);

    if runs <= 1 {
        // The whole input fit in the buffer; nothing to merge.
        info!("extsort: {} records fit in RAM, writing directly", last_len);
        let mut out = RecordFile::<T>::create(output)?;
        return out.write(&buf[..last_len]);
    }

    // Phase 2: merge `ways` runs per wave until a single run lands in
    // the output file.
    let mut run_len = buf_len as u64;
    while runs > 1 {
        info!("extsort: merging {} runs of up to {} records", runs, run_len);

        let mut src = dst;
        for file in &mut src {
            file.rewind()?;
        }
        let dst_files = if runs <= ways {
            vec![RecordFile::<T>::create(output)?]
        } else {
            temp_set(ways)?
        };

        let (read_half, write_half) = buf.split_at_mut(buf_len / 2);
        let mut heap = MergeHeap::new(src, run_len, read_half, &cmp);
        let mut writers = split_writers(dst_files, write_half);

        runs = 0;
        let mut target = 0;
        let mut value = T::default();
        while heap.make()? {
            while heap.pop(&mut value)? {
                writers[target].put(value)?;
            }
            target = (target + 1) % writers.len();
            runs += 1;
        }

        let mut finished = Vec::with_capacity(writers.len());
        for writer in writers {
            finished.push(writer.finish()?);
        }
        // The heap dies here, deleting the pass's source temp files.
        dst = finished;
        run_len *= ways as u64;
    }

    Ok(())
}

fn temp_set<T: Record>(count: usize) -> Result<Vec<RecordFile<T>>, SortError> {
    (0..count).map(|_| RecordFile::temp()).collect()
}

/// Splits `window` into one writer window per destination file.
fn split_writers<T: Record>(
    files: Vec<RecordFile<T>>,
    window: &mut [T],
) -> Vec<RecordWriter<'_, T>> {
    let count = files.len();
    let total = window.len();
    let mut rest = window;
    let mut bound = 0;
    let mut writers = Vec::with_capacity(count);
    for (i, file) in files.into_iter().enumerate() {
        let next_bound = ((i + 1) * total) / count;
        let (win, tail) = rest.split_at_mut(next_bound - bound);
        bound = next_bound;
        rest = tail;
        writers.push(RecordWriter::new(file, win));
    }
    writers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::NaturalOrder;

    use test_log::test;

    /// A heap over three tiny pre-sorted files, merged one wave at a time.
    #[test]
    fn heap_merges_one_run_per_wave() {
        // Two runs of three records in each file.
        let contents: [&[i64]; 3] = [&[1, 4, 7, 2, 2, 2], &[2, 5, 8, 1, 3, 5], &[3, 6, 9, 4, 4, 4]];
        let mut files = Vec::new();
        for c in contents {
            let mut f = RecordFile::<i64>::temp().unwrap();
            f.write(c).unwrap();
            f.rewind().unwrap();
            files.push(f);
        }

        let mut window = [0i64; 6];
        let cmp = NaturalOrder;
        let mut heap = MergeHeap::new(files, 3, &mut window, &cmp);

        let mut waves = Vec::new();
        let mut value = 0i64;
        while heap.make().unwrap() {
            let mut wave = Vec::new();
            while heap.pop(&mut value).unwrap() {
                wave.push(value);
            }
            waves.push(wave);
        }

        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0], vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(waves[1], vec![1, 2, 2, 2, 3, 4, 4, 4, 5]);
    }

    #[test]
    fn heap_handles_a_trailing_partial_run() {
        // The first file carries the dataset's final, shorter run; the
        // other ends exactly at a run boundary.
        let contents: [&[i64]; 2] = [&[10, 20, 30, 40, 5], &[15, 25, 35, 45]];
        let mut files = Vec::new();
        for c in contents {
            let mut f = RecordFile::<i64>::temp().unwrap();
            f.write(c).unwrap();
            f.rewind().unwrap();
            files.push(f);
        }

        let mut window = [0i64; 4];
        let cmp = NaturalOrder;
        let mut heap = MergeHeap::new(files, 4, &mut window, &cmp);

        let mut waves = Vec::new();
        let mut value = 0i64;
        while heap.make().unwrap() {
            let mut wave = Vec::new();
            while heap.pop(&mut value).unwrap() {
                wave.push(value);
            }
            waves.push(wave);
        }

        assert_eq!(
            waves,
            vec![vec![10, 15, 20, 25, 30, 35, 40, 45], vec![5]]
        );
    }

    #[test]
    fn config_must_split_evenly() {
        let err = extsort::<i64, _>(
            Path::new("in"),
            Path::new("out"),
            10,
            4,
            NaturalOrder,
        )
        .unwrap_err();
        assert!(matches!(err, SortError::Config { buf_len: 10, ways: 4 }));
    }
}
