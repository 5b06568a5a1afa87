//! Record-oriented file I/O for the external sorter.
//!
//! Everything here works in whole fixed-size records of some [`Record`]
//! type. [`RecordFile`] wraps a file with bulk record reads and writes;
//! [`RecordReader`], [`BarrieredReader`] and [`RecordWriter`] add
//! buffering through caller-provided windows, so the sorter can partition
//! one RAM budget between many streams without any hidden allocation.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// A fixed-size value that can cross a file boundary in the platform's
/// native representation.
pub trait Record: Copy + Default {
    /// Encoded size in bytes. A file of records must be a whole multiple
    /// of this.
    const SIZE: usize;

    fn read_from<R: io::Read>(r: &mut R) -> io::Result<Self>;
    fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()>;
}

macro_rules! int_records {
    ($($ty:ty, $read:ident, $write:ident;)*) => {$(
        impl Record for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();

            fn read_from<R: io::Read>(r: &mut R) -> io::Result<Self> {
                r.$read::<NativeEndian>()
            }

            fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
                w.$write::<NativeEndian>(*self)
            }
        }
    )*};
}

int_records! {
    i16, read_i16, write_i16;
    u16, read_u16, write_u16;
    i32, read_i32, write_i32;
    u32, read_u32, write_u32;
    i64, read_i64, write_i64;
    u64, read_u64, write_u64;
}

#[derive(Debug, Error)]
pub enum SortError {
    #[error("{op} failed on {file}: {source}")]
    Io {
        op: &'static str,
        file: String,
        #[source]
        source: io::Error,
    },
    #[error("size of {file} is not a multiple of the record size")]
    Format { file: String },
    #[error("buffer of {buf_len} records cannot be split over {ways} ways (must be a multiple of 2*ways)")]
    Config { buf_len: usize, ways: usize },
}

/// A file of `T` records, with the bookkeeping the sorter needs: a sticky
/// EOF flag, rewind, and errors that carry the operation and file name.
#[derive(Debug)]
pub struct RecordFile<T> {
    file: File,
    name: String,
    eof: bool,
    scratch: Vec<u8>,
    _records: PhantomData<T>,
}

impl<T: Record> RecordFile<T> {
    /// Opens an existing file for reading.
    pub fn open(path: &Path) -> Result<Self, SortError> {
        let name = path.display().to_string();
        let file = File::open(path).map_err(|source| SortError::Io {
            op: "open",
            file: name.clone(),
            source,
        })?;
        Ok(Self::wrap(file, name))
    }

    /// Creates (or truncates) a file, readable and writable.
    pub fn create(path: &Path) -> Result<Self, SortError> {
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| SortError::Io {
                op: "create",
                file: name.clone(),
                source,
            })?;
        Ok(Self::wrap(file, name))
    }

    /// An anonymous temp file, deleted when dropped.
    pub fn temp() -> Result<Self, SortError> {
        let file = tempfile::tempfile().map_err(|source| SortError::Io {
            op: "create",
            file: "<temp>".to_owned(),
            source,
        })?;
        Ok(Self::wrap(file, "<temp>".to_owned()))
    }

    fn wrap(file: File, name: String) -> Self {
        RecordFile { file, name, eof: false, scratch: Vec::new(), _records: PhantomData }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once a read has come up short of the request.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Reads up to `buf.len()` records, returning how many arrived. A
    /// short count sets the EOF flag; a file length that is not a whole
    /// number of records is a [`SortError::Format`].
    pub fn read(&mut self, buf: &mut [T]) -> Result<usize, SortError> {
        let want = buf.len() * T::SIZE;
        self.scratch.resize(want, 0);

        let mut got = 0;
        while got < want {
            match self.file.read(&mut self.scratch[got..want]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(SortError::Io { op: "read", file: self.name.clone(), source })
                }
            }
        }

        if got % T::SIZE != 0 {
            return Err(SortError::Format { file: self.name.clone() });
        }
        let records = got / T::SIZE;
        if records < buf.len() {
            self.eof = true;
        }

        let mut bytes = &self.scratch[..got];
        for slot in buf[..records].iter_mut() {
            *slot = T::read_from(&mut bytes).map_err(|source| SortError::Io {
                op: "decode",
                file: self.name.clone(),
                source,
            })?;
        }
        Ok(records)
    }

    /// Writes all of `buf` to the file.
    pub fn write(&mut self, buf: &[T]) -> Result<(), SortError> {
        self.scratch.clear();
        for value in buf {
            value.write_to(&mut self.scratch).map_err(|source| SortError::Io {
                op: "encode",
                file: self.name.clone(),
                source,
            })?;
        }
        self.file
            .write_all(&self.scratch)
            .map_err(|source| SortError::Io { op: "write", file: self.name.clone(), source })
    }

    /// Seeks back to the start and clears the EOF flag, so a freshly
    /// written file can be read.
    pub fn rewind(&mut self) -> Result<(), SortError> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|source| SortError::Io { op: "rewind", file: self.name.clone(), source })?;
        self.eof = false;
        Ok(())
    }
}

/// A reader that refills a private window of the shared RAM buffer on
/// demand and hands out one record at a time.
pub struct RecordReader<'buf, T> {
    file: RecordFile<T>,
    win: &'buf mut [T],
    cur: usize,
    top: usize,
}

impl<'buf, T: Record> RecordReader<'buf, T> {
    pub fn new(file: RecordFile<T>, win: &'buf mut [T]) -> Self {
        assert!(!win.is_empty(), "a reader needs at least a one-record window");
        RecordReader { file, win, cur: 0, top: 0 }
    }

    /// True once the file and the window are both drained.
    pub fn eof(&self) -> bool {
        self.file.eof() && self.cur >= self.top
    }

    /// Fetches the next record into `out`; false at end of input.
    pub fn get(&mut self, out: &mut T) -> Result<bool, SortError> {
        if self.cur >= self.top {
            if self.file.eof() {
                return Ok(false);
            }
            self.top = self.file.read(self.win)?;
            self.cur = 0;
            if self.top == 0 {
                return Ok(false);
            }
        }
        *out = self.win[self.cur];
        self.cur += 1;
        Ok(true)
    }
}

/// A [`RecordReader`] capped at `barrier` records per run: once the cap
/// is consumed, [`get`](BarrieredReader::get) yields nothing until
/// [`advance_past_barrier`](BarrieredReader::advance_past_barrier) arms
/// the next run. This is what lets the merge take exactly one sorted run
/// from each source per wave.
pub struct BarrieredReader<'buf, T> {
    inner: RecordReader<'buf, T>,
    consumed: u64,
    barrier: u64,
}

impl<'buf, T: Record> BarrieredReader<'buf, T> {
    pub fn new(file: RecordFile<T>, barrier: u64, win: &'buf mut [T]) -> Self {
        assert!(barrier > 0);
        BarrieredReader { inner: RecordReader::new(file, win), consumed: 0, barrier }
    }

    pub fn eof(&self) -> bool {
        self.inner.eof()
    }

    /// Fetches the next record unless the current run is exhausted.
    pub fn get(&mut self, out: &mut T) -> Result<bool, SortError> {
        if self.consumed >= self.barrier {
            return Ok(false);
        }
        let ok = self.inner.get(out)?;
        if ok {
            self.consumed += 1;
        }
        Ok(ok)
    }

    /// True when the run cap has been consumed.
    pub fn at_barrier(&self) -> bool {
        self.consumed >= self.barrier
    }

    /// Arms the next run. Only meaningful at the barrier with input left.
    pub fn advance_past_barrier(&mut self) {
        debug_assert!(self.at_barrier());
        debug_assert!(!self.eof());
        self.consumed = 0;
    }
}

/// A writer that batches records in a private window and flushes whole
/// windows to its file.
pub struct RecordWriter<'buf, T> {
    file: RecordFile<T>,
    win: &'buf mut [T],
    top: usize,
}

impl<'buf, T: Record> RecordWriter<'buf, T> {
    pub fn new(file: RecordFile<T>, win: &'buf mut [T]) -> Self {
        assert!(!win.is_empty(), "a writer needs at least a one-record window");
        RecordWriter { file, win, top: 0 }
    }

    pub fn put(&mut self, value: T) -> Result<(), SortError> {
        self.win[self.top] = value;
        self.top += 1;
        if self.top == self.win.len() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SortError> {
        if self.top > 0 {
            self.file.write(&self.win[..self.top])?;
            self.top = 0;
        }
        Ok(())
    }

    /// Flushes and hands the underlying file back, ready for rewinding.
    pub fn finish(mut self) -> Result<RecordFile<T>, SortError> {
        self.flush()?;
        Ok(self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn write_rewind_read_roundtrip() {
        let mut file = RecordFile::<i64>::temp().unwrap();
        file.write(&[3, 1, 4, 1, 5]).unwrap();
        file.rewind().unwrap();

        let mut buf = [0i64; 8];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], &[3, 1, 4, 1, 5]);
        assert!(file.eof());
    }

    #[test]
    fn unaligned_file_is_a_format_error() {
        let mut file = RecordFile::<i64>::temp().unwrap();
        file.write(&[7]).unwrap();
        // Scribble a partial record on the end through a second handle.
        file.file.write_all(&[0xFF; 3]).unwrap();
        file.rewind().unwrap();

        let mut buf = [0i64; 4];
        assert!(matches!(file.read(&mut buf), Err(SortError::Format { .. })));
    }

    #[test]
    fn missing_file_error_names_it() {
        let err = RecordFile::<i64>::open(Path::new("/no/such/file")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("open"), "got: {msg}");
        assert!(msg.contains("/no/such/file"), "got: {msg}");
    }

    #[test]
    fn reader_refills_its_window() {
        let mut file = RecordFile::<i64>::temp().unwrap();
        let expect: Vec<i64> = (0..20).collect();
        file.write(&expect).unwrap();
        file.rewind().unwrap();

        // A 3-record window forces several refills.
        let mut win = [0i64; 3];
        let mut reader = RecordReader::new(file, &mut win);
        let mut seen = Vec::new();
        let mut value = 0i64;
        while reader.get(&mut value).unwrap() {
            seen.push(value);
        }
        assert_eq!(seen, expect);
        assert!(reader.eof());
    }

    #[test]
    fn barrier_caps_a_run() {
        let mut file = RecordFile::<i64>::temp().unwrap();
        file.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        file.rewind().unwrap();

        let mut win = [0i64; 4];
        let mut reader = BarrieredReader::new(file, 3, &mut win);
        let mut value = 0i64;
        for expect in 1..=3i64 {
            assert!(reader.get(&mut value).unwrap());
            assert_eq!(value, expect);
        }
        // Run consumed: the reader yields nothing until re-armed.
        assert!(reader.at_barrier());
        assert!(!reader.get(&mut value).unwrap());
        assert!(!reader.eof());

        reader.advance_past_barrier();
        for expect in 4..=6i64 {
            assert!(reader.get(&mut value).unwrap());
            assert_eq!(value, expect);
        }
    }

    #[test]
    fn writer_batches_and_finishes() {
        let file = RecordFile::<i64>::temp().unwrap();
        let mut win = [0i64; 4];
        let mut writer = RecordWriter::new(file, &mut win);
        for v in 0..10i64 {
            writer.put(v).unwrap();
        }
        let mut file = writer.finish().unwrap();
        file.rewind().unwrap();

        let mut buf = [0i64; 16];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], (0..10).collect::<Vec<i64>>().as_slice());
    }
}
