//! Key Pool: external sort of fixed-width records for bulk loading.
//!
//! Records (key followed by value) collect in memory. A full buffer is
//! sorted and spilled to a temporary run file; `into_sorted` merges the runs
//! with a k-way heap merge, in several passes when there are more runs than
//! the configured fan-in. Run files are deleted when the pool or the merged
//! stream is dropped, including on cancellation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tabula_common::{BulkConfig, Result, TabulaError};
use tempfile::NamedTempFile;
use tracing::debug;

/// Buffer of unsorted records with spill-to-disk runs.
pub struct KeyPool {
    key_len: usize,
    record_len: usize,
    run_entries: usize,
    fan_in: usize,
    dir: PathBuf,
    buffer: Vec<u8>,
    runs: Vec<NamedTempFile>,
    total: u64,
}

impl KeyPool {
    /// Creates a pool whose spilled runs go to `dir`.
    pub fn new(
        key_len: usize,
        value_len: usize,
        config: &BulkConfig,
        dir: &Path,
        estimate: u64,
    ) -> Result<Self> {
        config.validate()?;
        if key_len == 0 {
            return Err(TabulaError::invalid("key_len", key_len));
        }
        let record_len = key_len + value_len;
        let first_run = (estimate as usize).min(config.run_entries);
        Ok(Self {
            key_len,
            record_len,
            run_entries: config.run_entries,
            fan_in: config.merge_fan_in,
            dir: dir.to_path_buf(),
            buffer: Vec::with_capacity(first_run * record_len),
            runs: Vec::new(),
            total: 0,
        })
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Records pushed so far.
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Runs spilled to disk so far.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn push(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() != self.key_len {
            return Err(TabulaError::invalid("key length", key.len()));
        }
        if key.len() + value.len() != self.record_len {
            return Err(TabulaError::invalid("value length", value.len()));
        }
        self.buffer.extend_from_slice(key);
        self.buffer.extend_from_slice(value);
        self.total += 1;
        if self.buffer.len() >= self.run_entries * self.record_len {
            self.spill()?;
        }
        Ok(())
    }

    /// Sorts the in-memory records, returning them as one contiguous buffer.
    fn sorted_buffer(&mut self) -> Vec<u8> {
        let len = self.record_len;
        let buffer = std::mem::take(&mut self.buffer);
        let mut order: Vec<usize> = (0..buffer.len() / len).collect();
        let record = |i: usize| &buffer[i * len..(i + 1) * len];
        order.sort_unstable_by(|&a, &b| record(a).cmp(record(b)));
        let mut sorted = Vec::with_capacity(buffer.len());
        for i in order {
            sorted.extend_from_slice(record(i));
        }
        sorted
    }

    fn new_run(&self) -> Result<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix("tabula-run-")
            .tempfile_in(&self.dir)?)
    }

    fn spill(&mut self) -> Result<()> {
        let sorted = self.sorted_buffer();
        let run = self.new_run()?;
        {
            let mut writer = BufWriter::new(run.as_file());
            writer.write_all(&sorted)?;
            writer.flush()?;
        }
        debug!(
            entries = sorted.len() / self.record_len,
            run = %run.path().display(),
            "key pool run spilled"
        );
        self.runs.push(run);
        Ok(())
    }

    /// Merges `group` into a single new run file.
    fn merge_runs(&self, group: Vec<NamedTempFile>) -> Result<NamedTempFile> {
        let out = self.new_run()?;
        let sources = group
            .iter()
            .map(|run| -> Result<Source> { Ok(Source::File(BufReader::new(run.reopen()?))) })
            .collect::<Result<Vec<_>>>()?;
        let mut merge = Merge::new(sources, self.record_len)?;
        {
            let mut writer = BufWriter::new(out.as_file());
            while let Some(record) = merge.next_record()? {
                writer.write_all(&record)?;
            }
            writer.flush()?;
        }
        Ok(out)
    }

    /// Consumes the pool and returns every record in ascending byte order.
    ///
    /// `check` runs after each intermediate merge pass; an error from it
    /// aborts the sort and deletes every run.
    pub fn into_sorted(mut self, check: &mut dyn FnMut() -> Result<()>) -> Result<SortedRecords> {
        let mut pass = 0;
        while self.runs.len() > self.fan_in {
            pass += 1;
            let runs = std::mem::take(&mut self.runs);
            let before = runs.len();
            let mut merged = Vec::with_capacity(before.div_ceil(self.fan_in));
            let mut runs = runs.into_iter().peekable();
            while runs.peek().is_some() {
                let group: Vec<NamedTempFile> = runs.by_ref().take(self.fan_in).collect();
                merged.push(self.merge_runs(group)?);
            }
            self.runs = merged;
            debug!(pass, before, after = self.runs.len(), "key pool merge pass");
            check()?;
        }

        let memory = self.sorted_buffer();
        let mut sources = Vec::with_capacity(self.runs.len() + 1);
        sources.push(Source::Memory {
            data: memory,
            offset: 0,
        });
        for run in &self.runs {
            sources.push(Source::File(BufReader::new(run.reopen()?)));
        }
        let merge = Merge::new(sources, self.record_len)?;
        Ok(SortedRecords {
            merge,
            _runs: std::mem::take(&mut self.runs),
        })
    }
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("record_len", &self.record_len)
            .field("total", &self.total)
            .field("runs", &self.runs.len())
            .finish()
    }
}

enum Source {
    Memory { data: Vec<u8>, offset: usize },
    File(BufReader<File>),
}

impl Source {
    fn next_record(&mut self, len: usize) -> Result<Option<Vec<u8>>> {
        match self {
            Source::Memory { data, offset } => {
                if *offset + len > data.len() {
                    return Ok(None);
                }
                let record = data[*offset..*offset + len].to_vec();
                *offset += len;
                Ok(Some(record))
            }
            Source::File(reader) => {
                let mut record = vec![0u8; len];
                match reader.read_exact(&mut record) {
                    Ok(()) => Ok(Some(record)),
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// K-way merge over sorted sources.
struct Merge {
    sources: Vec<Source>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
    record_len: usize,
}

impl Merge {
    fn new(mut sources: Vec<Source>, record_len: usize) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (i, source) in sources.iter_mut().enumerate() {
            if let Some(record) = source.next_record(record_len)? {
                heap.push(Reverse((record, i)));
            }
        }
        Ok(Self {
            sources,
            heap,
            record_len,
        })
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(Reverse((record, i))) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.sources[i].next_record(self.record_len)? {
            self.heap.push(Reverse((next, i)));
        }
        Ok(Some(record))
    }
}

/// Merged, ascending stream of records. Owns the run files it reads.
pub struct SortedRecords {
    merge: Merge,
    _runs: Vec<NamedTempFile>,
}

impl Iterator for SortedRecords {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.merge.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn config(run_entries: usize, merge_fan_in: usize) -> BulkConfig {
        BulkConfig {
            run_entries,
            merge_fan_in,
            ..Default::default()
        }
    }

    fn temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_in_memory_sort() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = KeyPool::new(2, 1, &config(100, 4), dir.path(), 3).unwrap();
        pool.push(b"zz", &[1]).unwrap();
        pool.push(b"aa", &[2]).unwrap();
        pool.push(b"mm", &[3]).unwrap();
        assert_eq!(pool.run_count(), 0);

        let sorted: Vec<Vec<u8>> = pool
            .into_sorted(&mut || Ok(()))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(sorted, vec![b"aa\x02".to_vec(), b"mm\x03".to_vec(), b"zz\x01".to_vec()]);
    }

    #[test]
    fn test_spill_and_multi_pass_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = KeyPool::new(4, 4, &config(50, 3), dir.path(), 0).unwrap();
        let mut rng = rand::thread_rng();
        let mut expected = Vec::new();
        for row in 0..1000u32 {
            let key: u32 = rng.gen();
            pool.push(&key.to_be_bytes(), &row.to_be_bytes()).unwrap();
            let mut record = key.to_be_bytes().to_vec();
            record.extend_from_slice(&row.to_be_bytes());
            expected.push(record);
        }
        assert_eq!(pool.run_count(), 20);
        assert_eq!(temp_files(dir.path()), 20);

        let mut passes = 0;
        let sorted: Vec<Vec<u8>> = pool
            .into_sorted(&mut || {
                passes += 1;
                Ok(())
            })
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        // 20 runs -> 7 -> 3
        assert_eq!(passes, 2);
        expected.sort();
        assert_eq!(sorted, expected);
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn test_cancel_during_merge_removes_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = KeyPool::new(4, 4, &config(10, 2), dir.path(), 0).unwrap();
        for n in 0..100u32 {
            pool.push(&n.to_be_bytes(), &n.to_be_bytes()).unwrap();
        }
        let result = pool.into_sorted(&mut || Err(TabulaError::BuildCancelled));
        assert!(matches!(result, Err(TabulaError::BuildCancelled)));
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn test_drop_removes_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = KeyPool::new(4, 4, &config(10, 2), dir.path(), 0).unwrap();
        for n in 0..35u32 {
            pool.push(&n.to_be_bytes(), &n.to_be_bytes()).unwrap();
        }
        assert_eq!(temp_files(dir.path()), 3);
        drop(pool);
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn test_push_rejects_wrong_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = KeyPool::new(4, 4, &config(10, 2), dir.path(), 0).unwrap();
        assert!(pool.push(b"abc", b"1234").is_err());
        assert!(pool.push(b"abcd", b"12").is_err());
        assert!(pool.is_empty());
    }
}
