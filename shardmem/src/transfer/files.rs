//! A list of headerless fixed-size record files viewed as one record sequence.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::errors::{Result, ShardMemError};

#[derive(Debug)]
struct RecordFile {
    path: PathBuf,
    file: File,
    records: u64,
}

#[derive(Debug)]
pub(crate) struct RecordFiles {
    files: Vec<RecordFile>,
    /// `starts[i]` is the global index of the first record of file `i`
    starts: Vec<u64>,
    record_size: u64,
}

impl RecordFiles {
    /// Open every file and derive its record count from its length.
    pub(crate) fn open<P: AsRef<Path>>(paths: &[P], record_size: u64) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        let mut starts = Vec::with_capacity(paths.len());
        let mut next = 0u64;

        for path in paths {
            let path = path.as_ref();
            let file = File::open(path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ShardMemError::NotFound(path.to_path_buf()),
                _ => e.into(),
            })?;

            let len = file.metadata()?.len();
            if len % record_size != 0 {
                return Err(ShardMemError::SizeMismatch {
                    what: format!(
                        "{} is not a whole number of {}-byte records",
                        path.display(),
                        record_size
                    ),
                    expected: len - len % record_size,
                    actual: len,
                });
            }

            let records = len / record_size;
            starts.push(next);
            next += records;
            files.push(RecordFile {
                path: path.to_path_buf(),
                file,
                records,
            });
        }

        Ok(Self {
            files,
            starts,
            record_size,
        })
    }

    pub(crate) fn counts(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.records).collect()
    }

    pub(crate) fn total_records(&self) -> u64 {
        self.files.iter().map(|f| f.records).sum()
    }

    /// Read records `[first, first + count)` with positioned reads, at most
    /// `chunk_bytes` per read, handing each record to `sink` with its global
    /// index.
    pub(crate) fn read_records<F>(
        &self,
        first: u64,
        count: u64,
        chunk_bytes: usize,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(u64, &[u8]),
    {
        let end = first + count;
        if end > self.total_records() {
            return Err(ShardMemError::SizeMismatch {
                what: "records requested from file list".into(),
                expected: end,
                actual: self.total_records(),
            });
        }

        let record_size = self.record_size as usize;
        let per_read = (chunk_bytes / record_size).max(1) as u64;
        let mut buf = vec![0u8; per_read as usize * record_size];

        let mut index = first;
        let mut file_idx = self.starts.partition_point(|s| *s <= first).saturating_sub(1);

        while index < end {
            let file = &self.files[file_idx];
            let file_start = self.starts[file_idx];
            let file_end = file_start + file.records;
            if index >= file_end {
                file_idx += 1;
                continue;
            }

            let batch = per_read.min(file_end - index).min(end - index);
            let bytes = &mut buf[..batch as usize * record_size];
            file.file
                .read_exact_at(bytes, (index - file_start) * self.record_size)
                .map_err(|e| {
                    tracing::error!(path = %file.path.display(), error = %e, "Record read failed");
                    e
                })?;

            for (i, record) in bytes.chunks_exact(record_size).enumerate() {
                sink(index + i as u64, record);
            }
            index += batch;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use tempfile::TempDir;

    fn write_records(dir: &TempDir, name: &str, first: u8, count: u8) -> PathBuf {
        let path = dir.path().join(name);
        let bytes: Vec<u8> = (first..first + count).flat_map(|v| [v, v]).collect();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_reads_across_file_boundaries() {
        let dir = TempDir::new().unwrap();
        let paths = vec![
            write_records(&dir, "a.bin", 0, 3),
            write_records(&dir, "b.bin", 3, 0),
            write_records(&dir, "c.bin", 3, 4),
        ];

        let files = RecordFiles::open(&paths, 2).unwrap();
        assert_eq!(files.counts(), vec![3, 0, 4]);
        assert_eq!(files.total_records(), 7);

        let mut seen = Vec::new();
        files
            .read_records(2, 4, 2, |i, record| seen.push((i, record[0])))
            .unwrap();
        assert_eq!(seen, vec![(2, 2), (3, 3), (4, 4), (5, 5)]);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = RecordFiles::open(&[dir.path().join("nope.bin")], 4).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_partial_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("odd.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let err = RecordFiles::open(&[path], 4).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SizeMismatch);
    }

    #[test]
    fn test_out_of_range_read() {
        let dir = TempDir::new().unwrap();
        let files = RecordFiles::open(&[write_records(&dir, "a.bin", 0, 2)], 2).unwrap();
        let err = files.read_records(1, 5, 64, |_, _| {}).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SizeMismatch);
    }
}
