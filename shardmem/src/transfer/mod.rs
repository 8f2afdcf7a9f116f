//! Sharded load/store between flat record files and distributed allocations.
//!
//! Files are bare sequences of fixed-size records with no header. Each rank
//! touches only the records that map onto its own shard.

mod files;
pub mod hdfs;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

pub use hdfs::{hdfs_support, HdfsSource};

use crate::context::Context;
use crate::errors::{Result, ShardMemError};
use crate::memory::MemoryHandle;
use files::RecordFiles;

#[derive(Serialize)]
struct LoadArgs {
    memory_offset: u64,
    memory_entry_size: u64,
    file_entry_size: u64,
    file_count: usize,
}

#[derive(Serialize)]
struct StoreArgs {
    memory_offset: u64,
    memory_entry_stride: u64,
    file_entry_size: u64,
}

/// Entry windows must tile every shard exactly.
fn check_entry_layout(total_size: u64, granularity: u64, entry: u64, what: &str) -> Result<()> {
    if entry == 0 {
        return Err(ShardMemError::InvalidInput(format!("{} must be non-zero", what)));
    }
    if total_size % entry != 0 {
        return Err(ShardMemError::InvalidInput(format!(
            "allocation size {} is not a multiple of {} {}",
            total_size, what, entry
        )));
    }
    if granularity % entry != 0 {
        return Err(ShardMemError::InvalidInput(format!(
            "granularity {} is not a multiple of {} {}, entries would straddle shards",
            granularity, what, entry
        )));
    }
    Ok(())
}

impl Context {
    /// Collective load of `file_names`, read as one sequence of
    /// `file_entry_size`-byte records, into the allocation.
    ///
    /// Record `i` lands at `memory_offset + i * memory_entry_size`. When a
    /// record is wider than its window it is truncated; when narrower, the
    /// rest of the window is zero-filled.
    pub fn load_from_file<P: AsRef<Path>>(
        &self,
        handle: MemoryHandle,
        memory_offset: u64,
        memory_entry_size: u64,
        file_entry_size: u64,
        file_names: &[P],
    ) -> Result<()> {
        let started = Instant::now();
        let allocation = self.allocation(handle)?;
        let communicator = allocation.communicator().clone();

        communicator.check_consistency(
            "load",
            &LoadArgs {
                memory_offset,
                memory_entry_size,
                file_entry_size,
                file_count: file_names.len(),
            },
        )?;

        check_entry_layout(
            allocation.total_size(),
            allocation.granularity(),
            memory_entry_size,
            "memory entry size",
        )?;
        if file_entry_size == 0 {
            return Err(ShardMemError::InvalidInput(
                "file entry size must be non-zero".into(),
            ));
        }
        if memory_offset >= memory_entry_size {
            return Err(ShardMemError::InvalidInput(format!(
                "memory offset {} outside entry of {} bytes",
                memory_offset, memory_entry_size
            )));
        }

        let files = communicator.agree("load:open", RecordFiles::open(file_names, file_entry_size))?;
        communicator.check_consistency("load:records", &files.counts())?;

        let expected = allocation.total_size() / memory_entry_size;
        if files.total_records() != expected {
            return Err(ShardMemError::SizeMismatch {
                what: "records in file list".into(),
                expected,
                actual: files.total_records(),
            });
        }

        let view = allocation.local_view();
        let first = view.offset / memory_entry_size;
        let count = view.size / memory_entry_size;
        let window = (memory_entry_size - memory_offset) as usize;
        let width = (file_entry_size as usize).min(window);
        let stride = memory_entry_size as usize;
        let offset = memory_offset as usize;

        debug!(
            rank = communicator.rank(),
            first,
            count,
            width,
            "Loading local records"
        );

        // SAFETY: this rank is the only writer of its shard, and peers do not
        // read it before the closing agreement below.
        let shard = unsafe { std::slice::from_raw_parts_mut(view.ptr, view.size as usize) };
        let read = files.read_records(
            first,
            count,
            self.config().transfer.io_chunk_bytes,
            |index, record| {
                let start = (index - first) as usize * stride + offset;
                let dst = &mut shard[start..start + window];
                dst[..width].copy_from_slice(&record[..width]);
                dst[width..].fill(0);
            },
        );
        communicator.agree("load:read", read)?;

        info!(
            %handle,
            rank = communicator.rank(),
            records = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Load finished"
        );
        Ok(())
    }

    /// Collective store: each rank writes its own entries into
    /// `local_file_name`, entry `i` at byte `i * file_entry_size`.
    ///
    /// The file is created if missing and never truncated before writing.
    /// When every rank names the same file it ends up holding exactly
    /// `total_size / memory_entry_stride` records.
    pub fn store_to_file<P: AsRef<Path>>(
        &self,
        handle: MemoryHandle,
        memory_offset: u64,
        memory_entry_stride: u64,
        file_entry_size: u64,
        local_file_name: P,
    ) -> Result<()> {
        let started = Instant::now();
        let path = local_file_name.as_ref();
        let allocation = self.allocation(handle)?;
        let communicator = allocation.communicator().clone();

        communicator.check_consistency(
            "store",
            &StoreArgs {
                memory_offset,
                memory_entry_stride,
                file_entry_size,
            },
        )?;

        check_entry_layout(
            allocation.total_size(),
            allocation.granularity(),
            memory_entry_stride,
            "memory entry stride",
        )?;
        if file_entry_size == 0 {
            return Err(ShardMemError::InvalidInput(
                "file entry size must be non-zero".into(),
            ));
        }
        if memory_offset
            .checked_add(file_entry_size)
            .map_or(true, |end| end > memory_entry_stride)
        {
            return Err(ShardMemError::InvalidInput(format!(
                "memory offset {} plus file entry size {} exceeds stride {}",
                memory_offset, file_entry_size, memory_entry_stride
            )));
        }

        let view = allocation.local_view();
        let first = view.offset / memory_entry_stride;
        let count = view.size / memory_entry_stride;
        let entries = allocation.total_size() / memory_entry_stride;

        // SAFETY: the shard is mapped for the lifetime of `allocation`; this
        // rank only reads it here.
        let shard = unsafe { std::slice::from_raw_parts(view.ptr as *const u8, view.size as usize) };
        let written = write_entries(
            path,
            shard,
            first,
            count,
            memory_offset as usize,
            memory_entry_stride as usize,
            file_entry_size as usize,
            self.config().transfer.io_chunk_bytes,
        );
        communicator.agree("store:write", written)?;

        // The rank holding the last entry trims any stale longer tail
        let last_owner = if entries == 0 {
            0
        } else {
            allocation
                .plan()
                .locate((entries - 1) * memory_entry_stride)?
                .0
        };
        let trimmed = if communicator.rank() == last_owner {
            trim_tail(path, entries * file_entry_size)
        } else {
            Ok(())
        };
        communicator.agree("store:trim", trimmed)?;

        info!(
            %handle,
            rank = communicator.rank(),
            records = count,
            path = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Store finished"
        );
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn write_entries(
    path: &Path,
    shard: &[u8],
    first: u64,
    count: u64,
    memory_offset: usize,
    stride: usize,
    file_entry_size: usize,
    chunk_bytes: usize,
) -> Result<()> {
    let file = OpenOptions::new().write(true).create(true).open(path)?;
    if count == 0 {
        return Ok(());
    }

    let per_write = (chunk_bytes / file_entry_size).max(1);
    let mut buf = Vec::with_capacity(per_write * file_entry_size);

    for (batch, entries) in shard
        .chunks(stride)
        .take(count as usize)
        .collect::<Vec<_>>()
        .chunks(per_write)
        .enumerate()
    {
        buf.clear();
        for entry in entries {
            buf.extend_from_slice(&entry[memory_offset..memory_offset + file_entry_size]);
        }
        let index = first + (batch * per_write) as u64;
        file.write_all_at(&buf, index * file_entry_size as u64)?;
    }

    file.sync_data()?;
    Ok(())
}

fn trim_tail(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() > len {
        debug!(path = %path.display(), len, "Trimming stale tail");
        file.set_len(len)?;
    }
    Ok(())
}
