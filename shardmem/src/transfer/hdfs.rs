//! Network-filesystem loader entry points. Not implemented.

use crate::context::Context;
use crate::errors::{Result, ShardMemError};
use crate::memory::MemoryHandle;

/// Location of a record file set on a network filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdfsSource {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub path: String,
    pub prefix: String,
}

/// Whether loading from a network filesystem is available. Always
/// `NotImplemented`.
pub fn hdfs_support() -> Result<()> {
    Err(ShardMemError::NotImplemented(
        "network filesystem loading".into(),
    ))
}

impl Context {
    /// Always `NotImplemented`; use [`Context::load_from_file`] on a local
    /// mount instead.
    pub fn load_from_hdfs_file(
        &self,
        handle: MemoryHandle,
        memory_offset: u64,
        memory_entry_size: u64,
        file_entry_size: u64,
        source: &HdfsSource,
    ) -> Result<()> {
        let _ = (handle, memory_offset, memory_entry_size, file_entry_size);
        Err(ShardMemError::NotImplemented(format!(
            "loading from hdfs://{}:{}{}",
            source.host, source.port, source.path
        )))
    }
}
