use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ShardMemError};
use crate::partition::PartitionPlan;
use crate::registry::Key;

/// How a distributed allocation is laid out across ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// One flat address range spanning every rank's shard
    Continuous,
    /// Separate per-rank shards, mapped by peers when the platform allows
    Chunked,
    /// Separate per-rank shards, only reachable by their owner
    Distributed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLocation {
    Device,
    Host,
}

impl Display for MemoryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryType::Continuous => "continuous",
            MemoryType::Chunked => "chunked",
            MemoryType::Distributed => "distributed",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MemoryType {
    type Err = ShardMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "continuous" => Ok(MemoryType::Continuous),
            "chunked" => Ok(MemoryType::Chunked),
            "distributed" => Ok(MemoryType::Distributed),
            other => Err(ShardMemError::InvalidInput(format!(
                "unknown memory type '{}' (expected continuous, chunked or distributed)",
                other
            ))),
        }
    }
}

impl Display for MemoryLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLocation::Device => f.write_str("device"),
            MemoryLocation::Host => f.write_str("host"),
        }
    }
}

impl std::str::FromStr for MemoryLocation {
    type Err = ShardMemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "device" => Ok(MemoryLocation::Device),
            "host" => Ok(MemoryLocation::Host),
            other => Err(ShardMemError::InvalidInput(format!(
                "unknown memory location '{}' (expected device or host)",
                other
            ))),
        }
    }
}

/// Opaque handle to a distributed allocation registered in a [`crate::Context`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub(crate) Key);

impl Display for MemoryHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "mem#{}", self.0)
    }
}

/// One rank's shard as seen from the calling process.
///
/// `ptr` is only dereferenceable for the lifetime of the allocation, and only
/// for `size` bytes. `offset` is the shard's position in the global region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardView {
    pub ptr: *mut u8,
    pub size: u64,
    pub offset: u64,
}

/// Where a rank's shard lives, from the point of view of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankBase {
    /// Shard is mapped into this process at this address
    Mapped(usize),
    /// Shard is only identified, not addressable from here
    Opaque(u64),
}

/// Resolution table mapping any global offset to its owning rank.
///
/// Always available, whatever the memory type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalReference {
    bases: Vec<RankBase>,
    plan: PartitionPlan,
    stride: u64,
}

impl GlobalReference {
    pub(crate) fn new(bases: Vec<RankBase>, plan: PartitionPlan, stride: u64) -> Self {
        Self {
            bases,
            plan,
            stride,
        }
    }

    pub fn bases(&self) -> &[RankBase] {
        &self.bases
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    /// Element stride in bytes (the allocation granularity)
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Resolve a global byte offset into `(rank, local_offset)`.
    pub fn resolve(&self, offset: u64) -> Result<(usize, u64)> {
        self.plan.locate(offset)
    }

    /// Address of the byte at a global offset, when the owning shard is
    /// mapped into this process.
    pub fn address_of(&self, offset: u64) -> Result<*mut u8> {
        let (rank, local) = self.resolve(offset)?;
        match self.bases[rank] {
            RankBase::Mapped(base) => Ok((base + local as usize) as *mut u8),
            RankBase::Opaque(_) => Err(ShardMemError::NotSupported(format!(
                "shard of rank {} is not addressable from this process",
                rank
            ))),
        }
    }
}
