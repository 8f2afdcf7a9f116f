//! Collectively managed, rank-sharded memory.
//!
//! A group of cooperating processes ("ranks") rendezvous into a
//! communicator, jointly allocate one logical region sharded across them by a
//! deterministic partition plan, address any byte of it through a flat
//! pointer or a resolution table, and bulk-load or store it from flat record
//! files in parallel.
//!
//! Every operation goes through an explicit [`Context`]; collective
//! operations block until every rank of the communicator made the same call.

pub mod comm;
pub mod config;
pub mod context;
pub mod device;
pub mod errors;
pub mod memory;
pub mod observability;
pub mod partition;
pub mod registry;
pub mod transfer;
pub mod units;

pub use comm::{CommHandle, Communicator, RendezvousToken};
pub use config::ShardMemConfig;
pub use context::Context;
pub use device::{device_count, HostCapabilities};
pub use errors::{code_of, ErrorCode, Result, ShardMemError};
pub use memory::{
    GlobalReference, HostMemoryProvider, MemoryHandle, MemoryLocation, MemoryProvider,
    MemoryType, RankBase, Segment, ShardView,
};
pub use observability::{init_production_logging, init_simple_logging};
pub use partition::{
    determine_entry_partition_plan, determine_partition_plan, PartitionEntry, PartitionPlan,
};
pub use transfer::{hdfs_support, HdfsSource};
pub use units::{format_bytes, parse_memory_string};
