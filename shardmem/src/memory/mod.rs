//! Collectively managed distributed allocations.
//!
//! `malloc` and `free` are collective over a communicator; every query is
//! local and synchronization-free.

pub mod handle;
pub mod provider;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

pub use handle::{GlobalReference, MemoryHandle, MemoryLocation, MemoryType, RankBase, ShardView};
pub use provider::{HostMemoryProvider, MemoryProvider, Segment};

use crate::comm::{CommHandle, Communicator};
use crate::context::Context;
use crate::errors::{Result, ShardMemError};
use crate::partition::{determine_partition_plan, PartitionEntry, PartitionPlan};

/// Mapped memory held by one rank for one allocation.
enum Storage {
    /// The whole region mapped once; shards are slices of it
    Continuous(Segment),
    /// Every rank's shard mapped into this process, indexed by rank
    Peers(Vec<Segment>),
    /// Only this rank's shard
    Local(Segment),
}

pub(crate) struct Allocation {
    comm: CommHandle,
    communicator: Arc<Communicator>,
    memory_type: MemoryType,
    location: MemoryLocation,
    total_size: u64,
    granularity: u64,
    plan: PartitionPlan,
    bases: Vec<RankBase>,
    storage: Storage,
}

impl Allocation {
    pub(crate) fn communicator(&self) -> &Arc<Communicator> {
        &self.communicator
    }

    pub(crate) fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.total_size
    }

    pub(crate) fn granularity(&self) -> u64 {
        self.granularity
    }

    pub(crate) fn local_entry(&self) -> PartitionEntry {
        self.plan.entries()[self.communicator.rank()]
    }

    pub(crate) fn local_view(&self) -> ShardView {
        let entry = self.local_entry();
        let ptr = match &self.storage {
            Storage::Continuous(whole) if entry.size > 0 => {
                // SAFETY: the plan entry lies inside the whole-region mapping.
                unsafe { whole.as_ptr().add(entry.offset as usize) }
            }
            Storage::Continuous(_) => std::ptr::NonNull::dangling().as_ptr(),
            Storage::Peers(segments) => segments[self.communicator.rank()].as_ptr(),
            Storage::Local(segment) => segment.as_ptr(),
        };
        ShardView {
            ptr,
            size: entry.size,
            offset: entry.offset,
        }
    }

    fn rank_view(&self, rank: usize) -> Result<ShardView> {
        let entry = self.plan.entry(rank)?;
        if rank == self.communicator.rank() {
            return Ok(self.local_view());
        }

        match self.bases[rank] {
            RankBase::Mapped(base) => Ok(ShardView {
                ptr: base as *mut u8,
                size: entry.size,
                offset: entry.offset,
            }),
            RankBase::Opaque(_) => Err(ShardMemError::NotSupported(format!(
                "{} allocation does not expose rank {}'s shard to peers",
                self.memory_type, rank
            ))),
        }
    }
}

/// Arguments every rank must agree on before allocating.
#[derive(Serialize)]
struct MallocArgs {
    total_size: u64,
    granularity: u64,
    memory_type: MemoryType,
    location: MemoryLocation,
    sequence: u64,
}

impl Context {
    /// Collective allocation of `total_size` bytes sharded over `comm`.
    pub fn malloc(
        &self,
        total_size: u64,
        comm: CommHandle,
        memory_type: MemoryType,
        location: MemoryLocation,
        granularity: u64,
    ) -> Result<MemoryHandle> {
        let communicator = self.communicator(comm)?;
        let rank = communicator.rank();
        let sequence = communicator.next_allocation_seq();

        communicator.check_consistency(
            "malloc",
            &MallocArgs {
                total_size,
                granularity,
                memory_type,
                location,
                sequence,
            },
        )?;

        if total_size == 0 {
            return Err(ShardMemError::InvalidInput(
                "allocation size must be non-zero".into(),
            ));
        }
        let plan = determine_partition_plan(total_size, granularity, communicator.size())?;

        let supported = if self.provider().supports(location) {
            Ok(())
        } else {
            Err(ShardMemError::NotSupported(format!(
                "{} provider cannot allocate {} memory",
                self.provider().name(),
                location
            )))
        };
        communicator.agree("malloc:location", supported)?;

        let peer_visible =
            communicator.single_node() && self.provider().supports_shared(location);
        let name_prefix = format!(
            "{}-{}-{}",
            self.config().memory.shm_prefix,
            communicator.token_id().simple(),
            sequence
        );

        let (storage, bases) = match memory_type {
            MemoryType::Continuous => {
                let unified = if peer_visible {
                    Ok(())
                } else {
                    Err(ShardMemError::NotSupported(
                        "continuous allocations need every rank on one node with shared memory"
                            .into(),
                    ))
                };
                communicator.agree("malloc:unified", unified)?;
                self.map_continuous(&communicator, &plan, location, &name_prefix)?
            }
            MemoryType::Chunked if peer_visible => {
                self.map_chunked(&communicator, &plan, location, &name_prefix)?
            }
            MemoryType::Chunked | MemoryType::Distributed => {
                self.map_distributed(&communicator, &plan, location)?
            }
        };

        let allocation = Allocation {
            comm,
            communicator: communicator.clone(),
            memory_type,
            location,
            total_size,
            granularity,
            plan,
            bases,
            storage,
        };
        let handle = MemoryHandle(self.allocations.insert(allocation));
        communicator.retain_allocation();

        info!(
            %handle,
            %comm,
            rank,
            bytes = total_size,
            %memory_type,
            %location,
            "Allocation created"
        );
        Ok(handle)
    }

    /// Collective release. The handle is invalid afterwards on every rank.
    pub fn free(&self, handle: MemoryHandle) -> Result<()> {
        let allocation = self.allocation(handle)?;

        // Peers may still be reading this rank's shard
        let synced = allocation.communicator.barrier();

        self.allocations.remove(handle.0)?;
        allocation.communicator.release_allocation();
        info!(%handle, rank = allocation.communicator.rank(), "Allocation freed");

        synced
    }

    pub fn get_communicator(&self, handle: MemoryHandle) -> Result<CommHandle> {
        Ok(self.allocation(handle)?.comm)
    }

    pub fn get_memory_type(&self, handle: MemoryHandle) -> Result<MemoryType> {
        Ok(self.allocation(handle)?.memory_type)
    }

    pub fn get_memory_location(&self, handle: MemoryHandle) -> Result<MemoryLocation> {
        Ok(self.allocation(handle)?.location)
    }

    pub fn get_total_size(&self, handle: MemoryHandle) -> Result<u64> {
        Ok(self.allocation(handle)?.total_size)
    }

    pub fn get_data_granularity(&self, handle: MemoryHandle) -> Result<u64> {
        Ok(self.allocation(handle)?.granularity)
    }

    /// The calling rank's own shard
    pub fn get_local_memory(&self, handle: MemoryHandle) -> Result<ShardView> {
        Ok(self.allocation(handle)?.local_view())
    }

    /// Any rank's shard, when it is mapped into this process
    pub fn get_rank_memory(&self, handle: MemoryHandle, rank: usize) -> Result<ShardView> {
        self.allocation(handle)?.rank_view(rank)
    }

    /// Flat pointer over the whole region (continuous allocations only)
    pub fn get_global_pointer(&self, handle: MemoryHandle) -> Result<*mut u8> {
        let allocation = self.allocation(handle)?;
        match &allocation.storage {
            Storage::Continuous(whole) => Ok(whole.as_ptr()),
            _ => Err(ShardMemError::NotSupported(format!(
                "{} allocation has no flat global pointer",
                allocation.memory_type
            ))),
        }
    }

    pub fn get_global_reference(&self, handle: MemoryHandle) -> Result<GlobalReference> {
        let allocation = self.allocation(handle)?;
        Ok(GlobalReference::new(
            allocation.bases.clone(),
            allocation.plan.clone(),
            allocation.granularity,
        ))
    }

    /// Partition plan baked into an allocation
    pub fn get_partition_plan(&self, handle: MemoryHandle) -> Result<PartitionPlan> {
        Ok(self.allocation(handle)?.plan.clone())
    }

    pub(crate) fn allocation(&self, handle: MemoryHandle) -> Result<Arc<Allocation>> {
        self.allocations.get(handle.0)
    }

    /// Rank 0 creates the whole region as one shared segment; every rank maps it.
    fn map_continuous(
        &self,
        communicator: &Communicator,
        plan: &PartitionPlan,
        location: MemoryLocation,
        name: &str,
    ) -> Result<(Storage, Vec<RankBase>)> {
        let provider = self.provider();
        let total = plan.total() as usize;
        let rank = communicator.rank();

        let created = if rank == 0 {
            provider.create_shared(location, name, total).map(Some)
        } else {
            Ok(None)
        };
        let created = communicator.agree("malloc:create", created)?;

        let whole = match created {
            Some(segment) => Ok(segment),
            None => provider.open_shared(location, name, total),
        };
        let whole = communicator.agree("malloc:open", whole);

        if rank == 0 {
            if let Err(e) = provider.unlink_shared(name) {
                warn!(name, error = %e, "Failed to unlink shared segment");
            }
        }
        let whole = whole?;

        let base = whole.as_ptr() as usize;
        let bases = plan
            .entries()
            .iter()
            .map(|e| RankBase::Mapped(base + e.offset as usize))
            .collect();

        debug!(rank, bytes = total, "Mapped continuous region");
        Ok((Storage::Continuous(whole), bases))
    }

    /// Each rank shares its own shard; every rank maps all of them.
    fn map_chunked(
        &self,
        communicator: &Communicator,
        plan: &PartitionPlan,
        location: MemoryLocation,
        prefix: &str,
    ) -> Result<(Storage, Vec<RankBase>)> {
        let provider = self.provider();
        let rank = communicator.rank();
        let own_name = format!("{}-{}", prefix, rank);
        let own_size = plan.entries()[rank].size as usize;

        let own = provider.create_shared(location, &own_name, own_size);
        let created = own.is_ok();
        let own = match communicator.agree("malloc:create", own) {
            Ok(segment) => segment,
            Err(e) => {
                if created {
                    let _ = provider.unlink_shared(&own_name);
                }
                return Err(e);
            }
        };

        let names = communicator.all_gather(own_name.clone().into_bytes())?;
        let mut own = Some(own);
        let mapped: Result<Vec<Segment>> = names
            .iter()
            .enumerate()
            .map(|(peer, name)| {
                if peer == rank {
                    return Ok(own.take().unwrap_or_else(Segment::empty));
                }
                let name = String::from_utf8_lossy(name);
                provider.open_shared(location, &name, plan.entries()[peer].size as usize)
            })
            .collect();
        let mapped = communicator.agree("malloc:open", mapped);

        if let Err(e) = provider.unlink_shared(&own_name) {
            warn!(name = %own_name, error = %e, "Failed to unlink shared segment");
        }
        let segments = mapped?;

        let bases = segments
            .iter()
            .map(|s| RankBase::Mapped(s.as_ptr() as usize))
            .collect();

        debug!(rank, peers = segments.len(), "Mapped chunked shards");
        Ok((Storage::Peers(segments), bases))
    }

    /// Private shards; peers only learn an opaque identifier, the owner keeps
    /// its own shard addressable.
    fn map_distributed(
        &self,
        communicator: &Communicator,
        plan: &PartitionPlan,
        location: MemoryLocation,
    ) -> Result<(Storage, Vec<RankBase>)> {
        let rank = communicator.rank();
        let size = plan.entries()[rank].size as usize;

        let local = self.provider().allocate_private(location, size);
        let local = communicator.agree("malloc:allocate", local)?;

        let token = (local.as_ptr() as usize as u64).to_be_bytes().to_vec();
        let bases = communicator
            .all_gather(token)?
            .iter()
            .enumerate()
            .map(|(peer, bytes)| {
                if peer == rank {
                    return RankBase::Mapped(local.as_ptr() as usize);
                }
                let mut raw = [0u8; 8];
                let n = bytes.len().min(8);
                raw[..n].copy_from_slice(&bytes[..n]);
                RankBase::Opaque(u64::from_be_bytes(raw))
            })
            .collect();

        Ok((Storage::Local(local), bases))
    }
}
