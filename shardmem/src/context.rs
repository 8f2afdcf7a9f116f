//! The per-process context threaded through every operation.
//!
//! A [`Context`] owns the runtime that drives rendezvous and collective
//! traffic, the memory provider, and the registries behind every opaque
//! handle. Collective calls block the calling thread; calling them from
//! inside an async runtime is a caller error.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::comm::{root, CommHandle, Communicator, RendezvousToken};
use crate::config::ShardMemConfig;
use crate::device::HostCapabilities;
use crate::errors::{Result, ShardMemError};
use crate::memory::provider::{HostMemoryProvider, MemoryProvider};
use crate::memory::Allocation;
use crate::registry::Registry;

pub struct Context {
    config: ShardMemConfig,
    runtime: tokio::runtime::Runtime,
    provider: Arc<dyn MemoryProvider>,
    pub(crate) communicators: Registry<Communicator>,
    pub(crate) allocations: Registry<Allocation>,
}

impl Context {
    /// Build a context with the host shared-memory provider.
    pub fn new(config: ShardMemConfig) -> Result<Self> {
        let node_id = HostCapabilities::node_id();
        let provider = HostMemoryProvider::new(config.memory.shm_dir.clone(), node_id);
        Self::with_provider(config, Arc::new(provider))
    }

    /// Build a context that draws shards from `provider`.
    pub fn with_provider(config: ShardMemConfig, provider: Arc<dyn MemoryProvider>) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime.worker_threads)
            .thread_name("shardmem-io")
            .enable_all()
            .build()?;

        info!(
            provider = provider.name(),
            node = %provider.node_id(),
            "Context initialized"
        );

        Ok(Self {
            config,
            runtime,
            provider,
            communicators: Registry::new("communicator"),
            allocations: Registry::new("memory handle"),
        })
    }

    pub fn config(&self) -> &ShardMemConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn MemoryProvider> {
        &self.provider
    }

    /// Generate a fresh rendezvous token and start its root in this process.
    ///
    /// The process must stay alive until every communicator formed from the
    /// token has been destroyed.
    pub fn create_unique_id(&self) -> Result<RendezvousToken> {
        let bind = self.config.rendezvous.bind_socket_addr()?;
        if bind.ip().is_unspecified() {
            return Err(ShardMemError::InvalidInput(format!(
                "rendezvous.bind_addr {} must name an address peers can reach",
                bind
            )));
        }

        let listener = self.runtime.block_on(TcpListener::bind(bind))?;
        let root_addr: SocketAddr = listener.local_addr()?;
        let token = RendezvousToken::new(root_addr);

        self.runtime.spawn(root::run(
            listener,
            token.id(),
            self.config.rendezvous.timeout(),
        ));

        info!(root = %root_addr, token = %token.id(), "Rendezvous root listening");
        Ok(token)
    }

    /// Blocking rendezvous: returns once all `size` ranks joined with `token`.
    pub fn create_communicator(
        &self,
        token: &RendezvousToken,
        rank: usize,
        size: usize,
    ) -> Result<CommHandle> {
        let communicator = Communicator::join(
            self.runtime.handle().clone(),
            token,
            rank,
            size,
            self.provider.node_id(),
            self.config.rendezvous.timeout(),
            self.config.rendezvous.collective_timeout(),
        )?;
        Ok(CommHandle(self.communicators.insert(communicator)))
    }

    /// Collective teardown. Fails with `LogicError`, leaving the communicator
    /// usable, while allocations built on it are still live.
    pub fn destroy_communicator(&self, comm: CommHandle) -> Result<()> {
        let communicator = self.communicator(comm)?;

        let live = communicator.live_allocations();
        if live > 0 {
            return Err(ShardMemError::Logic(format!(
                "{} still has {} live allocation(s)",
                comm, live
            )));
        }

        let synced = communicator.barrier();
        self.communicators.remove(comm.0)?;
        synced?;

        if let Err(e) = communicator.leave() {
            warn!(%comm, error = %e, "Failed to leave communicator cleanly");
        }
        info!(%comm, rank = communicator.rank(), "Communicator destroyed");
        Ok(())
    }

    pub fn communicator_rank(&self, comm: CommHandle) -> Result<usize> {
        Ok(self.communicator(comm)?.rank())
    }

    pub fn communicator_size(&self, comm: CommHandle) -> Result<usize> {
        Ok(self.communicator(comm)?.size())
    }

    pub fn barrier(&self, comm: CommHandle) -> Result<()> {
        self.communicator(comm)?.barrier()
    }

    /// Shared access to a registered communicator, for collectives beyond
    /// the barrier (`all_gather`, `check_consistency`).
    pub fn communicator(&self, comm: CommHandle) -> Result<Arc<Communicator>> {
        self.communicators.get(comm.0)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("provider", &self.provider.name())
            .field("communicators", &self.communicators.len())
            .field("allocations", &self.allocations.len())
            .finish()
    }
}
