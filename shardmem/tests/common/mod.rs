//! Multi-rank harness: one `Context` per rank, each on its own thread.
//!
//! A separate host context owns the rendezvous root so every rank, rank 0
//! included, joins the same way a remote process would.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shardmem::{
    CommHandle, Context, MemoryProvider, RendezvousToken, Result, ShardMemConfig,
};
use tempfile::TempDir;

static NEXT_PREFIX: AtomicU64 = AtomicU64::new(0);

pub struct Cluster {
    pub config: ShardMemConfig,
    pub shm: TempDir,
    host: Context,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_timeouts(10, 20)
    }

    pub fn with_timeouts(rendezvous_secs: u64, collective_secs: u64) -> Self {
        let shm = TempDir::new().unwrap();

        let mut config = ShardMemConfig::default();
        config.runtime.worker_threads = 1;
        config.rendezvous.timeout_secs = rendezvous_secs;
        config.rendezvous.collective_timeout_secs = collective_secs;
        config.memory.shm_dir = shm.path().to_path_buf();
        config.memory.shm_prefix = format!(
            "test-{}-{}",
            std::process::id(),
            NEXT_PREFIX.fetch_add(1, Ordering::Relaxed)
        );
        // Small chunks so transfers take several positioned reads/writes
        config.transfer.io_chunk_bytes = 24;

        let host = Context::new(config.clone()).unwrap();
        Self { config, shm, host }
    }

    pub fn token(&self) -> RendezvousToken {
        self.host.create_unique_id().unwrap()
    }

    /// Run `body` on `size` ranks joined into one communicator. Ranks whose
    /// rendezvous fails never reach `body`; their error is returned instead.
    pub fn run<T, F>(&self, size: usize, body: F) -> Vec<Result<T>>
    where
        T: Send,
        F: Fn(&Context, CommHandle, usize) -> T + Sync,
    {
        let joins: Vec<(usize, usize)> = (0..size).map(|rank| (rank, size)).collect();
        self.run_joins(&joins, None, |ctx, comm, rank| Ok(body(ctx, comm, rank)))
    }

    /// Like [`Cluster::run`] but every rank uses contexts built on `provider`.
    pub fn run_with_provider<T, F>(
        &self,
        size: usize,
        provider: Arc<dyn MemoryProvider>,
        body: F,
    ) -> Vec<Result<T>>
    where
        T: Send,
        F: Fn(&Context, CommHandle, usize) -> T + Sync,
    {
        let joins: Vec<(usize, usize)> = (0..size).map(|rank| (rank, size)).collect();
        self.run_joins(&joins, Some(provider), |ctx, comm, rank| {
            Ok(body(ctx, comm, rank))
        })
    }

    /// One thread per `(rank, size)` pair, all joining one fresh token.
    pub fn run_joins<T, F>(
        &self,
        joins: &[(usize, usize)],
        provider: Option<Arc<dyn MemoryProvider>>,
        body: F,
    ) -> Vec<Result<T>>
    where
        T: Send,
        F: Fn(&Context, CommHandle, usize) -> Result<T> + Sync,
    {
        let token = self.token();

        std::thread::scope(|scope| {
            let threads: Vec<_> = joins
                .iter()
                .map(|&(rank, size)| {
                    let provider = provider.clone();
                    let config = self.config.clone();
                    let body = &body;
                    scope.spawn(move || {
                        let ctx = match provider {
                            Some(provider) => Context::with_provider(config, provider)?,
                            None => Context::new(config)?,
                        };
                        let comm = ctx.create_communicator(&token, rank, size)?;
                        body(&ctx, comm, rank)
                    })
                })
                .collect();

            threads
                .into_iter()
                .map(|t| t.join().expect("rank thread panicked"))
                .collect()
        })
    }
}
