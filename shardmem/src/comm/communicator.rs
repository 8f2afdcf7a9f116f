use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{read_frame, write_frame, Frame};
use super::token::RendezvousToken;
use crate::errors::{ErrorCode, Result, ShardMemError};
use crate::registry::Key;

/// Opaque handle to a communicator registered in a [`crate::Context`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommHandle(pub(crate) Key);

impl Display for CommHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "comm#{}", self.0)
    }
}

struct Channel {
    stream: Option<TcpStream>,
    seq: u64,
    /// Set once a collective fails; the group must be recreated
    poison: Option<(ErrorCode, String)>,
}

/// Collective group of ranks.
///
/// Collectives are serialized per communicator by the channel lock, which is
/// the single in-flight collective slot of this rank. Accessors never take it.
pub struct Communicator {
    rank: usize,
    size: usize,
    token: Uuid,
    hosts: Vec<String>,
    runtime: Handle,
    collective_timeout: Duration,
    channel: Mutex<Channel>,
    live_allocations: AtomicUsize,
    next_allocation: AtomicU64,
}

impl Communicator {
    /// Blocking rendezvous with the root named by `token`.
    pub(crate) fn join(
        runtime: Handle,
        token: &RendezvousToken,
        rank: usize,
        size: usize,
        host: String,
        join_timeout: Duration,
        collective_timeout: Duration,
    ) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(ShardMemError::InvalidInput(format!(
                "rank {} out of range for communicator size {}",
                rank, size
            )));
        }

        let join = Frame::Join {
            token: token.id(),
            rank: rank as u32,
            size: size as u32,
            host,
        };
        let root = token.root();

        debug!(rank, size, root = %root, "Joining rendezvous");

        let (stream, hosts) = runtime.block_on(async {
            tokio::time::timeout(join_timeout, async {
                let mut stream = TcpStream::connect(root).await.map_err(|e| {
                    ShardMemError::Communication(format!(
                        "cannot reach rendezvous root {}: {}",
                        root, e
                    ))
                })?;
                stream.set_nodelay(true)?;
                write_frame(&mut stream, &join).await.map_err(transport)?;

                match read_frame(&mut stream).await.map_err(transport)? {
                    Frame::Welcome { size: agreed, hosts } if agreed as usize == size => {
                        Ok((stream, hosts))
                    }
                    Frame::Rejected { code, reason } => {
                        Err(ShardMemError::from_code(code, reason))
                    }
                    other => Err(ShardMemError::Communication(format!(
                        "unexpected {} frame during rendezvous",
                        other.kind()
                    ))),
                }
            })
            .await
            .map_err(|_| {
                ShardMemError::Timeout(format!(
                    "rendezvous did not assemble {} ranks within {:?}",
                    size, join_timeout
                ))
            })?
        })?;

        info!(rank, size, token = %token.id(), "Joined communicator");

        Ok(Self {
            rank,
            size,
            token: token.id(),
            hosts,
            runtime,
            collective_timeout,
            channel: Mutex::new(Channel {
                stream: Some(stream),
                seq: 0,
                poison: None,
            }),
            live_allocations: AtomicUsize::new(0),
            next_allocation: AtomicU64::new(0),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn token_id(&self) -> Uuid {
        self.token
    }

    /// Node id reported by every rank at rendezvous, indexed by rank
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// True when every rank runs on the same node
    pub fn single_node(&self) -> bool {
        self.hosts.windows(2).all(|w| w[0] == w[1])
    }

    /// Block until every rank entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        self.collective("barrier", Vec::new()).map(|_| ())
    }

    /// Gather one payload from every rank, indexed by rank.
    pub fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.collective("all_gather", payload)
    }

    /// Collective agreement step: every rank submits `value` and all ranks
    /// fail with `InvalidInput` if any rank's value differs from rank 0's.
    pub fn check_consistency<T: Serialize>(&self, label: &str, value: &T) -> Result<()> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)
            .map_err(|e| ShardMemError::Serialization(e.to_string()))?;

        let gathered = self.collective(&format!("consistency:{}", label), bytes)?;
        let differing: Vec<usize> = gathered
            .iter()
            .enumerate()
            .filter(|(_, b)| *b != &gathered[0])
            .map(|(rank, _)| rank)
            .collect();

        if differing.is_empty() {
            return Ok(());
        }

        warn!(rank = self.rank, label, ?differing, "Ranks disagree on collective arguments");
        Err(ShardMemError::InvalidInput(format!(
            "{}: arguments of ranks {:?} differ from rank 0",
            label, differing
        )))
    }

    /// Turn a per-rank outcome into a group outcome.
    ///
    /// Every rank learns whether any rank failed. A rank that failed returns
    /// its own error; a rank that succeeded locally drops its value and
    /// reports the first failing rank's error.
    pub fn agree<T>(&self, label: &str, local: Result<T>) -> Result<T> {
        let status: Option<(ErrorCode, String)> =
            local.as_ref().err().map(|e| (e.code(), e.to_string()));
        let mut bytes = Vec::new();
        ciborium::into_writer(&status, &mut bytes)
            .map_err(|e| ShardMemError::Serialization(e.to_string()))?;

        let gathered = self.collective(&format!("agree:{}", label), bytes)?;
        let value = local?;

        for (rank, bytes) in gathered.iter().enumerate() {
            let status: Option<(ErrorCode, String)> = ciborium::from_reader(&bytes[..])
                .map_err(|e| ShardMemError::Communication(format!("malformed status: {}", e)))?;
            if let Some((code, message)) = status {
                return Err(ShardMemError::from_code(
                    code,
                    format!("{} failed on rank {}: {}", label, rank, message),
                ));
            }
        }
        Ok(value)
    }

    fn collective(&self, tag: &str, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let mut channel = self.channel.lock();

        if let Some((code, reason)) = &channel.poison {
            return Err(ShardMemError::from_code(
                *code,
                format!("communicator unusable after earlier failure: {}", reason),
            ));
        }

        let seq = channel.seq;
        let size = self.size;
        let timeout = self.collective_timeout;
        let stream = channel.stream.as_mut().ok_or_else(|| {
            ShardMemError::Logic("collective on a communicator that already left".into())
        })?;

        debug!(rank = self.rank, seq, tag, bytes = payload.len(), "Collective");

        let frame = Frame::Collective {
            seq,
            tag: tag.to_string(),
            payload,
        };
        let outcome = self.runtime.block_on(async {
            tokio::time::timeout(timeout, async {
                write_frame(stream, &frame).await.map_err(transport)?;
                match read_frame(stream).await.map_err(transport)? {
                    Frame::Gathered {
                        seq: got,
                        payloads,
                    } if got == seq && payloads.len() == size => Ok(payloads),
                    Frame::Rejected { code, reason } => Err(ShardMemError::from_code(code, reason)),
                    other => Err(ShardMemError::Communication(format!(
                        "unexpected {} frame in collective {}",
                        other.kind(),
                        seq
                    ))),
                }
            })
            .await
            .unwrap_or_else(|_| {
                Err(ShardMemError::Timeout(format!(
                    "collective '{}' ({}) did not complete within {:?}",
                    tag, seq, timeout
                )))
            })
        });

        match outcome {
            Ok(payloads) => {
                channel.seq += 1;
                Ok(payloads)
            }
            Err(e) => {
                warn!(rank = self.rank, seq, tag, error = %e, "Collective failed, poisoning communicator");
                channel.poison = Some((e.code(), e.to_string()));
                channel.stream = None;
                Err(e)
            }
        }
    }

    /// Orderly departure from the group. Later collectives fail.
    pub(crate) fn leave(&self) -> Result<()> {
        let mut channel = self.channel.lock();
        let Some(mut stream) = channel.stream.take() else {
            return Ok(());
        };

        self.runtime
            .block_on(async { write_frame(&mut stream, &Frame::Leave).await })
            .map_err(transport)?;
        debug!(rank = self.rank, "Left communicator");
        Ok(())
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }

    pub(crate) fn retain_allocation(&self) {
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_allocation(&self) {
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
    }

    /// Sequence number of the next allocation. Identical on every rank as
    /// long as allocations are issued collectively.
    pub(crate) fn next_allocation_seq(&self) -> u64 {
        self.next_allocation.fetch_add(1, Ordering::AcqRel)
    }
}

fn transport(e: std::io::Error) -> ShardMemError {
    ShardMemError::Communication(format!("rendezvous transport: {}", e))
}
