//! Rendezvous root and collective relay.
//!
//! The root runs inside the process that generated the token. Ranks connect,
//! send `Join`, and wait for `Welcome`. After formation every rank keeps its
//! connection open and the root gathers one `Collective` frame per rank
//! before answering all of them with `Gathered`. Any protocol violation or
//! lost connection aborts the whole group.

use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{read_frame, write_frame, Frame};
use crate::errors::ErrorCode;

/// Bounded wait for the first frame on a fresh connection
const JOIN_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

struct Joined {
    rank: u32,
    host: String,
    stream: TcpStream,
}

enum RankEvent {
    Frame(usize, Frame),
    Closed(usize, String),
}

/// Run the root for one formation attempt identified by `token`.
///
/// The whole rank set must join within `join_timeout` of the root starting;
/// otherwise joined ranks are rejected and the listener is closed.
pub(crate) async fn run(listener: TcpListener, token: Uuid, join_timeout: Duration) {
    let (join_tx, mut join_rx) = mpsc::channel::<(Frame, TcpStream)>(64);
    let acceptor = tokio::spawn(accept_loop(listener, join_tx));

    let members = match form(&mut join_rx, token, join_timeout).await {
        Some(members) => members,
        None => {
            acceptor.abort();
            return;
        }
    };

    relay(members, join_rx).await;
    acceptor.abort();
    debug!(token = %token, "Rendezvous root exited");
}

async fn accept_loop(listener: TcpListener, join_tx: mpsc::Sender<(Frame, TcpStream)>) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Rendezvous accept failed");
                continue;
            }
        };

        let join_tx = join_tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(JOIN_FRAME_TIMEOUT, read_frame(&mut stream)).await {
                Ok(Ok(frame)) => {
                    let _ = join_tx.send((frame, stream)).await;
                }
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "Dropped connection before join"),
                Err(_) => debug!(peer = %peer, "Connection sent no join frame"),
            }
        });
    }
}

/// Collect `size` valid joins. Returns the members ordered by rank, or `None`
/// after rejecting everyone.
async fn form(
    join_rx: &mut mpsc::Receiver<(Frame, TcpStream)>,
    token: Uuid,
    join_timeout: Duration,
) -> Option<Vec<Joined>> {
    let mut joined: Vec<Joined> = Vec::new();
    let mut expected_size: Option<u32> = None;
    let deadline = Instant::now() + join_timeout;

    loop {
        let next = match tokio::time::timeout_at(deadline, join_rx.recv()).await {
            Ok(next) => next,
            Err(_) => {
                let reason = format!(
                    "rendezvous deadline expired with {} of {} ranks joined",
                    joined.len(),
                    expected_size.unwrap_or(0)
                );
                warn!(%reason, "Abandoning rendezvous");
                reject_all(joined, ErrorCode::Timeout, &reason).await;
                return None;
            }
        };

        let Some((frame, mut stream)) = next else {
            reject_all(joined, ErrorCode::CommunicationError, "rendezvous listener stopped").await;
            return None;
        };

        let Frame::Join {
            token: their_token,
            rank,
            size,
            host,
        } = frame
        else {
            reject(&mut stream, ErrorCode::InvalidInput, "expected join frame").await;
            continue;
        };

        if their_token != token {
            warn!(rank, "Join with foreign rendezvous token");
            reject(&mut stream, ErrorCode::InvalidInput, "rendezvous token mismatch").await;
            continue;
        }

        let problem = if size == 0 {
            Some("communicator size must be at least 1".to_string())
        } else if expected_size.is_some_and(|s| s != size) {
            Some(format!(
                "rank {} declared size {} but the group has size {}",
                rank,
                size,
                expected_size.unwrap_or(0)
            ))
        } else if rank >= size {
            Some(format!("rank {} out of range for size {}", rank, size))
        } else if joined.iter().any(|j| j.rank == rank) {
            Some(format!("duplicate rank {}", rank))
        } else {
            None
        };

        if let Some(reason) = problem {
            warn!(%reason, "Rejecting rendezvous");
            joined.push(Joined { rank, host, stream });
            reject_all(joined, ErrorCode::InvalidInput, &reason).await;
            return None;
        }

        debug!(rank, size, host = %host, "Rank joined");
        expected_size = Some(size);
        joined.push(Joined { rank, host, stream });

        if joined.len() == size as usize {
            break;
        }
    }

    joined.sort_by_key(|j| j.rank);
    let size = joined.len() as u32;
    let hosts: Vec<String> = joined.iter().map(|j| j.host.clone()).collect();
    let welcome = Frame::Welcome { size, hosts };

    let mut failure = None;
    for member in joined.iter_mut() {
        if let Err(e) = write_frame(&mut member.stream, &welcome).await {
            failure = Some(format!("rank {} dropped during formation: {}", member.rank, e));
            break;
        }
    }
    if let Some(reason) = failure {
        warn!(%reason, "Abandoning rendezvous");
        reject_all(joined, ErrorCode::CommunicationError, &reason).await;
        return None;
    }

    info!(token = %token, size, "Communicator formed");
    Some(joined)
}

/// Relay collectives until every rank left or the group aborts.
async fn relay(members: Vec<Joined>, mut join_rx: mpsc::Receiver<(Frame, TcpStream)>) {
    let size = members.len();
    let (event_tx, mut event_rx) = mpsc::channel::<RankEvent>(size * 2);
    let mut writers: Vec<Option<OwnedWriteHalf>> = Vec::with_capacity(size);

    for (rank, member) in members.into_iter().enumerate() {
        let (mut reader, writer) = member.stream.into_split();
        writers.push(Some(writer));

        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        let leaving = frame == Frame::Leave;
                        if event_tx.send(RankEvent::Frame(rank, frame)).await.is_err() || leaving {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = event_tx.send(RankEvent::Closed(rank, e.to_string())).await;
                        return;
                    }
                }
            }
        });
    }
    drop(event_tx);

    let mut seq: u64 = 0;
    let mut pending: Vec<Option<(String, Vec<u8>)>> = vec![None; size];
    let mut left = vec![false; size];

    loop {
        let event = tokio::select! {
            event = event_rx.recv() => event,
            Some((_, mut stream)) = join_rx.recv() => {
                reject(&mut stream, ErrorCode::InvalidInput, "communicator already formed").await;
                continue;
            }
        };

        let Some(event) = event else {
            return;
        };

        match event {
            RankEvent::Frame(rank, Frame::Leave) => {
                debug!(rank, "Rank left");
                left[rank] = true;
                writers[rank] = None;
                if pending.iter().any(Option::is_some) {
                    let reason = format!("rank {} left during collective {}", rank, seq);
                    abort(&mut writers, ErrorCode::CommunicationError, &reason).await;
                    return;
                }
                if left.iter().all(|l| *l) {
                    return;
                }
            }
            RankEvent::Frame(
                rank,
                Frame::Collective {
                    seq: their_seq,
                    tag,
                    payload,
                },
            ) => {
                if their_seq != seq || pending[rank].is_some() {
                    let reason = format!(
                        "rank {} sent collective {} while collective {} is in progress",
                        rank, their_seq, seq
                    );
                    abort(&mut writers, ErrorCode::LogicError, &reason).await;
                    return;
                }

                if let Some(gone) = left.iter().position(|l| *l) {
                    let reason = format!("collective {} issued after rank {} left", seq, gone);
                    abort(&mut writers, ErrorCode::CommunicationError, &reason).await;
                    return;
                }

                if let Some((other, (first, _))) = pending
                    .iter()
                    .enumerate()
                    .find_map(|(r, p)| p.as_ref().map(|p| (r, p)))
                {
                    if *first != tag {
                        let reason = format!(
                            "collective {} mismatch: rank {} issued '{}', rank {} issued '{}'",
                            seq, other, first, rank, tag
                        );
                        abort(&mut writers, ErrorCode::LogicError, &reason).await;
                        return;
                    }
                }

                pending[rank] = Some((tag, payload));

                if pending.iter().all(Option::is_some) {
                    let payloads: Vec<Vec<u8>> = pending
                        .iter_mut()
                        .filter_map(|p| p.take().map(|(_, payload)| payload))
                        .collect();
                    let gathered = Frame::Gathered { seq, payloads };

                    let mut failure = None;
                    for (rank, slot) in writers.iter_mut().enumerate() {
                        let Some(writer) = slot else { continue };
                        if let Err(e) = write_frame(writer, &gathered).await {
                            failure = Some(format!("rank {} unreachable: {}", rank, e));
                            *slot = None;
                            break;
                        }
                    }
                    if let Some(reason) = failure {
                        abort(&mut writers, ErrorCode::CommunicationError, &reason).await;
                        return;
                    }
                    seq += 1;
                }
            }
            RankEvent::Frame(rank, other) => {
                let reason = format!("rank {} sent unexpected {} frame", rank, other.kind());
                abort(&mut writers, ErrorCode::LogicError, &reason).await;
                return;
            }
            RankEvent::Closed(rank, error) => {
                if left[rank] {
                    continue;
                }
                let reason = format!("rank {} disconnected: {}", rank, error);
                writers[rank] = None;
                abort(&mut writers, ErrorCode::CommunicationError, &reason).await;
                return;
            }
        }
    }
}

async fn reject(stream: &mut TcpStream, code: ErrorCode, reason: &str) {
    let frame = Frame::Rejected {
        code,
        reason: reason.to_string(),
    };
    if let Err(e) = write_frame(stream, &frame).await {
        debug!(error = %e, "Failed to deliver rejection");
    }
}

async fn reject_all(joined: Vec<Joined>, code: ErrorCode, reason: &str) {
    for mut member in joined {
        reject(&mut member.stream, code, reason).await;
    }
}

async fn abort(writers: &mut [Option<OwnedWriteHalf>], code: ErrorCode, reason: &str) {
    warn!(?code, %reason, "Aborting communicator");
    let frame = Frame::Rejected {
        code,
        reason: reason.to_string(),
    };
    for writer in writers.iter_mut().flatten() {
        if let Err(e) = write_frame(writer, &frame).await {
            debug!(error = %e, "Failed to deliver abort");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    async fn start(join_timeout: Duration) -> (SocketAddr, Uuid, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = Uuid::new_v4();
        let root = tokio::spawn(run(listener, token, join_timeout));
        (addr, token, root)
    }

    async fn send_join(addr: SocketAddr, token: Uuid, rank: u32, size: u32) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let join = Frame::Join {
            token,
            rank,
            size,
            host: "node-a".into(),
        };
        write_frame(&mut stream, &join).await.unwrap();
        stream
    }

    fn rejected_code(frame: Frame) -> ErrorCode {
        match frame {
            Frame::Rejected { code, .. } => code,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_token_and_late_join() {
        let (addr, token, root) = start(Duration::from_secs(5)).await;

        let mut foreign = send_join(addr, Uuid::new_v4(), 0, 1).await;
        let frame = read_frame(&mut foreign).await.unwrap();
        assert_eq!(rejected_code(frame), ErrorCode::InvalidInput);

        // The foreign join did not disturb formation
        let mut member = send_join(addr, token, 0, 1).await;
        let frame = read_frame(&mut member).await.unwrap();
        assert_eq!(
            frame,
            Frame::Welcome {
                size: 1,
                hosts: vec!["node-a".into()]
            }
        );

        let mut late = send_join(addr, token, 0, 1).await;
        let frame = read_frame(&mut late).await.unwrap();
        assert_eq!(rejected_code(frame), ErrorCode::InvalidInput);

        write_frame(&mut member, &Frame::Leave).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), root)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_collective_gathers_in_rank_order() {
        let (addr, token, _root) = start(Duration::from_secs(5)).await;

        let mut second = send_join(addr, token, 1, 2).await;
        let mut first = send_join(addr, token, 0, 2).await;
        assert!(matches!(read_frame(&mut first).await.unwrap(), Frame::Welcome { .. }));
        assert!(matches!(read_frame(&mut second).await.unwrap(), Frame::Welcome { .. }));

        for (i, stream) in [&mut second, &mut first].into_iter().enumerate() {
            let frame = Frame::Collective {
                seq: 0,
                tag: "barrier".into(),
                payload: vec![1 - i as u8],
            };
            write_frame(stream, &frame).await.unwrap();
        }

        let expected = Frame::Gathered {
            seq: 0,
            payloads: vec![vec![0], vec![1]],
        };
        assert_eq!(read_frame(&mut first).await.unwrap(), expected);
        assert_eq!(read_frame(&mut second).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_tag_mismatch_aborts_group() {
        let (addr, token, root) = start(Duration::from_secs(5)).await;

        let mut first = send_join(addr, token, 0, 2).await;
        let mut second = send_join(addr, token, 1, 2).await;
        read_frame(&mut first).await.unwrap();
        read_frame(&mut second).await.unwrap();

        for (stream, tag) in [(&mut first, "barrier"), (&mut second, "all_gather")] {
            let frame = Frame::Collective {
                seq: 0,
                tag: tag.into(),
                payload: Vec::new(),
            };
            write_frame(stream, &frame).await.unwrap();
        }

        assert_eq!(
            rejected_code(read_frame(&mut first).await.unwrap()),
            ErrorCode::LogicError
        );
        assert_eq!(
            rejected_code(read_frame(&mut second).await.unwrap()),
            ErrorCode::LogicError
        );
        tokio::time::timeout(Duration::from_secs(5), root)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_root_exits_when_nobody_joins() {
        let (_addr, _token, root) = start(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), root)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_deadline_rejects_joined_ranks() {
        let (addr, token, root) = start(Duration::from_millis(200)).await;

        let mut lonely = send_join(addr, token, 0, 3).await;
        let frame = read_frame(&mut lonely).await.unwrap();
        assert_eq!(rejected_code(frame), ErrorCode::Timeout);
        root.await.unwrap();
    }
}
