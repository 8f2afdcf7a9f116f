// Rendezvous and collective frames exchanged between ranks and the root

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::errors::ErrorCode;

/// Maximum encoded frame size (16MB)
pub const MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Frames on a rank <-> root connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame sent by a rank
    Join {
        token: Uuid,
        rank: u32,
        size: u32,
        host: String,
    },
    /// All ranks joined; `hosts[r]` is the node id reported by rank `r`
    Welcome { size: u32, hosts: Vec<String> },
    /// Formation refused or group aborted; the connection closes after this
    Rejected { code: ErrorCode, reason: String },
    /// One rank's contribution to collective number `seq`
    Collective {
        seq: u64,
        tag: String,
        payload: Vec<u8>,
    },
    /// Every rank's contribution to collective `seq`, indexed by rank
    Gathered { seq: u64, payloads: Vec<Vec<u8>> },
    /// Orderly departure during communicator teardown
    Leave,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Join { .. } => "join",
            Frame::Welcome { .. } => "welcome",
            Frame::Rejected { .. } => "rejected",
            Frame::Collective { .. } => "collective",
            Frame::Gathered { .. } => "gathered",
            Frame::Leave => "leave",
        }
    }
}

/// Read a length-prefixed CBOR frame from an async stream
pub async fn read_frame<T>(io: &mut T) -> io::Result<Frame>
where
    T: AsyncRead + Unpin,
{
    // Read u32 length prefix (big-endian)
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MESSAGE_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", len, MESSAGE_SIZE_LIMIT),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    ciborium::from_reader(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a length-prefixed CBOR frame to an async stream
pub async fn write_frame<T>(io: &mut T, frame: &Frame) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    ciborium::into_writer(frame, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if buf.len() > MESSAGE_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Frame size {} exceeds limit {}",
                buf.len(),
                MESSAGE_SIZE_LIMIT
            ),
        ));
    }

    let len = buf.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frame = Frame::Join {
            token: Uuid::new_v4(),
            rank: 3,
            size: 4,
            host: "node-a".to_string(),
        };
        write_frame(&mut a, &frame).await.unwrap();
        write_frame(&mut a, &Frame::Leave).await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap(), frame);
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Leave);
    }

    #[tokio::test]
    async fn test_gathered_payloads() {
        let frame = Frame::Gathered {
            seq: 9,
            payloads: vec![vec![], vec![1, 2, 3], vec![255; 64]],
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let decoded = read_frame(&mut &buf[..]).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_rejected_carries_code() {
        let frame = Frame::Rejected {
            code: ErrorCode::Timeout,
            reason: "rendezvous deadline expired".to_string(),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        match read_frame(&mut &buf[..]).await.unwrap() {
            Frame::Rejected { code, .. } => assert_eq!(code, ErrorCode::Timeout),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_size_limit_enforcement() {
        let mut buf = Vec::new();
        let large_len: u32 = (MESSAGE_SIZE_LIMIT + 1) as u32;
        buf.extend_from_slice(&large_len.to_be_bytes());

        let result = read_frame(&mut &buf[..]).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_write_size_limit_enforcement() {
        let frame = Frame::Collective {
            seq: 0,
            tag: "all_gather".to_string(),
            payload: vec![0xAB; MESSAGE_SIZE_LIMIT],
        };

        let mut buf = Vec::new();
        let result = write_frame(&mut buf, &frame).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_malformed_cbor() {
        let mut buf = Vec::new();
        let len: u32 = 10;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&[0xFF; 10]);

        let result = read_frame(&mut &buf[..]).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_incomplete_read() {
        let mut buf = Vec::new();
        let len: u32 = 100;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x02, 0x03]);

        let result = read_frame(&mut &buf[..]).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
