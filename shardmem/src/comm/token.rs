use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::errors::ShardMemError;

/// Encoded token length: `uuid[16] | ip[16] | port[2]`
pub const TOKEN_BYTES: usize = 34;

/// Identity of one communicator-formation attempt.
///
/// Carries a random id and the address of the rendezvous root that was
/// started when the token was generated. Distributed out of band as hex text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezvousToken {
    id: Uuid,
    root: SocketAddr,
}

impl RendezvousToken {
    pub(crate) fn new(root: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            root,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address of the rendezvous root
    pub fn root(&self) -> SocketAddr {
        self.root
    }

    pub fn to_bytes(&self) -> [u8; TOKEN_BYTES] {
        let mut out = [0u8; TOKEN_BYTES];
        out[..16].copy_from_slice(self.id.as_bytes());

        let ip = match self.root.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        out[16..32].copy_from_slice(&ip.octets());
        out[32..].copy_from_slice(&self.root.port().to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShardMemError> {
        if bytes.len() != TOKEN_BYTES {
            return Err(ShardMemError::InvalidInput(format!(
                "rendezvous token must be {} bytes, got {}",
                TOKEN_BYTES,
                bytes.len()
            )));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[..16]);
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&bytes[16..32]);
        let port = u16::from_be_bytes([bytes[32], bytes[33]]);

        let ip = Ipv6Addr::from(ip);
        let ip = match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip),
        };

        Ok(Self {
            id: Uuid::from_bytes(id),
            root: SocketAddr::new(ip, port),
        })
    }
}

impl Display for RendezvousToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl FromStr for RendezvousToken {
    type Err = ShardMemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ShardMemError::InvalidInput(format!("malformed rendezvous token: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for RendezvousToken {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RendezvousToken {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn test_text_roundtrip_ipv4() {
        let token = RendezvousToken::new("127.0.0.1:40123".parse().unwrap());
        let text = token.to_string();
        assert_eq!(text.len(), TOKEN_BYTES * 2);

        let parsed: RendezvousToken = text.parse().unwrap();
        assert_eq!(parsed, token);
        assert!(parsed.root().is_ipv4());
    }

    #[test]
    fn test_ipv6_root() {
        let token = RendezvousToken::new("[::1]:9000".parse().unwrap());
        let parsed = RendezvousToken::from_bytes(&token.to_bytes()).unwrap();
        assert_eq!(parsed.root(), "[::1]:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_tokens_are_unique() {
        let root: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert_ne!(RendezvousToken::new(root).id(), RendezvousToken::new(root).id());
    }

    #[test]
    fn test_malformed_token() {
        let err = "zz".parse::<RendezvousToken>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let err = "abcd".parse::<RendezvousToken>().unwrap_err();
        assert!(err.to_string().contains("34 bytes"));
    }

    #[test]
    fn test_serde_as_text() {
        let token = RendezvousToken::new("10.0.0.5:7000".parse().unwrap());
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, format!("\"{}\"", token));
        let back: RendezvousToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }
}
