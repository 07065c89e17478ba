//! Discovery packet bodies, endpoints and node addressing.
//!
//! The signed envelope around these bodies lives in the crypto crate; this
//! module only knows the RLP shapes, the expiration rule and the textual
//! forms nodes are written in (dotted quads and enode URLs).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use primitive_types::H256;

use crate::rlp::{self, Encodable, Rlp};
use crate::{NodeId, ProtocolError};

pub const PING: u8 = 0x01;
pub const PONG: u8 = 0x02;
pub const FIND_NODE: u8 = 0x03;
pub const NEIGHBORS: u8 = 0x04;

/// Discovery protocol version carried in Ping.
pub const DISCOVERY_VERSION: u64 = 4;

// ============================================================================
// Host codec
// ============================================================================

/// Parse a dotted-quad host. Exactly four parts, each a decimal octet
/// written without leading zeros, so the text round-trips through
/// [`encode_host`].
pub fn decode_host(text: &str) -> Option<[u8; 4]> {
    let mut out = [0u8; 4];
    let mut parts = text.split('.');
    for slot in out.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if part.len() > 1 && part.starts_with('0') {
            return None;
        }
        *slot = part.parse::<u8>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Render four bytes as a dotted quad; anything but four bytes has no form.
pub fn encode_host(bytes: &[u8]) -> Option<String> {
    let [a, b, c, d]: [u8; 4] = bytes.try_into().ok()?;
    Some(format!("{a}.{b}.{c}.{d}"))
}

// ============================================================================
// Expiration
// ============================================================================

/// Expiration `secs` from `now`, as carried on the wire.
pub fn expiration_after(now: u64, secs: u64) -> u64 {
    now.saturating_add(secs)
}

/// Reject a packet whose expiration has already elapsed.
pub fn check_expiration(expiration: u64, now: u64) -> Result<(), ProtocolError> {
    if expiration < now {
        return Err(ProtocolError::Expired { expiration, now });
    }
    Ok(())
}

/// Expirations always travel as a 4-byte big-endian string.
fn expiration_rlp(expiration: u64) -> Rlp {
    let clamped = u32::try_from(expiration).unwrap_or(u32::MAX);
    Rlp::String(clamped.to_be_bytes().to_vec())
}

// ============================================================================
// Endpoints and nodes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: [u8; 4],
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn new(ip: [u8; 4], udp_port: u16, tcp_port: u16) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.ip), self.udp_port))
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.ip), self.tcp_port))
    }

    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(3)?;
        Ok(Self {
            ip: f[0].as_fixed()?,
            udp_port: f[1].as_u16()?,
            tcp_port: f[2].as_u16()?,
        })
    }
}

impl Encodable for Endpoint {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.ip.to_rlp(),
            self.udp_port.to_rlp(),
            self.tcp_port.to_rlp(),
        ])
    }
}

/// A reachable node: identity plus its discovery and session ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl Node {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self { id, endpoint }
    }

    /// Parse `enode://<hex id>@<a.b.c.d>:<tcp port>[?discport=<udp port>]`.
    pub fn from_enode(url: &str) -> Result<Self, ProtocolError> {
        let invalid = |what: &str| ProtocolError::InvalidField(format!("enode {what}: {url}"));

        let rest = url.strip_prefix("enode://").ok_or_else(|| invalid("scheme"))?;
        let (id_hex, address) = rest.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
        let id = NodeId::from_hex(id_hex)?;

        let (host_port, query) = match address.split_once('?') {
            Some((hp, q)) => (hp, Some(q)),
            None => (address, None),
        };
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let ip = decode_host(host).ok_or_else(|| invalid("host"))?;
        let tcp_port: u16 = port.parse().map_err(|_| invalid("port"))?;

        let mut udp_port = tcp_port;
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("discport=") {
                    udp_port = value.parse().map_err(|_| invalid("discport"))?;
                }
            }
        }

        Ok(Self::new(id, Endpoint::new(ip, udp_port, tcp_port)))
    }

    pub fn to_enode(&self) -> String {
        let host = encode_host(&self.endpoint.ip).unwrap_or_default();
        let mut url = format!(
            "enode://{}@{}:{}",
            self.id.to_hex(),
            host,
            self.endpoint.tcp_port
        );
        if self.endpoint.udp_port != self.endpoint.tcp_port {
            url.push_str(&format!("?discport={}", self.endpoint.udp_port));
        }
        url
    }

    fn decode(item: &Rlp) -> Result<Self, ProtocolError> {
        let f = item.fields(4)?;
        Ok(Self {
            endpoint: Endpoint {
                ip: f[0].as_fixed()?,
                udp_port: f[1].as_u16()?,
                tcp_port: f[2].as_u16()?,
            },
            id: NodeId::from_slice(f[3].as_bytes()?)?,
        })
    }
}

impl Encodable for Node {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.endpoint.ip.to_rlp(),
            self.endpoint.udp_port.to_rlp(),
            self.endpoint.tcp_port.to_rlp(),
            self.id.to_rlp(),
        ])
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint.udp_addr())
    }
}

// ============================================================================
// Packet bodies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingBody {
    pub version: u64,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongBody {
    pub to: Endpoint,
    /// Hash of the Ping packet being answered.
    pub ping_hash: H256,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeBody {
    pub target: NodeId,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborsBody {
    pub nodes: Vec<Node>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryBody {
    Ping(PingBody),
    Pong(PongBody),
    FindNode(FindNodeBody),
    Neighbors(NeighborsBody),
}

impl DiscoveryBody {
    pub fn kind(&self) -> u8 {
        match self {
            DiscoveryBody::Ping(_) => PING,
            DiscoveryBody::Pong(_) => PONG,
            DiscoveryBody::FindNode(_) => FIND_NODE,
            DiscoveryBody::Neighbors(_) => NEIGHBORS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryBody::Ping(_) => "ping",
            DiscoveryBody::Pong(_) => "pong",
            DiscoveryBody::FindNode(_) => "find_node",
            DiscoveryBody::Neighbors(_) => "neighbors",
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            DiscoveryBody::Ping(b) => b.expiration,
            DiscoveryBody::Pong(b) => b.expiration,
            DiscoveryBody::FindNode(b) => b.expiration,
            DiscoveryBody::Neighbors(b) => b.expiration,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let item = match self {
            DiscoveryBody::Ping(b) => Rlp::list(vec![
                b.version.to_rlp(),
                b.from.to_rlp(),
                b.to.to_rlp(),
                expiration_rlp(b.expiration),
            ]),
            DiscoveryBody::Pong(b) => Rlp::list(vec![
                b.to.to_rlp(),
                b.ping_hash.to_rlp(),
                expiration_rlp(b.expiration),
            ]),
            DiscoveryBody::FindNode(b) => {
                Rlp::list(vec![b.target.to_rlp(), expiration_rlp(b.expiration)])
            }
            DiscoveryBody::Neighbors(b) => Rlp::list(vec![
                Rlp::list(b.nodes.iter().map(Encodable::to_rlp).collect()),
                expiration_rlp(b.expiration),
            ]),
        };
        item.encoded()
    }

    /// Decode a body of the given kind. Extra trailing list fields are
    /// tolerated for forward compatibility.
    pub fn decode(kind: u8, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (item, _) = rlp::decode(bytes)?;
        match kind {
            PING => {
                let f = item.fields(4)?;
                Ok(DiscoveryBody::Ping(PingBody {
                    version: f[0].as_u64()?,
                    from: Endpoint::decode(&f[1])?,
                    to: Endpoint::decode(&f[2])?,
                    expiration: f[3].as_u64()?,
                }))
            }
            PONG => {
                let f = item.fields(3)?;
                Ok(DiscoveryBody::Pong(PongBody {
                    to: Endpoint::decode(&f[0])?,
                    ping_hash: f[1].as_h256()?,
                    expiration: f[2].as_u64()?,
                }))
            }
            FIND_NODE => {
                let f = item.fields(2)?;
                Ok(DiscoveryBody::FindNode(FindNodeBody {
                    target: NodeId::from_slice(f[0].as_bytes()?)?,
                    expiration: f[1].as_u64()?,
                }))
            }
            NEIGHBORS => {
                let f = item.fields(2)?;
                let nodes = f[0]
                    .as_list()?
                    .iter()
                    .map(Node::decode)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DiscoveryBody::Neighbors(NeighborsBody {
                    nodes,
                    expiration: f[1].as_u64()?,
                }))
            }
            other => Err(ProtocolError::UnknownMessage(u64::from(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENODE_ID: &str = "a979fb575495b8d6db44f750317d0f4622bf4c2aa3365d6af7c284339968eef29b69ad0dce72a4d8db5ebb4968de0e3bec910127f134779fbcb0cb6d3331163c";

    #[test]
    fn test_host_roundtrip() {
        let bytes = decode_host("1.2.3.4").unwrap();
        assert_eq!(bytes, [1, 2, 3, 4]);
        assert_eq!(encode_host(&bytes).unwrap(), "1.2.3.4");
    }

    #[test]
    fn test_host_rejects_malformed() {
        assert!(decode_host("12.13.14.257").is_none());
        assert!(decode_host("someError").is_none());
        assert!(decode_host("1.2.3").is_none());
        assert!(decode_host("1.2.3.4.5").is_none());
        assert!(decode_host("1..3.4").is_none());
        assert!(decode_host("").is_none());
        assert!(decode_host("01.2.3.4").is_none());
        assert!(decode_host("1.2.3.00").is_none());
        assert_eq!(decode_host("0.10.100.0"), Some([0, 10, 100, 0]));
        assert!(encode_host(&[1, 2, 3]).is_none());
        assert!(encode_host(&[1, 2, 3, 4, 5]).is_none());
    }

    #[test]
    fn test_expiration_rule() {
        assert!(check_expiration(expiration_after(1_000, 20), 1_010).is_ok());
        assert!(check_expiration(1_020, 1_020).is_ok());
        assert!(matches!(
            check_expiration(999, 1_000),
            Err(ProtocolError::Expired { expiration: 999, now: 1_000 })
        ));
    }

    #[test]
    fn test_expiration_is_four_bytes() {
        let body = DiscoveryBody::FindNode(FindNodeBody {
            target: NodeId([1u8; 64]),
            expiration: 0x10,
        });
        let item = rlp::decode_exact(&body.encode()).unwrap();
        assert_eq!(item.field(1).unwrap().as_bytes().unwrap(), &[0, 0, 0, 0x10]);
    }

    #[test]
    fn test_enode_parse() {
        let url = format!("enode://{ENODE_ID}@52.16.188.185:30303?discport=30301");
        let node = Node::from_enode(&url).unwrap();
        assert_eq!(node.endpoint.ip, [52, 16, 188, 185]);
        assert_eq!(node.endpoint.tcp_port, 30303);
        assert_eq!(node.endpoint.udp_port, 30301);
        assert_eq!(node.id.to_hex(), ENODE_ID);
        assert_eq!(node.to_enode(), url);

        let plain = Node::from_enode(&format!("enode://{ENODE_ID}@10.0.0.1:30303")).unwrap();
        assert_eq!(plain.endpoint.udp_port, 30303);
    }

    #[test]
    fn test_enode_rejects_garbage() {
        assert!(Node::from_enode("http://x@1.2.3.4:1").is_err());
        assert!(Node::from_enode(&format!("enode://{ENODE_ID}@1.2.3.4")).is_err());
        assert!(Node::from_enode(&format!("enode://{ENODE_ID}@host.example:30303")).is_err());
        assert!(Node::from_enode("enode://abcd@1.2.3.4:30303").is_err());
    }

    #[test]
    fn test_body_roundtrips() {
        let endpoint = Endpoint::new([127, 0, 0, 1], 30301, 30303);
        let bodies = vec![
            DiscoveryBody::Ping(PingBody {
                version: DISCOVERY_VERSION,
                from: endpoint,
                to: Endpoint::new([10, 0, 0, 2], 30301, 0),
                expiration: 1_700_000_000,
            }),
            DiscoveryBody::Pong(PongBody {
                to: endpoint,
                ping_hash: H256::repeat_byte(0x5a),
                expiration: 1_700_000_000,
            }),
            DiscoveryBody::Neighbors(NeighborsBody {
                nodes: vec![Node::new(NodeId([3u8; 64]), endpoint)],
                expiration: 1_700_000_000,
            }),
        ];
        for body in bodies {
            let decoded = DiscoveryBody::decode(body.kind(), &body.encode()).unwrap();
            assert_eq!(decoded, body);
        }
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            DiscoveryBody::decode(0x09, &[0xc0]),
            Err(ProtocolError::UnknownMessage(9))
        ));
    }
}
