//! Signed discovery packet envelope.
//!
//! ```text
//! hash(32) || signature(65) || kind(1) || rlp(body)
//! signature = sign(keccak(kind || body))
//! hash      = keccak(signature || kind || body)
//! ```
//!
//! The sender is identified by recovering the signing key, so packets carry
//! no separate identity field.

use ethspv_protocol::discovery::{check_expiration, DiscoveryBody};
use ethspv_protocol::{NodeId, H256};

use crate::identity::NodeKey;
use crate::{keccak_concat, node_id_from_public_key, recover, CryptoError, SIGNATURE_LENGTH};

const HASH_LEN: usize = 32;
const HEADER_LEN: usize = HASH_LEN + SIGNATURE_LENGTH + 1;

/// Largest datagram the discovery protocol sends or accepts.
pub const MAX_PACKET_SIZE: usize = 1280;

/// A verified inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPacket {
    pub hash: H256,
    pub sender: NodeId,
    pub body: DiscoveryBody,
}

/// Sign and frame a discovery body. Returns the datagram and its hash, which
/// a Pong must echo.
pub fn seal_packet(key: &NodeKey, body: &DiscoveryBody) -> Result<(Vec<u8>, H256), CryptoError> {
    let mut signed = vec![body.kind()];
    signed.extend_from_slice(&body.encode());

    let signature = key.sign(&keccak_concat(&[&signed[..]]))?;
    let hash = keccak_concat(&[&signature[..], &signed[..]]);

    let mut packet = Vec::with_capacity(HEADER_LEN + signed.len() - 1);
    packet.extend_from_slice(&hash);
    packet.extend_from_slice(&signature);
    packet.extend_from_slice(&signed);
    Ok((packet, H256(hash)))
}

/// Verify the hash, recover the sender, decode the body and reject it if
/// expired relative to `now` (Unix seconds).
pub fn open_packet(packet: &[u8], now: u64) -> Result<OpenedPacket, CryptoError> {
    if packet.len() <= HEADER_LEN {
        return Err(CryptoError::MalformedEnvelope(format!(
            "discovery packet too short: {} bytes",
            packet.len()
        )));
    }
    if packet.len() > MAX_PACKET_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "discovery packet too large: {} bytes",
            packet.len()
        )));
    }

    let (hash, rest) = packet.split_at(HASH_LEN);
    if keccak_concat(&[rest]) != hash {
        return Err(CryptoError::HashMismatch);
    }

    let (signature, signed) = rest.split_at(SIGNATURE_LENGTH);
    let public = recover(signature, &keccak_concat(&[signed]))?;
    let sender = node_id_from_public_key(&public);

    let body = DiscoveryBody::decode(signed[0], &signed[1..])?;
    check_expiration(body.expiration(), now)?;

    Ok(OpenedPacket {
        hash: H256::from_slice(hash),
        sender,
        body,
    })
}
