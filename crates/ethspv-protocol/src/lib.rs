//! ethspv protocol -- wire types, codecs and message families.
//!
//! TCP sessions carry RLPx frames (AES-256-CTR + keccak MAC) holding
//! DevP2P base messages and LES capability messages.
//! Discovery runs over UDP with signed RLP packets.
//! RLP is the encoding underneath all of it.

pub mod capability;
pub mod discovery;
pub mod frame;
pub mod header;
pub mod messages;
pub mod params;
pub mod rlp;

use std::fmt;

use sha3::{Digest, Keccak256};

pub use capability::Capability;
pub use frame::{FrameCodec, RawMessage, Secrets};
pub use header::{AccountState, BlockHeader};
pub use params::{ProtocolParams, CURRENT_PARAMS, LES_V2_PARAMS};
pub use primitive_types::{H256, U256};
pub use rlp::{Encodable, Rlp, RlpError};

/// Node identifier: the 64-byte uncompressed secp256k1 public key without
/// its SEC1 prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 64]);

impl NodeId {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let fixed: [u8; 64] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidField(format!("node id must be 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(fixed))
    }

    pub fn from_hex(text: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(text)
            .map_err(|e| ProtocolError::InvalidField(format!("node id hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    /// Abbreviated form for logs: first and last four bytes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            hex::encode(&self.0[..4]),
            hex::encode(&self.0[60..])
        )
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl Encodable for NodeId {
    fn to_rlp(&self) -> Rlp {
        Rlp::String(self.0.to_vec())
    }
}

/// Keccak-256 (the pre-standard SHA-3 variant used throughout the protocol).
pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("rlp error: {0}")]
    Rlp(#[from] RlpError),
    #[error("frame MAC mismatch")]
    MacMismatch,
    #[error("frame error: {0}")]
    Frame(String),
    #[error("unknown message code {0:#04x}")]
    UnknownMessage(u64),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("packet expired at {expiration} (now {now})")]
    Expired { expiration: u64, now: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error means the peer sent forged or corrupted ciphertext.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, ProtocolError::MacMismatch)
    }
}
