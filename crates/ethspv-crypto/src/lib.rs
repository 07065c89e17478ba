//! ethspv crypto -- secp256k1 identity, ECIES envelopes, RLPx handshake and
//! discovery packet signing.
//!
//! Node ids are 64-byte uncompressed public keys without the SEC1 prefix.
//! Inside ECIES envelopes the 65-byte `0x04 || x || y` form is used.
//! All randomness is drawn from a caller-supplied `RngCore + CryptoRng`.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use ring::digest;

use ethspv_protocol::{NodeId, ProtocolError, RlpError};

pub mod ecies;
pub mod handshake;
pub mod identity;
pub mod packet;

// Re-exports
pub use handshake::{Initiator, Responder};
pub use identity::NodeKey;
pub use packet::{open_packet, seal_packet, OpenedPacket};

/// Length of a recoverable signature: `r || s || v`.
pub const SIGNATURE_LENGTH: usize = 65;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("decryption failed: MAC mismatch")]
    DecryptionFailed,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("packet hash mismatch")]
    HashMismatch,
    #[error("rlp error: {0}")]
    Rlp(#[from] RlpError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("identity error: {0}")]
    IdentityError(String),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Parse a 64-byte node id back into a curve point.
pub fn public_key_from_node_id(id: &NodeId) -> Result<PublicKey, CryptoError> {
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(id.as_bytes());
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Node id of a public key: the uncompressed point minus its prefix byte.
pub fn node_id_from_public_key(key: &PublicKey) -> NodeId {
    let point = key.to_encoded_point(false);
    let mut id = [0u8; 64];
    id.copy_from_slice(&point.as_bytes()[1..]);
    NodeId(id)
}

/// x coordinate of the ECDH shared point.
pub fn ecdh_x(secret: &SigningKey, public: &PublicKey) -> [u8; 32] {
    let shared = k256::ecdh::diffie_hellman(secret.as_nonzero_scalar(), public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    out
}

/// Sign a 32-byte digest, returning `r || s || v` with `v` in `0..=3`.
pub fn sign_recoverable(
    key: &SigningKey,
    prehash: &[u8; 32],
) -> Result<[u8; SIGNATURE_LENGTH], CryptoError> {
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(prehash)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let mut out = [0u8; SIGNATURE_LENGTH];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte();
    Ok(out)
}

/// Recover the signer of a 32-byte digest from an `r || s || v` signature.
pub fn recover(signature: &[u8], prehash: &[u8; 32]) -> Result<PublicKey, CryptoError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(CryptoError::InvalidSignature);
    }
    let sig = Signature::from_slice(&signature[..64]).map_err(|_| CryptoError::InvalidSignature)?;
    let recovery_id =
        RecoveryId::from_byte(signature[64]).ok_or(CryptoError::InvalidSignature)?;
    let verifying = VerifyingKey::recover_from_prehash(prehash, &sig, recovery_id)
        .map_err(|_| CryptoError::InvalidSignature)?;
    Ok(PublicKey::from(&verifying))
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let d = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    out
}

/// Keccak-256 over several slices, as one message.
pub(crate) fn keccak_concat(parts: &[&[u8]]) -> [u8; 32] {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}
