//! RLPx Auth/AuthAck handshake (EIP-8 encoding).
//!
//! The initiator sends an ECIES-sealed Auth carrying a signature that lets
//! the responder recover the initiator's ephemeral key; the responder
//! answers with a sealed AuthAck carrying its own ephemeral key. Both sides
//! then derive identical [`Secrets`] with egress and ingress swapped.
//!
//! Each handshake object is consumed by secret derivation, so ephemeral
//! keys and nonces do not outlive the handshake.

use k256::ecdsa::SigningKey;
use k256::PublicKey;
use rand::{CryptoRng, Rng, RngCore};
use sha3::{Digest, Keccak256};

use ethspv_protocol::rlp::{self, Encodable, Rlp};
use ethspv_protocol::{NodeId, Secrets, CURRENT_PARAMS};

use crate::identity::NodeKey;
use crate::{
    ecdh_x, ecies, keccak_concat, node_id_from_public_key, public_key_from_node_id, recover,
    sign_recoverable, CryptoError,
};

const NONCE_LEN: usize = 32;

/// Random padding appended to EIP-8 handshake bodies.
const MIN_PADDING: usize = 100;
const MAX_PADDING: usize = 300;

fn random_nonce<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    nonce
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// RLP body plus random padding, sealed to `recipient`.
fn seal_padded<R: RngCore + CryptoRng>(
    body: &Rlp,
    recipient: &PublicKey,
    rng: &mut R,
) -> Result<Vec<u8>, CryptoError> {
    let mut plaintext = body.encoded();
    let padding = rng.gen_range(MIN_PADDING..MAX_PADDING);
    let start = plaintext.len();
    plaintext.resize(start + padding, 0);
    rng.fill_bytes(&mut plaintext[start..]);
    ecies::seal(&plaintext, recipient, rng)
}

/// Open a sealed handshake body and strip its padding.
fn open_padded(packet: &[u8], key: &SigningKey) -> Result<Rlp, CryptoError> {
    let plaintext = ecies::open(packet, key)?;
    let (item, _) = rlp::decode(&plaintext)?;
    Ok(item)
}

fn fixed<const N: usize>(item: &Rlp, what: &str) -> Result<[u8; N], CryptoError> {
    item.as_fixed::<N>()
        .map_err(|e| CryptoError::Handshake(format!("{what}: {e}")))
}

/// Both sides' contributions, in initiator/responder order.
struct Transcript<'a> {
    initiator_nonce: &'a [u8; NONCE_LEN],
    responder_nonce: &'a [u8; NONCE_LEN],
    auth_packet: &'a [u8],
    ack_packet: &'a [u8],
}

fn derive_secrets(
    ephemeral: &SigningKey,
    remote_ephemeral: &PublicKey,
    transcript: &Transcript<'_>,
    initiator: bool,
) -> Secrets {
    let ephemeral_shared = ecdh_x(ephemeral, remote_ephemeral);
    let nonce_hash = keccak_concat(&[
        &transcript.responder_nonce[..],
        &transcript.initiator_nonce[..],
    ]);
    let shared = keccak_concat(&[&ephemeral_shared[..], &nonce_hash[..]]);
    let aes = keccak_concat(&[&ephemeral_shared[..], &shared[..]]);
    let mac = keccak_concat(&[&ephemeral_shared[..], &aes[..]]);
    let token = keccak_concat(&[&shared[..]]);

    let mut initiator_egress = Keccak256::new();
    initiator_egress.update(xor32(&mac, transcript.responder_nonce));
    initiator_egress.update(transcript.auth_packet);

    let mut initiator_ingress = Keccak256::new();
    initiator_ingress.update(xor32(&mac, transcript.initiator_nonce));
    initiator_ingress.update(transcript.ack_packet);

    let (egress_mac, ingress_mac) = if initiator {
        (initiator_egress, initiator_ingress)
    } else {
        (initiator_ingress, initiator_egress)
    };

    Secrets {
        aes,
        mac,
        egress_mac,
        ingress_mac,
        token,
    }
}

// ============================================================================
// Initiator
// ============================================================================

/// Dialing side of the handshake.
pub struct Initiator {
    static_key: SigningKey,
    remote_id: NodeId,
    ephemeral: SigningKey,
    nonce: [u8; NONCE_LEN],
    auth_packet: Vec<u8>,
}

impl Initiator {
    /// Prepare the Auth packet for `remote`.
    pub fn new<R: RngCore + CryptoRng>(
        local: &NodeKey,
        remote_id: NodeId,
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        let remote_public = public_key_from_node_id(&remote_id)?;
        let ephemeral = SigningKey::random(rng);
        let nonce = random_nonce(rng);

        let static_shared = ecdh_x(local.signing_key(), &remote_public);
        let signature = sign_recoverable(&ephemeral, &xor32(&static_shared, &nonce))?;

        let body = Rlp::list(vec![
            signature.to_rlp(),
            local.node_id().to_rlp(),
            nonce.to_rlp(),
            CURRENT_PARAMS.handshake_version.to_rlp(),
        ]);
        let auth_packet = seal_padded(&body, &remote_public, rng)?;

        tracing::debug!(remote = %remote_id, size = auth_packet.len(), "handshake: auth prepared");
        Ok(Self {
            static_key: local.signing_key().clone(),
            remote_id,
            ephemeral,
            nonce,
            auth_packet,
        })
    }

    /// Bytes to write to the socket, prefix included.
    pub fn auth_packet(&self) -> &[u8] {
        &self.auth_packet
    }

    pub fn remote_id(&self) -> NodeId {
        self.remote_id
    }

    /// Consume the responder's AuthAck and derive the session secrets.
    pub fn finish(self, ack_packet: &[u8]) -> Result<Secrets, CryptoError> {
        let ack = open_padded(ack_packet, &self.static_key)?;
        let f = ack.fields(3)?;
        let remote_ephemeral_id = NodeId(fixed::<64>(&f[0], "ack ephemeral key")?);
        let responder_nonce = fixed::<NONCE_LEN>(&f[1], "ack nonce")?;
        let remote_ephemeral = public_key_from_node_id(&remote_ephemeral_id)?;

        let transcript = Transcript {
            initiator_nonce: &self.nonce,
            responder_nonce: &responder_nonce,
            auth_packet: &self.auth_packet,
            ack_packet,
        };
        tracing::debug!(remote = %self.remote_id, "handshake: ack accepted");
        Ok(derive_secrets(&self.ephemeral, &remote_ephemeral, &transcript, true))
    }
}

// ============================================================================
// Responder
// ============================================================================

/// Listening side of the handshake.
pub struct Responder {
    remote_id: NodeId,
    ephemeral: SigningKey,
    nonce: [u8; NONCE_LEN],
    remote_ephemeral: PublicKey,
    remote_nonce: [u8; NONCE_LEN],
    auth_packet: Vec<u8>,
    ack_packet: Vec<u8>,
}

impl Responder {
    /// Verify an incoming Auth packet and prepare the AuthAck.
    pub fn accept<R: RngCore + CryptoRng>(
        local: &NodeKey,
        auth_packet: Vec<u8>,
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        let auth = open_padded(&auth_packet, local.signing_key())?;
        let f = auth.fields(4)?;
        let signature = fixed::<65>(&f[0], "auth signature")?;
        let remote_id = NodeId(fixed::<64>(&f[1], "auth public key")?);
        let remote_nonce = fixed::<NONCE_LEN>(&f[2], "auth nonce")?;
        let version = f[3].as_u64()?;
        if version < CURRENT_PARAMS.handshake_version {
            tracing::debug!(remote = %remote_id, version, "handshake: older auth version");
        }

        let remote_public = public_key_from_node_id(&remote_id)?;
        let static_shared = ecdh_x(local.signing_key(), &remote_public);
        let remote_ephemeral = recover(&signature, &xor32(&static_shared, &remote_nonce))
            .map_err(|_| CryptoError::Handshake("auth signature does not recover".into()))?;

        let ephemeral = SigningKey::random(rng);
        let nonce = random_nonce(rng);
        let ephemeral_id = node_id_from_public_key(&PublicKey::from(ephemeral.verifying_key()));
        let body = Rlp::list(vec![
            ephemeral_id.to_rlp(),
            nonce.to_rlp(),
            CURRENT_PARAMS.handshake_version.to_rlp(),
        ]);
        let ack_packet = seal_padded(&body, &remote_public, rng)?;

        tracing::debug!(remote = %remote_id, "handshake: auth accepted");
        Ok(Self {
            remote_id,
            ephemeral,
            nonce,
            remote_ephemeral,
            remote_nonce,
            auth_packet,
            ack_packet,
        })
    }

    /// Bytes to write back to the initiator.
    pub fn ack_packet(&self) -> &[u8] {
        &self.ack_packet
    }

    pub fn remote_id(&self) -> NodeId {
        self.remote_id
    }

    pub fn finish(self) -> Secrets {
        let transcript = Transcript {
            initiator_nonce: &self.remote_nonce,
            responder_nonce: &self.nonce,
            auth_packet: &self.auth_packet,
            ack_packet: &self.ack_packet,
        };
        derive_secrets(&self.ephemeral, &self.remote_ephemeral, &transcript, false)
    }
}
