//! ECIES envelopes over secp256k1.
//!
//! ```text
//! prefix(2, u16_be) || ephemeral_pub(65) || iv(16) || ciphertext || tag(32)
//! ```
//!
//! The prefix counts everything after itself and is authenticated together
//! with the IV and ciphertext: `tag = HMAC-SHA256(mac_key, iv || c || prefix)`.
//! Keys come from ConcatKDF-SHA256 over the ECDH x coordinate.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use rand::{CryptoRng, RngCore};
use ring::hmac;

use crate::{ecdh_x, sha256, CryptoError};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

const PREFIX_LEN: usize = 2;
const PUBLIC_KEY_LEN: usize = 65;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Bytes an envelope adds around its plaintext.
pub const OVERHEAD: usize = PREFIX_LEN + PUBLIC_KEY_LEN + IV_LEN + TAG_LEN;

/// NIST SP 800-56 concatenation KDF with SHA-256, counter from 1, empty
/// shared info.
fn concat_kdf(shared: &[u8; 32], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut input = Vec::with_capacity(4 + shared.len());
        input.extend_from_slice(&counter.to_be_bytes());
        input.extend_from_slice(shared);
        out.extend_from_slice(&sha256(&input));
        counter += 1;
    }
    out.truncate(len);
    out
}

/// Encryption key and HMAC key for one envelope.
fn derive_keys(shared: &[u8; 32]) -> ([u8; 16], hmac::Key) {
    let material = concat_kdf(shared, 32);
    let mut enc_key = [0u8; 16];
    enc_key.copy_from_slice(&material[..16]);
    let mac_key = sha256(&material[16..32]);
    (enc_key, hmac::Key::new(hmac::HMAC_SHA256, &mac_key))
}

fn authenticated_data(iv: &[u8], ciphertext: &[u8], prefix: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(iv.len() + ciphertext.len() + prefix.len());
    data.extend_from_slice(iv);
    data.extend_from_slice(ciphertext);
    data.extend_from_slice(prefix);
    data
}

/// Encrypt `plaintext` to `recipient`.
pub fn seal<R: RngCore + CryptoRng>(
    plaintext: &[u8],
    recipient: &PublicKey,
    rng: &mut R,
) -> Result<Vec<u8>, CryptoError> {
    let body_len = PUBLIC_KEY_LEN + IV_LEN + plaintext.len() + TAG_LEN;
    let prefix = u16::try_from(body_len)
        .map_err(|_| CryptoError::MalformedEnvelope(format!("payload too large: {body_len}")))?
        .to_be_bytes();

    let ephemeral = SigningKey::random(rng);
    let shared = ecdh_x(&ephemeral, recipient);
    let (enc_key, mac_key) = derive_keys(&shared);

    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes128Ctr::new(GenericArray::from_slice(&enc_key), GenericArray::from_slice(&iv));
    cipher.apply_keystream(&mut ciphertext);

    let tag = hmac::sign(&mac_key, &authenticated_data(&iv, &ciphertext, &prefix));

    let ephemeral_pub = PublicKey::from(ephemeral.verifying_key()).to_encoded_point(false);

    let mut out = Vec::with_capacity(PREFIX_LEN + body_len);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(tag.as_ref());
    Ok(out)
}

/// Decrypt an envelope with the recipient's key. Fails closed: any
/// structural or MAC error yields no plaintext.
pub fn open(envelope: &[u8], key: &SigningKey) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < OVERHEAD {
        return Err(CryptoError::MalformedEnvelope(format!(
            "envelope too short: {} bytes",
            envelope.len()
        )));
    }
    let (prefix, body) = envelope.split_at(PREFIX_LEN);
    let declared = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    if declared != body.len() {
        return Err(CryptoError::MalformedEnvelope(format!(
            "length prefix {declared} does not match {} bytes",
            body.len()
        )));
    }

    let (ephemeral_pub, rest) = body.split_at(PUBLIC_KEY_LEN);
    let (iv, rest) = rest.split_at(IV_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

    let ephemeral =
        PublicKey::from_sec1_bytes(ephemeral_pub).map_err(|_| CryptoError::InvalidPublicKey)?;
    let shared = ecdh_x(key, &ephemeral);
    let (enc_key, mac_key) = derive_keys(&shared);

    hmac::verify(&mac_key, &authenticated_data(iv, ciphertext, prefix), tag)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes128Ctr::new(GenericArray::from_slice(&enc_key), GenericArray::from_slice(iv));
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// Total envelope length announced by its 2-byte prefix.
pub fn envelope_len(prefix: [u8; 2]) -> usize {
    PREFIX_LEN + u16::from_be_bytes(prefix) as usize
}
