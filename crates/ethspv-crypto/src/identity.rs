//! secp256k1 node key -- generation, loading, signing and key agreement.
//!
//! The key file holds the 32-byte secret as hex on a single line.

use std::path::Path;

use k256::ecdsa::SigningKey;
use k256::PublicKey;
use rand::{CryptoRng, RngCore};

use ethspv_protocol::NodeId;

use crate::{ecdh_x, node_id_from_public_key, public_key_from_node_id, sign_recoverable};
use crate::{CryptoError, SIGNATURE_LENGTH};

/// Node identity wrapping a secp256k1 signing key.
#[derive(Clone)]
pub struct NodeKey {
    secret: SigningKey,
    public: PublicKey,
    node_id: NodeId,
}

impl NodeKey {
    /// Generate a new random key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_signing_key(SigningKey::random(rng))
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::from_signing_key(secret))
    }

    fn from_signing_key(secret: SigningKey) -> Self {
        let public = PublicKey::from(secret.verifying_key());
        let node_id = node_id_from_public_key(&public);
        Self {
            secret,
            public,
            node_id,
        }
    }

    /// Load a hex key file.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let text = std::fs::read_to_string(path)?;
        let bytes = hex::decode(text.trim())
            .map_err(|e| CryptoError::IdentityError(format!("key file {}: {e}", path.display())))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Load or create the key at path.
    pub fn load_or_create<R: RngCore + CryptoRng>(
        path: &Path,
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let key = Self::generate(rng);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, format!("{}\n", hex::encode(key.secret.to_bytes())))?;
            tracing::info!(node_id = %key.node_id, path = %path.display(), "identity: generated node key");
            Ok(key)
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }

    /// Sign a 32-byte digest as `r || s || v`.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_LENGTH], CryptoError> {
        sign_recoverable(&self.secret, digest)
    }

    /// x coordinate of ECDH with the given node.
    pub fn agree(&self, remote: &NodeId) -> Result<[u8; 32], CryptoError> {
        let public = public_key_from_node_id(remote)?;
        Ok(ecdh_x(&self.secret, &public))
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generate_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let key = NodeKey::generate(&mut rng);
        assert_eq!(public_key_from_node_id(&key.node_id()).unwrap(), *key.public_key());
    }

    #[test]
    fn test_load_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");
        let mut rng = StdRng::seed_from_u64(8);

        let k1 = NodeKey::load_or_create(&path, &mut rng).unwrap();
        let k2 = NodeKey::load_or_create(&path, &mut rng).unwrap();
        assert_eq!(k1.node_id(), k2.node_id());
    }

    #[test]
    fn test_bad_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(matches!(
            NodeKey::from_file(&path),
            Err(CryptoError::IdentityError(_))
        ));

        std::fs::write(&path, hex::encode([0u8; 32])).unwrap();
        assert!(matches!(
            NodeKey::from_file(&path),
            Err(CryptoError::InvalidSecretKey)
        ));
    }

    #[test]
    fn test_agree_matches_peer() {
        let mut rng = StdRng::seed_from_u64(9);
        let a = NodeKey::generate(&mut rng);
        let b = NodeKey::generate(&mut rng);
        assert_eq!(a.agree(&b.node_id()).unwrap(), b.agree(&a.node_id()).unwrap());
    }

    #[test]
    fn test_debug_hides_secret() {
        let mut rng = StdRng::seed_from_u64(10);
        let key = NodeKey::generate(&mut rng);
        let text = format!("{key:?}");
        assert!(text.contains("node_id"));
        assert!(!text.contains(&hex::encode(key.secret.to_bytes())));
    }
}
