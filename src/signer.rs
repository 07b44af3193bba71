/*
    signer.rs - Signing and verification of map operations

    Every authorized mutation on the signed map carries an Ed25519
    signature over the canonical bytes of its operation tuple:

        insertion: canonical_json([key, value, id])
        deletion:  canonical_json([key, id])

    The verifier is constructed once per map from the configured public
    key and format tag.
*/

use crate::canonical::canonical_json;
use crate::error::{MapError, MapResult};
use crate::id::OpId;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Signature over one map operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// Signature and key format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum KeyFormat {
    #[default]
    Ed25519,
}

/// Keypair used by a writer to authorize its own operations
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::thread_rng().gen();
        Self::from_seed(seed)
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        KeyPair { signing: SigningKey::from_bytes(&seed) }
    }

    /// Public key bytes (32 bytes)
    pub fn public_key(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }

    /// Sign an insertion of `value` at `key` under `id`
    pub fn sign_insert<V: Serialize>(&self, key: &str, value: &V, id: &OpId) -> MapResult<Signature> {
        let payload = insert_payload(key, value, id)?;
        Ok(Signature(self.signing.sign(&payload).to_bytes().to_vec()))
    }

    /// Sign a deletion of the insertion `id` at `key`
    pub fn sign_delete(&self, key: &str, id: &OpId) -> MapResult<Signature> {
        let payload = delete_payload(key, id)?;
        Ok(Signature(self.signing.sign(&payload).to_bytes().to_vec()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").finish_non_exhaustive()
    }
}

/// Validates operation signatures against one configured public key
#[derive(Debug, Clone)]
pub struct OperationVerifier {
    key: VerifyingKey,
}

impl OperationVerifier {
    pub fn new(public_key: &[u8], format: KeyFormat) -> MapResult<Self> {
        match format {
            KeyFormat::Ed25519 => {
                let bytes: [u8; 32] = public_key
                    .try_into()
                    .map_err(|_| MapError::InvalidSignature("public key must be 32 bytes".to_string()))?;
                let key = VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| MapError::InvalidSignature(format!("unusable public key: {e}")))?;
                Ok(OperationVerifier { key })
            }
        }
    }

    /// Check an insertion signature; Err only on serialization failure
    pub fn verify_insert<V: Serialize>(
        &self,
        signature: &Signature,
        key: &str,
        value: &V,
        id: &OpId,
    ) -> MapResult<bool> {
        let payload = insert_payload(key, value, id)?;
        Ok(self.check(&payload, signature))
    }

    /// Check a deletion signature
    pub fn verify_delete(&self, signature: &Signature, key: &str, id: &OpId) -> MapResult<bool> {
        let payload = delete_payload(key, id)?;
        Ok(self.check(&payload, signature))
    }

    fn check(&self, payload: &[u8], signature: &Signature) -> bool {
        let Ok(sig) = Ed25519Signature::from_slice(&signature.0) else {
            return false;
        };
        self.key.verify(payload, &sig).is_ok()
    }
}

fn insert_payload<V: Serialize>(key: &str, value: &V, id: &OpId) -> MapResult<Vec<u8>> {
    Ok(canonical_json(&(key, value, id))?.into_bytes())
}

fn delete_payload(key: &str, id: &OpId) -> MapResult<Vec<u8>> {
    Ok(canonical_json(&(key, id))?.into_bytes())
}
