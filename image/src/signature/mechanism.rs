//! Signing mechanisms: produce and authenticate detached signatures.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::RwLock;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use stow_core::error::{Result, StowError};

use crate::digest::Digest;

/// Detached signing capability.
pub trait SigningMechanism: Send + Sync {
    /// Sign `payload` with the key identified by `key_identity`.
    fn sign(&self, payload: &[u8], key_identity: &str) -> Result<Vec<u8>>;

    /// Authenticate a signature, returning the signed payload and the
    /// identity of the key that signed it.
    fn verify(&self, signature: &[u8]) -> Result<(Vec<u8>, String)>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SignatureBlob {
    key_id: String,
    payload: String,
    signature: String,
}

struct KeyEntry {
    public: Vec<u8>,
    pkcs8: Option<Vec<u8>>,
}

/// In-process Ed25519 keyring.
///
/// Keys are identified by the hex SHA-256 fingerprint of their public key.
/// A key imported from its public half can verify but not sign.
#[derive(Default)]
pub struct Ed25519Mechanism {
    keys: RwLock<HashMap<String, KeyEntry>>,
}

impl Ed25519Mechanism {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh signing key and return its fingerprint.
    pub fn generate_key(&self) -> Result<String> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| StowError::SigningError("Failed to generate Ed25519 key".to_string()))?;
        self.import_pkcs8(pkcs8.as_ref())
    }

    /// Import a PKCS#8 v2 Ed25519 secret key.
    pub fn import_pkcs8(&self, pkcs8: &[u8]) -> Result<String> {
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| StowError::SigningError(format!("Invalid Ed25519 PKCS#8 key: {}", e)))?;
        let public = pair.public_key().as_ref().to_vec();
        let fingerprint = fingerprint(&public);
        self.keys.write().insert(
            fingerprint.clone(),
            KeyEntry {
                public,
                pkcs8: Some(pkcs8.to_vec()),
            },
        );
        tracing::debug!(fingerprint = %fingerprint, "Imported signing key");
        Ok(fingerprint)
    }

    /// Import a raw 32-byte Ed25519 public key for verification only.
    pub fn import_public_key(&self, public: &[u8]) -> Result<String> {
        if public.len() != 32 {
            return Err(StowError::SigningError(format!(
                "Ed25519 public key must be 32 bytes, got {}",
                public.len()
            )));
        }
        let fingerprint = fingerprint(public);
        self.keys
            .write()
            .entry(fingerprint.clone())
            .or_insert_with(|| KeyEntry {
                public: public.to_vec(),
                pkcs8: None,
            });
        Ok(fingerprint)
    }

    /// Raw public key for `fingerprint`.
    pub fn public_key(&self, fingerprint: &str) -> Option<Vec<u8>> {
        self.keys.read().get(fingerprint).map(|k| k.public.clone())
    }

    pub fn fingerprints(&self) -> Vec<String> {
        let mut out: Vec<String> = self.keys.read().keys().cloned().collect();
        out.sort();
        out
    }
}

impl SigningMechanism for Ed25519Mechanism {
    fn sign(&self, payload: &[u8], key_identity: &str) -> Result<Vec<u8>> {
        let keys = self.keys.read();
        let pkcs8 = keys
            .get(key_identity)
            .and_then(|k| k.pkcs8.as_deref())
            .ok_or_else(|| {
                StowError::SigningError(format!("no secret key with fingerprint {:?}", key_identity))
            })?;
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| StowError::SigningError(format!("Invalid Ed25519 key: {}", e)))?;
        let signature = pair.sign(payload);

        let blob = SignatureBlob {
            key_id: key_identity.to_string(),
            payload: STANDARD.encode(payload),
            signature: STANDARD.encode(signature.as_ref()),
        };
        Ok(serde_json::to_vec(&blob)?)
    }

    fn verify(&self, signature: &[u8]) -> Result<(Vec<u8>, String)> {
        let blob: SignatureBlob = serde_json::from_slice(signature)
            .map_err(|e| StowError::SignatureInvalid(format!("malformed signature: {}", e)))?;
        let payload = STANDARD
            .decode(&blob.payload)
            .map_err(|e| StowError::SignatureInvalid(format!("malformed payload encoding: {}", e)))?;
        let raw = STANDARD
            .decode(&blob.signature)
            .map_err(|e| StowError::SignatureInvalid(format!("malformed signature encoding: {}", e)))?;

        let public = self.public_key(&blob.key_id).ok_or_else(|| {
            StowError::SignatureInvalid(format!("signed by unknown key {:?}", blob.key_id))
        })?;
        UnparsedPublicKey::new(&ED25519, &public)
            .verify(&payload, &raw)
            .map_err(|_| {
                StowError::SignatureInvalid(format!(
                    "signature does not verify with key {}",
                    blob.key_id
                ))
            })?;

        Ok((payload, blob.key_id))
    }
}

fn fingerprint(public: &[u8]) -> String {
    Digest::compute(public).hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let mech = Ed25519Mechanism::new();
        let fp = mech.generate_key().unwrap();
        assert_eq!(fp.len(), 64);

        let sig = mech.sign(b"payload", &fp).unwrap();
        let (payload, signer) = mech.verify(&sig).unwrap();
        assert_eq!(payload, b"payload");
        assert_eq!(signer, fp);
    }

    #[test]
    fn test_sign_unknown_key() {
        let mech = Ed25519Mechanism::new();
        let err = mech.sign(b"payload", "this fingerprint doesn't exist").unwrap_err();
        assert!(matches!(err, StowError::SigningError(_)));
    }

    #[test]
    fn test_public_only_key_verifies_but_cannot_sign() {
        let signer = Ed25519Mechanism::new();
        let fp = signer.generate_key().unwrap();
        let sig = signer.sign(b"payload", &fp).unwrap();

        let verifier = Ed25519Mechanism::new();
        let imported = verifier
            .import_public_key(&signer.public_key(&fp).unwrap())
            .unwrap();
        assert_eq!(imported, fp);
        assert_eq!(verifier.verify(&sig).unwrap().1, fp);
        assert!(verifier.sign(b"payload", &fp).is_err());
    }

    #[test]
    fn test_verify_unknown_signer() {
        let signer = Ed25519Mechanism::new();
        let fp = signer.generate_key().unwrap();
        let sig = signer.sign(b"payload", &fp).unwrap();
        let err = Ed25519Mechanism::new().verify(&sig).unwrap_err();
        assert!(matches!(err, StowError::SignatureInvalid(_)));
    }

    #[test]
    fn test_verify_tampered_payload() {
        let mech = Ed25519Mechanism::new();
        let fp = mech.generate_key().unwrap();
        let sig = mech.sign(b"payload", &fp).unwrap();
        let mut blob: serde_json::Value = serde_json::from_slice(&sig).unwrap();
        blob["payload"] = serde_json::Value::String(STANDARD.encode(b"forged"));
        let err = mech.verify(&serde_json::to_vec(&blob).unwrap()).unwrap_err();
        assert!(matches!(err, StowError::SignatureInvalid(_)));
    }

    #[test]
    fn test_verify_corrupt() {
        let mech = Ed25519Mechanism::new();
        let corrupt_inputs: [&[u8]; 3] = [
            b"garbage",
            b"{}",
            br#"{"keyId":"x","payload":"!!","signature":""}"#,
        ];
        for corrupt in corrupt_inputs {
            assert!(matches!(
                mech.verify(corrupt).unwrap_err(),
                StowError::SignatureInvalid(_)
            ));
        }
    }

    #[test]
    fn test_import_pkcs8_round_trip() {
        let rng = SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let a = Ed25519Mechanism::new();
        let b = Ed25519Mechanism::new();
        assert_eq!(a.import_pkcs8(doc.as_ref()).unwrap(), b.import_pkcs8(doc.as_ref()).unwrap());
        assert!(a.import_pkcs8(b"not a key").is_err());
        assert!(a.import_public_key(&[0u8; 31]).is_err());
        assert_eq!(a.fingerprints().len(), 1);
    }
}
