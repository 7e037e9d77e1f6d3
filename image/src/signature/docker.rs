//! Signing and verifying Docker manifests.

use stow_core::error::{Result, StowError};

use super::envelope::UntrustedSignature;
use super::mechanism::SigningMechanism;
use crate::digest::Digest;
use crate::manifest;
use crate::reference::ImageReference;

/// A signature that passed every check in
/// [`verify_docker_manifest_signature`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub docker_reference: String,
    pub docker_manifest_digest: Digest,
}

/// Sign `manifest` as the image `docker_reference` using `key_identity`.
///
/// The reference must name a tag or a digest.
pub fn sign_docker_manifest(
    manifest: &[u8],
    docker_reference: &str,
    mechanism: &dyn SigningMechanism,
    key_identity: &str,
) -> Result<Vec<u8>> {
    let digest = manifest::digest(manifest)?;

    let invalid = |message: &str| StowError::InvalidReference {
        reference: docker_reference.to_string(),
        message: message.to_string(),
    };
    if docker_reference.is_empty() {
        return Err(invalid("empty reference"));
    }
    let parsed = ImageReference::parse_explicit(docker_reference)
        .map_err(|e| invalid(&e.to_string()))?;
    if parsed.is_name_only() {
        return Err(invalid("reference must include a tag or digest"));
    }

    let payload = UntrustedSignature::new(digest, docker_reference).to_json()?;
    mechanism.sign(&payload, key_identity).map_err(|e| match e {
        StowError::SigningError(_) => e,
        other => StowError::SigningError(other.to_string()),
    })
}

/// Verify that `signature` is a valid signature by `expected_key_identity`
/// of `manifest` as the image `expected_docker_reference`.
///
/// Any failure returns an error and no signature data.
pub fn verify_docker_manifest_signature(
    signature: &[u8],
    manifest: &[u8],
    expected_docker_reference: &str,
    mechanism: &dyn SigningMechanism,
    expected_key_identity: &str,
) -> Result<VerifiedSignature> {
    let digest = manifest::digest(manifest)?;

    let (payload, signer) = mechanism.verify(signature).map_err(|e| match e {
        StowError::SignatureInvalid(_) => e,
        other => StowError::SignatureInvalid(other.to_string()),
    })?;
    let claims = UntrustedSignature::from_json(&payload)?;

    if signer != expected_key_identity {
        tracing::warn!(expected = %expected_key_identity, actual = %signer, "Signature key mismatch");
        return Err(StowError::KeyMismatch {
            expected: expected_key_identity.to_string(),
            actual: signer,
        });
    }
    if claims.docker_reference != expected_docker_reference {
        tracing::warn!(
            expected = %expected_docker_reference,
            actual = %claims.docker_reference,
            "Signature reference mismatch"
        );
        return Err(StowError::ReferenceMismatch {
            expected: expected_docker_reference.to_string(),
            actual: claims.docker_reference,
        });
    }
    if !manifest::matches_digest(manifest, &claims.docker_manifest_digest)? {
        tracing::warn!(
            signed = %claims.docker_manifest_digest,
            actual = %digest,
            "Signature manifest digest mismatch"
        );
        return Err(StowError::DigestMismatch {
            expected: claims.docker_manifest_digest.to_string(),
            actual: digest.to_string(),
        });
    }

    Ok(VerifiedSignature {
        docker_reference: claims.docker_reference,
        docker_manifest_digest: claims.docker_manifest_digest,
    })
}
