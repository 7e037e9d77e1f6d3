//! Detached manifest signatures.
//!
//! A signature binds a Docker reference to a manifest digest. Verification
//! authenticates the signature, then checks the signer, the reference and
//! the manifest bytes; only when all agree is a [`VerifiedSignature`] returned.

mod docker;
mod envelope;
mod mechanism;

pub use docker::{sign_docker_manifest, verify_docker_manifest_signature, VerifiedSignature};
pub use envelope::UntrustedSignature;
pub use mechanism::{Ed25519Mechanism, SigningMechanism};
