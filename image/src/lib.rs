//! Stow Image - content-addressed image storage and trust.
//!
//! Digests and blobs, image references and their transports, OCI layout and
//! local image stores, detached manifest signatures, and a pull-through
//! proxy for remote repositories.

#![allow(clippy::result_large_err)]

pub mod blob;
pub mod digest;
pub mod manifest;
pub mod proxy;
pub mod reference;
pub mod signature;
pub mod store;
pub mod transfer;

// Re-export common types
pub use blob::{BlobInfo, BlobStore};
pub use digest::{Algorithm, Digest};
pub use manifest::Descriptor;
pub use proxy::ProxyStore;
pub use reference::{ImageRef, ImageReference, ImageTransport};
pub use reference::{ImageLookup, StorageReference, StorageTransport, StoreSpec};
pub use reference::{LayoutReference, LayoutTransport};
pub use signature::{sign_docker_manifest, verify_docker_manifest_signature};
pub use signature::{Ed25519Mechanism, SigningMechanism, UntrustedSignature, VerifiedSignature};
pub use store::{ImageStore, LayoutStore, StoredImage};
pub use transfer::{BlobStream, EvictionKey, EvictionScheduler, RegistryAuth, RegistryTransfer, RemoteTransfer};

/// Stow Image version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
