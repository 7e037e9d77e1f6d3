//! Remote transfer capability and cache eviction scheduling.
//!
//! [`RemoteTransfer`] is what the pull-through proxy needs from an upstream:
//! fetch and push manifests and blobs of one repository. [`RegistryTransfer`]
//! implements it against a distribution registry with `oci-distribution`.

use std::time::Duration;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use stow_core::error::{Result, StowError};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::digest::Digest;
use crate::manifest;
use crate::reference::ImageReference;

/// Byte stream of blob content.
pub type BlobStream = Box<dyn AsyncRead + Send + Unpin>;

/// Manifest and blob transfer against a remote repository.
#[async_trait]
pub trait RemoteTransfer: Send + Sync {
    /// Fetch the manifest named by `reference` (tag or digest).
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<Vec<u8>>;

    /// Stream the blob `digest` from the repository of `reference`.
    async fn fetch_blob(&self, reference: &ImageReference, digest: &Digest) -> Result<BlobStream>;

    async fn put_manifest(&self, reference: &ImageReference, manifest: &[u8]) -> Result<()>;

    async fn put_blob(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        content: BlobStream,
    ) -> Result<()>;

    /// Whether the manifest exists remotely. `NoSuchImage` from a fetch means no.
    async fn manifest_exists(&self, reference: &ImageReference) -> Result<bool> {
        match self.fetch_manifest(reference).await {
            Ok(_) => Ok(true),
            Err(StowError::NoSuchImage(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn blob_exists(&self, reference: &ImageReference, digest: &Digest) -> Result<bool> {
        match self.fetch_blob(reference, digest).await {
            Ok(_) => Ok(true),
            Err(StowError::NoSuchImage(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// What a cache eviction applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EvictionKey {
    /// A repository name, e.g. `docker.io/library/alpine`.
    Repository(String),
    Blob(Digest),
}

/// Schedules cached content for removal.
pub trait EvictionScheduler: Send + Sync {
    /// Remove `key` from the cache once `ttl` has elapsed. Rescheduling a key
    /// replaces its previous deadline.
    fn schedule_removal(&self, key: EvictionKey, ttl: Duration) -> Result<()>;
}

/// Credentials for a registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `STOW_REGISTRY_USERNAME` and `STOW_REGISTRY_PASSWORD`, anonymous
    /// unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("STOW_REGISTRY_USERNAME"),
            std::env::var("STOW_REGISTRY_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// [`RemoteTransfer`] over the OCI distribution API.
pub struct RegistryTransfer {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryTransfer {
    /// Anonymous HTTPS client.
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    fn to_oci_reference(&self, reference: &ImageReference) -> Result<Reference> {
        let ref_str = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => format!("{}@{}", reference.name(), digest),
            (None, Some(tag)) => format!("{}:{}", reference.name(), tag),
            (None, None) => reference.name_with_tag(),
        };
        ref_str.parse::<Reference>().map_err(|e| StowError::InvalidReference {
            reference: ref_str.clone(),
            message: e.to_string(),
        })
    }

    fn registry_error(reference: &ImageReference, e: impl std::fmt::Display) -> StowError {
        StowError::RegistryError {
            registry: reference.registry.clone(),
            message: e.to_string(),
        }
    }

    /// Obtain a token for `operation` before talking to blob endpoints,
    /// which unlike manifest pulls do not negotiate one themselves.
    async fn authenticate(
        &self,
        reference: &ImageReference,
        oci_ref: &Reference,
        operation: RegistryOperation,
    ) -> Result<()> {
        self.client
            .auth(oci_ref, &self.auth.to_oci_auth(), operation)
            .await
            .map_err(|e| map_registry_error(reference, e))?;
        Ok(())
    }
}

/// Registry "not found" answers become `NoSuchImage`; anything else is a
/// `RegistryError`.
fn map_registry_error(reference: &ImageReference, e: OciDistributionError) -> StowError {
    let not_found = match &e {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|err| {
            matches!(
                err.code,
                OciErrorCode::ManifestUnknown | OciErrorCode::BlobUnknown | OciErrorCode::NameUnknown
            )
        }),
        OciDistributionError::RequestError(err) => err.status().map(|s| s.as_u16()) == Some(404),
        _ => false,
    };
    if not_found {
        tracing::debug!(reference = %reference, error = %e, "Not found in registry");
        StowError::NoSuchImage(format!("{}: {}", reference, e))
    } else {
        RegistryTransfer::registry_error(reference, e)
    }
}

impl Default for RegistryTransfer {
    fn default() -> Self {
        Self::new()
    }
}

const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    manifest::OCI_MANIFEST_MEDIA_TYPE,
    manifest::OCI_INDEX_MEDIA_TYPE,
    manifest::DOCKER_V2_SCHEMA2_MEDIA_TYPE,
    manifest::DOCKER_V2_LIST_MEDIA_TYPE,
    manifest::DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE,
    manifest::DOCKER_V2_SCHEMA1_MEDIA_TYPE,
];

#[async_trait]
impl RemoteTransfer for RegistryTransfer {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<Vec<u8>> {
        let oci_ref = self.to_oci_reference(reference)?;
        tracing::debug!(reference = %reference, "Fetching manifest");
        let (data, _digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &self.auth.to_oci_auth(), ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| map_registry_error(reference, e))?;
        Ok(data)
    }

    async fn fetch_blob(&self, reference: &ImageReference, digest: &Digest) -> Result<BlobStream> {
        let oci_ref = self.to_oci_reference(reference)?;
        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };
        tracing::debug!(reference = %reference, digest = %digest, "Fetching blob");
        self.authenticate(reference, &oci_ref, RegistryOperation::Pull).await?;
        let mut data = Vec::new();
        self.client
            .pull_blob(&oci_ref, &descriptor, &mut data)
            .await
            .map_err(|e| map_registry_error(reference, e))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn put_manifest(&self, reference: &ImageReference, data: &[u8]) -> Result<()> {
        let oci_ref = self.to_oci_reference(reference)?;
        let media_type = manifest::guess_mime_type(data).ok_or_else(|| {
            StowError::Unsupported(format!("cannot determine manifest type for {}", reference))
        })?;
        let content_type = http::HeaderValue::from_static(media_type);

        self.authenticate(reference, &oci_ref, RegistryOperation::Push).await?;
        let url = self
            .client
            .push_manifest_raw(&oci_ref, data.to_vec(), content_type)
            .await
            .map_err(|e| Self::registry_error(reference, e))?;
        tracing::info!(reference = %reference, url = %url, "Pushed manifest");
        Ok(())
    }

    async fn put_blob(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        mut content: BlobStream,
    ) -> Result<()> {
        let oci_ref = self.to_oci_reference(reference)?;
        let mut data = Vec::new();
        content.read_to_end(&mut data).await?;
        let actual = Digest::compute_with(digest.algorithm(), &data);
        if actual != *digest {
            return Err(StowError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        self.authenticate(reference, &oci_ref, RegistryOperation::Push).await?;
        self.client
            .push_blob(&oci_ref, &data, &digest.to_string())
            .await
            .map_err(|e| Self::registry_error(reference, e))?;
        tracing::debug!(reference = %reference, digest = %digest, size = data.len(), "Pushed blob");
        Ok(())
    }
}
