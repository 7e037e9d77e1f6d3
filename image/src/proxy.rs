//! Pull-through caching proxy for one remote repository.
//!
//! Reads are served from the local blob store when possible. Misses are
//! fetched from the remote, verified against the requested digest, committed
//! locally, and scheduled for eviction after the repository TTL. The proxy
//! is read-only: pushes and deletes are rejected.

use std::sync::Arc;
use std::time::Duration;

use stow_core::config::ProxyConfig;
use stow_core::error::{Result, StowError};

use crate::blob::{write_file_atomic, BlobStore};
use crate::digest::Digest;
use crate::manifest;
use crate::reference::ImageReference;
use crate::transfer::{EvictionKey, EvictionScheduler, RemoteTransfer};

pub struct ProxyStore {
    repository: ImageReference,
    local: BlobStore,
    remote: Arc<dyn RemoteTransfer>,
    scheduler: Arc<dyn EvictionScheduler>,
    ttl: Duration,
}

impl ProxyStore {
    /// Proxy `repository` (tag and digest are ignored) through `local`.
    pub fn new(
        repository: &ImageReference,
        local: BlobStore,
        remote: Arc<dyn RemoteTransfer>,
        scheduler: Arc<dyn EvictionScheduler>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            repository: ImageReference {
                registry: repository.registry.clone(),
                repository: repository.repository.clone(),
                tag: None,
                digest: None,
            },
            local,
            remote,
            scheduler,
            ttl: config.ttl(),
        }
    }

    pub fn repository(&self) -> &ImageReference {
        &self.repository
    }

    fn at_digest(&self, digest: &Digest) -> ImageReference {
        ImageReference {
            digest: Some(digest.clone()),
            ..self.repository.clone()
        }
    }

    fn schedule(&self, digest: &Digest) -> Result<()> {
        self.scheduler
            .schedule_removal(EvictionKey::Repository(self.repository.name()), self.ttl)?;
        self.scheduler
            .schedule_removal(EvictionKey::Blob(digest.clone()), self.ttl)
    }

    pub async fn manifest_exists(&self, digest: &Digest) -> Result<bool> {
        if self.local.has_blob(digest) {
            return Ok(true);
        }
        self.remote.manifest_exists(&self.at_digest(digest)).await
    }

    /// Manifest with canonical digest `digest`.
    pub async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.local.blob_path(digest);
        if self.local.has_blob(digest) {
            // Anything short of a verified cached copy is a miss.
            let cached = tokio::fs::read(&path).await.ok();
            if let Some(data) = cached {
                if matches!(manifest::matches_digest(&data, digest), Ok(true)) {
                    return Ok(data);
                }
            }
            tracing::warn!(digest = %digest, "Cached manifest is corrupt, refetching");
            self.local.remove_blob(digest).await?;
        }

        let data = self.remote.fetch_manifest(&self.at_digest(digest)).await?;
        if !manifest::matches_digest(&data, digest)? {
            return Err(StowError::DigestMismatch {
                expected: digest.to_string(),
                actual: manifest::digest_with(digest.algorithm(), &data)?.to_string(),
            });
        }
        // Schema1 manifests are addressed by their payload digest, not their
        // bytes, so they bypass the content-verifying blob writer.
        write_file_atomic(&path, &data, self.local.mode()).await?;
        self.schedule(digest)?;

        tracing::info!(
            repository = %self.repository.name(),
            digest = %digest,
            "Cached proxied manifest"
        );
        Ok(data)
    }

    pub async fn put_manifest(&self, _manifest: &[u8]) -> Result<Digest> {
        Err(StowError::Unsupported(format!(
            "cannot push manifests to proxied repository {}",
            self.repository.name()
        )))
    }

    pub async fn delete_manifest(&self, _digest: &Digest) -> Result<()> {
        Err(StowError::Unsupported(format!(
            "cannot delete manifests from proxied repository {}",
            self.repository.name()
        )))
    }

    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        if self.local.has_blob(digest) {
            return Ok(true);
        }
        self.remote.blob_exists(&self.repository, digest).await
    }

    /// Open blob `digest` for reading, fetching it first on a miss.
    pub async fn get_blob(&self, digest: &Digest) -> Result<(tokio::fs::File, u64)> {
        if !self.local.has_blob(digest) {
            let stream = self.remote.fetch_blob(&self.repository, digest).await?;
            let info = self.local.write_blob(Some(digest), None, stream).await?;
            self.schedule(digest)?;
            tracing::info!(
                repository = %self.repository.name(),
                digest = %digest,
                size = info.size,
                "Cached proxied blob"
            );
        }
        self.local.open_blob(digest).await
    }
}
