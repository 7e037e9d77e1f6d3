//! OCI layout directory as an image destination and source.
//!
//! ```text
//! <dir>/oci-layout              {"imageLayoutVersion": "1.0.0"}
//! <dir>/blobs/<alg>-<hex>       manifests, configs, layers
//! <dir>/refs/<tag>              descriptor of the tagged manifest
//! ```

use serde::{Deserialize, Serialize};
use stow_core::config::StoreConfig;
use stow_core::error::{Result, StowError};
use tokio::io::AsyncRead;

use crate::blob::{write_file_atomic, BlobInfo, BlobStore};
use crate::digest::Digest;
use crate::manifest::{self, Descriptor, DOCKER_V2_SCHEMA2_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE};
use crate::reference::LayoutReference;

const LAYOUT_VERSION: &str = "1.0.0";
const RECORD_MODE: u32 = 0o644;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

/// A tagged image in an OCI layout directory.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    reference: LayoutReference,
    blobs: BlobStore,
}

impl LayoutStore {
    pub fn new(reference: LayoutReference) -> Self {
        let blobs = BlobStore::new(reference.resolved_dir());
        Self { reference, blobs }
    }

    /// Layout store whose blob algorithm and mode come from `config`.
    pub fn with_config(reference: LayoutReference, config: &StoreConfig) -> Result<Self> {
        let blobs = BlobStore::with_config(reference.resolved_dir(), config)?;
        Ok(Self { reference, blobs })
    }

    pub fn reference(&self) -> &LayoutReference {
        &self.reference
    }

    /// Manifest types accepted by [`put_manifest`](Self::put_manifest),
    /// most preferred first.
    pub fn supported_manifest_mime_types(&self) -> &'static [&'static str] {
        &[OCI_MANIFEST_MEDIA_TYPE, DOCKER_V2_SCHEMA2_MEDIA_TYPE]
    }

    /// Store a blob (config or layer).
    pub async fn put_blob<R>(
        &self,
        expected_digest: Option<&Digest>,
        expected_size: Option<u64>,
        reader: R,
    ) -> Result<BlobInfo>
    where
        R: AsyncRead + Unpin,
    {
        self.blobs
            .write_blob(expected_digest, expected_size, reader)
            .await
    }

    /// Store a manifest under this reference's tag.
    ///
    /// Docker schema2 manifests are converted to OCI first; the digest and
    /// size recorded are those of the stored bytes. The manifest blob is
    /// committed before the layout marker and the tag descriptor.
    pub async fn put_manifest(&self, manifest_bytes: &[u8]) -> Result<Descriptor> {
        let (stored, media_type) = manifest::to_oci(manifest_bytes)?;
        let digest = manifest::digest_with(self.blobs.algorithm(), &stored)?;

        let info = self
            .blobs
            .write_blob(Some(&digest), Some(stored.len() as u64), stored.as_slice())
            .await?;

        self.ensure_layout_marker().await?;

        let descriptor = Descriptor::new(media_type, info.digest, info.size);
        let record = serde_json::to_vec(&descriptor)?;
        write_file_atomic(
            &self.reference.descriptor_path(self.reference.tag()),
            &record,
            RECORD_MODE,
        )
        .await?;

        tracing::info!(
            dir = %self.reference.resolved_dir().display(),
            tag = %self.reference.tag(),
            digest = %descriptor.digest,
            media_type = %descriptor.media_type,
            "Committed manifest"
        );
        Ok(descriptor)
    }

    /// Layout directories cannot keep detached signatures: a converted
    /// manifest no longer matches signatures made over the original bytes.
    pub async fn put_signatures(&self, signatures: &[Vec<u8>]) -> Result<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        Err(StowError::SignaturesUnsupported(format!(
            "OCI layout {} cannot store {} signature(s)",
            self.reference.resolved_dir().display(),
            signatures.len()
        )))
    }

    /// Descriptor recorded for this reference's tag.
    pub async fn descriptor(&self) -> Result<Descriptor> {
        let path = self.reference.descriptor_path(self.reference.tag());
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StowError::NoSuchImage(format!(
                    "no manifest tagged {:?} in {}",
                    self.reference.tag(),
                    self.reference.resolved_dir().display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Manifest bytes and media type for this reference's tag.
    ///
    /// The stored bytes must match the descriptor's digest and size.
    pub async fn get_manifest(&self) -> Result<(Vec<u8>, String)> {
        let descriptor = self.descriptor().await?;
        let data = self.blobs.read_blob(&descriptor.digest).await?;
        if data.len() as u64 != descriptor.size {
            return Err(StowError::SizeMismatch {
                subject: descriptor.digest.to_string(),
                expected: descriptor.size,
                actual: data.len() as u64,
            });
        }
        Ok((data, descriptor.media_type))
    }

    /// Read a blob, verifying its digest.
    pub async fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        if !self.blobs.has_blob(digest) {
            return Err(StowError::NoSuchImage(format!(
                "blob {} not present in {}",
                digest,
                self.reference.resolved_dir().display()
            )));
        }
        self.blobs.read_blob(digest).await
    }

    async fn ensure_layout_marker(&self) -> Result<()> {
        let path = self.reference.layout_marker_path();
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let marker = serde_json::to_vec(&LayoutMarker {
            image_layout_version: LAYOUT_VERSION.to_string(),
        })?;
        write_file_atomic(&path, &marker, RECORD_MODE).await
    }
}
