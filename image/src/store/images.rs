//! Local image store backing the `storage` transport.
//!
//! Manifests are kept as blobs under the graph root; an in-memory index
//! mirrors `images.json`, which is rewritten atomically on every change.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stow_core::config::StoreConfig;
use stow_core::error::{Result, StowError};
use tokio::sync::RwLock;

use crate::blob::{write_file_atomic, BlobStore};
use crate::digest::Digest;
use crate::manifest;
use crate::reference::{ImageLookup, ImageReference};

const INDEX_FILE: &str = "images.json";

/// Metadata for a stored image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Store-local id: hex of the manifest digest
    pub id: String,
    /// Fully qualified names (e.g., "docker.io/library/busybox:latest")
    pub names: Vec<String>,
    /// Manifest digests this image is known by
    pub digests: Vec<Digest>,
    /// Manifest size in bytes
    pub size_bytes: u64,
    /// When the image was first stored
    pub created: DateTime<Utc>,
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based image store with an in-memory index.
pub struct ImageStore {
    root: PathBuf,
    blobs: BlobStore,
    index: Arc<RwLock<Vec<StoredImage>>>,
}

impl ImageStore {
    /// Open the store at `root`, creating it if needed and loading any
    /// existing index.
    pub fn new(root: &Path) -> Result<Self> {
        Self::open(root, BlobStore::new(root))
    }

    /// Open the store at the configured graph root.
    pub fn with_config(config: &StoreConfig) -> Result<Self> {
        Self::open(
            &config.graph_root,
            BlobStore::with_config(&config.graph_root, config)?,
        )
    }

    fn open(root: &Path, blobs: BlobStore) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            StowError::Other(format!(
                "Failed to create image store directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let images = Self::load_index(root)?
            .into_iter()
            .filter(|image| match image.digests.first() {
                Some(digest) => blobs.has_blob(digest),
                None => false,
            })
            .collect();

        Ok(Self {
            root: root.to_path_buf(),
            blobs,
            index: Arc::new(RwLock::new(images)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a manifest and attach `names` to the image it defines.
    ///
    /// The id is the hex of the manifest's sha256 digest whatever algorithm
    /// the store uses, so storing the same manifest twice updates one image.
    /// The manifest blob and `digests` use the store's algorithm. A name
    /// moves to the new image if another image held it.
    pub async fn put_image(&self, manifest_bytes: &[u8], names: &[&str]) -> Result<StoredImage> {
        let id = manifest::digest(manifest_bytes)?.hex().to_string();
        let digest = manifest::digest_with(self.blobs.algorithm(), manifest_bytes)?;
        let names = names
            .iter()
            .map(|n| ImageReference::parse(n).map(|r| r.full_reference()))
            .collect::<Result<Vec<_>>>()?;

        // Signed schema1 manifests are digested over their payload, so the
        // blob is addressed by the canonical digest rather than raw content.
        let path = self.blobs.blob_path(&digest);
        if !self.blobs.has_blob(&digest) {
            write_file_atomic(&path, manifest_bytes, self.blobs.mode()).await?;
        }

        let mut index = self.index.write().await;
        for image in index.iter_mut() {
            if image.id != id {
                image.names.retain(|n| !names.contains(n));
            }
        }
        let stored = match index.iter_mut().find(|image| image.id == id) {
            Some(image) => {
                for name in &names {
                    if !image.names.contains(name) {
                        image.names.push(name.clone());
                    }
                }
                image.clone()
            }
            None => {
                let image = StoredImage {
                    id,
                    names,
                    digests: vec![digest],
                    size_bytes: manifest_bytes.len() as u64,
                    created: Utc::now(),
                };
                index.push(image.clone());
                image
            }
        };
        self.save_index(&index).await?;
        drop(index);

        tracing::info!(id = %stored.id, names = ?stored.names, "Stored image");
        Ok(stored)
    }

    /// Manifest bytes of the image with `id`.
    pub async fn manifest(&self, id: &str) -> Result<Vec<u8>> {
        let image = self
            .find(id)
            .await
            .ok_or_else(|| StowError::NoSuchImage(id.to_string()))?;
        let digest = image
            .digests
            .first()
            .ok_or_else(|| StowError::NoSuchImage(format!("image {} has no manifest", id)))?;
        let data = tokio::fs::read(self.blobs.blob_path(digest)).await?;
        if !manifest::matches_digest(&data, digest)? {
            return Err(StowError::DigestMismatch {
                expected: digest.to_string(),
                actual: manifest::digest(&data)?.to_string(),
            });
        }
        Ok(data)
    }

    /// Remove an image by name or id. Its manifest blob is deleted too.
    ///
    /// The index is only changed once the blobs are gone, so a failed
    /// removal leaves the image listed.
    pub async fn remove(&self, name_or_id: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let key = normalize(name_or_id);
        let position = index
            .iter()
            .position(|image| image.id == name_or_id || image.names.contains(&key))
            .ok_or_else(|| StowError::NoSuchImage(name_or_id.to_string()))?;

        for digest in &index[position].digests {
            self.blobs.remove_blob(digest).await?;
        }
        let image = index.remove(position);
        self.save_index(&index).await?;
        drop(index);

        tracing::debug!(id = %image.id, "Removed image");
        Ok(())
    }

    /// List all stored images.
    pub async fn list(&self) -> Vec<StoredImage> {
        self.index.read().await.clone()
    }

    async fn find(&self, name_or_id: &str) -> Option<StoredImage> {
        let key = normalize(name_or_id);
        self.index
            .read()
            .await
            .iter()
            .find(|image| {
                image.id == name_or_id || image.names.iter().any(|n| n == name_or_id || *n == key)
            })
            .cloned()
    }

    fn load_index(root: &Path) -> Result<Vec<StoredImage>> {
        let index_path = root.join(INDEX_FILE);
        if !index_path.exists() {
            return Ok(Vec::new());
        }

        let data = std::fs::read_to_string(&index_path).map_err(|e| {
            StowError::Other(format!(
                "Failed to read image store index {}: {}",
                index_path.display(),
                e
            ))
        })?;

        let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
            StowError::SerializationError(format!("Failed to parse image store index: {}", e))
        })?;
        Ok(store_index.images)
    }

    /// Write `images` to disk. Callers hold the index write lock so saves
    /// land in the order the index changed.
    async fn save_index(&self, images: &[StoredImage]) -> Result<()> {
        let store_index = StoreIndex {
            images: images.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&store_index)?;
        write_file_atomic(&self.root.join(INDEX_FILE), &data, 0o600).await
    }
}

#[async_trait]
impl ImageLookup for ImageStore {
    async fn image(&self, name_or_id: &str) -> Result<Option<StoredImage>> {
        Ok(self.find(name_or_id).await)
    }

    async fn images_by_digest(&self, digest: &Digest) -> Result<Vec<StoredImage>> {
        Ok(self
            .index
            .read()
            .await
            .iter()
            .filter(|image| image.digests.contains(digest))
            .cloned()
            .collect())
    }
}

/// Fully qualified form of a name; ids and unparsable input pass through.
fn normalize(name: &str) -> String {
    ImageReference::parse(name)
        .map(|r| r.full_reference())
        .unwrap_or_else(|_| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;
    use crate::manifest::fixtures::{schema1_signed, OCI, SCHEMA1_BODY, SCHEMA2};
    use crate::reference::{ImageRef, StorageTransport, StoreSpec};
    use tempfile::TempDir;

    fn transport(root: &Path) -> StorageTransport {
        StorageTransport::new(StoreSpec {
            driver: "vfs".to_string(),
            graph_root: root.to_path_buf(),
            run_root: root.join("run"),
            options: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("graph");
        let store = ImageStore::new(&root).unwrap();
        assert!(root.exists());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();

        let stored = store.put_image(OCI.as_bytes(), &["busybox"]).await.unwrap();
        let digest = Digest::compute(OCI.as_bytes());
        assert_eq!(stored.id, digest.hex());
        assert_eq!(stored.names, vec!["docker.io/library/busybox:latest".to_string()]);
        assert_eq!(stored.size_bytes, OCI.len() as u64);

        assert_eq!(store.image("busybox").await.unwrap().unwrap().id, stored.id);
        assert_eq!(store.image(&stored.id).await.unwrap().unwrap(), stored);
        assert!(store.image("nonexistent").await.unwrap().is_none());

        let by_digest = store.images_by_digest(&digest).await.unwrap();
        assert_eq!(by_digest.len(), 1);
        assert_eq!(store.manifest(&stored.id).await.unwrap(), OCI.as_bytes());
    }

    #[tokio::test]
    async fn test_same_manifest_merges_names() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        store.put_image(OCI.as_bytes(), &["app:v1"]).await.unwrap();
        let stored = store.put_image(OCI.as_bytes(), &["app:stable"]).await.unwrap();
        assert_eq!(stored.names.len(), 2);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_name_moves_between_images() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let old = store.put_image(OCI.as_bytes(), &["app:latest"]).await.unwrap();
        let new = store.put_image(SCHEMA2.as_bytes(), &["app:latest"]).await.unwrap();
        assert_eq!(store.image("app").await.unwrap().unwrap().id, new.id);
        assert!(store.image(&old.id).await.unwrap().unwrap().names.is_empty());
    }

    #[tokio::test]
    async fn test_schema1_uses_canonical_digest() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let (manifest, payload) = schema1_signed(SCHEMA1_BODY);
        let stored = store.put_image(manifest.as_bytes(), &["legacy:1"]).await.unwrap();
        assert_eq!(stored.digests, vec![Digest::compute(&payload)]);
        assert_eq!(store.manifest(&stored.id).await.unwrap(), manifest.as_bytes());
    }

    #[tokio::test]
    async fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let stored = store.put_image(OCI.as_bytes(), &["nginx"]).await.unwrap();
        store.remove("nginx").await.unwrap();
        assert!(store.image(&stored.id).await.unwrap().is_none());
        assert!(!BlobStore::new(tmp.path()).has_blob(&stored.digests[0]));
        assert!(matches!(
            store.remove("nginx").await.unwrap_err(),
            StowError::NoSuchImage(_)
        ));
    }

    #[tokio::test]
    async fn test_index_persistence() {
        let tmp = TempDir::new().unwrap();
        {
            let store = ImageStore::new(tmp.path()).unwrap();
            store.put_image(OCI.as_bytes(), &["nginx:1.25"]).await.unwrap();
        }
        let store = ImageStore::new(tmp.path()).unwrap();
        let image = store.image("nginx:1.25").await.unwrap();
        assert!(image.is_some());
        assert!(tmp.path().join("images.json").is_file());
    }

    #[tokio::test]
    async fn test_index_drops_images_without_manifest() {
        let tmp = TempDir::new().unwrap();
        let stored = {
            let store = ImageStore::new(tmp.path()).unwrap();
            store.put_image(OCI.as_bytes(), &["nginx"]).await.unwrap()
        };
        BlobStore::new(tmp.path())
            .remove_blob(&stored.digests[0])
            .await
            .unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        assert!(store.list().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_all_persist() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(tmp.path()).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let manifest = format!(r#"{{"schemaVersion":2,"layers":[],"n":{}}}"#, i);
                    let name = format!("app:{}", i);
                    store
                        .put_image(manifest.as_bytes(), &[name.as_str()])
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let reopened = ImageStore::new(tmp.path()).unwrap();
        assert_eq!(reopened.list().await.len(), 16);
        for i in 0..16 {
            assert!(reopened.image(&format!("app:{}", i)).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_image() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let stored = store.put_image(OCI.as_bytes(), &["nginx"]).await.unwrap();

        // A directory in place of the manifest blob cannot be unlinked.
        let path = BlobStore::new(tmp.path()).blob_path(&stored.digests[0]);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.remove("nginx").await.is_err());
        assert_eq!(store.image("nginx").await.unwrap().unwrap().id, stored.id);
        let on_disk: StoreIndex =
            serde_json::from_slice(&std::fs::read(tmp.path().join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(on_disk.images.len(), 1);
    }

    #[tokio::test]
    async fn test_sha512_store_addresses_manifests_with_sha512() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            graph_root: tmp.path().to_path_buf(),
            digest_algorithm: "sha512".to_string(),
            ..Default::default()
        };
        let store = ImageStore::with_config(&config).unwrap();
        let stored = store.put_image(OCI.as_bytes(), &["app:v1"]).await.unwrap();

        let expected = Digest::compute_with(Algorithm::Sha512, OCI.as_bytes());
        assert_eq!(stored.digests, vec![expected.clone()]);
        assert_eq!(stored.id, Digest::compute(OCI.as_bytes()).hex());
        assert!(store.blobs.has_blob(&expected));
        assert_eq!(store.manifest(&stored.id).await.unwrap(), OCI.as_bytes());
        assert_eq!(store.images_by_digest(&expected).await.unwrap().len(), 1);

        let reopened = ImageStore::with_config(&config).unwrap();
        assert_eq!(reopened.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_storage_reference_resolves_against_store() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let stored = store
            .put_image(OCI.as_bytes(), &["example.com/app:v1"])
            .await
            .unwrap();
        let digest = &stored.digests[0];

        let t = transport(tmp.path());
        let by_digest = t.parse(&format!("example.com/app@{}", digest)).unwrap();
        assert_eq!(by_digest.resolve(&store).await.unwrap().id, stored.id);
        assert!(by_digest.string_within_transport().ends_with(&stored.id));

        let other_repo = t.parse(&format!("example.com/other@{}", digest)).unwrap();
        assert!(other_repo.resolve(&store).await.is_err());
    }
}
