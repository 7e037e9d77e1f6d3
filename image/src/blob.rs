//! Content-addressed blob storage with atomic publication.
//!
//! Blobs live at `<root>/blobs/<alg>-<hex>`. A write streams into a staging
//! file inside `blobs/` itself, so the final rename never crosses a
//! filesystem boundary. The staging file is a `tempfile::NamedTempFile`:
//! any early return, error, or dropped future removes it.

use std::path::{Path, PathBuf};

use stow_core::config::StoreConfig;
use stow_core::error::{Result, StowError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::digest::{Algorithm, Digest};

const BLOBS_DIR: &str = "blobs";
const STAGING_PREFIX: &str = ".staging-";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Digest and length of a committed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: Digest,
    pub size: u64,
}

/// Content-addressed blob directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    blobs_dir: PathBuf,
    algorithm: Algorithm,
    mode: u32,
}

impl BlobStore {
    /// Blob store under `root/blobs`, SHA-256 addressed, mode 0644.
    pub fn new(root: &Path) -> Self {
        Self {
            blobs_dir: root.join(BLOBS_DIR),
            algorithm: Algorithm::Sha256,
            mode: 0o644,
        }
    }

    /// Blob store under `root/blobs` using the configured algorithm and mode.
    pub fn with_config(root: &Path, config: &StoreConfig) -> Result<Self> {
        let algorithm = config
            .digest_algorithm
            .parse()
            .map_err(|e: StowError| StowError::ConfigError(e.to_string()))?;
        Ok(Self {
            blobs_dir: root.join(BLOBS_DIR),
            algorithm,
            mode: config.blob_mode,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Permission bits given to published blobs.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn blobs_dir(&self) -> &Path {
        &self.blobs_dir
    }

    /// Final path of the blob with `digest`.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir.join(digest.path_component())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Stream `reader` into the store.
    ///
    /// The content is hashed while it is copied. The write fails, and leaves
    /// nothing behind, when the source errors, when `expected_size` differs
    /// from the bytes read, or when `expected_digest` differs from the hash.
    /// On success the data is fsynced, given the store's mode and renamed to
    /// its digest-addressed path. An existing blob at that path is replaced
    /// by identical content.
    pub async fn write_blob<R>(
        &self,
        expected_digest: Option<&Digest>,
        expected_size: Option<u64>,
        mut reader: R,
    ) -> Result<BlobInfo>
    where
        R: AsyncRead + Unpin,
    {
        tokio::fs::create_dir_all(&self.blobs_dir).await.map_err(|e| {
            StowError::Other(format!(
                "Failed to create blob directory {}: {}",
                self.blobs_dir.display(),
                e
            ))
        })?;

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&self.blobs_dir)?;
        let mut file = tokio::fs::File::from_std(staging.as_file().try_clone()?);

        let algorithm = expected_digest
            .map(|d| d.algorithm())
            .unwrap_or(self.algorithm);
        let mut digester = algorithm.digester();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
            if let Some(expected) = expected_size {
                if size > expected {
                    return Err(size_mismatch(expected_digest, expected, size));
                }
            }
        }
        if let Some(expected) = expected_size {
            if size != expected {
                return Err(size_mismatch(expected_digest, expected, size));
            }
        }

        let digest = digester.finalize();
        if let Some(expected) = expected_digest {
            if *expected != digest {
                return Err(StowError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        set_mode(staging.path(), self.mode)?;

        let final_path = self.blob_path(&digest);
        staging.persist(&final_path).map_err(|e| {
            StowError::Other(format!(
                "Failed to commit blob {} to {}: {}",
                digest,
                final_path.display(),
                e.error
            ))
        })?;

        tracing::debug!(digest = %digest, size, path = %final_path.display(), "Committed blob");

        Ok(BlobInfo { digest, size })
    }

    /// Write an in-memory buffer as a blob.
    pub async fn write_bytes(&self, data: &[u8]) -> Result<BlobInfo> {
        self.write_blob(None, Some(data.len() as u64), data).await
    }

    /// Read a whole blob, re-checking that its content matches `digest`.
    pub async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let data = tokio::fs::read(&path).await.map_err(|e| {
            StowError::Other(format!("Failed to read blob {}: {}", path.display(), e))
        })?;
        let actual = Digest::compute_with(digest.algorithm(), &data);
        if actual != *digest {
            return Err(StowError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Open a blob for streaming, returning the file and its size.
    pub async fn open_blob(&self, digest: &Digest) -> Result<(tokio::fs::File, u64)> {
        let path = self.blob_path(digest);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            StowError::Other(format!("Failed to open blob {}: {}", path.display(), e))
        })?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Remove a blob. Missing blobs are not an error.
    pub async fn remove_blob(&self, digest: &Digest) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Replace `path` with `data` atomically: stage next to it, fsync, rename.
///
/// Used for the small mutable records that sit beside blobs (descriptors,
/// markers, indexes).
pub(crate) async fn write_file_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        StowError::Other(format!("{} has no parent directory", path.display()))
    })?;
    tokio::fs::create_dir_all(dir).await?;

    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(dir)?;
    let mut file = tokio::fs::File::from_std(staging.as_file().try_clone()?);
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    set_mode(staging.path(), mode)?;

    staging.persist(path).map_err(|e| {
        StowError::Other(format!("Failed to write {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

fn size_mismatch(digest: Option<&Digest>, expected: u64, actual: u64) -> StowError {
    StowError::SizeMismatch {
        subject: digest
            .map(|d| d.to_string())
            .unwrap_or_else(|| "blob".to_string()),
        expected,
        actual,
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
