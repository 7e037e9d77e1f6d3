//! The `oci` transport: an OCI image layout directory plus a tag.

use std::path::{Path, PathBuf};

use stow_core::error::{Result, StowError};

use super::named::{is_valid_tag, DEFAULT_TAG};
use super::path::{ancestors_excluding_root, is_clean_absolute, resolve_fully_explicit};
use super::{ImageRef, ImageReference, ImageTransport};
use crate::digest::Digest;

pub const TRANSPORT_NAME: &str = "oci";

/// The `oci` layout transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutTransport;

impl LayoutTransport {
    /// Parse `dir[:tag]`, splitting on the last `:`.
    pub fn parse(&self, reference: &str) -> Result<LayoutReference> {
        let (dir, tag) = match reference.rsplit_once(':') {
            Some((dir, tag)) => (dir, tag),
            None => (reference, DEFAULT_TAG),
        };
        LayoutReference::new(dir, tag)
    }
}

impl ImageTransport for LayoutTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn parse_reference(&self, reference: &str) -> Result<Box<dyn ImageRef>> {
        Ok(Box::new(self.parse(reference)?))
    }

    fn validate_policy_configuration_scope(&self, scope: &str) -> Result<()> {
        let invalid = |message: String| StowError::InvalidReferenceSyntax {
            reference: scope.to_string(),
            message,
        };

        let dir = match scope.rsplit_once(':') {
            Some((dir, tag)) => {
                if !is_valid_tag(tag) {
                    return Err(invalid(format!("invalid tag '{}'", tag)));
                }
                dir
            }
            None => scope,
        };
        if dir.contains(':') {
            return Err(invalid(format!("directory '{}' contains a colon", dir)));
        }
        if !dir.starts_with('/') {
            return Err(invalid("scope must be an absolute path".to_string()));
        }
        // "/" alone would shadow the empty default scope; "/:tag" is fine.
        if scope == "/" {
            return Err(invalid("scope must not be the root directory".to_string()));
        }
        if !is_clean_absolute(dir) {
            return Err(invalid(format!(
                "directory '{}' is not in canonical form",
                dir
            )));
        }
        Ok(())
    }
}

/// Reference to a tagged image in an OCI layout directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutReference {
    /// Directory as given by the caller.
    dir: String,
    /// Absolute path without symlinks, `.` or `..`.
    resolved_dir: String,
    tag: String,
}

impl LayoutReference {
    /// Build a reference to `tag` in `dir`. The directory need not exist,
    /// but its parent must.
    pub fn new(dir: &str, tag: &str) -> Result<Self> {
        let invalid = |message: String| StowError::InvalidReferenceSyntax {
            reference: format!("{}:{}", dir, tag),
            message,
        };

        if dir.contains(':') {
            return Err(invalid(format!("directory '{}' contains a colon", dir)));
        }
        if !is_valid_tag(tag) {
            return Err(invalid(format!("invalid tag '{}'", tag)));
        }
        let resolved = resolve_fully_explicit(Path::new(dir))
            .map_err(|e| invalid(format!("cannot resolve directory: {}", e)))?;
        let resolved_dir = resolved
            .to_str()
            .ok_or_else(|| invalid("directory is not valid UTF-8".to_string()))?
            .to_string();

        Ok(Self {
            dir: dir.to_string(),
            resolved_dir,
            tag: tag.to_string(),
        })
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn resolved_dir(&self) -> &Path {
        Path::new(&self.resolved_dir)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `<dir>/oci-layout`
    pub fn layout_marker_path(&self) -> PathBuf {
        self.resolved_dir().join("oci-layout")
    }

    /// `<dir>/blobs/<alg>-<hex>`
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.resolved_dir()
            .join("blobs")
            .join(digest.path_component())
    }

    /// `<dir>/refs/<tag>`
    pub fn descriptor_path(&self, tag: &str) -> PathBuf {
        self.resolved_dir().join("refs").join(tag)
    }
}

impl ImageRef for LayoutReference {
    fn transport_name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn string_within_transport(&self) -> String {
        format!("{}:{}", self.dir, self.tag)
    }

    fn docker_reference(&self) -> Option<&ImageReference> {
        None
    }

    fn policy_configuration_identity(&self) -> String {
        format!("{}:{}", self.resolved_dir, self.tag)
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        ancestors_excluding_root(&self.resolved_dir)
    }
}
