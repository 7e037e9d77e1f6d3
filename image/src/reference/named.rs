//! Docker-style named references.
//!
//! Parses references like `ghcr.io/org/app:v1.0` or
//! `quay.io/org/app@sha256:...` into structured components.

use std::fmt;

use stow_core::error::{Result, StowError};

use crate::digest::Digest;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
pub(crate) const DEFAULT_TAG: &str = "latest";

const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Manifest digest
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference, defaulting the tag to `latest` when
    /// neither a tag nor a digest is given.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myuser/myimage:v1` → docker.io/myuser/myimage:v1
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let mut r = Self::parse_explicit(reference)?;
        if r.is_name_only() {
            r.tag = Some(DEFAULT_TAG.to_string());
        }
        Ok(r)
    }

    /// Parse an image reference without applying a default tag.
    pub fn parse_explicit(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let invalid = |message: String| StowError::InvalidReferenceSyntax {
            reference: reference.to_string(),
            message,
        };
        if reference.is_empty() {
            return Err(invalid("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name_tag, digest)) => {
                let digest: Digest = digest
                    .parse()
                    .map_err(|e: StowError| invalid(e.to_string()))?;
                (name_tag, Some(digest))
            }
            None => (reference, None),
        };

        // A tag is whatever follows the last ':' after the last '/'.
        let last_component_start = name_tag.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name_tag[last_component_start..].rfind(':') {
            Some(i) => {
                let colon = last_component_start + i;
                (&name_tag[..colon], Some(&name_tag[colon + 1..]))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = tag {
            if !is_valid_tag(tag) {
                return Err(invalid(format!("invalid tag '{}'", tag)));
            }
        }
        if name.len() > MAX_NAME_LEN {
            return Err(invalid(format!(
                "repository name must not be more than {} characters",
                MAX_NAME_LEN
            )));
        }

        let (registry, repository) = split_registry_repository(name).map_err(invalid)?;

        Ok(ImageReference {
            registry,
            repository,
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// Registry and repository without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Whether the reference carries neither a tag nor a digest.
    pub fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// Name plus tag, dropping any digest.
    pub fn name_with_tag(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}:{}", self.name(), tag),
            None => self.name(),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.name_with_tag();
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Tag grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub(crate) fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    tag.len() <= MAX_TAG_LEN && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str) -> std::result::Result<(String, String), String> {
    // The first component is a registry if it looks like a hostname.
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            if !is_valid_registry(first) {
                return Err(format!("invalid registry '{}'", first));
            }
            (first.to_string(), rest.to_string())
        }
        _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        _ => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
    };

    if repository.is_empty() {
        return Err("empty repository".to_string());
    }
    for component in repository.split('/') {
        if !is_valid_path_component(component) {
            return Err(format!(
                "invalid repository component '{}' (must be lowercase alphanumerics separated by '.', '_' or '-')",
                component
            ));
        }
    }
    Ok((registry, repository))
}

fn is_valid_registry(host: &str) -> bool {
    let (hostname, port) = match host.rsplit_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (host, None),
    };
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    !hostname.is_empty()
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn is_valid_path_component(component: &str) -> bool {
    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let (Some(first), Some(last)) = (component.chars().next(), component.chars().last()) else {
        return false;
    };
    is_alnum(first)
        && is_alnum(last)
        && component
            .chars()
            .all(|c| is_alnum(c) || matches!(c, '.' | '_' | '-'))
}
