//! Manifest media types, digests and schema conversion.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use stow_core::error::{Result, StowError};

use crate::digest::{Algorithm, Digest};

pub const DOCKER_V2_SCHEMA1_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_V2_SCHEMA2_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_V2_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_V2_SCHEMA2_FOREIGN_LAYER_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
pub const DOCKER_V2_SCHEMA2_UNCOMPRESSED_LAYER_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.diff.tar";

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Content descriptor: `{mediaType, digest, size}`.
///
/// Used inside manifests and as the per-tag record of a layout store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: Vec::new(),
        }
    }
}

/// Single-platform manifest in the schema2 / OCI shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    media_type: String,
    config: Descriptor,
    layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

/// Guess the media type of a manifest from its content.
///
/// Returns `None` when the bytes are not a recognisable manifest.
pub fn guess_mime_type(manifest: &[u8]) -> Option<&'static str> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Meta {
        #[serde(default)]
        media_type: String,
        #[serde(default)]
        schema_version: u32,
        #[serde(default)]
        signatures: Option<serde_json::Value>,
        #[serde(default)]
        config: Option<MediaTypeOnly>,
        #[serde(default)]
        manifests: Vec<MediaTypeOnly>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct MediaTypeOnly {
        #[serde(default)]
        media_type: String,
    }

    let meta: Meta = serde_json::from_slice(manifest).ok()?;
    for known in [
        DOCKER_V2_SCHEMA1_MEDIA_TYPE,
        DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE,
        DOCKER_V2_SCHEMA2_MEDIA_TYPE,
        DOCKER_V2_LIST_MEDIA_TYPE,
        OCI_MANIFEST_MEDIA_TYPE,
        OCI_INDEX_MEDIA_TYPE,
    ] {
        if meta.media_type == known {
            return Some(known);
        }
    }

    match meta.schema_version {
        1 => {
            if meta.signatures.is_some() {
                Some(DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE)
            } else {
                Some(DOCKER_V2_SCHEMA1_MEDIA_TYPE)
            }
        }
        2 => {
            if meta
                .config
                .as_ref()
                .map_or(false, |c| c.media_type == OCI_CONFIG_MEDIA_TYPE)
            {
                Some(OCI_MANIFEST_MEDIA_TYPE)
            } else if meta
                .manifests
                .first()
                .map_or(false, |m| m.media_type == OCI_MANIFEST_MEDIA_TYPE)
            {
                Some(OCI_INDEX_MEDIA_TYPE)
            } else {
                Some(DOCKER_V2_SCHEMA2_MEDIA_TYPE)
            }
        }
        _ => None,
    }
}

/// Compute the canonical digest of a manifest.
///
/// Signed schema1 manifests are digested over their JWS payload, which
/// excludes the embedded signatures. Everything else is digested verbatim.
pub fn digest(manifest: &[u8]) -> Result<Digest> {
    digest_with(Algorithm::Sha256, manifest)
}

/// [`digest`] with an explicit hash algorithm.
pub fn digest_with(algorithm: Algorithm, manifest: &[u8]) -> Result<Digest> {
    if guess_mime_type(manifest) == Some(DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE) {
        let payload = schema1_payload(manifest)?;
        return Ok(Digest::compute_with(algorithm, &payload));
    }
    Ok(Digest::compute_with(algorithm, manifest))
}

/// Check whether `manifest` has the given digest, hashing with the
/// digest's own algorithm.
pub fn matches_digest(manifest: &[u8], expected: &Digest) -> Result<bool> {
    Ok(digest_with(expected.algorithm(), manifest)? == *expected)
}

/// Extract the signed payload of a "pretty" JWS schema1 manifest.
///
/// Each protected header carries `formatLength` and `formatTail`; the payload
/// is `manifest[..formatLength] ++ base64url(formatTail)`. All signatures must
/// describe the same payload.
fn schema1_payload(manifest: &[u8]) -> Result<Vec<u8>> {
    #[derive(Deserialize)]
    struct Signed {
        signatures: Vec<JwsSignature>,
    }

    #[derive(Deserialize)]
    struct JwsSignature {
        protected: String,
        signature: String,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Protected {
        format_length: usize,
        format_tail: String,
    }

    let invalid = |msg: String| StowError::ManifestDigestError(msg);

    let signed: Signed = serde_json::from_slice(manifest)
        .map_err(|e| invalid(format!("invalid schema1 signature block: {}", e)))?;
    if signed.signatures.is_empty() {
        return Err(invalid("schema1 manifest has no signatures".to_string()));
    }

    let mut format: Option<(usize, Vec<u8>)> = None;
    for sig in &signed.signatures {
        if sig.signature.is_empty() {
            return Err(invalid("schema1 signature is empty".to_string()));
        }
        let header = URL_SAFE_NO_PAD
            .decode(sig.protected.trim_end_matches('='))
            .map_err(|e| invalid(format!("invalid protected header encoding: {}", e)))?;
        let protected: Protected = serde_json::from_slice(&header)
            .map_err(|e| invalid(format!("invalid protected header: {}", e)))?;
        let tail = URL_SAFE_NO_PAD
            .decode(protected.format_tail.trim_end_matches('='))
            .map_err(|e| invalid(format!("invalid formatTail encoding: {}", e)))?;

        match &format {
            None => format = Some((protected.format_length, tail)),
            Some((length, existing_tail)) => {
                if *length != protected.format_length || *existing_tail != tail {
                    return Err(invalid(
                        "schema1 signatures disagree on the signed payload".to_string(),
                    ));
                }
            }
        }
    }

    let (length, tail) = format.ok_or_else(|| invalid("no signatures".to_string()))?;
    if length > manifest.len() {
        return Err(invalid(format!(
            "formatLength {} exceeds manifest length {}",
            length,
            manifest.len()
        )));
    }
    let mut payload = manifest[..length].to_vec();
    payload.extend_from_slice(&tail);
    Ok(payload)
}

/// Convert a manifest to an OCI image manifest.
///
/// Returns the bytes to store and their media type. OCI manifests are
/// returned unchanged; Docker schema2 manifests are rewritten; lists,
/// indexes and schema1 manifests cannot be converted without loss.
pub fn to_oci(manifest: &[u8]) -> Result<(Vec<u8>, &'static str)> {
    match guess_mime_type(manifest) {
        Some(OCI_MANIFEST_MEDIA_TYPE) => {
            serde_json::from_slice::<oci_spec::image::ImageManifest>(manifest).map_err(|e| {
                StowError::UnsupportedConversion(format!("invalid OCI manifest: {}", e))
            })?;
            Ok((manifest.to_vec(), OCI_MANIFEST_MEDIA_TYPE))
        }
        Some(DOCKER_V2_SCHEMA2_MEDIA_TYPE) => {
            let mut m: ImageManifest = serde_json::from_slice(manifest).map_err(|e| {
                StowError::UnsupportedConversion(format!("invalid schema2 manifest: {}", e))
            })?;
            m.media_type = OCI_MANIFEST_MEDIA_TYPE.to_string();
            m.config.media_type = OCI_CONFIG_MEDIA_TYPE.to_string();
            for layer in &mut m.layers {
                layer.media_type = oci_layer_media_type(&layer.media_type)?.to_string();
            }
            Ok((serde_json::to_vec(&m)?, OCI_MANIFEST_MEDIA_TYPE))
        }
        Some(DOCKER_V2_SCHEMA1_MEDIA_TYPE) | Some(DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE) => Err(
            StowError::UnsupportedConversion(
                "can't create OCI manifest from Docker V2 schema 1 manifest".to_string(),
            ),
        ),
        Some(DOCKER_V2_LIST_MEDIA_TYPE) => Err(StowError::UnsupportedConversion(
            "can't create OCI manifest from Docker V2 schema 2 manifest list".to_string(),
        )),
        Some(OCI_INDEX_MEDIA_TYPE) => Err(StowError::UnsupportedConversion(
            "can't create OCI manifest from OCI image index".to_string(),
        )),
        _ => Err(StowError::UnsupportedConversion(
            "unrecognized manifest media type".to_string(),
        )),
    }
}

fn oci_layer_media_type(docker: &str) -> Result<&'static str> {
    match docker {
        DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE | OCI_LAYER_GZIP_MEDIA_TYPE => {
            Ok(OCI_LAYER_GZIP_MEDIA_TYPE)
        }
        DOCKER_V2_SCHEMA2_FOREIGN_LAYER_MEDIA_TYPE | OCI_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE => {
            Ok(OCI_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE)
        }
        DOCKER_V2_SCHEMA2_UNCOMPRESSED_LAYER_MEDIA_TYPE | OCI_LAYER_MEDIA_TYPE => {
            Ok(OCI_LAYER_MEDIA_TYPE)
        }
        other => Err(StowError::UnsupportedConversion(format!(
            "unknown layer media type '{}'",
            other
        ))),
    }
}
