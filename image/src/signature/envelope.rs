//! The signed payload: an "atomic container signature" JSON document.
//!
//! ```json
//! {
//!   "critical": {
//!     "type": "atomic container signature",
//!     "image": {"docker-manifest-digest": "sha256:..."},
//!     "identity": {"docker-reference": "example.com/app:v1"}
//!   },
//!   "optional": {"creator": "...", "timestamp": 1700000000}
//! }
//! ```
//!
//! Parsing is strict: every member of `critical` must be understood.

use serde::{Deserialize, Serialize};
use stow_core::error::{Result, StowError};

use crate::digest::Digest;

const SIGNATURE_TYPE: &str = "atomic container signature";

/// Claims carried by a signature before it has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntrustedSignature {
    pub docker_manifest_digest: Digest,
    pub docker_reference: String,
    pub creator: Option<String>,
    pub timestamp: Option<i64>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Wire {
    critical: Critical,
    optional: Optional,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Critical {
    #[serde(rename = "type")]
    kind: String,
    image: Image,
    identity: Identity,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Image {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: Digest,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Identity {
    #[serde(rename = "docker-reference")]
    docker_reference: String,
}

#[derive(Default, Serialize, Deserialize)]
struct Optional {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

impl UntrustedSignature {
    /// Claims for `docker_reference` at `docker_manifest_digest`, stamped
    /// with this library as creator and the current time.
    pub fn new(docker_manifest_digest: Digest, docker_reference: impl Into<String>) -> Self {
        Self {
            docker_manifest_digest,
            docker_reference: docker_reference.into(),
            creator: Some(format!("stow {}", crate::VERSION)),
            timestamp: Some(chrono::Utc::now().timestamp()),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let wire = Wire {
            critical: Critical {
                kind: SIGNATURE_TYPE.to_string(),
                image: Image {
                    docker_manifest_digest: self.docker_manifest_digest.clone(),
                },
                identity: Identity {
                    docker_reference: self.docker_reference.clone(),
                },
            },
            optional: Optional {
                creator: self.creator.clone(),
                timestamp: self.timestamp,
            },
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parse a payload, rejecting anything not exactly in the expected form.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let wire: Wire = serde_json::from_slice(data)
            .map_err(|e| StowError::SignatureInvalid(format!("malformed signature payload: {}", e)))?;
        if wire.critical.kind != SIGNATURE_TYPE {
            return Err(StowError::SignatureInvalid(format!(
                "unrecognized signature type {:?}",
                wire.critical.kind
            )));
        }
        Ok(Self {
            docker_manifest_digest: wire.critical.image.docker_manifest_digest,
            docker_reference: wire.critical.identity.docker_reference,
            creator: wire.optional.creator,
            timestamp: wire.optional.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UntrustedSignature {
        UntrustedSignature::new(Digest::compute(b"manifest"), "example.com/app:v1")
    }

    #[test]
    fn test_wire_shape() {
        let json: serde_json::Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["critical"]["type"], "atomic container signature");
        assert_eq!(
            json["critical"]["image"]["docker-manifest-digest"],
            Digest::compute(b"manifest").to_string()
        );
        assert_eq!(json["critical"]["identity"]["docker-reference"], "example.com/app:v1");
        assert!(json["optional"]["creator"].as_str().unwrap().starts_with("stow "));
        assert!(json["optional"]["timestamp"].is_i64());
    }

    #[test]
    fn test_parse_back() {
        let s = sample();
        assert_eq!(UntrustedSignature::from_json(&s.to_json().unwrap()).unwrap(), s);
    }

    #[test]
    fn test_optional_is_lenient() {
        let digest = Digest::compute(b"m");
        let data = format!(
            r#"{{"critical":{{"type":"atomic container signature","image":{{"docker-manifest-digest":"{}"}},"identity":{{"docker-reference":"a/b:c"}}}},"optional":{{"extra":true}}}}"#,
            digest
        );
        let s = UntrustedSignature::from_json(data.as_bytes()).unwrap();
        assert_eq!(s.docker_reference, "a/b:c");
        assert_eq!(s.creator, None);
    }

    #[test]
    fn test_rejects_malformed() {
        let digest = Digest::compute(b"m");
        let cases = [
            "not json".to_string(),
            "{}".to_string(),
            format!(
                r#"{{"critical":{{"type":"something else","image":{{"docker-manifest-digest":"{}"}},"identity":{{"docker-reference":"a"}}}},"optional":{{}}}}"#,
                digest
            ),
            format!(
                r#"{{"critical":{{"type":"atomic container signature","image":{{"docker-manifest-digest":"{}"}},"identity":{{"docker-reference":"a"}},"unknown":1}},"optional":{{}}}}"#,
                digest
            ),
            r#"{"critical":{"type":"atomic container signature","image":{"docker-manifest-digest":"sha256:short"},"identity":{"docker-reference":"a"}},"optional":{}}"#.to_string(),
            format!(
                r#"{{"critical":{{"type":"atomic container signature","image":{{"docker-manifest-digest":"{}"}}}},"optional":{{}}}}"#,
                digest
            ),
        ];
        for case in cases {
            let err = UntrustedSignature::from_json(case.as_bytes()).unwrap_err();
            assert!(matches!(err, StowError::SignatureInvalid(_)), "{}", case);
        }
    }
}
