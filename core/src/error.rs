use thiserror::Error;

/// Stow error types
#[derive(Error, Debug)]
pub enum StowError {
    /// Reference string could not be parsed for the transport
    #[error("Invalid reference syntax: {reference} - {message}")]
    InvalidReferenceSyntax { reference: String, message: String },

    /// No stored image matches the reference
    #[error("No such image: {0}")]
    NoSuchImage(String),

    /// Streamed blob length differs from the declared length
    #[error("Size mismatch for {subject}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        subject: String,
        expected: u64,
        actual: u64,
    },

    /// Manifest cannot be translated into the destination's schema
    #[error("Unsupported manifest conversion: {0}")]
    UnsupportedConversion(String),

    /// Destination cannot persist detached signatures
    #[error("Signatures unsupported: {0}")]
    SignaturesUnsupported(String),

    /// Manifest bytes cannot be deterministically digested
    #[error("Manifest digest error: {0}")]
    ManifestDigestError(String),

    /// Reference is empty or not fully qualified
    #[error("Invalid reference: {reference:?} - {message}")]
    InvalidReference { reference: String, message: String },

    /// Signing mechanism failed to produce a signature
    #[error("Signing failed: {0}")]
    SigningError(String),

    /// Signature could not be authenticated or parsed
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// Signature was made by a different key than expected
    #[error("Key mismatch: expected {expected}, signed by {actual}")]
    KeyMismatch { expected: String, actual: String },

    /// Signature claims a different image identity than expected
    #[error("Reference mismatch: expected {expected:?}, signature claims {actual:?}")]
    ReferenceMismatch { expected: String, actual: String },

    /// Content digest differs from the claimed digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Operation not supported by this store
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StowError {
    /// Whether the error means "content is readable but not trusted".
    ///
    /// `ManifestDigestError` is not included: it reports malformed input.
    pub fn is_untrusted(&self) -> bool {
        matches!(
            self,
            StowError::SignatureInvalid(_)
                | StowError::KeyMismatch { .. }
                | StowError::ReferenceMismatch { .. }
                | StowError::DigestMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for StowError {
    fn from(err: serde_json::Error) -> Self {
        StowError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StowError {
    fn from(err: serde_yaml::Error) -> Self {
        StowError::SerializationError(err.to_string())
    }
}

/// Result type alias for Stow operations
pub type Result<T> = std::result::Result<T, StowError>;
