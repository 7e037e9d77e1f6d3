use std::fmt;

use stow_core::error::Result;

use super::ImageReference;

/// A family of image locations sharing one reference syntax.
pub trait ImageTransport: Send + Sync {
    /// Name used as the transport prefix, e.g. `storage` or `oci`.
    fn name(&self) -> &'static str;

    /// Parse a reference in this transport's syntax.
    fn parse_reference(&self, reference: &str) -> Result<Box<dyn ImageRef>>;

    /// Check that `scope` is a valid policy configuration key for this
    /// transport. The scope need not correspond to an existing image.
    fn validate_policy_configuration_scope(&self, scope: &str) -> Result<()>;
}

/// A transport-qualified image identity.
pub trait ImageRef: fmt::Debug + Send + Sync {
    fn transport_name(&self) -> &'static str;

    /// Reference in the transport's syntax, without the transport prefix.
    /// Parsing it through the same transport yields an equal reference.
    fn string_within_transport(&self) -> String;

    /// The Docker reference the image claims, if the transport has one.
    fn docker_reference(&self) -> Option<&ImageReference>;

    /// Most specific policy lookup key for this image.
    fn policy_configuration_identity(&self) -> String;

    /// Progressively less specific policy lookup keys, most specific first.
    /// Does not include the identity itself.
    fn policy_configuration_namespaces(&self) -> Vec<String>;
}
