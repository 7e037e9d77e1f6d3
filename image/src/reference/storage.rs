//! The `storage` transport: references into a local image store.
//!
//! A reference is written `[driver@graph_root+run_root:opts]name[:tag][@digest][@id]`
//! or `[...]@id`. Without the bracketed locator it binds to the transport's
//! default store. `id` is the 64-hex store-local image id.

use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use stow_core::config::StoreConfig;
use stow_core::error::{Result, StowError};

use super::path::is_clean_absolute;
use super::{ImageRef, ImageReference, ImageTransport};
use crate::digest::Digest;
use crate::store::StoredImage;

pub const TRANSPORT_NAME: &str = "storage";

/// Name index and digest index of a local image store.
#[async_trait]
pub trait ImageLookup: Send + Sync {
    /// Find an image by one of its names or by its id.
    async fn image(&self, name_or_id: &str) -> Result<Option<StoredImage>>;

    /// All images whose manifest has `digest`, in store order.
    async fn images_by_digest(&self, digest: &Digest) -> Result<Vec<StoredImage>>;
}

/// Identity of a local store: driver, roots and driver options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSpec {
    pub driver: String,
    pub graph_root: PathBuf,
    pub run_root: PathBuf,
    pub options: Vec<String>,
}

impl StoreSpec {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            driver: config.driver.clone(),
            graph_root: config.graph_root.clone(),
            run_root: config.run_root.clone(),
            options: config.options.clone(),
        }
    }

    /// Parse the text between the brackets of a locator. Missing driver,
    /// run root or options are taken from `defaults`.
    fn parse(spec: &str, defaults: &StoreSpec) -> std::result::Result<Self, String> {
        if spec.is_empty() {
            return Err("empty store specifier".to_string());
        }
        let (driver, rest) = match spec.split_once('@') {
            Some((driver, rest)) => (driver.to_string(), rest),
            None => (defaults.driver.clone(), spec),
        };
        if driver.is_empty() {
            return Err("empty driver name".to_string());
        }
        let (roots, options) = match rest.split_once(':') {
            Some((roots, opts)) => (
                roots,
                opts.split(',')
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            None => (rest, defaults.options.clone()),
        };
        let (graph_root, run_root) = match roots.split_once('+') {
            Some((graph, run)) => (PathBuf::from(graph), PathBuf::from(run)),
            None => (PathBuf::from(roots), defaults.run_root.clone()),
        };
        if !graph_root.is_absolute() || !run_root.is_absolute() {
            return Err("store roots must be absolute paths".to_string());
        }
        if has_locator_separator(&graph_root) || has_locator_separator(&run_root) {
            return Err("store roots must not contain ']', ':', '+' or '@'".to_string());
        }
        Ok(Self {
            driver,
            graph_root,
            run_root,
            options,
        })
    }

    /// `[driver@graph_root]`: the store identity used for policy lookups.
    pub fn policy_spec(&self) -> String {
        format!("[{}@{}]", self.driver, self.graph_root.display())
    }

    /// `[graph_root]`: matches the store whatever driver it uses.
    pub fn driverless_spec(&self) -> String {
        format!("[{}]", self.graph_root.display())
    }
}

/// The options section is always written: `[d@g+r:]` names a store with no
/// options, while `[d@g+r]` would take the transport's default options.
impl fmt::Display for StoreSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}@{}+{}:{}]",
            self.driver,
            self.graph_root.display(),
            self.run_root.display(),
            self.options.join(",")
        )
    }
}

fn has_locator_separator(root: &std::path::Path) -> bool {
    root.to_string_lossy().contains([']', ':', '+', '@'])
}

/// The `storage` transport, bound to a default store.
#[derive(Debug, Clone)]
pub struct StorageTransport {
    default_spec: StoreSpec,
}

impl StorageTransport {
    pub fn new(default_spec: StoreSpec) -> Self {
        Self { default_spec }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(StoreSpec::from_config(config))
    }

    pub fn default_spec(&self) -> &StoreSpec {
        &self.default_spec
    }

    /// Change the default store. References already issued keep the
    /// store they were parsed against.
    pub fn set_default_store(&mut self, spec: StoreSpec) {
        self.default_spec = spec;
    }

    /// Parse a storage reference.
    pub fn parse(&self, reference: &str) -> Result<StorageReference> {
        let invalid = |message: String| StowError::InvalidReferenceSyntax {
            reference: reference.to_string(),
            message,
        };

        let (spec, rest) = if let Some(stripped) = reference.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| invalid("store specifier is missing ']'".to_string()))?;
            let spec = StoreSpec::parse(&stripped[..close], &self.default_spec).map_err(invalid)?;
            (spec, &stripped[close + 1..])
        } else {
            (self.default_spec.clone(), reference)
        };

        let (named, id) = parse_name_and_id(rest, ImageReference::parse)
            .map_err(|e| invalid(e.to_string()))?;
        Ok(StorageReference::new(spec, named, id))
    }

    /// Build a reference into this transport's default store.
    pub fn new_reference(
        &self,
        named: Option<ImageReference>,
        id: Option<&str>,
    ) -> Result<StorageReference> {
        if let Some(id) = id {
            if !is_valid_id(id) {
                return Err(StowError::InvalidReferenceSyntax {
                    reference: id.to_string(),
                    message: "image id must be 64 lowercase hex characters".to_string(),
                });
            }
        }
        if named.is_none() && id.is_none() {
            return Err(StowError::InvalidReferenceSyntax {
                reference: String::new(),
                message: "a storage reference needs a name or an id".to_string(),
            });
        }
        Ok(StorageReference::new(
            self.default_spec.clone(),
            named,
            id.map(str::to_string),
        ))
    }
}

impl ImageTransport for StorageTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn parse_reference(&self, reference: &str) -> Result<Box<dyn ImageRef>> {
        Ok(Box::new(self.parse(reference)?))
    }

    fn validate_policy_configuration_scope(&self, scope: &str) -> Result<()> {
        let invalid = |message: &str| StowError::InvalidReferenceSyntax {
            reference: scope.to_string(),
            message: message.to_string(),
        };

        let stripped = scope
            .strip_prefix('[')
            .ok_or_else(|| invalid("scope must start with a [store specifier]"))?;
        let close = stripped
            .find(']')
            .ok_or_else(|| invalid("store specifier is missing ']'"))?;
        let spec = &stripped[..close];
        let rest = &stripped[close + 1..];

        let root = spec.split_once('@').map_or(spec, |(_, root)| root);
        if root.contains('+') || root.contains(':') {
            return Err(invalid("scope store specifier must be [driver@graph_root] or [graph_root]"));
        }
        if !is_clean_absolute(root) {
            return Err(invalid("graph root must be an absolute, clean path"));
        }
        if rest.is_empty() {
            return Ok(());
        }
        parse_name_and_id(rest, ImageReference::parse_explicit).map(|_| ())
    }
}

/// Split `name[:tag][@digest][@id]` or `@id`.
fn parse_name_and_id(
    rest: &str,
    parse_name: fn(&str) -> Result<ImageReference>,
) -> Result<(Option<ImageReference>, Option<String>)> {
    let syntax = |message: &str| StowError::InvalidReferenceSyntax {
        reference: rest.to_string(),
        message: message.to_string(),
    };

    if rest.is_empty() {
        return Err(syntax("a storage reference needs a name or an id"));
    }
    if let Some(id) = rest.strip_prefix('@') {
        if !is_valid_id(id) {
            return Err(syntax("image id must be 64 lowercase hex characters"));
        }
        return Ok((None, Some(id.to_string())));
    }
    match rest.rsplit_once('@') {
        Some((name, id)) if is_valid_id(id) => Ok((Some(parse_name(name)?), Some(id.to_string()))),
        _ => Ok((Some(parse_name(rest)?), None)),
    }
}

fn is_valid_id(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// A reference to an image in a local store.
///
/// Immutable apart from the store-local id, which is recorded once by a
/// successful [`StorageReference::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageReference {
    spec: StoreSpec,
    named: Option<ImageReference>,
    id: OnceLock<String>,
}

impl StorageReference {
    fn new(spec: StoreSpec, named: Option<ImageReference>, id: Option<String>) -> Self {
        let cell = OnceLock::new();
        if let Some(id) = id {
            let _ = cell.set(id);
        }
        Self {
            spec,
            named,
            id: cell,
        }
    }

    pub fn store_spec(&self) -> &StoreSpec {
        &self.spec
    }

    pub fn named(&self) -> Option<&ImageReference> {
        self.named.as_ref()
    }

    /// Store-local image id, if given or already resolved.
    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    fn name_string(&self) -> Option<String> {
        self.named.as_ref().map(ImageReference::full_reference)
    }

    fn matches_repo(image: &StoredImage, named: &ImageReference) -> bool {
        let repo = named.name();
        image
            .names
            .iter()
            .filter_map(|n| ImageReference::parse(n).ok())
            .any(|n| n.name() == repo)
    }

    /// Locate the stored image this reference denotes.
    ///
    /// Order: a known id; an exact name match; for digested references, the
    /// first image with that digest whose names include the same repository.
    /// A named reference must still share a repository with the image found.
    pub async fn resolve(&self, store: &dyn ImageLookup) -> Result<StoredImage> {
        let mut id = self.id().map(str::to_string);

        if id.is_none() {
            if let Some(name) = self.name_string() {
                if let Some(image) = store.image(&name).await? {
                    id = Some(image.id);
                }
            }
        }

        if id.is_none() {
            if let Some(named) = &self.named {
                if let Some(digest) = &named.digest {
                    id = store
                        .images_by_digest(digest)
                        .await?
                        .into_iter()
                        .find(|image| Self::matches_repo(image, named))
                        .map(|image| image.id);
                }
            }
        }

        let id = match id {
            Some(id) => id,
            None => {
                tracing::debug!(
                    reference = %self.string_within_transport(),
                    "Reference does not resolve to an image ID"
                );
                return Err(StowError::NoSuchImage(format!(
                    "reference {:?} does not resolve to an image ID",
                    self.string_within_transport()
                )));
            }
        };

        let image = store.image(&id).await?.ok_or_else(|| {
            StowError::NoSuchImage(format!("image {} is not in the store", id))
        })?;

        if let Some(named) = &self.named {
            if !Self::matches_repo(&image, named) {
                tracing::error!(
                    reference = %self.string_within_transport(),
                    id = %image.id,
                    "No image matching reference found"
                );
                return Err(StowError::NoSuchImage(format!(
                    "no image matching reference {:?} found",
                    self.string_within_transport()
                )));
            }
        }

        let _ = self.id.set(image.id.clone());
        Ok(image)
    }
}

impl ImageRef for StorageReference {
    fn transport_name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn string_within_transport(&self) -> String {
        match (self.name_string(), self.id()) {
            (None, Some(id)) => format!("{}@{}", self.spec, id),
            (Some(name), None) => format!("{}{}", self.spec, name),
            (Some(name), Some(id)) => format!("{}{}@{}", self.spec, name, id),
            (None, None) => self.spec.to_string(),
        }
    }

    fn docker_reference(&self) -> Option<&ImageReference> {
        self.named.as_ref()
    }

    fn policy_configuration_identity(&self) -> String {
        let store = self.spec.policy_spec();
        match (self.name_string(), self.id()) {
            (None, Some(id)) => format!("{}@{}", store, id),
            (Some(name), None) => format!("{}{}", store, name),
            (Some(name), Some(id)) => format!("{}{}@{}", store, name, id),
            (None, None) => store,
        }
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        let store = self.spec.policy_spec();
        let mut namespaces = Vec::new();
        if let Some(named) = &self.named {
            if self.id().is_some() {
                namespaces.push(format!("{}{}", store, named.name_with_tag()));
            }
            let name = named.name();
            let mut components: Vec<&str> = name.split('/').collect();
            while !components.is_empty() {
                namespaces.push(format!("{}{}", store, components.join("/")));
                components.pop();
            }
        }
        namespaces.push(store);
        namespaces.push(self.spec.driverless_spec());
        namespaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    const ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    const OTHER_ID: &str = "fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210";

    fn spec() -> StoreSpec {
        StoreSpec {
            driver: "overlay".to_string(),
            graph_root: PathBuf::from("/var/lib/stow"),
            run_root: PathBuf::from("/run/stow"),
            options: vec!["mountopt=nodev".to_string()],
        }
    }

    fn transport() -> StorageTransport {
        StorageTransport::new(spec())
    }

    #[derive(Default)]
    struct FakeStore {
        images: Vec<StoredImage>,
    }

    impl FakeStore {
        fn with(mut self, id: &str, names: &[&str], digest: &Digest) -> Self {
            self.images.push(StoredImage {
                id: id.to_string(),
                names: names.iter().map(|n| n.to_string()).collect(),
                digests: vec![digest.clone()],
                size_bytes: 0,
                created: Utc::now(),
            });
            self
        }
    }

    #[async_trait]
    impl ImageLookup for FakeStore {
        async fn image(&self, name_or_id: &str) -> Result<Option<StoredImage>> {
            Ok(self
                .images
                .iter()
                .find(|i| i.id == name_or_id || i.names.iter().any(|n| n == name_or_id))
                .cloned())
        }

        async fn images_by_digest(&self, digest: &Digest) -> Result<Vec<StoredImage>> {
            Ok(self
                .images
                .iter()
                .filter(|i| i.digests.contains(digest))
                .cloned()
                .collect())
        }
    }

    #[test]
    fn test_store_spec_display() {
        assert_eq!(
            spec().to_string(),
            "[overlay@/var/lib/stow+/run/stow:mountopt=nodev]"
        );
        assert_eq!(spec().policy_spec(), "[overlay@/var/lib/stow]");
        assert_eq!(spec().driverless_spec(), "[/var/lib/stow]");

        let mut bare = spec();
        bare.options.clear();
        assert_eq!(bare.to_string(), "[overlay@/var/lib/stow+/run/stow:]");
    }

    #[test]
    fn test_explicit_empty_options_round_trip() {
        let t = transport();
        let r = t.parse("[vfs@/srv/graph+/srv/run:]quay.io/x/y:1").unwrap();
        assert!(r.store_spec().options.is_empty());

        let s = r.string_within_transport();
        assert_eq!(s, "[vfs@/srv/graph+/srv/run:]quay.io/x/y:1");
        let again = t.parse(&s).unwrap();
        assert_eq!(again, r);
        assert!(again.store_spec().options.is_empty());
    }

    #[test]
    fn test_parse_rejects_separators_in_roots() {
        let t = transport();
        for input in [
            "[vfs@/srv/gr@ph+/srv/run]busybox",
            "[vfs@/srv/graph+/srv/r+un]busybox",
            "[vfs@/srv/graph+/srv/run@x:]busybox",
        ] {
            let err = t.parse(input).unwrap_err();
            assert!(
                matches!(err, StowError::InvalidReferenceSyntax { .. }),
                "{:?}",
                input
            );
        }
    }

    #[test]
    fn test_parse_with_and_without_locator() {
        let t = transport();
        let a = t.parse("busybox").unwrap();
        assert_eq!(a.store_spec(), &spec());
        assert_eq!(a.named().unwrap().full_reference(), "docker.io/library/busybox:latest");
        assert_eq!(a.id(), None);

        let b = t.parse("[vfs@/srv/graph+/srv/run]example.com/app:v1").unwrap();
        assert_eq!(b.store_spec().driver, "vfs");
        assert_eq!(b.store_spec().graph_root, PathBuf::from("/srv/graph"));
        assert_eq!(b.store_spec().run_root, PathBuf::from("/srv/run"));
        assert_eq!(b.store_spec().options, spec().options);

        let c = t.parse(&format!("[/srv/graph]@{}", ID)).unwrap();
        assert_eq!(c.store_spec().driver, "overlay");
        assert!(c.named().is_none());
        assert_eq!(c.id(), Some(ID));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let t = transport();
        for input in [
            "",
            "[overlay@/var/lib/stow",
            "[overlay@relative]busybox",
            "[]busybox",
            "@notanid",
            "[overlay@/a+/b]",
            "busybox:bad'tag",
        ] {
            let err = t.parse(input).unwrap_err();
            assert!(
                matches!(err, StowError::InvalidReferenceSyntax { .. }),
                "{:?}",
                input
            );
        }
    }

    #[test]
    fn test_string_within_transport_round_trip() {
        let t = transport();
        let digest = Digest::compute(b"manifest");
        for input in [
            "busybox".to_string(),
            "example.com/a/b/c:tag".to_string(),
            format!("example.com/app@{}", digest),
            format!("example.com/app:v1@{}", digest),
            format!("example.com/app:v1@{}", ID),
            format!("@{}", ID),
            format!("[vfs@/srv/graph+/srv/run]quay.io/x/y@{}", ID),
        ] {
            let r = t.parse(&input).unwrap();
            let s = r.string_within_transport();
            assert!(s.starts_with('['), "{}", s);
            assert_eq!(t.parse(&s).unwrap(), r, "{}", input);
        }
    }

    #[test]
    fn test_policy_identity() {
        let t = transport();
        let r = t.parse(&format!("example.com/app:v1@{}", ID)).unwrap();
        assert_eq!(
            r.policy_configuration_identity(),
            format!("[overlay@/var/lib/stow]example.com/app:v1@{}", ID)
        );
        let r = t.parse(&format!("@{}", ID)).unwrap();
        assert_eq!(
            r.policy_configuration_identity(),
            format!("[overlay@/var/lib/stow]@{}", ID)
        );
    }

    #[test]
    fn test_policy_namespaces_order() {
        let t = transport();
        let r = t.parse(&format!("example.com/a/b/c:tag@{}", ID)).unwrap();
        assert_eq!(
            r.policy_configuration_namespaces(),
            vec![
                "[overlay@/var/lib/stow]example.com/a/b/c:tag",
                "[overlay@/var/lib/stow]example.com/a/b/c",
                "[overlay@/var/lib/stow]example.com/a/b",
                "[overlay@/var/lib/stow]example.com/a",
                "[overlay@/var/lib/stow]example.com",
                "[overlay@/var/lib/stow]",
                "[/var/lib/stow]",
            ]
        );

        let r = t.parse("example.com/a:tag").unwrap();
        assert_eq!(r.policy_configuration_namespaces()[0], "[overlay@/var/lib/stow]example.com/a");

        let digest = Digest::compute(b"manifest");
        let r = t
            .parse(&format!("example.com/a/b:tag@{}@{}", digest, ID))
            .unwrap();
        let namespaces = r.policy_configuration_namespaces();
        assert_eq!(namespaces[0], "[overlay@/var/lib/stow]example.com/a/b:tag");
        assert!(namespaces.iter().all(|n| !n.contains(&digest.to_string())));

        let r = t.parse(&format!("@{}", ID)).unwrap();
        assert_eq!(
            r.policy_configuration_namespaces(),
            vec!["[overlay@/var/lib/stow]", "[/var/lib/stow]"]
        );
    }

    #[test]
    fn test_reference_keeps_locator_snapshot() {
        let mut t = transport();
        let r = t.parse("busybox").unwrap();
        let mut other = spec();
        other.graph_root = PathBuf::from("/elsewhere");
        t.set_default_store(other);
        assert_eq!(r.store_spec(), &spec());
        assert_eq!(t.parse("busybox").unwrap().store_spec().graph_root, PathBuf::from("/elsewhere"));
    }

    #[test]
    fn test_validate_policy_scope() {
        let t = transport();
        for scope in [
            "[overlay@/var/lib/stow]",
            "[/var/lib/stow]",
            "[overlay@/var/lib/stow]example.com",
            "[overlay@/var/lib/stow]example.com/a/b:tag",
            &format!("[overlay@/var/lib/stow]@{}", ID),
        ] {
            assert!(t.validate_policy_configuration_scope(scope).is_ok(), "{}", scope);
        }
        for scope in [
            "example.com/a",
            "[overlay@relative]",
            "[overlay@/var/lib/stow+/run/stow]",
            "[overlay@/double//slashes]",
            "[overlay@/has/./dot]",
            "[overlay@/has/dot/../dot]",
            "[overlay@/trailing/slash/]",
            "[overlay@/var/lib/stow]UPPER",
            "[overlay@/var/lib/stow",
        ] {
            assert!(t.validate_policy_configuration_scope(scope).is_err(), "{}", scope);
        }
    }

    #[test]
    fn test_new_reference() {
        let t = transport();
        assert!(t.new_reference(None, None).is_err());
        assert!(t.new_reference(None, Some("short")).is_err());
        let r = t
            .new_reference(Some(ImageReference::parse("busybox").unwrap()), Some(ID))
            .unwrap();
        assert_eq!(r.id(), Some(ID));
    }

    #[tokio::test]
    async fn test_resolve_by_name_records_id() {
        let digest = Digest::compute(b"m");
        let store = FakeStore::default().with(ID, &["docker.io/library/busybox:latest"], &digest);
        let r = transport().parse("busybox").unwrap();
        let image = r.resolve(&store).await.unwrap();
        assert_eq!(image.id, ID);
        assert_eq!(r.id(), Some(ID));
    }

    #[tokio::test]
    async fn test_resolve_by_digest_same_repo_only() {
        let digest = Digest::compute(b"m");
        let store = FakeStore::default()
            .with(OTHER_ID, &["example.com/unrelated:v1"], &digest)
            .with(ID, &["example.com/app:old"], &digest);
        let r = transport()
            .parse(&format!("example.com/app@{}", digest))
            .unwrap();
        assert_eq!(r.resolve(&store).await.unwrap().id, ID);

        let unrelated = FakeStore::default().with(OTHER_ID, &["example.com/unrelated:v1"], &digest);
        let r = transport()
            .parse(&format!("example.com/app@{}", digest))
            .unwrap();
        let err = r.resolve(&unrelated).await.unwrap_err();
        assert!(matches!(err, StowError::NoSuchImage(_)));
        assert_eq!(r.id(), None);
    }

    #[tokio::test]
    async fn test_resolve_by_id() {
        let digest = Digest::compute(b"m");
        let store = FakeStore::default().with(ID, &["example.com/app:v1"], &digest);
        let r = transport().parse(&format!("@{}", ID)).unwrap();
        assert_eq!(r.resolve(&store).await.unwrap().id, ID);
    }

    #[tokio::test]
    async fn test_resolve_stale_id_is_rejected() {
        let digest = Digest::compute(b"m");
        let store = FakeStore::default().with(ID, &["example.com/other:v1"], &digest);
        let r = transport()
            .parse(&format!("example.com/app:v1@{}", ID))
            .unwrap();
        let err = r.resolve(&store).await.unwrap_err();
        assert!(matches!(err, StowError::NoSuchImage(_)));
    }

    #[tokio::test]
    async fn test_resolve_missing() {
        let r = transport().parse("busybox").unwrap();
        let err = r.resolve(&FakeStore::default()).await.unwrap_err();
        assert!(matches!(err, StowError::NoSuchImage(_)));
    }
}
