//! Image references and the transports that interpret them.
//!
//! - `named`: Docker-style `registry/repository[:tag][@digest]`
//! - `storage`: images in a local store, with policy namespaces per store
//! - `layout`: tagged images in an OCI layout directory

pub mod layout;
mod named;
mod path;
pub mod storage;
mod transport;

pub use layout::{LayoutReference, LayoutTransport};
pub use named::ImageReference;
pub use storage::{ImageLookup, StorageReference, StorageTransport, StoreSpec};
pub use transport::{ImageRef, ImageTransport};
