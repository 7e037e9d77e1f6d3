//! Image stores: OCI layout directories and the local image index.

mod images;
mod layout;

pub use images::{ImageStore, StoredImage};
pub use layout::LayoutStore;
