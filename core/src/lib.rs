//! Stow Core - Foundational Types
//!
//! Error taxonomy, configuration and logging setup shared by the
//! Stow image storage and trust crates.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{LogLevel, ProxyConfig, StoreConfig, StowConfig};
pub use error::{Result, StowError};

/// Stow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
