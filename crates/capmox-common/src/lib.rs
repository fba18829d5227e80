//! Common types for the Proxmox machine reconciler: CRDs, errors, events
//! and metrics

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "capmox-controller";
