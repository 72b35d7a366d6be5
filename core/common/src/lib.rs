//! Common utilities and types shared across Wayfarer sync crates.
//!
//! This module provides the error taxonomy and the identifier types used by
//! the offline store, the conflict resolver and the sync orchestrator.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{DeviceId, EntityKey};
