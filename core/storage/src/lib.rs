//! Durable record storage for the Wayfarer offline queue.
//!
//! The offline store keeps its whole queue in one named record and replaces
//! it on every write. This crate provides the narrow interface it persists
//! through, plus backends and a registry for resolving a backend by name.
//!
//! # Design Principles
//! - Backend isolation: no backend-specific logic in the sync engine
//! - Whole-record writes: a save replaces the record, never patches it
//! - Synchronous I/O: queue writes complete before the in-memory update returns

pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use local::LocalRecordStore;
pub use memory::MemoryRecordStore;
pub use provider::{validate_record_name, RecordStore};
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
