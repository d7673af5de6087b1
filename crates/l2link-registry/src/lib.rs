//! Tunnel identity registry
//!
//! Holds the authoritative set of tunnel records, allocates link subnets and
//! identifiers, and enforces host-wide uniqueness before anything is persisted.

pub mod error;
pub mod pool;
pub mod registry;
pub mod store;

pub use error::RegistryError;
pub use pool::AddressPool;
pub use registry::TunnelRegistry;
pub use store::{FileStore, LoadReport, MemoryStore, RecordStore, SkippedRecord, StoreError};
