//! Persistence layer.
//!
//! - `log`: operation log trait, entry/snapshot types, paged range reads
//! - `memory`: in-process backend for tests and ephemeral servers
//! - `rocks`: RocksDB backend with column families per concern

pub mod log;
pub mod memory;
pub mod rocks;

pub use log::{read_range, LogEntry, LogError, LogRange, OperationLog, Snapshot};
pub use memory::{MemoryHistory, MemoryLog};
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};
