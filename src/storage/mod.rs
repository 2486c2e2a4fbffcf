//! Local store gateway and its implementations.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    CheckpointRecord, CollectionCounts, FieldFilter, FilterOp, LocalStore, LogEntry, OrderBy,
    Query,
};
