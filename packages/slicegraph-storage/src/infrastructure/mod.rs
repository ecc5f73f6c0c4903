//! Infrastructure layer - Storage adapters
//!
//! Only the in-memory adapters live in this crate. Persistent backends
//! implement the same ports out of tree.

pub mod memory;

pub use memory::{
    InMemoryIndexRepository, InMemoryIngestUnitOfWork, InMemoryOutboxRepository,
    InMemoryRawDataRepository, InMemorySliceRepository, RecordingSink,
};
