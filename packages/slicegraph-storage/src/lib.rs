//! slicegraph-storage - versioned raw/slice/index stores behind ports
//!
//! > Every write is an idempotent put keyed by natural identity plus content hash.
//!
//! ## Core Principles
//!
//! 1. **Immutability**: raw records and slices are never updated in place
//! 2. **Determinism**: content hashes come from canonical JSON (`hashing`)
//! 3. **Idempotency**: same hash ⇒ skip, different hash ⇒ conflict
//! 4. **Transactional outbox**: raw data and its event commit together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use slicegraph_storage::domain::{RawDataRecord, SliceRepository};
//! use slicegraph_storage::infrastructure::InMemorySliceRepository;
//!
//! let slices = InMemorySliceRepository::new();
//! slices.put_all_idempotent(&records).await?;
//! let live = slices.get_by_version("t1", "PRODUCT#t1#p1", 2, false).await?;
//! ```

pub mod domain;
pub mod error;
pub mod hashing;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    AggregateType, IndexPage, IngestUnitOfWork, InvertedIndexEntry, InvertedIndexRepository,
    OutboxEntry, OutboxRepository, OutboxStatus, PutOutcome, RawDataRecord, RawDataRepository,
    ShipItem, ShipReceipt, SinkPort, SliceKey, SliceRecord, SliceRepository, Tombstone,
};
