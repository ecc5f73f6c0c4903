//! Domain layer for the slice pipeline stores
//!
//! # Domain Models
//!
//! - `RawDataRecord`: immutable, versioned, content-hashed raw input
//! - `OutboxEntry`: transactional-outbox row with claim lifecycle
//! - `SliceRecord` / `Tombstone`: derived, typed, content-hashed output
//! - `InvertedIndexEntry`: reverse reference used for fanout
//!
//! # Port Traits
//!
//! - `RawDataRepository`, `OutboxRepository`, `SliceRepository`,
//!   `InvertedIndexRepository`, `IngestUnitOfWork`, `SinkPort`

pub mod models;
pub mod ports;

pub use models::*;
pub use ports::*;
