//! Repository ports (trait interfaces)
//!
//! Port/Adapter pattern for backend flexibility:
//! - Testing: InMemory (fast unit tests, `infrastructure::memory`)
//! - Production: key-value / relational / document adapters (out of tree)
//!
//! Every mutating operation is an idempotent put keyed by natural identity
//! plus content hash. There are no global locks.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use super::models::{
    InvertedIndexEntry, OutboxEntry, PutOutcome, RawDataRecord, SliceKey, SliceRecord,
};
use crate::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Raw data
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait RawDataRepository: Send + Sync {
    /// Get a raw record at an exact version
    async fn get(&self, tenant_id: &str, entity_key: &str, version: u64)
        -> Result<Option<RawDataRecord>>;

    /// Write a raw record
    ///
    /// - Same (entity, version) with the same hash: `Skipped`
    /// - Same (entity, version) with a different hash: `Conflict` error
    async fn put_idempotent(&self, record: &RawDataRecord) -> Result<PutOutcome>;

    /// Highest stored version for an entity
    async fn latest_version(&self, tenant_id: &str, entity_key: &str) -> Result<Option<u64>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new entry; a duplicate idempotency key is `Skipped`
    async fn insert(&self, entry: &OutboxEntry) -> Result<PutOutcome>;

    /// PENDING entries in insertion order (read-only)
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Claim up to `limit` entries for `worker_id`
    ///
    /// Claimable: PENDING, or PROCESSING with a claim older than
    /// `stale_after` (crash recovery). Claimed entries become PROCESSING
    /// with `claimed_at`/`claimed_by` stamped. Insertion order.
    async fn claim_batch(
        &self,
        limit: usize,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Vec<OutboxEntry>>;

    /// Bulk transition to PROCESSED
    async fn mark_processed(&self, ids: &[Uuid]) -> Result<()>;

    /// Transition one entry to FAILED with the captured reason
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slices
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait SliceRepository: Send + Sync {
    /// Idempotent batch put
    ///
    /// The whole batch is checked first; any key whose stored hash differs
    /// from the incoming one fails the call with a `Conflict` carrying the
    /// key, and nothing is written.
    async fn put_all_idempotent(&self, slices: &[SliceRecord]) -> Result<Vec<PutOutcome>>;

    /// Fetch by keys; missing keys are simply absent from the result
    async fn batch_get(
        &self,
        keys: &[SliceKey],
        include_tombstones: bool,
    ) -> Result<Vec<SliceRecord>>;

    /// All slices of an entity at one version, ordered by slice type
    async fn get_by_version(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        include_tombstones: bool,
    ) -> Result<Vec<SliceRecord>>;

    /// Slices whose entity key starts with `prefix`
    async fn find_by_key_prefix(
        &self,
        tenant_id: &str,
        prefix: &str,
        include_tombstones: bool,
    ) -> Result<Vec<SliceRecord>>;

    /// Number of slice records stored for an entity (all versions, tombstones included)
    async fn count(&self, tenant_id: &str, entity_key: &str) -> Result<usize>;

    /// Highest version with at least one slice
    async fn get_latest_version(&self, tenant_id: &str, entity_key: &str) -> Result<Option<u64>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inverted index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One page of index lookups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPage {
    pub entries: Vec<InvertedIndexEntry>,
    /// Opaque cursor for the next page; `None` when exhausted
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait InvertedIndexRepository: Send + Sync {
    async fn put_all_idempotent(&self, entries: &[InvertedIndexEntry]) -> Result<Vec<PutOutcome>>;

    /// Entries for `index_type = index_value` (value normalized before lookup)
    ///
    /// Results are ordered by target entity key then target version.
    /// Tombstoned entries are returned; callers filter them.
    async fn query_by_index_type(
        &self,
        tenant_id: &str,
        index_type: &str,
        index_value: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<IndexPage>;

    async fn count_by_index_type(
        &self,
        tenant_id: &str,
        index_type: &str,
        index_value: &str,
    ) -> Result<usize>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transactional ingest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw write and outbox insert in one unit of work
#[async_trait]
pub trait IngestUnitOfWork: Send + Sync {
    /// Commit both or neither
    ///
    /// Re-committing an identical record is `Skipped` and does not insert a
    /// second outbox entry.
    async fn commit(&self, record: &RawDataRecord, entry: &OutboxEntry) -> Result<PutOutcome>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipReceipt {
    pub sink_id: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShipItem {
    pub tenant_id: String,
    pub entity_key: String,
    pub version: u64,
    pub payload: Value,
}

/// Narrow delivery capability to an external sink
#[async_trait]
pub trait SinkPort: Send + Sync {
    fn sink_id(&self) -> &str;

    async fn ship(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        payload: &Value,
    ) -> Result<ShipReceipt>;

    async fn ship_batch(&self, items: &[ShipItem]) -> Result<Vec<ShipReceipt>> {
        let mut receipts = Vec::with_capacity(items.len());
        for item in items {
            receipts.push(
                self.ship(&item.tenant_id, &item.entity_key, item.version, &item.payload)
                    .await?,
            );
        }
        Ok(receipts)
    }
}
