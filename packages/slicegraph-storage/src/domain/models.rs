//! Domain models
//!
//! All records are identified by natural keys. Writes are idempotent: the
//! content hash decides between "skip" (same hash) and "conflict"
//! (different hash for the same key).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::hashing;

// ═══════════════════════════════════════════════════════════════════════════
// Entity keys
// ═══════════════════════════════════════════════════════════════════════════

/// Separator used in entity keys (`TYPE#tenant#id`)
pub const ENTITY_KEY_SEPARATOR: char = '#';

/// Build an entity key: `PRODUCT#t1#p1`
pub fn make_entity_key(entity_type: &str, tenant_id: &str, id: &str) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        entity_type,
        tenant_id,
        id,
        sep = ENTITY_KEY_SEPARATOR
    )
}

/// Entity type prefix of a key (`PRODUCT#t1#p1` → `PRODUCT`)
pub fn entity_type_of(entity_key: &str) -> Option<&str> {
    entity_key
        .split_once(ENTITY_KEY_SEPARATOR)
        .map(|(ty, _)| ty)
        .filter(|ty| !ty.is_empty())
}

/// Trailing id segment of a key (`PRODUCT#t1#p1` → `p1`)
pub fn entity_id_of(entity_key: &str) -> Option<&str> {
    let mut parts = entity_key.splitn(3, ENTITY_KEY_SEPARATOR);
    let _ty = parts.next()?;
    let _tenant = parts.next()?;
    parts.next().filter(|id| !id.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════
// Raw data
// ═══════════════════════════════════════════════════════════════════════════

/// Immutable, versioned raw record
///
/// Versions are monotonic per entity and start at 1. The payload is stored
/// canonicalized, and `content_hash` covers the payload plus schema identity.
///
/// # Examples
///
/// ```rust
/// use slicegraph_storage::domain::RawDataRecord;
/// use serde_json::json;
///
/// let a = RawDataRecord::new("t1", "PRODUCT#t1#p1", 1, "product", "1", json!({"b": 1, "a": 2}));
/// let b = RawDataRecord::new("t1", "PRODUCT#t1#p1", 1, "product", "1", json!({"a": 2, "b": 1}));
/// assert_eq!(a.content_hash, b.content_hash);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataRecord {
    pub tenant_id: String,
    pub entity_key: String,
    pub version: u64,
    pub schema_id: String,
    pub schema_version: String,
    pub payload: Value,
    pub content_hash: String,
}

impl RawDataRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        entity_key: impl Into<String>,
        version: u64,
        schema_id: impl Into<String>,
        schema_version: impl Into<String>,
        payload: Value,
    ) -> Self {
        let schema_id = schema_id.into();
        let schema_version = schema_version.into();
        let payload = hashing::canonicalize(&payload);
        let content_hash = hashing::raw_content_hash(&payload, &schema_id, &schema_version);

        Self {
            tenant_id: tenant_id.into(),
            entity_key: entity_key.into(),
            version,
            schema_id,
            schema_version,
            payload,
            content_hash,
        }
    }

    /// `tenant/entity@vN`, used in logs and error keys
    pub fn natural_key(&self) -> String {
        raw_key(&self.tenant_id, &self.entity_key, self.version)
    }
}

pub fn raw_key(tenant_id: &str, entity_key: &str, version: u64) -> String {
    format!("{}/{}@v{}", tenant_id, entity_key, version)
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbox
// ═══════════════════════════════════════════════════════════════════════════

/// Aggregate that produced an outbox entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateType {
    RawData,
    Slice,
    ChangeSet,
    /// Unrecognized aggregate, kept verbatim so the worker can fail it
    Other(String),
}

impl AggregateType {
    pub fn as_str(&self) -> &str {
        match self {
            AggregateType::RawData => "RAW_DATA",
            AggregateType::Slice => "SLICE",
            AggregateType::ChangeSet => "CHANGESET",
            AggregateType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "RAW_DATA" => AggregateType::RawData,
            "SLICE" => AggregateType::Slice,
            "CHANGESET" => AggregateType::ChangeSet,
            other => AggregateType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Well-known outbox event types
pub mod event_types {
    pub const RAW_DATA_INGESTED: &str = "RawDataIngested";
    pub const SHIP_REQUESTED: &str = "ShipRequested";
    pub const ENTITY_CHANGED: &str = "EntityChanged";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Processed => "PROCESSED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

/// Transactional-outbox row
///
/// Written in the same unit of work as the state change it announces.
/// Lifecycle: PENDING → PROCESSING (claim) → PROCESSED | FAILED. A
/// PROCESSING row whose claim is older than the staleness threshold can be
/// reclaimed by any worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub idempotency_key: String,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub event_type: String,
    /// Serialized JSON payload
    pub payload: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub failure_reason: Option<String>,
}

impl OutboxEntry {
    /// Create a new PENDING entry
    pub fn new(
        idempotency_key: impl Into<String>,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            aggregate_type,
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            claimed_at: None,
            claimed_by: None,
            failure_reason: None,
        }
    }

    /// True when a PROCESSING claim is older than `stale_after`
    pub fn is_stale_claim(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == OutboxStatus::Processing
            && self
                .claimed_at
                .map(|claimed| now - claimed > stale_after)
                .unwrap_or(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Slices
// ═══════════════════════════════════════════════════════════════════════════

/// Natural identity of a slice: one record per (entity, version, sliceType)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceKey {
    pub tenant_id: String,
    pub entity_key: String,
    pub version: u64,
    pub slice_type: String,
}

impl SliceKey {
    pub fn new(
        tenant_id: impl Into<String>,
        entity_key: impl Into<String>,
        version: u64,
        slice_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            entity_key: entity_key.into(),
            version,
            slice_type: slice_type.into(),
        }
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/v{}/{}",
            self.tenant_id, self.entity_key, self.version, self.slice_type
        )
    }
}

/// Marks a slice type as intentionally absent at a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub is_deleted: bool,
    pub deleted_at_version: u64,
    pub delete_reason: String,
}

impl Tombstone {
    pub fn new(deleted_at_version: u64, delete_reason: impl Into<String>) -> Self {
        Self {
            is_deleted: true,
            deleted_at_version,
            delete_reason: delete_reason.into(),
        }
    }
}

/// Derived, typed, content-hashed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
    pub tenant_id: String,
    pub entity_key: String,
    pub version: u64,
    pub slice_type: String,
    pub data: Value,
    pub content_hash: String,
    pub rule_set_id: String,
    pub rule_set_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Tombstone>,
}

impl SliceRecord {
    /// Live slice; the hash is computed from `data`.
    pub fn new(
        tenant_id: impl Into<String>,
        entity_key: impl Into<String>,
        version: u64,
        slice_type: impl Into<String>,
        data: Value,
        rule_set_id: impl Into<String>,
        rule_set_version: impl Into<String>,
    ) -> Self {
        let data = hashing::canonicalize(&data);
        let content_hash = hashing::slice_content_hash(&data);
        Self {
            tenant_id: tenant_id.into(),
            entity_key: entity_key.into(),
            version,
            slice_type: slice_type.into(),
            data,
            content_hash,
            rule_set_id: rule_set_id.into(),
            rule_set_version: rule_set_version.into(),
            tombstone: None,
        }
    }

    /// Tombstone slice with a deterministic hash
    pub fn tombstone(
        tenant_id: impl Into<String>,
        entity_key: impl Into<String>,
        version: u64,
        slice_type: impl Into<String>,
        reason: impl Into<String>,
        rule_set_id: impl Into<String>,
        rule_set_version: impl Into<String>,
    ) -> Self {
        let entity_key = entity_key.into();
        let slice_type = slice_type.into();
        let content_hash = hashing::tombstone_hash(&entity_key, &slice_type, version);
        Self {
            tenant_id: tenant_id.into(),
            entity_key,
            version,
            slice_type,
            data: Value::Null,
            content_hash,
            rule_set_id: rule_set_id.into(),
            rule_set_version: rule_set_version.into(),
            tombstone: Some(Tombstone::new(version, reason)),
        }
    }

    /// Same data and hash, stamped at a new version.
    ///
    /// Tombstones are re-derived since their hash includes the version.
    pub fn restamp(&self, version: u64) -> Self {
        match &self.tombstone {
            Some(t) => Self::tombstone(
                self.tenant_id.clone(),
                self.entity_key.clone(),
                version,
                self.slice_type.clone(),
                t.delete_reason.clone(),
                self.rule_set_id.clone(),
                self.rule_set_version.clone(),
            ),
            None => Self {
                version,
                ..self.clone()
            },
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone.as_ref().map(|t| t.is_deleted).unwrap_or(false)
    }

    pub fn key(&self) -> SliceKey {
        SliceKey::new(
            self.tenant_id.clone(),
            self.entity_key.clone(),
            self.version,
            self.slice_type.clone(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inverted index
// ═══════════════════════════════════════════════════════════════════════════

/// "target's slice of `slice_type` references `ref_entity_key` via
/// `index_type = index_value`"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertedIndexEntry {
    pub tenant_id: String,
    pub ref_entity_key: String,
    pub ref_version: u64,
    pub target_entity_key: String,
    pub target_version: u64,
    pub index_type: String,
    /// Normalized (trimmed, lowercased)
    pub index_value: String,
    pub slice_type: String,
    pub slice_hash: String,
    pub tombstone: bool,
}

impl InvertedIndexEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        ref_entity_key: impl Into<String>,
        ref_version: u64,
        target_entity_key: impl Into<String>,
        target_version: u64,
        index_type: impl Into<String>,
        index_value: &str,
        slice_type: impl Into<String>,
        slice_hash: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ref_entity_key: ref_entity_key.into(),
            ref_version,
            target_entity_key: target_entity_key.into(),
            target_version,
            index_type: index_type.into(),
            index_value: hashing::normalize_index_value(index_value),
            slice_type: slice_type.into(),
            slice_hash: slice_hash.into(),
            tombstone: false,
        }
    }

    pub fn with_tombstone(mut self, tombstone: bool) -> Self {
        self.tombstone = tombstone;
        self
    }

    /// Natural identity: one entry per (target, version, index type, value, slice type)
    pub fn natural_key(&self) -> String {
        format!(
            "{}/{}/v{}/{}={}/{}",
            self.tenant_id,
            self.target_entity_key,
            self.target_version,
            self.index_type,
            self.index_value,
            self.slice_type
        )
    }
}

/// Outcome of an idempotent put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutOutcome {
    Inserted,
    /// Identical record already present
    Skipped,
}
