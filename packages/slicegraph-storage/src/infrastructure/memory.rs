//! In-memory adapters (for tests and local runs)
//!
//! `parking_lot::Mutex`-guarded maps implementing every port. Each adapter
//! exposes `list_all()` and `clear()` so tests can inspect state directly.
//! NOT for production use.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::models::{
    raw_key, InvertedIndexEntry, OutboxEntry, OutboxStatus, PutOutcome, RawDataRecord, SliceKey,
    SliceRecord,
};
use crate::domain::ports::{
    IndexPage, IngestUnitOfWork, InvertedIndexRepository, OutboxRepository, RawDataRepository,
    ShipReceipt, SinkPort, SliceRepository,
};
use crate::hashing::normalize_index_value;
use crate::{Result, StorageError};

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

// ═══════════════════════════════════════════════════════════════════════════
// Raw data
// ═══════════════════════════════════════════════════════════════════════════

type EntityId = (String, String);

#[derive(Default)]
pub struct InMemoryRawDataRepository {
    records: Mutex<HashMap<EntityId, BTreeMap<u64, RawDataRecord>>>,
}

impl InMemoryRawDataRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_all(&self) -> Vec<RawDataRecord> {
        let records = self.records.lock();
        let mut all: Vec<RawDataRecord> = records
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect();
        all.sort_by(|a, b| {
            (&a.tenant_id, &a.entity_key, a.version).cmp(&(&b.tenant_id, &b.entity_key, b.version))
        });
        all
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn check_put(
        records: &HashMap<EntityId, BTreeMap<u64, RawDataRecord>>,
        record: &RawDataRecord,
    ) -> Result<PutOutcome> {
        let existing = records
            .get(&(record.tenant_id.clone(), record.entity_key.clone()))
            .and_then(|versions| versions.get(&record.version));

        match existing {
            Some(stored) if stored.content_hash == record.content_hash => Ok(PutOutcome::Skipped),
            Some(stored) => Err(StorageError::conflict(
                record.natural_key(),
                &stored.content_hash,
                &record.content_hash,
            )),
            None => Ok(PutOutcome::Inserted),
        }
    }

    fn insert_unchecked(
        records: &mut HashMap<EntityId, BTreeMap<u64, RawDataRecord>>,
        record: &RawDataRecord,
    ) {
        records
            .entry((record.tenant_id.clone(), record.entity_key.clone()))
            .or_default()
            .insert(record.version, record.clone());
    }
}

#[async_trait]
impl RawDataRepository for InMemoryRawDataRepository {
    async fn get(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
    ) -> Result<Option<RawDataRecord>> {
        Ok(self
            .records
            .lock()
            .get(&(tenant_id.to_string(), entity_key.to_string()))
            .and_then(|versions| versions.get(&version).cloned()))
    }

    async fn put_idempotent(&self, record: &RawDataRecord) -> Result<PutOutcome> {
        let mut records = self.records.lock();
        let outcome = Self::check_put(&records, record)?;
        if outcome == PutOutcome::Inserted {
            Self::insert_unchecked(&mut records, record);
        }
        Ok(outcome)
    }

    async fn latest_version(&self, tenant_id: &str, entity_key: &str) -> Result<Option<u64>> {
        Ok(self
            .records
            .lock()
            .get(&(tenant_id.to_string(), entity_key.to_string()))
            .and_then(|versions| versions.keys().next_back().copied()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbox
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct OutboxTable {
    /// Insertion order
    entries: Vec<OutboxEntry>,
    idempotency_keys: HashSet<String>,
}

impl OutboxTable {
    fn insert(&mut self, entry: &OutboxEntry) -> PutOutcome {
        if !self.idempotency_keys.insert(entry.idempotency_key.clone()) {
            return PutOutcome::Skipped;
        }
        self.entries.push(entry.clone());
        PutOutcome::Inserted
    }
}

#[derive(Default)]
pub struct InMemoryOutboxRepository {
    table: Mutex<OutboxTable>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_all(&self) -> Vec<OutboxEntry> {
        self.table.lock().entries.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxEntry> {
        self.table.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn count_by_status(&self, status: OutboxStatus) -> usize {
        self.table
            .lock()
            .entries
            .iter()
            .filter(|e| e.status == status)
            .count()
    }

    /// Force an entry back into a PROCESSING claim (crash simulation in tests)
    pub fn force_claim(&self, id: Uuid, worker_id: &str, claimed_at: chrono::DateTime<Utc>) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.iter_mut().find(|e| e.id == id) {
            entry.status = OutboxStatus::Processing;
            entry.claimed_by = Some(worker_id.to_string());
            entry.claimed_at = Some(claimed_at);
        }
    }

    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.entries.clear();
        table.idempotency_keys.clear();
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn insert(&self, entry: &OutboxEntry) -> Result<PutOutcome> {
        Ok(self.table.lock().insert(entry))
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .table
            .lock()
            .entries
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        let now = Utc::now();
        let stale_after = to_chrono(stale_after);
        let mut table = self.table.lock();

        let mut claimed = Vec::new();
        for entry in table.entries.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let claimable = entry.status == OutboxStatus::Pending
                || entry.is_stale_claim(now, stale_after);
            if claimable {
                entry.status = OutboxStatus::Processing;
                entry.claimed_at = Some(now);
                entry.claimed_by = Some(worker_id.to_string());
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, ids: &[Uuid]) -> Result<()> {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut table = self.table.lock();
        for entry in table.entries.iter_mut().filter(|e| ids.contains(&e.id)) {
            entry.status = OutboxStatus::Processed;
            entry.failure_reason = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()> {
        let mut table = self.table.lock();
        let entry = table
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StorageError::not_found("outbox entry", id.to_string()))?;
        entry.status = OutboxStatus::Failed;
        entry.failure_reason = Some(reason.to_string());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transactional ingest
// ═══════════════════════════════════════════════════════════════════════════

/// Atomic raw + outbox commit over the two in-memory repositories
///
/// Lock order: raw, then outbox.
pub struct InMemoryIngestUnitOfWork {
    raw: Arc<InMemoryRawDataRepository>,
    outbox: Arc<InMemoryOutboxRepository>,
}

impl InMemoryIngestUnitOfWork {
    pub fn new(raw: Arc<InMemoryRawDataRepository>, outbox: Arc<InMemoryOutboxRepository>) -> Self {
        Self { raw, outbox }
    }
}

#[async_trait]
impl IngestUnitOfWork for InMemoryIngestUnitOfWork {
    async fn commit(&self, record: &RawDataRecord, entry: &OutboxEntry) -> Result<PutOutcome> {
        let mut records = self.raw.records.lock();
        let mut table = self.outbox.table.lock();

        let outcome = InMemoryRawDataRepository::check_put(&records, record)?;
        if outcome == PutOutcome::Inserted {
            InMemoryRawDataRepository::insert_unchecked(&mut records, record);
            table.insert(entry);
        }
        Ok(outcome)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Slices
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemorySliceRepository {
    slices: Mutex<BTreeMap<SliceKey, SliceRecord>>,
}

impl InMemorySliceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_all(&self) -> Vec<SliceRecord> {
        self.slices.lock().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.slices.lock().clear();
    }
}

fn visible(slice: &SliceRecord, include_tombstones: bool) -> bool {
    include_tombstones || !slice.is_tombstone()
}

#[async_trait]
impl SliceRepository for InMemorySliceRepository {
    async fn put_all_idempotent(&self, slices: &[SliceRecord]) -> Result<Vec<PutOutcome>> {
        let mut store = self.slices.lock();

        // Validate first so a conflict leaves the store untouched
        let mut outcomes = Vec::with_capacity(slices.len());
        let mut batch_hashes: HashMap<SliceKey, &str> = HashMap::new();
        for slice in slices {
            let key = slice.key();
            let existing = store
                .get(&key)
                .map(|s| s.content_hash.as_str())
                .or_else(|| batch_hashes.get(&key).copied());
            match existing {
                Some(hash) if hash == slice.content_hash => outcomes.push(PutOutcome::Skipped),
                Some(hash) => {
                    return Err(StorageError::conflict(
                        key.to_string(),
                        hash,
                        &slice.content_hash,
                    ))
                }
                None => {
                    batch_hashes.insert(key, slice.content_hash.as_str());
                    outcomes.push(PutOutcome::Inserted);
                }
            }
        }

        for (slice, outcome) in slices.iter().zip(&outcomes) {
            if *outcome == PutOutcome::Inserted {
                store.insert(slice.key(), slice.clone());
            }
        }
        Ok(outcomes)
    }

    async fn batch_get(
        &self,
        keys: &[SliceKey],
        include_tombstones: bool,
    ) -> Result<Vec<SliceRecord>> {
        let store = self.slices.lock();
        Ok(keys
            .iter()
            .filter_map(|key| store.get(key))
            .filter(|s| visible(s, include_tombstones))
            .cloned()
            .collect())
    }

    async fn get_by_version(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        include_tombstones: bool,
    ) -> Result<Vec<SliceRecord>> {
        Ok(self
            .slices
            .lock()
            .values()
            .filter(|s| {
                s.tenant_id == tenant_id && s.entity_key == entity_key && s.version == version
            })
            .filter(|s| visible(s, include_tombstones))
            .cloned()
            .collect())
    }

    async fn find_by_key_prefix(
        &self,
        tenant_id: &str,
        prefix: &str,
        include_tombstones: bool,
    ) -> Result<Vec<SliceRecord>> {
        Ok(self
            .slices
            .lock()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.entity_key.starts_with(prefix))
            .filter(|s| visible(s, include_tombstones))
            .cloned()
            .collect())
    }

    async fn count(&self, tenant_id: &str, entity_key: &str) -> Result<usize> {
        Ok(self
            .slices
            .lock()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.entity_key == entity_key)
            .count())
    }

    async fn get_latest_version(&self, tenant_id: &str, entity_key: &str) -> Result<Option<u64>> {
        Ok(self
            .slices
            .lock()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.entity_key == entity_key)
            .map(|s| s.version)
            .max())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inverted index
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryIndexRepository {
    entries: Mutex<BTreeMap<String, InvertedIndexEntry>>,
}

impl InMemoryIndexRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_all(&self) -> Vec<InvertedIndexEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn matching(
        &self,
        tenant_id: &str,
        index_type: &str,
        index_value: &str,
    ) -> Vec<InvertedIndexEntry> {
        let value = normalize_index_value(index_value);
        let mut matches: Vec<InvertedIndexEntry> = self
            .entries
            .lock()
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id && e.index_type == index_type && e.index_value == value
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            (&a.target_entity_key, a.target_version, &a.slice_type).cmp(&(
                &b.target_entity_key,
                b.target_version,
                &b.slice_type,
            ))
        });
        matches
    }
}

#[async_trait]
impl InvertedIndexRepository for InMemoryIndexRepository {
    async fn put_all_idempotent(&self, entries: &[InvertedIndexEntry]) -> Result<Vec<PutOutcome>> {
        let mut store = self.entries.lock();
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = entry.natural_key();
            match store.get(&key) {
                Some(existing) if existing == entry => outcomes.push(PutOutcome::Skipped),
                Some(existing) => {
                    return Err(StorageError::conflict(
                        key,
                        &existing.slice_hash,
                        &entry.slice_hash,
                    ))
                }
                None => {
                    store.insert(key, entry.clone());
                    outcomes.push(PutOutcome::Inserted);
                }
            }
        }
        Ok(outcomes)
    }

    async fn query_by_index_type(
        &self,
        tenant_id: &str,
        index_type: &str,
        index_value: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<IndexPage> {
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| StorageError::validation(format!("Invalid index cursor: {}", c)))?,
            None => 0,
        };
        let matches = self.matching(tenant_id, index_type, index_value);
        let limit = limit.max(1);
        let end = (offset + limit).min(matches.len());
        let entries = matches.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < matches.len()).then(|| end.to_string());

        Ok(IndexPage {
            entries,
            next_cursor,
        })
    }

    async fn count_by_index_type(
        &self,
        tenant_id: &str,
        index_type: &str,
        index_value: &str,
    ) -> Result<usize> {
        Ok(self.matching(tenant_id, index_type, index_value).len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════════════════════

/// Sink that records every delivery; can be switched to fail
pub struct RecordingSink {
    sink_id: String,
    shipped: Mutex<Vec<(String, String, u64, Value)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new(sink_id: impl Into<String>) -> Self {
        Self {
            sink_id: sink_id.into(),
            shipped: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// (tenant, entity, version, payload) in delivery order
    pub fn list_all(&self) -> Vec<(String, String, u64, Value)> {
        self.shipped.lock().clone()
    }
}

#[async_trait]
impl SinkPort for RecordingSink {
    fn sink_id(&self) -> &str {
        &self.sink_id
    }

    async fn ship(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        payload: &Value,
    ) -> Result<ShipReceipt> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::storage(format!(
                "Sink {} rejected {}",
                self.sink_id,
                raw_key(tenant_id, entity_key, version)
            )));
        }
        self.shipped.lock().push((
            tenant_id.to_string(),
            entity_key.to_string(),
            version,
            payload.clone(),
        ));
        Ok(ShipReceipt {
            sink_id: self.sink_id.clone(),
            latency_ms: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AggregateType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn slice(version: u64, slice_type: &str, data: Value) -> SliceRecord {
        SliceRecord::new("t1", "PRODUCT#t1#p1", version, slice_type, data, "rs", "1")
    }

    #[tokio::test]
    async fn test_raw_put_idempotent() {
        let repo = InMemoryRawDataRepository::new();
        let record = RawDataRecord::new("t1", "PRODUCT#t1#p1", 1, "product", "1", json!({"name": "A"}));

        assert_eq!(repo.put_idempotent(&record).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(repo.put_idempotent(&record).await.unwrap(), PutOutcome::Skipped);

        let different = RawDataRecord::new("t1", "PRODUCT#t1#p1", 1, "product", "1", json!({"name": "B"}));
        let err = repo.put_idempotent(&different).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.key.as_deref(), Some("t1/PRODUCT#t1#p1@v1"));

        assert_eq!(repo.latest_version("t1", "PRODUCT#t1#p1").await.unwrap(), Some(1));
        assert_eq!(repo.list_all().len(), 1);
    }

    #[tokio::test]
    async fn test_slice_put_conflict_writes_nothing() {
        let repo = InMemorySliceRepository::new();
        repo.put_all_idempotent(&[slice(1, "CORE", json!({"name": "A"}))])
            .await
            .unwrap();

        let batch = vec![
            slice(1, "PRICE", json!({"price": 10})),
            slice(1, "CORE", json!({"name": "B"})),
        ];
        let err = repo.put_all_idempotent(&batch).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.key.as_deref(), Some("t1/PRODUCT#t1#p1/v1/CORE"));
        assert_eq!(repo.list_all().len(), 1);
    }

    #[tokio::test]
    async fn test_slice_put_same_hash_is_skip() {
        let repo = InMemorySliceRepository::new();
        let s = slice(1, "CORE", json!({"name": "A"}));
        assert_eq!(
            repo.put_all_idempotent(&[s.clone()]).await.unwrap(),
            vec![PutOutcome::Inserted]
        );
        assert_eq!(
            repo.put_all_idempotent(&[s]).await.unwrap(),
            vec![PutOutcome::Skipped]
        );
        assert_eq!(repo.count("t1", "PRODUCT#t1#p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_by_version_excludes_tombstones() {
        let repo = InMemorySliceRepository::new();
        repo.put_all_idempotent(&[
            slice(2, "CORE", json!({"name": "A"})),
            SliceRecord::tombstone("t1", "PRODUCT#t1#p1", 2, "PRICE", "gone", "rs", "1"),
        ])
        .await
        .unwrap();

        let live = repo.get_by_version("t1", "PRODUCT#t1#p1", 2, false).await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(live.iter().all(|s| !s.is_tombstone()));

        let all = repo.get_by_version("t1", "PRODUCT#t1#p1", 2, true).await.unwrap();
        assert_eq!(all.len(), 2);

        assert_eq!(repo.get_latest_version("t1", "PRODUCT#t1#p1").await.unwrap(), Some(2));
        assert_eq!(
            repo.find_by_key_prefix("t1", "PRODUCT#", false).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_outbox_claim_and_stale_reclaim() {
        let repo = InMemoryOutboxRepository::new();
        let a = OutboxEntry::new("a", AggregateType::RawData, "x", "RawDataIngested", "{}");
        let b = OutboxEntry::new("b", AggregateType::RawData, "y", "RawDataIngested", "{}");
        repo.insert(&a).await.unwrap();
        repo.insert(&b).await.unwrap();
        assert_eq!(repo.insert(&a).await.unwrap(), PutOutcome::Skipped);

        let claimed = repo
            .claim_batch(10, "w1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(repo.find_pending(10).await.unwrap().is_empty());

        // Fresh claims are not reclaimable
        let again = repo
            .claim_batch(10, "w2", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(again.is_empty());

        // A crashed worker's claim goes stale
        repo.force_claim(a.id, "w1", Utc::now() - chrono::Duration::seconds(60));
        let reclaimed = repo
            .claim_batch(10, "w2", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("w2"));

        repo.mark_processed(&[a.id]).await.unwrap();
        repo.mark_failed(b.id, "boom").await.unwrap();
        assert_eq!(repo.count_by_status(OutboxStatus::Processed), 1);
        assert_eq!(repo.get(b.id).unwrap().failure_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_ingest_unit_of_work_is_atomic() {
        let raw = Arc::new(InMemoryRawDataRepository::new());
        let outbox = Arc::new(InMemoryOutboxRepository::new());
        let uow = InMemoryIngestUnitOfWork::new(raw.clone(), outbox.clone());

        let record = RawDataRecord::new("t1", "PRODUCT#t1#p1", 1, "product", "1", json!({"name": "A"}));
        let entry = OutboxEntry::new("k1", AggregateType::RawData, "PRODUCT#t1#p1", "RawDataIngested", "{}");
        assert_eq!(uow.commit(&record, &entry).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(uow.commit(&record, &entry).await.unwrap(), PutOutcome::Skipped);

        let conflicting = RawDataRecord::new("t1", "PRODUCT#t1#p1", 1, "product", "1", json!({"name": "Z"}));
        let other_entry = OutboxEntry::new("k2", AggregateType::RawData, "PRODUCT#t1#p1", "RawDataIngested", "{}");
        assert!(uow.commit(&conflicting, &other_entry).await.is_err());

        assert_eq!(raw.list_all().len(), 1);
        assert_eq!(outbox.list_all().len(), 1);
    }

    #[tokio::test]
    async fn test_index_query_pagination() {
        let repo = InMemoryIndexRepository::new();
        let entries: Vec<_> = (0..5)
            .map(|i| {
                InvertedIndexEntry::new(
                    "t1",
                    "BRAND#t1#BR001",
                    1,
                    format!("PRODUCT#t1#p{}", i),
                    1,
                    "product_by_brand",
                    "BR001",
                    "CORE",
                    "h",
                )
            })
            .collect();
        repo.put_all_idempotent(&entries).await.unwrap();

        let first = repo
            .query_by_index_type("t1", "product_by_brand", "br001", 2, None)
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("2"));

        let last = repo
            .query_by_index_type("t1", "product_by_brand", "BR001", 10, Some("4"))
            .await
            .unwrap();
        assert_eq!(last.entries.len(), 1);
        assert!(last.next_cursor.is_none());

        assert_eq!(
            repo.count_by_index_type("t1", "product_by_brand", " Br001 ").await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = RecordingSink::new("search");
        sink.ship("t1", "PRODUCT#t1#p1", 1, &json!({})).await.unwrap();
        sink.set_failing(true);
        assert!(sink.ship("t1", "PRODUCT#t1#p1", 2, &json!({})).await.is_err());
        assert_eq!(sink.list_all().len(), 1);
        assert_eq!(sink.sink_id(), "search");
    }
}
