//! Slicing engine
//!
//! Derives slices and inverted-index entries from a raw record:
//!
//! - **FULL**: every slice-build rule runs against the raw payload.
//! - **INCREMENTAL** (`from → to`): diff the payloads, resolve impacted
//!   slice types through the impact map, rebuild only those, carry the rest
//!   forward re-stamped at `to`.
//!
//! Both modes persist one record per declared slice type (live or
//! tombstone), so `FULL(to)` and `INCREMENTAL(to-1 → to)` yield the same
//! (slice type → hash) map.

use crate::contract::{ContractRegistry, RuleSet, RuleSetRef, SinkRule};
use crate::error::{OrchestratorError, Result};
use crate::outbox::payload::{fields, OutboxPayload};
use crate::slicing::changeset::ChangeSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slicegraph_storage::domain::{
    entity_type_of, event_types, make_entity_key, raw_key, AggregateType, InvertedIndexEntry,
    InvertedIndexRepository, OutboxEntry, OutboxRepository, PutOutcome, RawDataRecord,
    RawDataRepository, SliceKey, SliceRecord, SliceRepository,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Reason stamped on tombstones for rules that produced nothing
pub const EMPTY_RULE_REASON: &str = "rule yielded no data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlicingMode {
    Full,
    Incremental,
}

impl SlicingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlicingMode::Full => "FULL",
            SlicingMode::Incremental => "INCREMENTAL",
        }
    }
}

/// Outcome of one slicing run
#[derive(Debug, Clone, PartialEq)]
pub struct SlicingResult {
    pub mode: SlicingMode,
    pub tenant_id: String,
    pub entity_key: String,
    pub version: u64,
    pub rule_set: RuleSetRef,
    /// Keys of live (non-tombstone) slices at `version`
    pub slice_keys: Vec<SliceKey>,
    /// Slice types written as tombstones
    pub tombstoned: Vec<String>,
    /// Slice types rebuilt by an incremental run
    pub impacted: Vec<String>,
    /// Slice types copied from the previous version
    pub carried_forward: Vec<String>,
    pub inserted: usize,
    pub skipped: usize,
    pub index_entries: usize,
    pub duration_ms: u64,
}

impl SlicingResult {
    /// Live slice types, sorted
    pub fn live_types(&self) -> Vec<&str> {
        self.slice_keys.iter().map(|k| k.slice_type.as_str()).collect()
    }
}

/// Upstream change that triggered a downstream re-slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamChange {
    pub entity_key: String,
    pub version: u64,
    /// Downstream slice types whose views read the upstream entity
    pub affected_slice_types: Vec<String>,
}

/// Slicing entry points used by the outbox dispatcher and the fanout engine
#[async_trait]
pub trait SliceExecutor: Send + Sync {
    /// FULL run at `version`
    async fn execute(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<SlicingResult>;

    /// FULL for the first version or when `version - 1` has no raw record,
    /// INCREMENTAL(`version - 1 → version`) otherwise
    async fn execute_auto(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<SlicingResult>;

    /// FULL run on behalf of a changed upstream entity
    ///
    /// Slices are a function of the entity's own raw record, so an
    /// upstream change alone rewrites nothing; implementations that ship
    /// re-publish the views reading `upstream.affected_slice_types`.
    async fn execute_for_upstream(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        rule_set: Option<&RuleSetRef>,
        _upstream: &UpstreamChange,
    ) -> Result<SlicingResult> {
        self.execute(tenant_id, entity_key, version, rule_set).await
    }
}

pub struct SlicingEngine {
    raw: Arc<dyn RawDataRepository>,
    slices: Arc<dyn SliceRepository>,
    index: Arc<dyn InvertedIndexRepository>,
    registry: Arc<dyn ContractRegistry>,
    /// Ship/fanout events are published only when set
    outbox: Option<Arc<dyn OutboxRepository>>,
}

impl SlicingEngine {
    pub fn new(
        raw: Arc<dyn RawDataRepository>,
        slices: Arc<dyn SliceRepository>,
        index: Arc<dyn InvertedIndexRepository>,
        registry: Arc<dyn ContractRegistry>,
    ) -> Self {
        Self {
            raw,
            slices,
            index,
            registry,
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxRepository>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pure derivation
    // ═══════════════════════════════════════════════════════════════════════

    /// Rebuild only `slice_types`; types yielding nothing become tombstones
    pub fn slice_partial(
        rule_set: &RuleSet,
        raw: &RawDataRecord,
        slice_types: &BTreeSet<String>,
    ) -> Vec<SliceRecord> {
        rule_set
            .slices
            .iter()
            .filter(|rule| slice_types.contains(&rule.slice_type))
            .map(|rule| match rule.build(&raw.payload) {
                Some(data) => SliceRecord::new(
                    raw.tenant_id.clone(),
                    raw.entity_key.clone(),
                    raw.version,
                    rule.slice_type.clone(),
                    data,
                    rule_set.id.clone(),
                    rule_set.version.clone(),
                ),
                None => SliceRecord::tombstone(
                    raw.tenant_id.clone(),
                    raw.entity_key.clone(),
                    raw.version,
                    rule.slice_type.clone(),
                    EMPTY_RULE_REASON,
                    rule_set.id.clone(),
                    rule_set.version.clone(),
                ),
            })
            .collect()
    }

    /// Index entries for every index rule
    ///
    /// Entries whose slice type is tombstoned at this version are written
    /// with `tombstone = true`.
    pub fn build_index_entries(
        rule_set: &RuleSet,
        raw: &RawDataRecord,
        slices: &[SliceRecord],
    ) -> Vec<InvertedIndexEntry> {
        let by_type: BTreeMap<&str, &SliceRecord> =
            slices.iter().map(|s| (s.slice_type.as_str(), s)).collect();

        let mut entries = Vec::new();
        for rule in &rule_set.indexes {
            let Some(slice) = by_type.get(rule.slice_type.as_str()) else {
                continue;
            };
            for value in rule.extract_values(&raw.payload) {
                let ref_key = make_entity_key(&rule.ref_entity_type, &raw.tenant_id, &value);
                entries.push(
                    InvertedIndexEntry::new(
                        raw.tenant_id.clone(),
                        ref_key,
                        0,
                        raw.entity_key.clone(),
                        raw.version,
                        rule.index_type.clone(),
                        &value,
                        rule.slice_type.clone(),
                        slice.content_hash.clone(),
                    )
                    .with_tombstone(slice.is_tombstone()),
                );
            }
        }
        entries
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Incremental
    // ═══════════════════════════════════════════════════════════════════════

    /// INCREMENTAL(`from → to`); falls back to FULL(`to`) when `from` has
    /// no raw record
    pub async fn execute_incremental(
        &self,
        tenant_id: &str,
        entity_key: &str,
        from_version: u64,
        to_version: u64,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<SlicingResult> {
        validate_target(tenant_id, entity_key, to_version)?;
        if from_version >= to_version {
            return Err(OrchestratorError::validation(format!(
                "Incremental range must move forward: v{} -> v{}",
                from_version, to_version
            )));
        }

        let started = Instant::now();
        let to_raw = self.load_raw(tenant_id, entity_key, to_version).await?;
        let Some(from_raw) = self.raw.get(tenant_id, entity_key, from_version).await? else {
            info!(
                "No raw record at v{} for {}, falling back to FULL",
                from_version,
                to_raw.natural_key()
            );
            return self.execute(tenant_id, entity_key, to_version, rule_set).await;
        };

        let rule_set = self.resolve_rule_set(entity_key, rule_set).await?;
        let changes = ChangeSet::diff(from_version, &from_raw.payload, to_version, &to_raw.payload);
        let impacted = rule_set.impact_map.resolve(&changes.changed_paths)?;
        debug!(
            "{}: {} changed paths -> impacted {:?}",
            to_raw.natural_key(),
            changes.len(),
            impacted
        );

        let previous: BTreeMap<String, SliceRecord> = self
            .slices
            .get_by_version(tenant_id, entity_key, from_version, true)
            .await?
            .into_iter()
            .map(|s| (s.slice_type.clone(), s))
            .collect();

        // Declared types that cannot be carried forward are rebuilt
        let mut rebuild = impacted.clone();
        let mut carried = Vec::new();
        let mut records = Vec::new();
        for declared in rule_set.slice_types() {
            if impacted.contains(&declared) {
                continue;
            }
            match previous.get(&declared) {
                Some(prev) => {
                    records.push(prev.restamp(to_version));
                    carried.push(declared);
                }
                None => {
                    rebuild.insert(declared);
                }
            }
        }
        records.extend(Self::slice_partial(&rule_set, &to_raw, &rebuild));

        self.persist(
            SlicingMode::Incremental,
            &rule_set,
            &to_raw,
            records,
            impacted.into_iter().collect(),
            carried,
            started,
        )
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Shared steps
    // ═══════════════════════════════════════════════════════════════════════

    async fn load_raw(&self, tenant_id: &str, entity_key: &str, version: u64) -> Result<RawDataRecord> {
        self.raw
            .get(tenant_id, entity_key, version)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "raw record {}",
                    raw_key(tenant_id, entity_key, version)
                ))
            })
    }

    async fn resolve_rule_set(
        &self,
        entity_key: &str,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<Arc<RuleSet>> {
        let reference = match rule_set {
            Some(r) => r.clone(),
            None => {
                let entity_type = entity_type_of(entity_key).ok_or_else(|| {
                    OrchestratorError::validation(format!(
                        "Entity key {} has no entity type prefix",
                        entity_key
                    ))
                })?;
                self.registry.default_rule_set_for(entity_type).await?
            }
        };
        self.registry.load_rule_set_contract(&reference).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        mode: SlicingMode,
        rule_set: &RuleSet,
        raw: &RawDataRecord,
        mut records: Vec<SliceRecord>,
        impacted: Vec<String>,
        carried_forward: Vec<String>,
        started: Instant,
    ) -> Result<SlicingResult> {
        records.sort_by(|a, b| a.slice_type.cmp(&b.slice_type));

        let outcomes = self.slices.put_all_idempotent(&records).await?;
        let inserted = outcomes.iter().filter(|o| **o == PutOutcome::Inserted).count();

        let entries = Self::build_index_entries(rule_set, raw, &records);
        self.index.put_all_idempotent(&entries).await?;

        self.publish_events(rule_set, raw, inserted).await?;

        let (tombstones, live): (Vec<&SliceRecord>, Vec<&SliceRecord>) =
            records.iter().partition(|s| s.is_tombstone());

        let result = SlicingResult {
            mode,
            tenant_id: raw.tenant_id.clone(),
            entity_key: raw.entity_key.clone(),
            version: raw.version,
            rule_set: rule_set.reference(),
            slice_keys: live.iter().map(|s| s.key()).collect(),
            tombstoned: tombstones.iter().map(|s| s.slice_type.clone()).collect(),
            impacted,
            carried_forward,
            inserted,
            skipped: outcomes.len() - inserted,
            index_entries: entries.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            "Sliced {} ({}): {} live, {} tombstoned, {} inserted, {} skipped",
            raw.natural_key(),
            mode.as_str(),
            result.slice_keys.len(),
            result.tombstoned.len(),
            result.inserted,
            result.skipped
        );
        Ok(result)
    }

    /// Ship request per sink rule, plus an entity-changed event when any
    /// slice was newly written
    async fn publish_events(&self, rule_set: &RuleSet, raw: &RawDataRecord, inserted: usize) -> Result<()> {
        let Some(outbox) = &self.outbox else {
            return Ok(());
        };

        let base_key = format!("{}:{}:{}", raw.tenant_id, raw.entity_key, raw.version);
        for sink in &rule_set.sinks {
            let entry = Self::ship_entry(
                rule_set,
                &raw.tenant_id,
                &raw.entity_key,
                raw.version,
                sink,
                format!("{}:{}:{}", base_key, event_types::SHIP_REQUESTED, sink.sink_id),
            )?;
            outbox.insert(&entry).await?;
        }

        if inserted > 0 {
            let payload = OutboxPayload::new(&raw.tenant_id, &raw.entity_key, raw.version)
                .with_rule_set(&rule_set.reference())
                .with_field(fields::ENTITY_TYPE, rule_set.entity_type.as_str());
            let entry = OutboxEntry::new(
                format!("{}:{}", base_key, event_types::ENTITY_CHANGED),
                AggregateType::Slice,
                raw.entity_key.clone(),
                event_types::ENTITY_CHANGED,
                payload.to_json()?,
            );
            outbox.insert(&entry).await?;
        }
        Ok(())
    }

    fn ship_entry(
        rule_set: &RuleSet,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        sink: &SinkRule,
        idempotency_key: String,
    ) -> Result<OutboxEntry> {
        let mut payload = OutboxPayload::new(tenant_id, entity_key, version)
            .with_rule_set(&rule_set.reference())
            .with_field(fields::SINK_ID, sink.sink_id.as_str());
        if let Some(view) = &sink.view {
            payload = payload
                .with_field(fields::VIEW_ID, view.id.as_str())
                .with_field(fields::VIEW_VERSION, view.version.as_str());
        }
        Ok(OutboxEntry::new(
            idempotency_key,
            AggregateType::Slice,
            entity_key,
            event_types::SHIP_REQUESTED,
            payload.to_json()?,
        ))
    }

    /// Whether a sink's payload includes any of `slice_types`; a sink
    /// without a view ships every slice type
    async fn sink_reads_any(&self, sink: &SinkRule, slice_types: &[String]) -> Result<bool> {
        match &sink.view {
            None => Ok(true),
            Some(view) => {
                let view = self.registry.load_view_definition_contract(view).await?;
                Ok(view.slice_types.iter().any(|ty| slice_types.contains(ty)))
            }
        }
    }
}

fn validate_target(tenant_id: &str, entity_key: &str, version: u64) -> Result<()> {
    if tenant_id.trim().is_empty() {
        return Err(OrchestratorError::validation("tenant_id must not be blank"));
    }
    if entity_key.trim().is_empty() {
        return Err(OrchestratorError::validation("entity_key must not be blank"));
    }
    if version == 0 {
        return Err(OrchestratorError::validation("versions start at 1"));
    }
    Ok(())
}

#[async_trait]
impl SliceExecutor for SlicingEngine {
    async fn execute(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<SlicingResult> {
        validate_target(tenant_id, entity_key, version)?;
        let started = Instant::now();

        let raw = self.load_raw(tenant_id, entity_key, version).await?;
        let rule_set = self.resolve_rule_set(entity_key, rule_set).await?;
        let records = Self::slice_partial(&rule_set, &raw, &rule_set.slice_types());

        self.persist(SlicingMode::Full, &rule_set, &raw, records, Vec::new(), Vec::new(), started)
            .await
    }

    async fn execute_auto(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<SlicingResult> {
        validate_target(tenant_id, entity_key, version)?;
        if version <= 1 {
            return self.execute(tenant_id, entity_key, version, rule_set).await;
        }

        let previous = version - 1;
        if self.raw.get(tenant_id, entity_key, previous).await?.is_none() {
            debug!(
                "{} has no predecessor raw record, running FULL",
                raw_key(tenant_id, entity_key, version)
            );
            return self.execute(tenant_id, entity_key, version, rule_set).await;
        }
        self.execute_incremental(tenant_id, entity_key, previous, version, rule_set)
            .await
    }

    async fn execute_for_upstream(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        rule_set: Option<&RuleSetRef>,
        upstream: &UpstreamChange,
    ) -> Result<SlicingResult> {
        let result = self.execute(tenant_id, entity_key, version, rule_set).await?;
        let Some(outbox) = &self.outbox else {
            return Ok(result);
        };

        // Keyed by the upstream version so each upstream change ships once
        let rule_set = self.registry.load_rule_set_contract(&result.rule_set).await?;
        let mut republished = 0;
        for sink in &rule_set.sinks {
            if !self.sink_reads_any(sink, &upstream.affected_slice_types).await? {
                continue;
            }
            let entry = Self::ship_entry(
                &rule_set,
                tenant_id,
                entity_key,
                version,
                sink,
                format!(
                    "{}:{}:{}:{}:{}:{}@{}",
                    tenant_id,
                    entity_key,
                    version,
                    event_types::SHIP_REQUESTED,
                    sink.sink_id,
                    upstream.entity_key,
                    upstream.version
                ),
            )?;
            if outbox.insert(&entry).await? == PutOutcome::Inserted {
                republished += 1;
            }
        }
        debug!(
            "{} v{}: {} ship requests re-published for {} v{}",
            entity_key, version, republished, upstream.entity_key, upstream.version
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{
        ImpactMap, InMemoryContractRegistry, IndexRule, MissingPolicy, SinkRule, SliceBuildRule,
        ViewDefinition, ViewRef,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use slicegraph_storage::domain::OutboxStatus;
    use slicegraph_storage::infrastructure::{
        InMemoryIndexRepository, InMemoryOutboxRepository, InMemoryRawDataRepository,
        InMemorySliceRepository,
    };

    struct Fixture {
        raw: Arc<InMemoryRawDataRepository>,
        slices: Arc<InMemorySliceRepository>,
        index: Arc<InMemoryIndexRepository>,
        outbox: Arc<InMemoryOutboxRepository>,
        registry: Arc<InMemoryContractRegistry>,
        engine: SlicingEngine,
    }

    fn product_rule_set() -> RuleSet {
        let mut rs = RuleSet::new("product", "1", "PRODUCT");
        rs.slices.push(SliceBuildRule::new("CORE", &["name", "brand"]));
        rs.slices.push(SliceBuildRule::new("PRICE", &["price"]));
        rs.indexes.push(IndexRule {
            index_type: "product_by_brand".to_string(),
            source_path: "brand".to_string(),
            ref_entity_type: "BRAND".to_string(),
            slice_type: "CORE".to_string(),
        });
        rs.impact_map = ImpactMap::new()
            .with("name", &["CORE"])
            .with("brand", &["CORE"])
            .with("price", &["PRICE"]);
        rs.sinks.push(SinkRule {
            sink_id: "search".to_string(),
            view: None,
        });
        rs
    }

    fn fixture() -> Fixture {
        let raw = Arc::new(InMemoryRawDataRepository::new());
        let slices = Arc::new(InMemorySliceRepository::new());
        let index = Arc::new(InMemoryIndexRepository::new());
        let outbox = Arc::new(InMemoryOutboxRepository::new());
        let registry = Arc::new(InMemoryContractRegistry::new());
        registry.register_rule_set(product_rule_set()).unwrap();

        let engine =
            SlicingEngine::new(raw.clone(), slices.clone(), index.clone(), registry.clone())
                .with_outbox(outbox.clone());
        Fixture {
            raw,
            slices,
            index,
            outbox,
            registry,
            engine,
        }
    }

    async fn put_raw(f: &Fixture, version: u64, payload: Value) {
        let record = RawDataRecord::new("t1", "PRODUCT#t1#p1", version, "product", "1", payload);
        f.raw.put_idempotent(&record).await.unwrap();
    }

    async fn hashes(f: &Fixture, version: u64) -> BTreeMap<String, String> {
        f.slices
            .get_by_version("t1", "PRODUCT#t1#p1", version, true)
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.slice_type, s.content_hash))
            .collect()
    }

    #[tokio::test]
    async fn test_full_writes_tombstone_for_empty_rule() {
        let f = fixture();
        put_raw(&f, 1, json!({"name": "A", "brand": "BR001"})).await;

        let result = f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();
        assert_eq!(result.mode, SlicingMode::Full);
        assert_eq!(result.live_types(), vec!["CORE"]);
        assert_eq!(result.tombstoned, vec!["PRICE"]);
        assert_eq!(result.inserted, 2);

        let live = f.slices.get_by_version("t1", "PRODUCT#t1#p1", 1, false).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(f.index.list_all().len(), 1);
        assert_eq!(f.index.list_all()[0].index_value, "br001");
    }

    #[tokio::test]
    async fn test_full_is_idempotent() {
        let f = fixture();
        put_raw(&f, 1, json!({"name": "A"})).await;

        f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();
        let again = f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(f.slices.count("t1", "PRODUCT#t1#p1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_raw_is_not_found() {
        let f = fixture();
        let err = f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_rule_set_propagates() {
        let f = fixture();
        put_raw(&f, 1, json!({"name": "A"})).await;
        let err = f
            .engine
            .execute("t1", "PRODUCT#t1#p1", 1, Some(&RuleSetRef::new("product", "9")))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Contract(_)));
    }

    #[tokio::test]
    async fn test_incremental_rebuilds_impacted_and_carries_rest() {
        let f = fixture();
        put_raw(&f, 1, json!({"name": "A", "price": 10})).await;
        put_raw(&f, 2, json!({"name": "B", "price": 10})).await;
        f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();

        let result = f.engine.execute_auto("t1", "PRODUCT#t1#p1", 2, None).await.unwrap();
        assert_eq!(result.mode, SlicingMode::Incremental);
        assert_eq!(result.impacted, vec!["CORE"]);
        assert_eq!(result.carried_forward, vec!["PRICE"]);

        let v1 = hashes(&f, 1).await;
        let v2 = hashes(&f, 2).await;
        assert_ne!(v1["CORE"], v2["CORE"]);
        assert_eq!(v1["PRICE"], v2["PRICE"]);
    }

    #[tokio::test]
    async fn test_incremental_equals_full() {
        let f = fixture();
        put_raw(&f, 1, json!({"name": "A", "price": 10})).await;
        put_raw(&f, 2, json!({"name": "A", "brand": "BR9"})).await;
        f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();
        f.engine.execute_incremental("t1", "PRODUCT#t1#p1", 1, 2, None).await.unwrap();
        let incremental = hashes(&f, 2).await;

        let g = fixture();
        put_raw(&g, 2, json!({"name": "A", "brand": "BR9"})).await;
        g.engine.execute("t1", "PRODUCT#t1#p1", 2, None).await.unwrap();

        assert_eq!(incremental, hashes(&g, 2).await);
    }

    #[tokio::test]
    async fn test_incremental_unmapped_path_fails_closed() {
        let f = fixture();
        put_raw(&f, 1, json!({"name": "A"})).await;
        put_raw(&f, 2, json!({"name": "A", "color": "red"})).await;
        f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();

        let err = f
            .engine
            .execute_incremental("t1", "PRODUCT#t1#p1", 1, 2, None)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::UnmappedChangePath { path } => assert_eq!(path, "color"),
            other => panic!("Expected UnmappedChangePath, got {:?}", other),
        }
        assert!(hashes(&f, 2).await.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_falls_back_to_full_without_predecessor() {
        let f = fixture();
        put_raw(&f, 3, json!({"name": "A"})).await;

        let result = f
            .engine
            .execute_incremental("t1", "PRODUCT#t1#p1", 2, 3, None)
            .await
            .unwrap();
        assert_eq!(result.mode, SlicingMode::Full);

        let auto = f.engine.execute_auto("t1", "PRODUCT#t1#p1", 3, None).await.unwrap();
        assert_eq!(auto.mode, SlicingMode::Full);
    }

    #[tokio::test]
    async fn test_hash_conflict_is_invariant_violation() {
        let f = fixture();
        put_raw(&f, 1, json!({"name": "A"})).await;
        let forged = SliceRecord::new("t1", "PRODUCT#t1#p1", 1, "CORE", json!({"name": "Z"}), "product", "1");
        f.slices.put_all_idempotent(&[forged]).await.unwrap();

        let err = f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap_err();
        match err {
            OrchestratorError::InvariantViolation { key, .. } => {
                assert_eq!(key, "t1/PRODUCT#t1#p1/v1/CORE")
            }
            other => panic!("Expected InvariantViolation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_published_once() {
        let f = fixture();
        put_raw(&f, 1, json!({"name": "A"})).await;
        f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();
        f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();

        let events: Vec<String> = f
            .outbox
            .list_all()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(events, vec!["ShipRequested", "EntityChanged"]);
        assert_eq!(f.outbox.count_by_status(OutboxStatus::Pending), 2);
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let f = fixture();
        assert!(matches!(
            f.engine.execute(" ", "PRODUCT#t1#p1", 1, None).await,
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(
            f.engine.execute("t1", "PRODUCT#t1#p1", 0, None).await,
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(
            f.engine.execute_incremental("t1", "PRODUCT#t1#p1", 2, 2, None).await,
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_upstream_change_republishes_views_reading_joined_types() {
        let f = fixture();
        let mut rs = product_rule_set();
        rs.version = "2".to_string();
        rs.sinks.push(SinkRule {
            sink_id: "prices".to_string(),
            view: Some(ViewRef::new("price_only", "1")),
        });
        f.registry.register_rule_set(rs).unwrap();
        f.registry.register_view(ViewDefinition {
            id: "price_only".to_string(),
            version: "1".to_string(),
            slice_types: vec!["PRICE".to_string()],
            missing_policy: MissingPolicy::Partial,
        });
        put_raw(&f, 1, json!({"name": "A", "brand": "BR001", "price": 10})).await;
        f.engine.execute("t1", "PRODUCT#t1#p1", 1, None).await.unwrap();

        let upstream = |version: u64| UpstreamChange {
            entity_key: "BRAND#t1#BR001".to_string(),
            version,
            affected_slice_types: vec!["CORE".to_string()],
        };
        let result = f
            .engine
            .execute_for_upstream("t1", "PRODUCT#t1#p1", 1, None, &upstream(2))
            .await
            .unwrap();
        assert_eq!(result.inserted, 0);
        assert_eq!(result.rule_set, RuleSetRef::new("product", "2"));
        f.engine
            .execute_for_upstream("t1", "PRODUCT#t1#p1", 1, None, &upstream(2))
            .await
            .unwrap();
        f.engine
            .execute_for_upstream("t1", "PRODUCT#t1#p1", 1, None, &upstream(3))
            .await
            .unwrap();

        let sinks: Vec<String> = f
            .outbox
            .list_all()
            .into_iter()
            .filter(|e| e.event_type == event_types::SHIP_REQUESTED)
            .map(|e| {
                OutboxPayload::parse(&e.payload)
                    .unwrap()
                    .str_field(fields::SINK_ID)
                    .unwrap()
                    .to_string()
            })
            .collect();
        // Own version to both sinks, then one search ship per brand version;
        // the PRICE-only view does not read the join
        assert_eq!(sinks, vec!["search", "prices", "search", "search"]);
        let changed = f
            .outbox
            .list_all()
            .into_iter()
            .filter(|e| e.event_type == event_types::ENTITY_CHANGED)
            .count();
        assert_eq!(changed, 1);
    }
}
