//! Ship: merge an entity's slices into a view and deliver it to a sink
//!
//! Every delivery runs through a deploy job:
//! QUEUED → RUNNING → (assemble) READY → SINKING → (sink) DONE, or FAILED.
//!
//! Joined upstream data is read at assembly time, never copied into the
//! downstream slices.

use crate::contract::{ContractRegistry, JoinSpec, MissingPolicy, RuleSetRef, ViewDefinition};
use crate::deploy::{DeployEvent, DeployRecord, DeployTracker};
use crate::error::{OrchestratorError, Result};
use crate::fanout::{FanoutEngine, ShipRequest, ShipWindow, WindowFlushTarget};
use crate::outbox::dispatch::OutboxEventHandler;
use crate::outbox::payload::{fields, OutboxPayload};
use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Map, Value};
use slicegraph_storage::domain::{
    entity_type_of, event_types, make_entity_key, OutboxEntry, RawDataRepository, ShipItem,
    SinkPort, SliceRepository,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════
// View assembly
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of resolving one join for one entity version
enum Joined {
    /// The join path holds no reference
    Unreferenced,
    Resolved(Value),
    /// A referenced upstream entity has no live slices
    Missing,
}

/// Merges live slices into `{ sliceType: data }`
///
/// Joins whose affected slice types the view reads are merged under the
/// join name: the referenced upstream entity's latest live slices, or an
/// array of them ordered by id when the join path holds several ids.
pub struct ViewAssembler {
    slices: Arc<dyn SliceRepository>,
    raw: Arc<dyn RawDataRepository>,
    registry: Arc<dyn ContractRegistry>,
}

impl ViewAssembler {
    pub fn new(
        slices: Arc<dyn SliceRepository>,
        raw: Arc<dyn RawDataRepository>,
        registry: Arc<dyn ContractRegistry>,
    ) -> Self {
        Self {
            slices,
            raw,
            registry,
        }
    }

    /// Slices named by `view` plus the joins it reads; tombstones count
    /// as missing
    pub async fn assemble(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        view: &ViewDefinition,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<Value> {
        let live = self
            .slices
            .get_by_version(tenant_id, entity_key, version, false)
            .await?;
        let by_type: HashMap<&str, &Value> = live
            .iter()
            .map(|s| (s.slice_type.as_str(), &s.data))
            .collect();

        let mut merged = Map::new();
        let mut missing = Vec::new();
        for slice_type in &view.slice_types {
            match by_type.get(slice_type.as_str()) {
                Some(data) => {
                    merged.insert(slice_type.clone(), (*data).clone());
                }
                None => missing.push(slice_type.clone()),
            }
        }

        let joins = self.joins_for(entity_key, rule_set).await?;
        for join in joins.iter().filter(|j| j.affects_any(&view.slice_types)) {
            match self.resolve_join(tenant_id, entity_key, version, join).await? {
                Joined::Resolved(value) => {
                    merged.insert(join.name.clone(), value);
                }
                Joined::Missing => missing.push(join.name.clone()),
                Joined::Unreferenced => {}
            }
        }

        if !missing.is_empty() {
            match view.missing_policy {
                MissingPolicy::FailClosed => {
                    return Err(OrchestratorError::MissingSlices {
                        entity_key: entity_key.to_string(),
                        missing,
                    });
                }
                MissingPolicy::Partial => {
                    debug!(
                        "View {}@{} for {}: omitting {}",
                        view.id,
                        view.version,
                        entity_key,
                        missing.join(", ")
                    );
                }
            }
        }
        Ok(Value::Object(merged))
    }

    /// Every live slice of the entity at `version` plus every resolvable join
    pub async fn assemble_all(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<Value> {
        let live = self
            .slices
            .get_by_version(tenant_id, entity_key, version, false)
            .await?;
        if live.is_empty() {
            return Err(OrchestratorError::NotFound(format!(
                "live slices of {} v{}",
                entity_key, version
            )));
        }
        let mut merged: Map<String, Value> =
            live.into_iter().map(|s| (s.slice_type, s.data)).collect();

        for join in self.joins_for(entity_key, rule_set).await? {
            match self.resolve_join(tenant_id, entity_key, version, &join).await? {
                Joined::Resolved(value) => {
                    merged.insert(join.name, value);
                }
                Joined::Missing => debug!("{}: join {} unresolved, omitted", entity_key, join.name),
                Joined::Unreferenced => {}
            }
        }
        Ok(Value::Object(merged))
    }

    /// Joins of `rule_set`, or of the entity type's default rule set
    async fn joins_for(
        &self,
        entity_key: &str,
        rule_set: Option<&RuleSetRef>,
    ) -> Result<Vec<JoinSpec>> {
        let reference = match rule_set {
            Some(reference) => reference.clone(),
            None => {
                let Some(entity_type) = entity_type_of(entity_key) else {
                    return Ok(Vec::new());
                };
                match self.registry.default_rule_set_for(entity_type).await {
                    Ok(reference) => reference,
                    Err(e) => {
                        debug!("No rule set for {}, assembling without joins: {}", entity_key, e);
                        return Ok(Vec::new());
                    }
                }
            }
        };
        let rule_set = self.registry.load_rule_set_contract(&reference).await?;
        Ok(rule_set.joins.clone())
    }

    async fn resolve_join(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        join: &JoinSpec,
    ) -> Result<Joined> {
        let Some(record) = self.raw.get(tenant_id, entity_key, version).await? else {
            debug!("{} v{}: no raw record to resolve join {}", entity_key, version, join.name);
            return Ok(Joined::Missing);
        };
        let ids = join.referenced_ids(&record.payload);
        if ids.is_empty() {
            return Ok(Joined::Unreferenced);
        }

        let mut values = Vec::with_capacity(ids.len());
        for id in &ids {
            let upstream_key = make_entity_key(&join.upstream_entity_type, tenant_id, id);
            match self.latest_live(tenant_id, &upstream_key).await? {
                Some(value) => values.push(value),
                None => {
                    debug!(
                        "Join {} of {}: {} has no live slices",
                        join.name, entity_key, upstream_key
                    );
                    return Ok(Joined::Missing);
                }
            }
        }
        Ok(Joined::Resolved(match values.len() {
            1 => values.remove(0),
            _ => Value::Array(values),
        }))
    }

    /// `{ sliceType: data }` of the entity's latest sliced version
    async fn latest_live(&self, tenant_id: &str, entity_key: &str) -> Result<Option<Value>> {
        let Some(latest) = self.slices.get_latest_version(tenant_id, entity_key).await? else {
            return Ok(None);
        };
        let live = self
            .slices
            .get_by_version(tenant_id, entity_key, latest, false)
            .await?;
        if live.is_empty() {
            return Ok(None);
        }
        Ok(Some(Value::Object(
            live.into_iter().map(|s| (s.slice_type, s.data)).collect(),
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Ship handler
// ═══════════════════════════════════════════════════════════════════════════

pub struct ShipRequestHandler {
    assembler: ViewAssembler,
    registry: Arc<dyn ContractRegistry>,
    sinks: HashMap<String, Arc<dyn SinkPort>>,
    tracker: Arc<DeployTracker>,
}

impl ShipRequestHandler {
    pub fn new(
        slices: Arc<dyn SliceRepository>,
        raw: Arc<dyn RawDataRepository>,
        registry: Arc<dyn ContractRegistry>,
        tracker: Arc<DeployTracker>,
    ) -> Self {
        Self {
            assembler: ViewAssembler::new(slices, raw, registry.clone()),
            registry,
            sinks: HashMap::new(),
            tracker,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SinkPort>) -> Self {
        self.sinks.insert(sink.sink_id().to_string(), sink);
        self
    }

    pub fn tracker(&self) -> &Arc<DeployTracker> {
        &self.tracker
    }

    fn sink(&self, sink_id: &str) -> Result<&Arc<dyn SinkPort>> {
        self.sinks
            .get(sink_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("sink {}", sink_id)))
    }

    async fn payload_for(&self, request: &ShipRequest) -> Result<Value> {
        match &request.view {
            Some(view_ref) => {
                let view = self.registry.load_view_definition_contract(view_ref).await?;
                self.assembler
                    .assemble(
                        &request.tenant_id,
                        &request.entity_key,
                        request.version,
                        &view,
                        request.rule_set.as_ref(),
                    )
                    .await
            }
            None => {
                self.assembler
                    .assemble_all(
                        &request.tenant_id,
                        &request.entity_key,
                        request.version,
                        request.rule_set.as_ref(),
                    )
                    .await
            }
        }
    }

    /// Assemble and deliver one entity version; the deploy record is returned
    pub async fn ship(&self, request: &ShipRequest) -> Result<DeployRecord> {
        let job_id = self.tracker.enqueue();
        match self.run_job(job_id, request).await {
            Ok(()) => self
                .tracker
                .get(job_id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("deploy job {}", job_id))),
            Err(e) => {
                warn!(
                    "Ship of {} v{} to {} failed: {}",
                    request.entity_key, request.version, request.sink_id, e
                );
                self.tracker.fail(job_id, e.to_string())?;
                Err(e)
            }
        }
    }

    async fn run_job(&self, job_id: Uuid, request: &ShipRequest) -> Result<()> {
        self.tracker.apply(job_id, DeployEvent::StartRunning)?;
        let sink = self.sink(&request.sink_id)?;
        let payload = self.payload_for(request).await?;
        self.tracker.apply(job_id, DeployEvent::CompileComplete)?;

        self.tracker.apply(job_id, DeployEvent::StartSinking)?;
        let receipt = sink
            .ship(&request.tenant_id, &request.entity_key, request.version, &payload)
            .await?;
        self.tracker.apply(job_id, DeployEvent::Complete)?;

        info!(
            "Shipped {} v{} to {} ({}ms)",
            request.entity_key, request.version, receipt.sink_id, receipt.latency_ms
        );
        Ok(())
    }

    fn request_from(payload: &OutboxPayload) -> Result<ShipRequest> {
        let sink_id = payload
            .str_field(fields::SINK_ID)
            .ok_or_else(|| OrchestratorError::validation("ShipRequested payload has no sinkId"))?;
        Ok(ShipRequest {
            sink_id: sink_id.to_string(),
            tenant_id: payload.tenant_id.clone(),
            entity_key: payload.entity_key.clone(),
            version: payload.version,
            view: payload.view(),
            rule_set: payload.rule_set(),
        })
    }
}

#[async_trait]
impl OutboxEventHandler for ShipRequestHandler {
    async fn handle(&self, _entry: &OutboxEntry, payload: &OutboxPayload) -> anyhow::Result<()> {
        let request = Self::request_from(payload)?;
        self.ship(&request).await?;
        Ok(())
    }
}

/// Windowed flushes: one deploy job per request, one `ship_batch` per sink
#[async_trait]
impl WindowFlushTarget for ShipRequestHandler {
    async fn flush(&self, sink_id: &str, requests: Vec<ShipRequest>) -> Result<()> {
        let sink = self.sink(sink_id)?;

        let mut jobs = Vec::with_capacity(requests.len());
        let mut items = Vec::with_capacity(requests.len());
        for request in &requests {
            let job_id = self.tracker.enqueue();
            self.tracker.apply(job_id, DeployEvent::StartRunning)?;
            match self.payload_for(request).await {
                Ok(payload) => {
                    self.tracker.apply(job_id, DeployEvent::CompileComplete)?;
                    jobs.push(job_id);
                    items.push(ShipItem {
                        tenant_id: request.tenant_id.clone(),
                        entity_key: request.entity_key.clone(),
                        version: request.version,
                        payload,
                    });
                }
                Err(e) => {
                    warn!("Dropping {} v{} from flush: {}", request.entity_key, request.version, e);
                    self.tracker.fail(job_id, e.to_string())?;
                }
            }
        }
        if items.is_empty() {
            return Ok(());
        }

        for job_id in &jobs {
            self.tracker.apply(*job_id, DeployEvent::StartSinking)?;
        }
        match sink.ship_batch(&items).await {
            Ok(_) => {
                for job_id in &jobs {
                    self.tracker.apply(*job_id, DeployEvent::Complete)?;
                }
                Ok(())
            }
            Err(e) => {
                for job_id in &jobs {
                    self.tracker.fail(*job_id, e.to_string())?;
                }
                Err(e.into())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SLICE event routing
// ═══════════════════════════════════════════════════════════════════════════

/// SLICE aggregate handler: ShipRequested → ship, EntityChanged → fanout
pub struct SliceEventRouter {
    ship: Arc<ShipRequestHandler>,
    fanout: Arc<FanoutEngine>,
    window: Option<Arc<ShipWindow>>,
}

impl SliceEventRouter {
    pub fn new(ship: Arc<ShipRequestHandler>, fanout: Arc<FanoutEngine>) -> Self {
        Self {
            ship,
            fanout,
            window: None,
        }
    }

    /// Coalesce ship requests through `window` instead of shipping inline
    pub fn with_window(mut self, window: Arc<ShipWindow>) -> Self {
        self.window = Some(window);
        self
    }

    async fn on_entity_changed(&self, payload: &OutboxPayload) -> anyhow::Result<()> {
        let entity_type = payload
            .str_field(fields::ENTITY_TYPE)
            .or_else(|| entity_type_of(&payload.entity_key))
            .ok_or_else(|| {
                OrchestratorError::validation(format!(
                    "Cannot determine entity type of {}",
                    payload.entity_key
                ))
            })?;

        let result = self
            .fanout
            .on_entity_change(
                &payload.tenant_id,
                entity_type,
                &payload.entity_key,
                payload.version,
                None,
            )
            .await?;
        if result.failed_count > 0 {
            bail!(
                "Fanout from {} v{}: {} of {} candidates failed",
                payload.entity_key,
                payload.version,
                result.failed_count,
                result.total_affected
            );
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxEventHandler for SliceEventRouter {
    async fn handle(&self, entry: &OutboxEntry, payload: &OutboxPayload) -> anyhow::Result<()> {
        match entry.event_type.as_str() {
            event_types::SHIP_REQUESTED => match &self.window {
                Some(window) => {
                    let request = ShipRequestHandler::request_from(payload)?;
                    window.submit(request).await?;
                    Ok(())
                }
                None => self.ship.handle(entry, payload).await,
            },
            event_types::ENTITY_CHANGED => self.on_entity_changed(payload).await,
            other => bail!("Unsupported SLICE event {}", other),
        }
    }
}
