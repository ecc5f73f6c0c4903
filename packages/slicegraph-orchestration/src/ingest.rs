//! Raw-data ingest: one atomic raw write + `RawDataIngested` outbox event

use crate::error::{OrchestratorError, Result};
use crate::outbox::payload::{fields, OutboxPayload};
use serde_json::Value;
use slicegraph_storage::domain::{
    entity_type_of, event_types, AggregateType, IngestUnitOfWork, OutboxEntry, PutOutcome,
    RawDataRecord,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub tenant_id: String,
    pub entity_key: String,
    pub version: u64,
    pub content_hash: String,
    pub outcome: PutOutcome,
    /// Outbox entry written with the record; `None` when skipped
    pub outbox_entry_id: Option<Uuid>,
}

pub struct IngestService {
    uow: Arc<dyn IngestUnitOfWork>,
}

impl IngestService {
    pub fn new(uow: Arc<dyn IngestUnitOfWork>) -> Self {
        Self { uow }
    }

    /// Store a raw record and announce it
    ///
    /// Re-ingesting identical content is `Skipped` with no new event;
    /// different content at an existing version is an invariant violation.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: u64,
        schema_id: &str,
        schema_version: &str,
        payload: Value,
    ) -> Result<IngestReceipt> {
        validate(tenant_id, entity_key, version, schema_id)?;

        let record = RawDataRecord::new(
            tenant_id,
            entity_key,
            version,
            schema_id,
            schema_version,
            payload,
        );

        let event = OutboxPayload::new(tenant_id, entity_key, version)
            .with_field(fields::SCHEMA_ID, schema_id)
            .with_field(fields::SCHEMA_VERSION, schema_version)
            .with_field(fields::CONTENT_HASH, record.content_hash.clone());
        let entry = OutboxEntry::new(
            format!(
                "{}:{}:{}:{}",
                tenant_id,
                entity_key,
                version,
                event_types::RAW_DATA_INGESTED
            ),
            AggregateType::RawData,
            entity_key,
            event_types::RAW_DATA_INGESTED,
            event.to_json()?,
        );

        let outcome = self.uow.commit(&record, &entry).await?;
        match outcome {
            PutOutcome::Inserted => info!(
                "Ingested {} ({})",
                record.natural_key(),
                &record.content_hash[..12]
            ),
            PutOutcome::Skipped => debug!("Ingest of {} skipped, identical content", record.natural_key()),
        }

        Ok(IngestReceipt {
            tenant_id: record.tenant_id,
            entity_key: record.entity_key,
            version,
            content_hash: record.content_hash,
            outcome,
            outbox_entry_id: (outcome == PutOutcome::Inserted).then_some(entry.id),
        })
    }
}

fn validate(tenant_id: &str, entity_key: &str, version: u64, schema_id: &str) -> Result<()> {
    if tenant_id.trim().is_empty() {
        return Err(OrchestratorError::validation("tenant_id must not be blank"));
    }
    if entity_type_of(entity_key).is_none() {
        return Err(OrchestratorError::validation(format!(
            "entity key {:?} is not TYPE#tenant#id",
            entity_key
        )));
    }
    if version == 0 {
        return Err(OrchestratorError::validation("version must be >= 1"));
    }
    if schema_id.trim().is_empty() {
        return Err(OrchestratorError::validation("schema_id must not be blank"));
    }
    Ok(())
}
