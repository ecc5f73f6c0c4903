//! Outbox dispatch table
//!
//! | aggregate  | event             | target                         |
//! |------------|-------------------|--------------------------------|
//! | RAW_DATA   | RawDataIngested   | `SliceExecutor::execute_auto`  |
//! | SLICE      | any               | slice event handler            |
//! | CHANGESET  | any               | changeset handler (no-op)      |
//! | other      | any               | failure                        |

use crate::outbox::payload::OutboxPayload;
use crate::slicing::SliceExecutor;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use slicegraph_storage::domain::{event_types, AggregateType, OutboxEntry};
use std::sync::Arc;
use tracing::debug;

/// Pluggable handler for SLICE / CHANGESET events
#[async_trait]
pub trait OutboxEventHandler: Send + Sync {
    async fn handle(&self, entry: &OutboxEntry, payload: &OutboxPayload) -> anyhow::Result<()>;
}

/// Accepts everything
pub struct NoopEventHandler;

#[async_trait]
impl OutboxEventHandler for NoopEventHandler {
    async fn handle(&self, entry: &OutboxEntry, _payload: &OutboxPayload) -> anyhow::Result<()> {
        debug!("No-op handler consumed {} {}", entry.aggregate_type, entry.event_type);
        Ok(())
    }
}

pub struct OutboxDispatcher {
    executor: Arc<dyn SliceExecutor>,
    slice_handler: Option<Arc<dyn OutboxEventHandler>>,
    changeset_handler: Arc<dyn OutboxEventHandler>,
}

impl OutboxDispatcher {
    pub fn new(executor: Arc<dyn SliceExecutor>) -> Self {
        Self {
            executor,
            slice_handler: None,
            changeset_handler: Arc::new(NoopEventHandler),
        }
    }

    pub fn with_slice_handler(mut self, handler: Arc<dyn OutboxEventHandler>) -> Self {
        self.slice_handler = Some(handler);
        self
    }

    pub fn with_changeset_handler(mut self, handler: Arc<dyn OutboxEventHandler>) -> Self {
        self.changeset_handler = handler;
        self
    }

    /// Route one entry; any error marks only this entry FAILED
    pub async fn dispatch(&self, entry: &OutboxEntry) -> anyhow::Result<()> {
        let payload = OutboxPayload::parse(&entry.payload)?;

        match &entry.aggregate_type {
            AggregateType::RawData if entry.event_type == event_types::RAW_DATA_INGESTED => {
                let rule_set = payload.rule_set();
                self.executor
                    .execute_auto(
                        &payload.tenant_id,
                        &payload.entity_key,
                        payload.version,
                        rule_set.as_ref(),
                    )
                    .await?;
                Ok(())
            }
            AggregateType::Slice => {
                let handler = self
                    .slice_handler
                    .as_ref()
                    .ok_or_else(|| anyhow!("No handler registered for SLICE/{}", entry.event_type))?;
                handler.handle(entry, &payload).await
            }
            AggregateType::ChangeSet => self.changeset_handler.handle(entry, &payload).await,
            other => bail!("Unknown outbox route {}/{}", other, entry.event_type),
        }
    }
}
