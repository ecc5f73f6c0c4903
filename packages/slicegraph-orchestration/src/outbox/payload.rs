//! Persisted outbox payload
//!
//! Wire shape shared by producers and consumers:
//! `{"payloadVersion":1,"tenantId":..,"entityKey":..,"version":..,...eventFields}`.
//! serde_json escapes every string per RFC 8259.

use crate::contract::{RuleSetRef, ViewRef};
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PAYLOAD_VERSION: u32 = 1;

/// Event-specific field names
pub mod fields {
    pub const SCHEMA_ID: &str = "schemaId";
    pub const SCHEMA_VERSION: &str = "schemaVersion";
    pub const CONTENT_HASH: &str = "contentHash";
    pub const RULE_SET_ID: &str = "ruleSetId";
    pub const RULE_SET_VERSION: &str = "ruleSetVersion";
    pub const SINK_ID: &str = "sinkId";
    pub const VIEW_ID: &str = "viewId";
    pub const VIEW_VERSION: &str = "viewVersion";
    pub const ENTITY_TYPE: &str = "entityType";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxPayload {
    pub payload_version: u32,
    pub tenant_id: String,
    pub entity_key: String,
    pub version: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboxPayload {
    pub fn new(tenant_id: &str, entity_key: &str, version: u64) -> Self {
        Self {
            payload_version: PAYLOAD_VERSION,
            tenant_id: tenant_id.to_string(),
            entity_key: entity_key.to_string(),
            version,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(name.to_string(), value.into());
        self
    }

    pub fn with_rule_set(self, rule_set: &RuleSetRef) -> Self {
        self.with_field(fields::RULE_SET_ID, rule_set.id.as_str())
            .with_field(fields::RULE_SET_VERSION, rule_set.version.as_str())
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }

    /// Rule set named by the producer, if any
    pub fn rule_set(&self) -> Option<RuleSetRef> {
        Some(RuleSetRef::new(
            self.str_field(fields::RULE_SET_ID)?,
            self.str_field(fields::RULE_SET_VERSION)?,
        ))
    }

    pub fn view(&self) -> Option<ViewRef> {
        Some(ViewRef::new(
            self.str_field(fields::VIEW_ID)?,
            self.str_field(fields::VIEW_VERSION)?,
        ))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and check the envelope
    pub fn parse(raw: &str) -> Result<Self> {
        let payload: Self = serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::serialization(format!("Malformed outbox payload: {}", e)))?;

        if payload.payload_version != PAYLOAD_VERSION {
            return Err(OrchestratorError::validation(format!(
                "Unsupported payloadVersion {}",
                payload.payload_version
            )));
        }
        if payload.tenant_id.trim().is_empty() || payload.entity_key.trim().is_empty() {
            return Err(OrchestratorError::validation(
                "Outbox payload requires tenantId and entityKey",
            ));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let payload = OutboxPayload::new("t1", "PRODUCT#t1#p1", 2)
            .with_field(fields::SINK_ID, "search");
        let json: Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();

        assert_eq!(json["payloadVersion"], 1);
        assert_eq!(json["tenantId"], "t1");
        assert_eq!(json["entityKey"], "PRODUCT#t1#p1");
        assert_eq!(json["version"], 2);
        assert_eq!(json["sinkId"], "search");
    }

    #[test]
    fn test_strings_are_escaped() {
        let payload = OutboxPayload::new("t1", "NOTE#t1#\"quoted\"\n", 1);
        let raw = payload.to_json().unwrap();
        assert!(raw.contains(r#"NOTE#t1#\"quoted\"\n"#));
        assert_eq!(OutboxPayload::parse(&raw).unwrap(), payload);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            OutboxPayload::parse("not json"),
            Err(OrchestratorError::Serialization(_))
        ));
        assert!(matches!(
            OutboxPayload::parse(r#"{"payloadVersion":1,"tenantId":" ","entityKey":"k","version":1}"#),
            Err(OrchestratorError::Validation(_))
        ));
        assert!(OutboxPayload::parse(
            r#"{"payloadVersion":9,"tenantId":"t1","entityKey":"k","version":1}"#
        )
        .is_err());
    }

    #[test]
    fn test_optional_rule_set_and_view() {
        let payload = OutboxPayload::new("t1", "k", 1);
        assert!(payload.rule_set().is_none());
        assert!(payload.view().is_none());

        let payload = payload
            .with_rule_set(&RuleSetRef::new("product", "2"))
            .with_field(fields::VIEW_ID, "pdp")
            .with_field(fields::VIEW_VERSION, "1");
        assert_eq!(payload.rule_set(), Some(RuleSetRef::new("product", "2")));
        assert_eq!(payload.view(), Some(ViewRef::new("pdp", "1")));
    }
}
