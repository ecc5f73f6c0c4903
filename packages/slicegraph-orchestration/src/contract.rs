//! Resolved rule/view contracts
//!
//! The registry hands the engines already-parsed rule sets. Only the shapes
//! read here matter: slice-build rules, index rules, joins, the impact map,
//! sink rules and view missing-policies.

use crate::error::{OrchestratorError, Result};
use crate::fanout::config::FanoutConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use slicegraph_storage::hashing::normalize_index_value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Path separator for payload paths (`attributes.color`)
pub const PATH_SEPARATOR: char = '.';

/// Wildcard selecting/mapping the whole payload
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleSetRef {
    pub id: String,
    pub version: String,
}

impl RuleSetRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for RuleSetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Read a dotted path out of a JSON value
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path == WILDCARD {
        return Some(value);
    }
    path.split(PATH_SEPARATOR)
        .try_fold(value, |current, segment| current.get(segment))
}

fn insert_path(target: &mut Map<String, Value>, path: &str, leaf: Value) {
    let mut segments = path.split(PATH_SEPARATOR).peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), leaf);
            return;
        }
        let child = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        match child {
            Value::Object(map) => current = map,
            _ => return,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rule set
// ═══════════════════════════════════════════════════════════════════════════

/// Projects selected payload paths into one slice type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceBuildRule {
    pub slice_type: String,
    pub select: Vec<String>,
}

impl SliceBuildRule {
    pub fn new(slice_type: impl Into<String>, select: &[&str]) -> Self {
        Self {
            slice_type: slice_type.into(),
            select: select.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Slice data, or `None` when no selected path is present
    pub fn build(&self, payload: &Value) -> Option<Value> {
        let mut out = Map::new();
        for path in &self.select {
            match get_path(payload, path) {
                Some(Value::Null) | None => {}
                Some(v) if path == WILDCARD => match v {
                    Value::Object(map) if !map.is_empty() => {
                        out.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    _ => {}
                },
                Some(v) => insert_path(&mut out, path, v.clone()),
            }
        }
        (!out.is_empty()).then_some(Value::Object(out))
    }
}

/// Emits inverted index entries for references found in a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRule {
    pub index_type: String,
    pub source_path: String,
    pub ref_entity_type: String,
    /// Slice type the reference belongs to
    pub slice_type: String,
}

impl IndexRule {
    /// Referenced values (strings, numbers, or arrays of them)
    pub fn extract_values(&self, payload: &Value) -> Vec<String> {
        reference_values(get_path(payload, &self.source_path))
    }
}

/// Whether the value at `path` is, or contains, `id` once both are
/// normalized like index values
pub fn path_references(payload: &Value, path: &str, id: &str) -> bool {
    let wanted = normalize_index_value(id);
    reference_values(get_path(payload, path))
        .iter()
        .any(|value| normalize_index_value(value) == wanted)
}

/// Scalar references at a path, sorted and deduplicated
fn reference_values(value: Option<&Value>) -> Vec<String> {
    fn scalar(v: &Value) -> Option<String> {
        match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    let mut values: Vec<String> = match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar).collect(),
        Some(v) => scalar(v).into_iter().collect(),
        None => Vec::new(),
    };
    values.sort();
    values.dedup();
    values
}

/// Declared upstream → downstream edge
///
/// The owning rule set's entity type is the downstream side. Views reading
/// any of `affected_slice_types` get the referenced upstream entities'
/// live slices merged in under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub name: String,
    pub upstream_entity_type: String,
    pub index_type: String,
    /// Payload path in the downstream entity holding the reference
    pub join_path: String,
    pub affected_slice_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout: Option<FanoutConfig>,
}

impl JoinSpec {
    /// Upstream ids referenced at `join_path`, sorted
    pub fn referenced_ids(&self, payload: &Value) -> Vec<String> {
        reference_values(get_path(payload, &self.join_path))
    }

    /// Whether `payload` still references upstream `id` (normalized match)
    pub fn references(&self, payload: &Value, id: &str) -> bool {
        path_references(payload, &self.join_path, id)
    }

    /// Whether a view over `slice_types` reads this join
    pub fn affects_any<'a, I>(&self, slice_types: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        slice_types
            .into_iter()
            .any(|ty| self.affected_slice_types.contains(ty))
    }
}

/// Changed path → dependent slice types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImpactMap {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl ImpactMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, slice_types: &[&str]) -> Self {
        self.entries
            .entry(path.into())
            .or_default()
            .extend(slice_types.iter().map(|s| s.to_string()));
        self
    }

    pub fn declared_paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn slice_types(&self) -> impl Iterator<Item = &String> {
        self.entries.values().flatten()
    }

    /// Declared `a.b` covers `a.b` and `a.b.c`; a changed container `a`
    /// covers every declared descendant `a.*`.
    fn matches(declared: &str, changed: &str) -> bool {
        fn is_prefix(prefix: &str, path: &str) -> bool {
            path.len() > prefix.len()
                && path.starts_with(prefix)
                && path[prefix.len()..].starts_with(PATH_SEPARATOR)
        }
        declared == WILDCARD
            || declared == changed
            || is_prefix(declared, changed)
            || is_prefix(changed, declared)
    }

    /// Slice types impacted by one changed path (empty = unmapped)
    pub fn lookup(&self, changed: &str) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|(declared, _)| Self::matches(declared, changed))
            .flat_map(|(_, types)| types.iter().cloned())
            .collect()
    }

    /// Union over all changed paths; the first unmapped path fails closed
    pub fn resolve<'a, I>(&self, changed_paths: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut impacted = BTreeSet::new();
        for path in changed_paths {
            let types = self.lookup(path);
            if types.is_empty() {
                return Err(OrchestratorError::UnmappedChangePath { path: path.clone() });
            }
            impacted.extend(types);
        }
        Ok(impacted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewRef {
    pub id: String,
    pub version: String,
}

impl ViewRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ViewRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Where merged slices are shipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRule {
    pub sink_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<ViewRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub id: String,
    pub version: String,
    /// Entity type this rule set slices (`PRODUCT`)
    pub entity_type: String,
    pub slices: Vec<SliceBuildRule>,
    #[serde(default)]
    pub indexes: Vec<IndexRule>,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub impact_map: ImpactMap,
    #[serde(default)]
    pub sinks: Vec<SinkRule>,
}

impl RuleSet {
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            entity_type: entity_type.into(),
            slices: Vec::new(),
            indexes: Vec::new(),
            joins: Vec::new(),
            impact_map: ImpactMap::new(),
            sinks: Vec::new(),
        }
    }

    pub fn reference(&self) -> RuleSetRef {
        RuleSetRef::new(self.id.clone(), self.version.clone())
    }

    pub fn slice_types(&self) -> BTreeSet<String> {
        self.slices.iter().map(|r| r.slice_type.clone()).collect()
    }

    pub fn slice_rule(&self, slice_type: &str) -> Option<&SliceBuildRule> {
        self.slices.iter().find(|r| r.slice_type == slice_type)
    }

    /// Reject contracts the engines cannot run deterministically
    pub fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(OrchestratorError::contract(format!(
                "Rule set {} has no entity type",
                self.reference()
            )));
        }

        let mut seen = BTreeSet::new();
        for rule in &self.slices {
            if !seen.insert(rule.slice_type.as_str()) {
                return Err(OrchestratorError::contract(format!(
                    "Rule set {} declares slice type {} twice",
                    self.reference(),
                    rule.slice_type
                )));
            }
        }

        let unknown = |ty: &String, what: &str| {
            OrchestratorError::contract(format!(
                "Rule set {} references unknown slice type {} in {}",
                self.reference(),
                ty,
                what
            ))
        };
        for ty in self.impact_map.slice_types() {
            if !seen.contains(ty.as_str()) {
                return Err(unknown(ty, "impact map"));
            }
        }
        for rule in &self.indexes {
            if !seen.contains(rule.slice_type.as_str()) {
                return Err(unknown(&rule.slice_type, "index rules"));
            }
        }
        let mut join_names = BTreeSet::new();
        for join in &self.joins {
            if join.name.trim().is_empty()
                || seen.contains(join.name.as_str())
                || !join_names.insert(join.name.as_str())
            {
                return Err(OrchestratorError::contract(format!(
                    "Rule set {}: join name {:?} is blank or collides with a slice type or join",
                    self.reference(),
                    join.name
                )));
            }
            for ty in &join.affected_slice_types {
                if !seen.contains(ty.as_str()) {
                    return Err(unknown(ty, "joins"));
                }
            }
        }

        // Incremental runs carry forward every type the impact map does not
        // name, so each selected path must map back to its own slice type.
        if self.impact_map.declared_paths().next().is_some() {
            for rule in &self.slices {
                for path in &rule.select {
                    if !self.impact_map.lookup(path).contains(&rule.slice_type) {
                        return Err(OrchestratorError::contract(format!(
                            "Rule set {}: path {} of slice type {} is not in the impact map",
                            self.reference(),
                            path,
                            rule.slice_type
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Views
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissingPolicy {
    /// Any missing slice type fails the assembly
    #[default]
    FailClosed,
    /// Missing slice types are omitted
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub id: String,
    pub version: String,
    pub slice_types: Vec<String>,
    #[serde(default)]
    pub missing_policy: MissingPolicy,
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry port
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ContractRegistry: Send + Sync {
    async fn load_rule_set_contract(&self, rule_set: &RuleSetRef) -> Result<Arc<RuleSet>>;

    async fn load_view_definition_contract(&self, view: &ViewRef) -> Result<Arc<ViewDefinition>>;

    /// Rule set bound to an entity type when the caller names none
    async fn default_rule_set_for(&self, entity_type: &str) -> Result<RuleSetRef>;

    /// The active rule set of every entity type (input to dependency
    /// inference); superseded versions are excluded
    async fn rule_sets(&self) -> Result<Vec<Arc<RuleSet>>>;
}

/// Registry backed by maps; the last registered rule set per entity type
/// becomes its default.
#[derive(Default)]
pub struct InMemoryContractRegistry {
    rule_sets: RwLock<BTreeMap<RuleSetRef, Arc<RuleSet>>>,
    defaults: RwLock<HashMap<String, RuleSetRef>>,
    views: RwLock<HashMap<ViewRef, Arc<ViewDefinition>>>,
}

impl InMemoryContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_rule_set(&self, rule_set: RuleSet) -> Result<RuleSetRef> {
        rule_set.validate()?;
        let reference = rule_set.reference();
        let entity_type = rule_set.entity_type.clone();
        self.rule_sets
            .write()
            .insert(reference.clone(), Arc::new(rule_set));
        self.defaults.write().insert(entity_type, reference.clone());
        Ok(reference)
    }

    pub fn register_view(&self, view: ViewDefinition) -> ViewRef {
        let reference = ViewRef::new(view.id.clone(), view.version.clone());
        self.views.write().insert(reference.clone(), Arc::new(view));
        reference
    }
}

#[async_trait]
impl ContractRegistry for InMemoryContractRegistry {
    async fn load_rule_set_contract(&self, rule_set: &RuleSetRef) -> Result<Arc<RuleSet>> {
        self.rule_sets
            .read()
            .get(rule_set)
            .cloned()
            .ok_or_else(|| OrchestratorError::contract(format!("Rule set not found: {}", rule_set)))
    }

    async fn load_view_definition_contract(&self, view: &ViewRef) -> Result<Arc<ViewDefinition>> {
        self.views
            .read()
            .get(view)
            .cloned()
            .ok_or_else(|| OrchestratorError::contract(format!("View not found: {}", view)))
    }

    async fn default_rule_set_for(&self, entity_type: &str) -> Result<RuleSetRef> {
        self.defaults.read().get(entity_type).cloned().ok_or_else(|| {
            OrchestratorError::contract(format!("No rule set bound to entity type {}", entity_type))
        })
    }

    async fn rule_sets(&self) -> Result<Vec<Arc<RuleSet>>> {
        let defaults = self.defaults.read();
        let rule_sets = self.rule_sets.read();
        let mut active: Vec<Arc<RuleSet>> = defaults
            .values()
            .filter_map(|reference| rule_sets.get(reference).cloned())
            .collect();
        active.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        Ok(active)
    }
}
