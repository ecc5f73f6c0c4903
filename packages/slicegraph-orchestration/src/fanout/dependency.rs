//! Upstream → downstream dependency inference
//!
//! Both units are pure functions of the registered rule sets:
//! - `infer_dependencies`: the edges leaving one upstream entity type
//! - `DependencyGraph`: the full entity-type graph, used to audit cascades

use crate::contract::{path_references, RuleSet, RuleSetRef};
use crate::fanout::config::FanoutConfig;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One upstream → downstream causal edge declared by a join
#[derive(Debug, Clone, PartialEq)]
pub struct FanoutDependency {
    pub upstream_entity_type: String,
    pub downstream_entity_type: String,
    pub index_type: String,
    pub join_path: String,
    pub affected_slice_types: Vec<String>,
    /// Join-level config, replacing the engine default for this edge
    pub config: Option<FanoutConfig>,
    /// Rule set used to re-slice the downstream entities
    pub rule_set: RuleSetRef,
}

impl FanoutDependency {
    /// `PRODUCT via product_by_brand`
    pub fn label(&self) -> String {
        format!("{} via {}", self.downstream_entity_type, self.index_type)
    }

    /// Whether a downstream payload still points at upstream `id` through
    /// `join_path`
    pub fn references(&self, payload: &Value, id: &str) -> bool {
        path_references(payload, &self.join_path, id)
    }
}

/// Dependencies whose upstream side is `upstream_entity_type`
///
/// `rule_sets` are expected to be the active set (one per entity type).
///
/// Ordered by (downstream type, index type) so repeated calls process
/// dependencies in the same order.
pub fn infer_dependencies(
    rule_sets: &[Arc<RuleSet>],
    upstream_entity_type: &str,
) -> Vec<FanoutDependency> {
    let mut deps: Vec<FanoutDependency> = rule_sets
        .iter()
        .flat_map(|rs| {
            rs.joins
                .iter()
                .filter(|join| join.upstream_entity_type == upstream_entity_type)
                .map(move |join| FanoutDependency {
                    upstream_entity_type: join.upstream_entity_type.clone(),
                    downstream_entity_type: rs.entity_type.clone(),
                    index_type: join.index_type.clone(),
                    join_path: join.join_path.clone(),
                    affected_slice_types: join.affected_slice_types.clone(),
                    config: join.fanout.clone(),
                    rule_set: rs.reference(),
                })
        })
        .collect();

    deps.sort_by(|a, b| {
        (&a.downstream_entity_type, &a.index_type).cmp(&(&b.downstream_entity_type, &b.index_type))
    });
    deps.dedup_by(|a, b| {
        a.downstream_entity_type == b.downstream_entity_type && a.index_type == b.index_type
    });
    deps
}

/// Entity-type graph (edge = "a change in A re-slices B")
pub struct DependencyGraph {
    graph: DiGraph<String, String>,
    nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn from_rule_sets(rule_sets: &[Arc<RuleSet>]) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        let mut node = |graph: &mut DiGraph<String, String>, ty: &str| -> NodeIndex {
            *nodes
                .entry(ty.to_string())
                .or_insert_with(|| graph.add_node(ty.to_string()))
        };

        for rs in rule_sets {
            for join in &rs.joins {
                let from = node(&mut graph, &join.upstream_entity_type);
                let to = node(&mut graph, &rs.entity_type);
                graph.add_edge(from, to, join.index_type.clone());
            }
        }

        Self { graph, nodes }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct downstream types, sorted
    pub fn downstream_of(&self, entity_type: &str) -> Vec<String> {
        let Some(&idx) = self.nodes.get(entity_type) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .neighbors(idx)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Strongly connected groups that can cascade forever (sorted members)
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .map(|scc| {
                let mut names: Vec<String> = scc.iter().map(|n| self.graph[*n].clone()).collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// True when a change to `entity_type` can eventually re-trigger itself
    pub fn is_on_cycle(&self, entity_type: &str) -> bool {
        self.cycles()
            .iter()
            .any(|group| group.iter().any(|ty| ty == entity_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{JoinSpec, SliceBuildRule};
    use serde_json::json;

    fn rule_set(entity_type: &str, joins: &[(&str, &str)]) -> Arc<RuleSet> {
        let mut rs = RuleSet::new(entity_type.to_lowercase(), "1", entity_type);
        rs.slices.push(SliceBuildRule::new("CORE", &["name"]));
        for (upstream, index_type) in joins {
            rs.joins.push(JoinSpec {
                name: format!("{}_{}", entity_type, upstream),
                upstream_entity_type: upstream.to_string(),
                index_type: index_type.to_string(),
                join_path: format!("{}_id", upstream.to_lowercase()),
                affected_slice_types: vec!["CORE".to_string()],
                fanout: None,
            });
        }
        Arc::new(rs)
    }

    #[test]
    fn test_infer_dependencies_filters_by_upstream_type() {
        let rule_sets = vec![
            rule_set("PRODUCT", &[("BRAND", "product_by_brand"), ("CATEGORY", "product_by_category")]),
            rule_set("OFFER", &[("BRAND", "offer_by_brand")]),
            rule_set("BRAND", &[]),
        ];

        let deps = infer_dependencies(&rule_sets, "BRAND");
        let labels: Vec<String> = deps.iter().map(|d| d.label()).collect();
        assert_eq!(
            labels,
            vec!["OFFER via offer_by_brand", "PRODUCT via product_by_brand"]
        );
        assert_eq!(deps[1].rule_set, RuleSetRef::new("product", "1"));
        assert!(infer_dependencies(&rule_sets, "STORE").is_empty());
    }

    #[test]
    fn test_dependency_follows_join_path() {
        let rule_sets = vec![rule_set("PRODUCT", &[("BRAND", "product_by_brand")])];
        let dep = &infer_dependencies(&rule_sets, "BRAND")[0];

        assert_eq!(dep.join_path, "brand_id");
        assert!(dep.references(&json!({"brand_id": "BR001"}), "br001"));
        assert!(!dep.references(&json!({"brand_id": "BR002"}), "BR001"));
        assert!(!dep.references(&json!({"brand": "BR001"}), "BR001"));
    }

    #[test]
    fn test_graph_downstream_and_acyclic() {
        let rule_sets = vec![
            rule_set("PRODUCT", &[("BRAND", "product_by_brand")]),
            rule_set("OFFER", &[("PRODUCT", "offer_by_product")]),
        ];
        let graph = DependencyGraph::from_rule_sets(&rule_sets);

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.downstream_of("BRAND"), vec!["PRODUCT"]);
        assert!(graph.downstream_of("OFFER").is_empty());
        assert!(graph.cycles().is_empty());
    }

    #[test]
    fn test_graph_detects_cycles() {
        let rule_sets = vec![
            rule_set("A", &[("B", "a_by_b")]),
            rule_set("B", &[("A", "b_by_a")]),
            rule_set("SELF", &[("SELF", "self_by_parent")]),
        ];
        let graph = DependencyGraph::from_rule_sets(&rule_sets);

        assert_eq!(
            graph.cycles(),
            vec![vec!["A".to_string(), "B".to_string()], vec!["SELF".to_string()]]
        );
        assert!(graph.is_on_cycle("A"));
        assert!(!graph.is_on_cycle("C"));
    }
}
