use std::collections::HashMap;

use loom_governance::{applicable_protocols, validate_pre_execution, EvalContext};
use loom_types::{Feature, FeatureStatus, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    BreadthFirst,
    DepthFirst,
}

/// A feature is ready when pending, every dependency is completed, and no
/// active protocol blocks pre-execution validation for it.
pub fn is_ready(feature: &Feature, all: &[Feature], protocols: &[Protocol]) -> bool {
    if feature.status != FeatureStatus::Pending {
        return false;
    }
    let deps_completed = feature.depends_on.iter().all(|dep| {
        all.iter()
            .find(|f| &f.id == dep)
            .map(|f| f.status == FeatureStatus::Completed)
            .unwrap_or(false)
    });
    if !deps_completed {
        return false;
    }
    let ctx = EvalContext {
        feature_id: Some(feature.id.clone()),
        now: chrono::Utc::now(),
        ..Default::default()
    };
    validate_pre_execution(protocols, &ctx).allowed
}

pub fn ready_features<'a>(all: &'a [Feature], protocols: &[Protocol]) -> Vec<&'a Feature> {
    all.iter().filter(|f| is_ready(f, all, protocols)).collect()
}

/// `50*(# pending features blocked by it) + 40*(no dependencies) +
/// 30*(low complexity) - 20*attempts`, with strategy-specific bonuses.
pub fn priority(feature: &Feature, all: &[Feature], strategy: Strategy) -> i64 {
    let blocked_count = all
        .iter()
        .filter(|f| f.status == FeatureStatus::Pending && f.depends_on.iter().any(|d| d == &feature.id))
        .count() as i64;
    let no_deps = feature.depends_on.is_empty();
    let low_complexity = feature.complexity.map(|c| c < 0.5).unwrap_or(true);

    let mut score = 50 * blocked_count + if no_deps { 40 } else { 0 } + if low_complexity { 30 } else { 0 }
        - 20 * feature.attempts as i64;

    match strategy {
        Strategy::BreadthFirst if no_deps => score += 20,
        Strategy::DepthFirst => score += 30 * blocked_count,
        _ => {}
    }
    score
}

/// Orders ready features by descending priority, ties broken by id.
pub fn prioritised<'a>(ready: Vec<&'a Feature>, all: &[Feature], strategy: Strategy) -> Vec<&'a Feature> {
    let mut scored: Vec<(&Feature, i64)> = ready.into_iter().map(|f| (f, priority(f, all, strategy))).collect();
    scored.sort_by(|(fa, pa), (fb, pb)| pb.cmp(pa).then_with(|| fa.id.cmp(&fb.id)));
    scored.into_iter().map(|(f, _)| f).collect()
}

/// Selects the top `batch_size` (capped at 10) ready features by priority.
pub fn select_batch<'a>(
    all: &'a [Feature],
    protocols: &[Protocol],
    strategy: Strategy,
    batch_size: usize,
) -> Vec<&'a Feature> {
    let batch_size = batch_size.min(10);
    let ready = ready_features(all, protocols);
    prioritised(ready, all, strategy).into_iter().take(batch_size).collect()
}

/// Static conflict prediction: re-exported from loom-runtime's heartbeat
/// module so scheduler callers don't need a second dependency path.
pub fn analyze_conflicts(features: &[Feature]) -> Vec<loom_runtime::FeatureConflict> {
    let pairs: Vec<(String, String)> = features.iter().map(|f| (f.id.clone(), f.description.clone())).collect();
    loom_runtime::analyze_feature_conflicts(&pairs)
}

pub fn dependency_map(features: &[Feature]) -> HashMap<String, Vec<String>> {
    features.iter().map(|f| (f.id.clone(), f.depends_on.clone())).collect()
}

/// Whether setting `feature_id`'s dependencies to `proposed_deps` would
/// introduce a cycle into the feature graph (I2, P3). The check applies
/// the proposed edges to a snapshot of the graph and looks for a path
/// leading back to `feature_id`.
pub fn would_create_cycle(features: &[Feature], feature_id: &str, proposed_deps: &[String]) -> bool {
    let mut graph = dependency_map(features);
    graph.insert(feature_id.to_string(), proposed_deps.to_vec());

    let mut visited = std::collections::HashSet::new();
    let mut stack = vec![feature_id.to_string()];
    let mut first = true;
    while let Some(current) = stack.pop() {
        if !first && current == feature_id {
            return true;
        }
        first = false;
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(deps) = graph.get(&current) {
            stack.extend(deps.iter().cloned());
        }
    }
    false
}

/// A read-only view of the feature dependency graph (`feature_graph` op):
/// every feature's direct dependencies, plus whether the graph is acyclic.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGraph {
    pub nodes: Vec<FeatureGraphNode>,
    pub acyclic: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGraphNode {
    pub id: String,
    pub status: FeatureStatus,
    pub depends_on: Vec<String>,
}

pub fn feature_graph(features: &[Feature]) -> FeatureGraph {
    let nodes: Vec<FeatureGraphNode> = features
        .iter()
        .map(|f| FeatureGraphNode {
            id: f.id.clone(),
            status: f.status,
            depends_on: f.depends_on.clone(),
        })
        .collect();
    let acyclic = features.iter().all(|f| !would_create_cycle(features, &f.id, &f.depends_on));
    FeatureGraph { nodes, acyclic }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: &str, deps: Vec<&str>) -> Feature {
        let mut f = Feature::new(id, format!("do {id}"));
        f.depends_on = deps.into_iter().map(String::from).collect();
        f
    }

    #[test]
    fn feature_with_unmet_dependency_is_not_ready() {
        let all = vec![feature("a", vec![]), feature("b", vec!["a"])];
        assert!(!is_ready(&all[1], &all, &[]));
    }

    #[test]
    fn feature_with_completed_dependency_is_ready() {
        let mut a = feature("a", vec![]);
        a.status = FeatureStatus::Completed;
        let b = feature("b", vec!["a"]);
        let all = vec![a, b];
        assert!(is_ready(&all[1], &all, &[]));
    }

    #[test]
    fn no_dependency_feature_scores_higher_than_blocked_one() {
        let free = feature("free", vec![]);
        let blocked = feature("blocked", vec!["other"]);
        let all = vec![free.clone(), blocked.clone()];
        assert!(priority(&free, &all, Strategy::BreadthFirst) > priority(&blocked, &all, Strategy::BreadthFirst));
    }

    #[test]
    fn ties_broken_by_feature_id() {
        let all = vec![feature("b", vec![]), feature("a", vec![])];
        let ready: Vec<&Feature> = all.iter().collect();
        let ordered = prioritised(ready, &all, Strategy::BreadthFirst);
        assert_eq!(ordered[0].id, "a");
    }

    #[test]
    fn select_batch_caps_at_ten() {
        let all: Vec<Feature> = (0..15).map(|i| feature(&format!("f{i}"), vec![])).collect();
        let batch = select_batch(&all, &[], Strategy::BreadthFirst, 20);
        assert_eq!(batch.len(), 10);
    }

    #[test]
    fn would_create_cycle_detects_direct_self_reference() {
        let all = vec![feature("a", vec![])];
        assert!(would_create_cycle(&all, "a", &["a".to_string()]));
    }

    #[test]
    fn would_create_cycle_detects_transitive_cycle() {
        let all = vec![feature("a", vec![]), feature("b", vec!["a"])];
        assert!(would_create_cycle(&all, "a", &["b".to_string()]));
    }

    #[test]
    fn would_create_cycle_allows_acyclic_dependency() {
        let all = vec![feature("a", vec![]), feature("b", vec![])];
        assert!(!would_create_cycle(&all, "b", &["a".to_string()]));
    }

    #[test]
    fn feature_graph_reports_acyclic_for_a_valid_chain() {
        let all = vec![feature("a", vec![]), feature("b", vec!["a"])];
        let graph = feature_graph(&all);
        assert!(graph.acyclic);
        assert_eq!(graph.nodes.len(), 2);
    }
}
