use std::collections::{HashMap, HashSet};

use loom_types::Protocol;

/// Computes the `extends`-and-`requires` transitive closure of `id` in
/// topological order (dependencies before `id`). A dependency cycle simply
/// stops propagating once a node is revisited while still "visiting" — it
/// never throws, per the resolver's silent cycle-breaking contract.
pub fn resolve_chain(id: &str, protocols: &HashMap<String, Protocol>) -> Vec<String> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut visiting = HashSet::new();
    visit(id, protocols, &mut visited, &mut visiting, &mut order);
    order
}

fn visit(
    id: &str,
    protocols: &HashMap<String, Protocol>,
    visited: &mut HashSet<String>,
    visiting: &mut HashSet<String>,
    order: &mut Vec<String>,
) {
    if visited.contains(id) || visiting.contains(id) {
        return;
    }
    let Some(protocol) = protocols.get(id) else {
        return;
    };
    visiting.insert(id.to_string());
    for dep in protocol.extends.iter().chain(protocol.requires.iter()) {
        visit(dep, protocols, visited, visiting, order);
    }
    visiting.remove(id);
    visited.insert(id.to_string());
    order.push(id.to_string());
}

/// Direct dependents of `id`: protocols that name it in `extends` or
/// `requires`.
pub fn get_dependents(id: &str, protocols: &HashMap<String, Protocol>) -> Vec<String> {
    protocols
        .values()
        .filter(|p| p.extends.iter().any(|e| e == id) || p.requires.iter().any(|r| r == id))
        .map(|p| p.id.clone())
        .collect()
}

/// Orders an arbitrary protocol set so dependencies appear before
/// dependents, suitable for bulk registration or import.
pub fn order_for_registration(protocols: &[Protocol]) -> Vec<String> {
    let by_id: HashMap<String, Protocol> = protocols.iter().map(|p| (p.id.clone(), p.clone())).collect();
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for protocol in protocols {
        if !visited.contains(&protocol.id) {
            let mut visiting = HashSet::new();
            visit(&protocol.id, &by_id, &mut visited, &mut visiting, &mut order);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::{EnforcementConfig, EnforcementMode, OnViolation};

    fn protocol(id: &str, extends: Vec<&str>, requires: Vec<&str>) -> Protocol {
        Protocol {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            name: id.to_string(),
            description: None,
            extends: extends.into_iter().map(String::from).collect(),
            requires: requires.into_iter().map(String::from).collect(),
            conflicts: Vec::new(),
            constraints: Vec::new(),
            enforcement: EnforcementConfig {
                mode: EnforcementMode::Permissive,
                on_violation: OnViolation::Warn,
                ..Default::default()
            },
            applicable_contexts: Default::default(),
            priority: 0,
            tags: None,
            enabled: false,
            deprecated: false,
            created_at: chrono::Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn resolve_chain_orders_dependencies_before_dependents() {
        let mut map = HashMap::new();
        map.insert("base".to_string(), protocol("base", vec![], vec![]));
        map.insert("mid".to_string(), protocol("mid", vec!["base"], vec![]));
        map.insert("top".to_string(), protocol("top", vec!["mid"], vec![]));
        let chain = resolve_chain("top", &map);
        assert_eq!(chain, vec!["base", "mid", "top"]);
    }

    #[test]
    fn resolve_chain_breaks_cycles_silently() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), protocol("a", vec!["b"], vec![]));
        map.insert("b".to_string(), protocol("b", vec!["a"], vec![]));
        let chain = resolve_chain("a", &map);
        assert!(chain.contains(&"a".to_string()));
    }

    #[test]
    fn get_dependents_finds_direct_requirers() {
        let mut map = HashMap::new();
        map.insert("base".to_string(), protocol("base", vec![], vec![]));
        map.insert("dependent".to_string(), protocol("dependent", vec![], vec!["base"]));
        let dependents = get_dependents("base", &map);
        assert_eq!(dependents, vec!["dependent".to_string()]);
    }
}
