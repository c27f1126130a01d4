//! Dependency graph of a composition and "main service" resolution.
//!
//! The main service is the one whose container the scheduler follows. With
//! several services, it is the service with the deepest dependency tree:
//! a leaf weighs 1, any other service weighs one plus the sum of its
//! dependencies.
//! Only services that depend on something are candidates.

use std::collections::BTreeMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use serde_json::Value;

use crate::core::SchedulerError;

/// Services of a composition with `dependency -> dependent` edges.
#[derive(Debug)]
pub struct ServiceGraph<'a> {
    graph: DiGraphMap<&'a str, ()>,
}

/// Names listed in a service's `depends_on`, list or map form.
pub fn depends_on(service: &Value) -> Vec<&str> {
    match service.get("depends_on") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        Some(Value::Object(map)) => map.keys().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}

impl<'a> ServiceGraph<'a> {
    /// Build the graph of `services`.
    pub fn new(services: &'a BTreeMap<String, Value>) -> Self {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in services.keys() {
            graph.add_node(name.as_str());
        }
        for (name, service) in services {
            for dep in depends_on(service) {
                graph.add_edge(dep, name.as_str(), ());
            }
        }
        Self { graph }
    }

    /// Weight of every service, failing on a dependency cycle.
    pub fn weights(&self) -> Result<BTreeMap<&'a str, u64>, SchedulerError> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            SchedulerError::Validation(vec![format!(
                "dependency cycle involving service '{}'",
                cycle.node_id()
            )])
        })?;
        let mut weights: BTreeMap<&str, u64> = BTreeMap::new();
        for node in order {
            let weight = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| weights.get(dep).copied().unwrap_or(1))
                .fold(1_u64, u64::saturating_add);
            weights.insert(node, weight);
        }
        Ok(weights)
    }

    /// Resolve the main service.
    pub fn main_service(&self) -> Result<&'a str, SchedulerError> {
        let mut nodes = self.graph.nodes();
        match (nodes.next(), nodes.next()) {
            (None, _) => {
                return Err(SchedulerError::InvalidArgument(
                    "composition declares no service".into(),
                ))
            }
            (Some(only), None) => return Ok(only),
            _ => {}
        }

        let weights = self.weights()?;
        let mut candidates: Vec<(&str, u64)> = weights
            .into_iter()
            .filter(|(name, _)| {
                self.graph
                    .neighbors_directed(*name, Direction::Incoming)
                    .next()
                    .is_some()
            })
            .collect();
        if candidates.is_empty() {
            return Err(SchedulerError::Ambiguity(
                "several services and none depends on another".into(),
            ));
        }
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        if let [first, second, ..] = candidates.as_slice() {
            if first.1 == second.1 {
                return Err(SchedulerError::Ambiguity(format!(
                    "leader ambiguity between nodes {} and {}",
                    first.0, second.0
                )));
            }
        }
        Ok(candidates[0].0)
    }
}
