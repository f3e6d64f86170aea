use super::{GatewayDirection, NodeSpec, ProcessDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn error(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

/// Validate a definition before compilation. Returns all errors found.
pub fn validate(definition: &ProcessDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // V1: Node IDs must be unique
    let mut node_map: HashMap<&str, &NodeSpec> = HashMap::new();
    for node in &definition.nodes {
        if node_map.insert(node.id(), node).is_some() {
            errors.push(error("V1", format!("Duplicate node id: {}", node.id())));
        }
    }

    // V2: Exactly one Start node
    let start_count = definition
        .nodes
        .iter()
        .filter(|n| matches!(n, NodeSpec::Start { .. }))
        .count();
    if start_count != 1 {
        errors.push(error(
            "V2",
            format!("Expected exactly one Start node, found {start_count}"),
        ));
    }

    // V3: At least one end node
    if !definition.nodes.iter().any(|n| n.is_end()) {
        errors.push(error("V3", "No End node found".to_string()));
    }

    // V4: Edges reference known nodes
    for edge in &definition.edges {
        for (field, reference) in [("from", &edge.from), ("to", &edge.to)] {
            if !node_map.contains_key(reference.as_str()) {
                errors.push(error(
                    "V4",
                    format!("Edge references unknown node: {reference} ({field})"),
                ));
            }
        }
    }

    let mut outgoing: HashMap<&str, Vec<&super::EdgeSpec>> = HashMap::new();
    let mut incoming: HashMap<&str, usize> = HashMap::new();
    for edge in &definition.edges {
        outgoing.entry(edge.from.as_str()).or_default().push(edge);
        *incoming.entry(edge.to.as_str()).or_insert(0) += 1;
    }

    // V5: ExclusiveGateway with several outgoing edges needs exactly one default
    for node in &definition.nodes {
        if let NodeSpec::ExclusiveGateway { id } = node {
            let out = outgoing.get(id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            if out.len() > 1 {
                let default_count = out
                    .iter()
                    .filter(|e| e.is_default || e.condition.is_none())
                    .count();
                if default_count != 1 {
                    errors.push(error(
                        "V5",
                        format!(
                            "ExclusiveGateway {id}: must have exactly one default outgoing edge, found {default_count}"
                        ),
                    ));
                }
            }
        }
    }

    // V6: Conditions only on edges leaving an exclusive gateway
    for edge in &definition.edges {
        if edge.condition.is_some() {
            let from_gateway = node_map
                .get(edge.from.as_str())
                .is_some_and(|n| matches!(n, NodeSpec::ExclusiveGateway { .. }));
            if !from_gateway {
                errors.push(error(
                    "V6",
                    format!(
                        "Edge {}→{}: conditions are only valid on ExclusiveGateway outgoing edges",
                        edge.from, edge.to
                    ),
                ));
            }
        }
    }

    // V7: All nodes reachable from the start node
    if start_count == 1 {
        let reachable = reachable_from_start(definition);
        for node in &definition.nodes {
            if !reachable.contains(node.id()) {
                errors.push(error(
                    "V7",
                    format!("Node {} is unreachable from the start node", node.id()),
                ));
            }
        }
    }

    // V8: Catch/throw events name their event
    for node in &definition.nodes {
        let name = match node {
            NodeSpec::MessageCatch { message, .. } | NodeSpec::MessageThrow { message, .. } => {
                Some(("message", message))
            }
            NodeSpec::SignalCatch { signal, .. } | NodeSpec::SignalThrow { signal, .. } => {
                Some(("signal", signal))
            }
            _ => None,
        };
        if let Some((kind, name)) = name {
            if name.is_empty() {
                errors.push(error(
                    "V8",
                    format!("Node {}: empty {kind} name", node.id()),
                ));
            }
        }
    }

    // V9: Converging parallel gateways need at least two incoming edges
    for node in &definition.nodes {
        if let NodeSpec::ParallelGateway {
            id,
            direction: GatewayDirection::Converging,
        } = node
        {
            let count = incoming.get(id.as_str()).copied().unwrap_or(0);
            if count < 2 {
                errors.push(error(
                    "V9",
                    format!(
                        "ParallelGateway {id}: converging gateway needs at least 2 incoming edges, found {count}"
                    ),
                ));
            }
        }
    }

    // V10: CallActivity names a callee
    for node in &definition.nodes {
        if let NodeSpec::CallActivity { id, process_id, .. } = node {
            if process_id.is_empty() {
                errors.push(error("V10", format!("CallActivity {id}: empty process_id")));
            }
        }
    }

    // V11: Every non-end node has at least one outgoing edge
    for node in &definition.nodes {
        if !node.is_end() && !outgoing.contains_key(node.id()) {
            errors.push(error(
                "V11",
                format!("Node {} has no outgoing edge", node.id()),
            ));
        }
    }

    errors
}

fn reachable_from_start(definition: &ProcessDefinition) -> HashSet<&str> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &definition.nodes {
        indices
            .entry(node.id())
            .or_insert_with(|| graph.add_node(node.id()));
    }
    for edge in &definition.edges {
        if let (Some(&from), Some(&to)) = (
            indices.get(edge.from.as_str()),
            indices.get(edge.to.as_str()),
        ) {
            graph.add_edge(from, to, ());
        }
    }

    let mut reachable = HashSet::new();
    let start = definition
        .nodes
        .iter()
        .find(|n| matches!(n, NodeSpec::Start { .. }))
        .map(|n| n.id());
    if let Some(start_id) = start {
        let mut dfs = Dfs::new(&graph, indices[start_id]);
        while let Some(ix) = dfs.next(&graph) {
            reachable.insert(graph[ix]);
        }
    }
    reachable
}
