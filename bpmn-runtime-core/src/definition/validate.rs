use super::model::*;
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

fn push(errors: &mut Vec<ValidationError>, rule: &str, message: String) {
    errors.push(ValidationError {
        rule: rule.to_string(),
        message,
    });
}

/// Validate a model before compiling it. Returns all errors found.
pub fn validate_model(model: &ProcessModel) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // V0: Key must be present
    if model.key.trim().is_empty() {
        push(&mut errors, "V0", "Process key is empty".to_string());
    }

    let mut seen = HashSet::new();
    validate_container(&model.nodes, &model.edges, "process", &mut seen, &mut errors);
    errors
}

fn validate_container(
    nodes: &[NodeDto],
    edges: &[EdgeDto],
    label: &str,
    seen: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    let mut node_map: HashMap<&str, &NodeDto> = HashMap::new();
    let mut outgoing: HashMap<&str, Vec<&EdgeDto>> = HashMap::new();
    let mut incoming: HashMap<&str, usize> = HashMap::new();

    // V1: Node ids unique across the whole model, nested levels included
    for node in nodes {
        let id = node.id();
        if id.is_empty() {
            push(errors, "V1", format!("Empty node id in {}", label));
            continue;
        }
        if !seen.insert(id.to_string()) {
            push(errors, "V1", format!("Duplicate node id: {}", id));
        } else {
            node_map.insert(id, node);
        }
    }

    // V2: Edge endpoints exist at this level
    for edge in edges {
        for (reference, field) in [(&edge.from, "from"), (&edge.to, "to")] {
            if !node_map.contains_key(reference.as_str()) {
                push(
                    errors,
                    "V2",
                    format!(
                        "Edge references unknown node in {}: {} ({})",
                        label, reference, field
                    ),
                );
            }
        }
        outgoing.entry(edge.from.as_str()).or_default().push(edge);
        *incoming.entry(edge.to.as_str()).or_default() += 1;
    }

    // V3: Exactly one Start node per level
    let starts: Vec<&str> = nodes
        .iter()
        .filter(|n| matches!(n, NodeDto::Start { .. }))
        .map(|n| n.id())
        .collect();
    if starts.len() != 1 {
        push(
            errors,
            "V3",
            format!("Expected exactly one Start node in {}, found {}", label, starts.len()),
        );
    }

    // V4: At least one End node per level
    if !nodes.iter().any(|n| matches!(n, NodeDto::End { .. })) {
        push(errors, "V4", format!("No End node found in {}", label));
    }

    // V5: Start has no incoming, End has no outgoing
    for node in nodes {
        match node {
            NodeDto::Start { id } if incoming.contains_key(id.as_str()) => {
                push(errors, "V5", format!("Start {} has incoming edges", id))
            }
            NodeDto::End { id, .. } if outgoing.contains_key(id.as_str()) => {
                push(errors, "V5", format!("End {} has outgoing edges", id))
            }
            _ => {}
        }
    }

    // V6: Branching nodes without a condition on every edge need exactly one default
    for node in nodes {
        if matches!(node, NodeDto::ParallelGateway { .. } | NodeDto::EventGateway { .. }) {
            continue;
        }
        let out_edges = outgoing.get(node.id()).map(Vec::as_slice).unwrap_or_default();
        if out_edges.len() > 1 {
            let default_count = out_edges
                .iter()
                .filter(|e| e.is_default || e.condition.is_none())
                .count();
            if default_count != 1 {
                push(
                    errors,
                    "V6",
                    format!(
                        "{}: must have exactly one default outgoing edge, found {}",
                        node.id(),
                        default_count
                    ),
                );
            }
        }
    }

    // V7: No edge has both condition and is_default
    for edge in edges {
        if edge.condition.is_some() && edge.is_default {
            push(
                errors,
                "V7",
                format!(
                    "Edge {}→{}: condition and is_default are mutually exclusive",
                    edge.from, edge.to
                ),
            );
        }
    }

    // V8: Diverging ParallelGateway.join references a Converging ParallelGateway
    for node in nodes {
        if let NodeDto::ParallelGateway {
            id,
            direction: GatewayDirection::Diverging,
            join: Some(join_id),
        } = node
        {
            let valid = node_map.get(join_id.as_str()).is_some_and(|n| {
                matches!(
                    n,
                    NodeDto::ParallelGateway {
                        direction: GatewayDirection::Converging,
                        ..
                    }
                )
            });
            if !valid {
                push(
                    errors,
                    "V8",
                    format!("ParallelGateway {}: join '{}' not found or not Converging", id, join_id),
                );
            }
        }
    }

    // V9: EventGateway flows only into catch events, at least two of them
    for node in nodes {
        if let NodeDto::EventGateway { id } = node {
            let out_edges = outgoing.get(id.as_str()).map(Vec::as_slice).unwrap_or_default();
            if out_edges.len() < 2 {
                push(
                    errors,
                    "V9",
                    format!("EventGateway {}: needs at least two outgoing edges", id),
                );
            }
            for edge in out_edges {
                let target_ok = node_map
                    .get(edge.to.as_str())
                    .is_some_and(|n| n.is_catch_event());
                if !target_ok || edge.condition.is_some() {
                    push(
                        errors,
                        "V9",
                        format!(
                            "EventGateway {}: edge to '{}' must be an unconditioned edge to a catch event",
                            id, edge.to
                        ),
                    );
                }
            }
        }
    }

    // V10: Signal and message names are present
    for node in nodes {
        match node {
            NodeDto::SignalCatch { id, signal } if signal.trim().is_empty() => {
                push(errors, "V10", format!("SignalCatch {}: empty signal name", id))
            }
            NodeDto::MessageCatch { id, message } if message.trim().is_empty() => {
                push(errors, "V10", format!("MessageCatch {}: empty message name", id))
            }
            _ => {}
        }
    }

    // V11: Every node reachable from the Start node
    if let [start] = starts.as_slice() {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for &id in node_map.keys() {
            index.insert(id, graph.add_node(id));
        }
        for edge in edges {
            if let (Some(&a), Some(&b)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) {
                graph.add_edge(a, b, ());
            }
        }
        if let Some(&start_ix) = index.get(start) {
            let mut reached = HashSet::new();
            let mut dfs = Dfs::new(&graph, start_ix);
            while let Some(ix) = dfs.next(&graph) {
                reached.insert(graph[ix]);
            }
            let mut unreachable: Vec<&str> = node_map
                .keys()
                .copied()
                .filter(|id| !reached.contains(id))
                .collect();
            unreachable.sort();
            for id in unreachable {
                push(errors, "V11", format!("Node {} is unreachable from {}", id, start));
            }
        }
    }

    // V12: A Converging ParallelGateway has a single way out
    for node in nodes {
        if let NodeDto::ParallelGateway {
            id,
            direction: GatewayDirection::Converging,
            ..
        } = node
        {
            let count = outgoing.get(id.as_str()).map_or(0, Vec::len);
            if count > 1 {
                push(
                    errors,
                    "V12",
                    format!("ParallelGateway {}: Converging with {} outgoing edges", id, count),
                );
            }
        }
    }

    for node in nodes {
        if let NodeDto::SubProcess {
            id,
            nodes: inner_nodes,
            edges: inner_edges,
        } = node
        {
            validate_container(inner_nodes, inner_edges, &format!("sub-process {}", id), seen, errors);
        }
    }
}
