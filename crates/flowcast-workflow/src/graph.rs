use std::collections::HashMap;

use flowcast_config::{Edge, NodeDef};

/// Reverse adjacency of a workflow, walked backward from answer nodes.
#[derive(Debug, Clone)]
pub struct Graph {
  /// node_id -> list of upstream node_ids, in edge declaration order.
  reverse_adjacency: HashMap<String, Vec<String>>,
}

impl Graph {
  /// Build a graph from nodes and edges.
  pub fn new(nodes: &[NodeDef], edges: &[Edge]) -> Self {
    let mut reverse_adjacency: HashMap<String, Vec<String>> = nodes
      .iter()
      .map(|node| (node.node_id.clone(), Vec::new()))
      .collect();

    for edge in edges {
      reverse_adjacency
        .entry(edge.to.clone())
        .or_default()
        .push(edge.from.clone());
    }

    Self { reverse_adjacency }
  }

  /// Get upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }
}
