use std::collections::HashMap;

use flowcast_config::{Edge, GraphDef, NodeDef, NodeKind};

use crate::error::WorkflowError;
use crate::graph::Graph;

/// A locked workflow ready for stream analysis.
#[derive(Debug, Clone)]
pub struct Workflow {
  workflow_id: String,
  name: String,
  nodes: Vec<NodeDef>,
  edges: Vec<Edge>,
  positions: HashMap<String, usize>,
  graph: Graph,
}

impl Workflow {
  /// Validate a graph definition and lock it.
  pub fn from_def(def: GraphDef) -> Result<Self, WorkflowError> {
    let mut positions = HashMap::with_capacity(def.nodes.len());
    for (position, node) in def.nodes.iter().enumerate() {
      if positions.insert(node.node_id.clone(), position).is_some() {
        return Err(WorkflowError::DuplicateNode(node.node_id.clone()));
      }
    }

    for edge in &def.edges {
      if !positions.contains_key(&edge.from) || !positions.contains_key(&edge.to) {
        return Err(WorkflowError::InvalidEdge {
          from: edge.from.clone(),
          to: edge.to.clone(),
        });
      }
    }

    for node in &def.nodes {
      if let Some(iteration_id) = &node.iteration_id {
        let owner = positions.get(iteration_id).map(|p| def.nodes[*p].kind());
        if !owner.is_some_and(|kind| kind.is_iteration()) {
          return Err(WorkflowError::InvalidIteration {
            node_id: node.node_id.clone(),
            iteration_id: iteration_id.clone(),
          });
        }
      }
    }

    if !def.nodes.iter().any(|n| n.kind() == NodeKind::Start) {
      return Err(WorkflowError::MissingStartNode);
    }

    let graph = Graph::new(&def.nodes, &def.edges);

    Ok(Self {
      workflow_id: def.workflow_id,
      name: def.name,
      nodes: def.nodes,
      edges: def.edges,
      positions,
      graph,
    })
  }

  pub fn workflow_id(&self) -> &str {
    &self.workflow_id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Nodes in declaration order.
  pub fn nodes(&self) -> &[NodeDef] {
    &self.nodes
  }

  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  /// Get a node by ID.
  pub fn get_node(&self, node_id: &str) -> Option<&NodeDef> {
    self.positions.get(node_id).map(|p| &self.nodes[*p])
  }

  /// The graph structure for traversal.
  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// The iteration or loop node that directly encloses `node_id`.
  pub fn enclosing_iteration(&self, node_id: &str) -> Option<&str> {
    self.get_node(node_id)?.iteration_id.as_deref()
  }

  /// Serializable snapshot of the definition, stored on the run record.
  pub fn to_def(&self) -> GraphDef {
    GraphDef {
      workflow_id: self.workflow_id.clone(),
      name: self.name.clone(),
      nodes: self.nodes.clone(),
      edges: self.edges.clone(),
    }
  }
}
