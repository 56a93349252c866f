use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("node not found: {0}")]
  NodeNotFound(String),

  #[error("duplicate node id: {0}")]
  DuplicateNode(String),

  #[error("edge references unknown node: from={from}, to={to}")]
  InvalidEdge { from: String, to: String },

  #[error("node '{node_id}' references unknown iteration '{iteration_id}'")]
  InvalidIteration { node_id: String, iteration_id: String },

  #[error("workflow has no start node")]
  MissingStartNode,
}
