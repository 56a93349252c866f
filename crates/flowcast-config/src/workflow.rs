use serde::{Deserialize, Serialize};

use crate::edge::Edge;
use crate::node::NodeDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
  pub workflow_id: String,
  #[serde(default)]
  pub name: String,
  pub nodes: Vec<NodeDef>,
  #[serde(default)]
  pub edges: Vec<Edge>,
}
