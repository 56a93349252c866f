use std::collections::HashMap;
use std::time::Instant;

use flowcast_config::NodeKind;
use serde_json::{Map, Value};

/// Bookkeeping for a started node, keyed by node id in [`TaskState`].
#[derive(Debug, Clone)]
pub struct NodeExecutionInfo {
  pub workflow_node_execution_id: String,
  pub node_type: NodeKind,
  pub start_at: Instant,
  /// Enclosing iteration at the time the node started.
  pub iteration_id: Option<String>,
  pub finished: bool,
}

/// Cursor into the active stream route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGenerateState {
  /// Start node id the route is registered under.
  pub route_key: String,
  pub position: usize,
}

/// Mutable state of one pipeline invocation. Owned by the consumption loop.
#[derive(Debug)]
pub struct TaskState {
  pub answer: String,
  pub metadata: Map<String, Value>,
  pub ran_node_execution_infos: HashMap<String, NodeExecutionInfo>,
  pub latest_node_execution_info: Option<NodeExecutionInfo>,
  pub current_stream_generate_state: Option<StreamGenerateState>,
  pub total_steps: i64,
  pub total_tokens: i64,
  pub start_at: Instant,
  pub workflow_run_id: Option<String>,
}

impl TaskState {
  pub fn new() -> Self {
    Self {
      answer: String::new(),
      metadata: Map::new(),
      ran_node_execution_infos: HashMap::new(),
      latest_node_execution_info: None,
      current_stream_generate_state: None,
      total_steps: 0,
      total_tokens: 0,
      start_at: Instant::now(),
      workflow_run_id: None,
    }
  }

  /// Move the route cursor forward, clearing the route once it is exhausted.
  pub fn advance_route(&mut self, position: usize, route_len: usize) {
    let Some(generate_state) = self.current_stream_generate_state.as_mut() else {
      return;
    };
    if position >= route_len {
      self.current_stream_generate_state = None;
    } else if position > generate_state.position {
      generate_state.position = position;
    }
  }
}

impl Default for TaskState {
  fn default() -> Self {
    Self::new()
  }
}
