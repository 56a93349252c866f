//! Live bookkeeping for iteration and loop nodes.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde_json::Value;

/// State of one active iteration.
#[derive(Debug, Clone)]
pub struct IterationState {
  /// Node execution recorded for the iteration node itself.
  pub node_execution_id: String,
  pub parent_iteration_id: Option<String>,
  pub current_index: u32,
  /// Resolved list being iterated, used to answer `item` lookups.
  pub items: Vec<Value>,
  pub total_tokens: i64,
  pub started_at: Instant,
}

impl IterationState {
  pub fn new(node_execution_id: String, parent_iteration_id: Option<String>, inputs: Option<&Value>) -> Self {
    let items = inputs
      .and_then(|inputs| inputs.get("iterator_selector"))
      .and_then(Value::as_array)
      .cloned()
      .unwrap_or_default();

    Self {
      node_execution_id,
      parent_iteration_id,
      current_index: 0,
      items,
      total_tokens: 0,
      started_at: Instant::now(),
    }
  }

  pub fn current_item(&self) -> Option<&Value> {
    self.items.get(self.current_index as usize)
  }
}

/// Tracks every iteration that is currently running.
#[derive(Debug, Default)]
pub struct IterationTracker {
  current_iterations: HashMap<String, IterationState>,
  aborted: HashSet<String>,
}

impl IterationTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn start(&mut self, node_id: &str, state: IterationState) {
    self.aborted.remove(node_id);
    self.current_iterations.insert(node_id.to_string(), state);
  }

  pub fn get(&self, node_id: &str) -> Option<&IterationState> {
    self.current_iterations.get(node_id)
  }

  pub fn is_active(&self, node_id: &str) -> bool {
    self.current_iterations.contains_key(node_id)
  }

  pub fn is_aborted(&self, node_id: &str) -> bool {
    self.aborted.contains(node_id)
  }

  /// Move to the next round. Returns the updated state.
  pub fn next(&mut self, node_id: &str, index: u32) -> Option<&IterationState> {
    let state = self.current_iterations.get_mut(node_id)?;
    state.current_index = index;
    Some(state)
  }

  pub fn add_tokens(&mut self, node_id: &str, tokens: i64) {
    if let Some(state) = self.current_iterations.get_mut(node_id) {
      state.total_tokens += tokens;
    }
  }

  /// Remove a finished iteration. Its tokens roll up into the parent iteration.
  pub fn complete(&mut self, node_id: &str) -> Option<IterationState> {
    let state = self.current_iterations.remove(node_id)?;
    if let Some(parent) = state.parent_iteration_id.as_deref() {
      self.add_tokens(parent, state.total_tokens);
    }
    Some(state)
  }

  /// Remove an iteration and ignore its later events.
  pub fn abort(&mut self, node_id: &str) -> Option<IterationState> {
    self.aborted.insert(node_id.to_string());
    self.current_iterations.remove(node_id)
  }

  /// Take every active iteration, e.g. to fail them when the run fails.
  pub fn drain(&mut self) -> Vec<(String, IterationState)> {
    self.current_iterations.drain().collect()
  }
}
