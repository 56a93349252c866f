//! Static stream routes for answer nodes.
//!
//! Routes are resolved once per run from the locked workflow. Each answer
//! template becomes an ordered list of [`RouteChunk`]s, registered under every
//! node whose start should begin streaming that answer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use flowcast_config::{NodeKind, NodeType};
use flowcast_workflow::Workflow;
use regex::Regex;
use serde::Serialize;

/// `{{#node_id.field.path#}}` references inside answer templates.
static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"\{\{#([a-zA-Z0-9_]{1,50}(?:\.[a-zA-Z_][a-zA-Z0-9_]{0,29}){1,10})#\}\}")
    .expect("variable pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteChunk {
  Text { text: String },
  Var { value_selector: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamGenerateRoute {
  pub answer_node_id: String,
  pub chunks: Vec<RouteChunk>,
}

/// Every route of a workflow plus the iteration membership map.
#[derive(Debug, Clone, Default)]
pub struct StreamRoutes {
  routes: BTreeMap<String, StreamGenerateRoute>,
  iteration_nested_relations: HashMap<String, Vec<String>>,
}

impl StreamRoutes {
  pub fn resolve(workflow: &Workflow) -> Self {
    let mut routes = BTreeMap::new();
    let mut iteration_nested_relations: HashMap<String, Vec<String>> = HashMap::new();

    // Declaration order: a later answer node wins a shared start node.
    for node in workflow.nodes() {
      if let Some(iteration_id) = &node.iteration_id {
        iteration_nested_relations
          .entry(iteration_id.clone())
          .or_default()
          .push(node.node_id.clone());
      }

      let NodeType::Answer { answer } = &node.node_type else {
        continue;
      };

      let chunks = extract_route_chunks(answer);
      for start_node_id in answer_start_node_ids(workflow, &node.node_id) {
        routes.insert(
          start_node_id,
          StreamGenerateRoute {
            answer_node_id: node.node_id.clone(),
            chunks: chunks.clone(),
          },
        );
      }
    }

    Self {
      routes,
      iteration_nested_relations,
    }
  }

  /// Route that starts streaming when `node_id` starts.
  pub fn get(&self, node_id: &str) -> Option<&StreamGenerateRoute> {
    self.routes.get(node_id)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &StreamGenerateRoute)> {
    self.routes.iter()
  }

  /// Nodes declared directly inside an iteration or loop node.
  pub fn nested_nodes(&self, iteration_id: &str) -> &[String] {
    self
      .iteration_nested_relations
      .get(iteration_id)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }
}

/// Split an answer template into literal text and variable references.
pub fn extract_route_chunks(template: &str) -> Vec<RouteChunk> {
  let mut chunks = Vec::new();
  let mut last = 0;

  for captures in VARIABLE_PATTERN.captures_iter(template) {
    let (Some(whole), Some(selector)) = (captures.get(0), captures.get(1)) else {
      continue;
    };
    if whole.start() > last {
      chunks.push(RouteChunk::Text {
        text: template[last..whole.start()].to_string(),
      });
    }
    chunks.push(RouteChunk::Var {
      value_selector: selector.as_str().split('.').map(str::to_string).collect(),
    });
    last = whole.end();
  }

  if last < template.len() {
    chunks.push(RouteChunk::Text {
      text: template[last..].to_string(),
    });
  }

  chunks
}

/// Nodes whose start should begin streaming the answer at `answer_node_id`.
fn answer_start_node_ids(workflow: &Workflow, answer_node_id: &str) -> Vec<String> {
  let mut start_node_ids = Vec::new();
  let mut visited = HashSet::new();
  collect_start_node_ids(workflow, answer_node_id, &mut visited, &mut start_node_ids);
  start_node_ids
}

fn collect_start_node_ids(
  workflow: &Workflow,
  target_node_id: &str,
  visited: &mut HashSet<String>,
  start_node_ids: &mut Vec<String>,
) {
  if !visited.insert(target_node_id.to_string()) {
    return;
  }

  let upstream = workflow.graph().upstream(target_node_id);
  if upstream.is_empty() {
    if is_iteration_start(workflow, target_node_id) {
      push_unique(start_node_ids, target_node_id);
    }
    return;
  }

  for source_id in upstream {
    let Some(source) = workflow.get_node(source_id) else {
      continue;
    };

    if source.kind().is_stream_barrier() {
      push_unique(start_node_ids, target_node_id);
    } else if source.kind() == NodeKind::Start || is_iteration_start(workflow, source_id) {
      push_unique(start_node_ids, source_id);
    } else {
      collect_start_node_ids(workflow, source_id, visited, start_node_ids);
    }
  }
}

/// Whether `node_id` is the declared body start of its enclosing iteration.
fn is_iteration_start(workflow: &Workflow, node_id: &str) -> bool {
  workflow
    .enclosing_iteration(node_id)
    .and_then(|iteration_id| workflow.get_node(iteration_id))
    .and_then(|iteration| iteration.node_type.start_node_id())
    == Some(node_id)
}

fn push_unique(start_node_ids: &mut Vec<String>, node_id: &str) {
  if !start_node_ids.iter().any(|id| id == node_id) {
    start_node_ids.push(node_id.to_string());
  }
}
