//! Walking the active stream route.
//!
//! When a route becomes active its leading literal text is emitted right
//! away. Every later node finish resumes the walk at the cursor, resolving
//! variable chunks until one depends on a node that has not finished.

use std::sync::Arc;

use flowcast_config::NodeKind;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::WorkflowStreamPipeline;
use crate::route::{RouteChunk, StreamGenerateRoute, StreamRoutes};
use crate::variable::{lookup_path, value_to_text};

/// Outcome of resolving one variable chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VarResolution {
  /// The source has not produced the value yet.
  Wait,
  /// Already streamed as deltas. Advance without emitting.
  Skip,
  /// Resolved. `None` when the value renders to nothing.
  Text(Option<String>),
}

impl WorkflowStreamPipeline {
  pub(crate) fn generate_stream_on_node_started(&mut self) {
    let routes = Arc::clone(&self.routes);
    let Some((route, mut position)) = self.active_route(&routes) else {
      return;
    };

    for chunk in route.chunks.iter().skip(position) {
      let RouteChunk::Text { text } = chunk else {
        break;
      };
      self.emit_answer_text(text.clone());
      position += 1;
    }

    self.state.advance_route(position, route.chunks.len());
  }

  pub(crate) async fn generate_stream_on_node_finished(&mut self) -> Result<(), PipelineError> {
    let routes = Arc::clone(&self.routes);
    let Some((route, mut position)) = self.active_route(&routes) else {
      return Ok(());
    };

    for chunk in route.chunks.iter().skip(position) {
      match chunk {
        RouteChunk::Text { text } => self.emit_answer_text(text.clone()),
        RouteChunk::Var { value_selector } => match self.resolve_var(value_selector).await? {
          VarResolution::Wait => break,
          VarResolution::Skip => {}
          VarResolution::Text(Some(text)) => self.emit_answer_text(text),
          VarResolution::Text(None) => {}
        },
      }
      position += 1;
    }

    self.state.advance_route(position, route.chunks.len());
    if self.state.current_stream_generate_state.is_none() {
      debug!(answer_node_id = %route.answer_node_id, "stream_route_completed");
    }
    Ok(())
  }

  fn active_route<'a>(&self, routes: &'a StreamRoutes) -> Option<(&'a StreamGenerateRoute, usize)> {
    let generate_state = self.state.current_stream_generate_state.as_ref()?;
    let route = routes.get(&generate_state.route_key)?;
    Some((route, generate_state.position))
  }

  async fn resolve_var(&self, value_selector: &[String]) -> Result<VarResolution, PipelineError> {
    let Some((source, path)) = value_selector.split_first() else {
      return Ok(VarResolution::Text(None));
    };

    if source == "sys" {
      let value = path
        .split_first()
        .and_then(|(name, rest)| {
          self
            .context
            .system_variable(name)
            .and_then(|value| lookup_path(&value, rest))
        });
      return Ok(VarResolution::Text(value.as_ref().and_then(value_to_text)));
    }

    // Index and item of a running iteration are known before it finishes.
    if let Some(iteration) = self.iterations.get(source) {
      return Ok(match path.split_first() {
        Some((field, [])) if field == "index" => {
          VarResolution::Text(Some(iteration.current_index.to_string()))
        }
        Some((field, rest)) if field == "item" => VarResolution::Text(
          iteration
            .current_item()
            .and_then(|item| lookup_path(item, rest))
            .as_ref()
            .and_then(value_to_text),
        ),
        _ => VarResolution::Wait,
      });
    }

    let Some(info) = self.state.ran_node_execution_infos.get(source) else {
      return Ok(VarResolution::Wait);
    };
    if !info.finished {
      return Ok(VarResolution::Wait);
    }

    let latest_is_llm = self
      .state
      .latest_node_execution_info
      .as_ref()
      .is_some_and(|latest| latest.node_type == NodeKind::Llm);
    if info.node_type == NodeKind::Llm && latest_is_llm {
      return Ok(VarResolution::Skip);
    }

    let execution = self
      .store
      .get_node_execution(&info.workflow_node_execution_id)
      .await?;
    let value = execution
      .outputs
      .and_then(|outputs| lookup_path(&outputs.0, path));
    Ok(VarResolution::Text(value.as_ref().and_then(value_to_text)))
  }
}
