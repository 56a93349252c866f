//! Persistence of workflow runs and node executions.
//!
//! Every operation is one write followed by a read of the stored record, so
//! callers always see what the store actually holds.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use flowcast_store::{
  Json, NodeExecutionStatus, RunStatus, Store, WorkflowNodeExecution, WorkflowRun,
};
use flowcast_workflow::Workflow;
use serde_json::{Map, Value, json};
use tracing::{info, instrument};

use crate::error::PipelineError;
use crate::iteration::IterationTracker;
use crate::queue::{NodeFinishedEvent, NodeStartedEvent};
use crate::state::{NodeExecutionInfo, TaskState};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
  Succeeded { outputs: Option<Value> },
  Failed { error: String },
  Stopped { reason: String },
}

/// Iteration a node runs in, stamped into its execution metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationScope {
  pub iteration_id: String,
  pub index: u32,
}

/// Fields written when an execution finishes.
#[derive(Debug, Clone, Default)]
pub struct NodeCompletion {
  pub inputs: Option<Value>,
  pub process_data: Option<Value>,
  pub outputs: Option<Value>,
  pub execution_metadata: Option<Value>,
  pub error: Option<String>,
}

impl From<&NodeFinishedEvent> for NodeCompletion {
  fn from(event: &NodeFinishedEvent) -> Self {
    Self {
      inputs: event.inputs.clone(),
      process_data: event.process_data.clone(),
      outputs: event.outputs.clone(),
      execution_metadata: event.execution_metadata.clone(),
      error: event.error.clone(),
    }
  }
}

/// Writes run and node execution records for one pipeline invocation.
pub struct WorkflowRecorder {
  store: Arc<dyn Store>,
  workflow: Arc<Workflow>,
  app_id: String,
  user_id: String,
}

impl WorkflowRecorder {
  pub fn new(store: Arc<dyn Store>, workflow: Arc<Workflow>, app_id: String, user_id: String) -> Self {
    Self {
      store,
      workflow,
      app_id,
      user_id,
    }
  }

  /// Create the run record with the next sequence number for the app.
  ///
  /// The sequence number is read then written without a lock, so two runs of
  /// the same app created concurrently can end up with the same number.
  #[instrument(skip_all, fields(app_id = %self.app_id))]
  pub async fn start_run(&self, state: &mut TaskState, inputs: Value) -> Result<WorkflowRun, PipelineError> {
    let sequence_number = self.store.max_sequence_number(&self.app_id).await?.unwrap_or(0) + 1;

    let run = WorkflowRun {
      id: uuid::Uuid::new_v4().to_string(),
      app_id: self.app_id.clone(),
      workflow_id: self.workflow.workflow_id().to_string(),
      sequence_number,
      status: RunStatus::Running,
      graph: Json(serde_json::to_value(self.workflow.to_def())?),
      inputs: Json(inputs),
      outputs: None,
      error: None,
      elapsed_time: 0.0,
      total_tokens: 0,
      total_steps: 0,
      created_by: self.user_id.clone(),
      created_at: Utc::now(),
      finished_at: None,
    };

    self.store.create_run(&run).await?;
    let run = self.store.get_run(&run.id).await?;
    state.workflow_run_id = Some(run.id.clone());

    info!(workflow_run_id = %run.id, sequence_number, "workflow_run_started");
    Ok(run)
  }

  #[instrument(skip_all, fields(workflow_run_id = ?state.workflow_run_id))]
  pub async fn finish_run(&self, state: &TaskState, outcome: RunOutcome) -> Result<WorkflowRun, PipelineError> {
    let run_id = state
      .workflow_run_id
      .as_deref()
      .ok_or(PipelineError::RunNotStarted)?;
    let mut run = self.store.get_run(run_id).await?;

    match outcome {
      RunOutcome::Succeeded { outputs } => {
        run.status = RunStatus::Succeeded;
        run.outputs = outputs.map(Json);
      }
      RunOutcome::Failed { error } => {
        run.status = RunStatus::Failed;
        run.error = Some(error);
      }
      RunOutcome::Stopped { reason } => {
        run.status = RunStatus::Stopped;
        run.error = Some(reason);
      }
    }
    run.elapsed_time = state.start_at.elapsed().as_secs_f64();
    run.total_tokens = state.total_tokens;
    run.total_steps = state.total_steps;
    run.finished_at = Some(Utc::now());

    self.store.update_run(&run).await?;
    let run = self.store.get_run(run_id).await?;

    info!(
      status = ?run.status,
      total_steps = run.total_steps,
      total_tokens = run.total_tokens,
      "workflow_run_finished"
    );
    Ok(run)
  }

  /// Record a node start. The execution index is the run's step counter.
  #[instrument(skip_all, fields(node_id = %event.node_id))]
  pub async fn start_node(
    &self,
    state: &mut TaskState,
    event: &NodeStartedEvent,
    iteration: Option<&IterationScope>,
  ) -> Result<WorkflowNodeExecution, PipelineError> {
    let run_id = state
      .workflow_run_id
      .clone()
      .ok_or(PipelineError::RunNotStarted)?;

    let title = match event.title.is_empty() {
      false => event.title.clone(),
      true => self
        .workflow
        .get_node(&event.node_id)
        .map(|node| node.title.clone())
        .unwrap_or_default(),
    };
    let execution_metadata = iteration.map(|scope| {
      Json(json!({
        "iteration_id": scope.iteration_id,
        "iteration_index": scope.index,
      }))
    });

    state.total_steps += 1;
    let execution = WorkflowNodeExecution {
      id: uuid::Uuid::new_v4().to_string(),
      app_id: self.app_id.clone(),
      workflow_id: self.workflow.workflow_id().to_string(),
      workflow_run_id: run_id,
      index: state.total_steps,
      predecessor_node_id: event.predecessor_node_id.clone(),
      node_id: event.node_id.clone(),
      node_type: event.node_type.as_str().to_string(),
      title,
      inputs: event.inputs.clone().map(Json),
      process_data: None,
      outputs: None,
      status: NodeExecutionStatus::Running,
      error: None,
      elapsed_time: 0.0,
      execution_metadata,
      created_by: self.user_id.clone(),
      created_at: Utc::now(),
      finished_at: None,
    };

    self.store.create_node_execution(&execution).await?;
    let execution = self.store.get_node_execution(&execution.id).await?;

    let info = NodeExecutionInfo {
      workflow_node_execution_id: execution.id.clone(),
      node_type: event.node_type,
      start_at: Instant::now(),
      iteration_id: iteration.map(|scope| scope.iteration_id.clone()),
      finished: false,
    };
    state
      .ran_node_execution_infos
      .insert(event.node_id.clone(), info.clone());
    state.latest_node_execution_info = Some(info);

    info!(index = execution.index, "node_execution_started");
    Ok(execution)
  }

  /// Record a node finish and account its token usage.
  #[instrument(skip_all, fields(node_id = %event.node_id))]
  pub async fn finish_node(
    &self,
    state: &mut TaskState,
    iterations: &mut IterationTracker,
    event: &NodeFinishedEvent,
    status: NodeExecutionStatus,
  ) -> Result<WorkflowNodeExecution, PipelineError> {
    let execution = self
      .complete_execution(state, &event.node_id, NodeCompletion::from(event), status)
      .await?;

    let tokens = event.total_tokens();
    if tokens > 0 {
      state.total_tokens += tokens;
      let iteration_id = state
        .ran_node_execution_infos
        .get(&event.node_id)
        .and_then(|info| info.iteration_id.as_deref());
      if let Some(iteration_id) = iteration_id {
        iterations.add_tokens(iteration_id, tokens);
      }
    }

    Ok(execution)
  }

  /// Record the end of an iteration node. Its tokens were already counted
  /// when the nested nodes finished.
  #[instrument(skip_all, fields(node_id = %node_id))]
  pub async fn finish_iteration(
    &self,
    state: &mut TaskState,
    node_id: &str,
    completion: NodeCompletion,
  ) -> Result<WorkflowNodeExecution, PipelineError> {
    let status = match completion.error {
      Some(_) => NodeExecutionStatus::Failed,
      None => NodeExecutionStatus::Succeeded,
    };
    self.complete_execution(state, node_id, completion, status).await
  }

  async fn complete_execution(
    &self,
    state: &mut TaskState,
    node_id: &str,
    completion: NodeCompletion,
    status: NodeExecutionStatus,
  ) -> Result<WorkflowNodeExecution, PipelineError> {
    let info = state
      .ran_node_execution_infos
      .get_mut(node_id)
      .ok_or_else(|| PipelineError::NodeNotStarted(node_id.to_string()))?;
    let mut execution = self
      .store
      .get_node_execution(&info.workflow_node_execution_id)
      .await?;

    // Partial data is kept on failure too.
    if let Some(inputs) = completion.inputs {
      execution.inputs = Some(Json(inputs));
    }
    execution.process_data = completion.process_data.map(Json);
    execution.outputs = completion.outputs.map(Json);
    execution.status = status;
    execution.error = completion.error;
    execution.elapsed_time = info.start_at.elapsed().as_secs_f64();
    execution.execution_metadata = merge_metadata(
      execution.execution_metadata.take().map(|metadata| metadata.0),
      completion.execution_metadata,
    )
    .map(Json);
    execution.finished_at = Some(Utc::now());

    self.store.update_node_execution(&execution).await?;
    info.finished = true;
    let execution = self.store.get_node_execution(&execution.id).await?;

    info!(status = ?execution.status, elapsed_time = execution.elapsed_time, "node_execution_finished");
    Ok(execution)
  }
}

fn merge_metadata(existing: Option<Value>, update: Option<Value>) -> Option<Value> {
  match (existing, update) {
    (Some(Value::Object(mut existing)), Some(Value::Object(update))) => {
      existing.extend(update);
      Some(Value::Object(existing))
    }
    (existing, None) => existing,
    (None, update) => update,
    (Some(existing), Some(update)) => {
      let mut merged = Map::new();
      merged.insert("previous".to_string(), existing);
      merged.insert("current".to_string(), update);
      Some(Value::Object(merged))
    }
  }
}
