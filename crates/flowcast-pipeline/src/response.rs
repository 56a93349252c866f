//! Client-facing stream responses.
//!
//! Every response serializes as `{"task_id": ..., "type": ..., "data": {...}}`.

use flowcast_store::{NodeExecutionStatus, RunStatus, WorkflowNodeExecution, WorkflowRun};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::variable::collect_files;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamResponse {
  pub task_id: String,
  #[serde(flatten)]
  pub event: StreamEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
  WorkflowStarted(WorkflowStartedData),
  WorkflowFinished(WorkflowFinishedData),
  NodeStarted(NodeStartedData),
  NodeFinished(NodeFinishedData),
  IterationStarted(IterationStartedData),
  IterationNext(IterationNextData),
  IterationCompleted(IterationCompletedData),
  /// A node inside an active iteration failed.
  IterationException(IterationExceptionData),
  #[serde(rename = "message")]
  TextDelta {
    id: String,
    answer: String,
  },
  MessageReplace {
    answer: String,
  },
  MessageEnd(MessageEndData),
  #[serde(rename = "tts_message")]
  AudioChunk {
    audio: String,
  },
  #[serde(rename = "tts_message_end")]
  AudioEnd {
    audio: String,
  },
  Ping,
  Error(ErrorData),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStartedData {
  pub id: String,
  pub workflow_id: String,
  pub sequence_number: i64,
  pub inputs: Value,
  pub created_at: i64,
}

impl From<&WorkflowRun> for WorkflowStartedData {
  fn from(run: &WorkflowRun) -> Self {
    Self {
      id: run.id.clone(),
      workflow_id: run.workflow_id.clone(),
      sequence_number: run.sequence_number,
      inputs: run.inputs.0.clone(),
      created_at: run.created_at.timestamp(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowFinishedData {
  pub id: String,
  pub workflow_id: String,
  pub sequence_number: i64,
  pub status: RunStatus,
  pub outputs: Option<Value>,
  pub error: Option<String>,
  pub elapsed_time: f64,
  pub total_tokens: i64,
  pub total_steps: i64,
  pub created_by: String,
  pub created_at: i64,
  pub finished_at: Option<i64>,
  pub files: Vec<Value>,
}

impl From<&WorkflowRun> for WorkflowFinishedData {
  fn from(run: &WorkflowRun) -> Self {
    let outputs = run.outputs.as_ref().map(|outputs| outputs.0.clone());
    Self {
      id: run.id.clone(),
      workflow_id: run.workflow_id.clone(),
      sequence_number: run.sequence_number,
      status: run.status,
      files: outputs.as_ref().map(collect_files).unwrap_or_default(),
      outputs,
      error: run.error.clone(),
      elapsed_time: run.elapsed_time,
      total_tokens: run.total_tokens,
      total_steps: run.total_steps,
      created_by: run.created_by.clone(),
      created_at: run.created_at.timestamp(),
      finished_at: run.finished_at.map(|at| at.timestamp()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStartedData {
  pub id: String,
  pub node_id: String,
  pub node_type: String,
  pub title: String,
  pub index: i64,
  pub predecessor_node_id: Option<String>,
  pub inputs: Option<Value>,
  pub created_at: i64,
  pub iteration_id: Option<String>,
}

impl NodeStartedData {
  pub fn new(execution: &WorkflowNodeExecution, iteration_id: Option<String>) -> Self {
    Self {
      id: execution.id.clone(),
      node_id: execution.node_id.clone(),
      node_type: execution.node_type.clone(),
      title: execution.title.clone(),
      index: execution.index,
      predecessor_node_id: execution.predecessor_node_id.clone(),
      inputs: execution.inputs.as_ref().map(|inputs| inputs.0.clone()),
      created_at: execution.created_at.timestamp(),
      iteration_id,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeFinishedData {
  pub id: String,
  pub node_id: String,
  pub node_type: String,
  pub title: String,
  pub index: i64,
  pub predecessor_node_id: Option<String>,
  pub inputs: Option<Value>,
  pub process_data: Option<Value>,
  pub outputs: Option<Value>,
  pub status: NodeExecutionStatus,
  pub error: Option<String>,
  pub elapsed_time: f64,
  pub execution_metadata: Option<Value>,
  pub created_at: i64,
  pub finished_at: Option<i64>,
  pub files: Vec<Value>,
}

impl From<&WorkflowNodeExecution> for NodeFinishedData {
  fn from(execution: &WorkflowNodeExecution) -> Self {
    let outputs = execution.outputs.as_ref().map(|outputs| outputs.0.clone());
    Self {
      id: execution.id.clone(),
      node_id: execution.node_id.clone(),
      node_type: execution.node_type.clone(),
      title: execution.title.clone(),
      index: execution.index,
      predecessor_node_id: execution.predecessor_node_id.clone(),
      inputs: execution.inputs.as_ref().map(|inputs| inputs.0.clone()),
      process_data: execution.process_data.as_ref().map(|data| data.0.clone()),
      files: outputs.as_ref().map(collect_files).unwrap_or_default(),
      outputs,
      status: execution.status,
      error: execution.error.clone(),
      elapsed_time: execution.elapsed_time,
      execution_metadata: execution
        .execution_metadata
        .as_ref()
        .map(|metadata| metadata.0.clone()),
      created_at: execution.created_at.timestamp(),
      finished_at: execution.finished_at.map(|at| at.timestamp()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationStartedData {
  pub id: String,
  pub node_id: String,
  pub title: String,
  pub index: i64,
  pub inputs: Option<Value>,
  pub created_at: i64,
}

impl From<&WorkflowNodeExecution> for IterationStartedData {
  fn from(execution: &WorkflowNodeExecution) -> Self {
    Self {
      id: execution.id.clone(),
      node_id: execution.node_id.clone(),
      title: execution.title.clone(),
      index: execution.index,
      inputs: execution.inputs.as_ref().map(|inputs| inputs.0.clone()),
      created_at: execution.created_at.timestamp(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationNextData {
  pub id: String,
  pub node_id: String,
  pub index: u32,
  pub pre_iteration_output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationCompletedData {
  pub id: String,
  pub node_id: String,
  pub title: String,
  pub outputs: Option<Value>,
  pub status: NodeExecutionStatus,
  pub error: Option<String>,
  pub elapsed_time: f64,
  pub total_tokens: i64,
  pub steps: u32,
  pub created_at: i64,
  pub finished_at: Option<i64>,
}

impl IterationCompletedData {
  pub fn new(execution: &WorkflowNodeExecution, total_tokens: i64, steps: u32) -> Self {
    Self {
      id: execution.id.clone(),
      node_id: execution.node_id.clone(),
      title: execution.title.clone(),
      outputs: execution.outputs.as_ref().map(|outputs| outputs.0.clone()),
      status: execution.status,
      error: execution.error.clone(),
      elapsed_time: execution.elapsed_time,
      total_tokens,
      steps,
      created_at: execution.created_at.timestamp(),
      finished_at: execution.finished_at.map(|at| at.timestamp()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationExceptionData {
  /// Node execution id of the iteration node.
  pub id: String,
  pub node_id: String,
  pub iteration_index: u32,
  pub failed_node_id: String,
  pub error: String,
  /// Whether the iteration was aborted rather than left running.
  pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageEndData {
  pub id: String,
  pub conversation_id: String,
  #[serde(skip_serializing_if = "Map::is_empty")]
  pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
  pub code: String,
  pub status: u16,
  pub message: String,
}
