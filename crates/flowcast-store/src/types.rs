use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Running,
  Succeeded,
  Failed,
  Stopped,
}

/// Status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
  Running,
  Succeeded,
  Failed,
}

/// Status of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageStatus {
  Normal,
  Error,
}

/// A workflow run as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowRun {
  pub id: String,
  pub app_id: String,
  pub workflow_id: String,
  /// Monotonic per app, assigned as `max + 1` at creation.
  pub sequence_number: i64,
  pub status: RunStatus,
  /// Snapshot of the graph definition the run executed.
  pub graph: Json<serde_json::Value>,
  pub inputs: Json<serde_json::Value>,
  pub outputs: Option<Json<serde_json::Value>>,
  pub error: Option<String>,
  /// Seconds between run start and finish.
  pub elapsed_time: f64,
  pub total_tokens: i64,
  pub total_steps: i64,
  pub created_by: String,
  pub created_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
}

/// A node execution as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowNodeExecution {
  pub id: String,
  pub app_id: String,
  pub workflow_id: String,
  pub workflow_run_id: String,
  /// 1-based position of this execution within its run.
  #[sqlx(rename = "execution_index")]
  pub index: i64,
  pub predecessor_node_id: Option<String>,
  pub node_id: String,
  pub node_type: String,
  pub title: String,
  pub inputs: Option<Json<serde_json::Value>>,
  pub process_data: Option<Json<serde_json::Value>>,
  pub outputs: Option<Json<serde_json::Value>>,
  pub status: NodeExecutionStatus,
  pub error: Option<String>,
  pub elapsed_time: f64,
  pub execution_metadata: Option<Json<serde_json::Value>>,
  pub created_by: String,
  pub created_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
}

/// A chat message produced by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
  pub id: String,
  pub conversation_id: String,
  pub app_id: String,
  pub query: String,
  pub answer: String,
  pub status: MessageStatus,
  pub error: Option<String>,
  pub metadata: Json<serde_json::Value>,
  pub workflow_run_id: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// A conversation that groups messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Conversation {
  pub id: String,
  pub app_id: String,
  pub name: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}
