use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::{Conversation, Error, Message, Store, WorkflowNodeExecution, WorkflowRun};

const RUN_COLUMNS: &str = "id, app_id, workflow_id, sequence_number, status, graph, inputs, \
  outputs, error, elapsed_time, total_tokens, total_steps, created_by, created_at, finished_at";

const NODE_EXECUTION_COLUMNS: &str = "id, app_id, workflow_id, workflow_run_id, \
  execution_index, predecessor_node_id, node_id, node_type, title, inputs, process_data, \
  outputs, status, error, elapsed_time, execution_metadata, created_by, created_at, finished_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, app_id, query, answer, status, error, \
  metadata, workflow_run_id, created_at, updated_at";

/// SQLite-based store implementation.
#[derive(Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }
}

fn not_found(kind: &str, id: &str) -> Error {
  Error::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl Store for SqliteStore {
  async fn max_sequence_number(&self, app_id: &str) -> Result<Option<i64>, Error> {
    let max: Option<i64> =
      sqlx::query_scalar("SELECT MAX(sequence_number) FROM workflow_runs WHERE app_id = ?")
        .bind(app_id)
        .fetch_one(&self.pool)
        .await?;

    Ok(max)
  }

  async fn create_run(&self, run: &WorkflowRun) -> Result<(), Error> {
    sqlx::query(&format!(
      "INSERT INTO workflow_runs ({RUN_COLUMNS}) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&run.id)
    .bind(&run.app_id)
    .bind(&run.workflow_id)
    .bind(run.sequence_number)
    .bind(run.status)
    .bind(&run.graph)
    .bind(&run.inputs)
    .bind(&run.outputs)
    .bind(&run.error)
    .bind(run.elapsed_time)
    .bind(run.total_tokens)
    .bind(run.total_steps)
    .bind(&run.created_by)
    .bind(run.created_at)
    .bind(run.finished_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, Error> {
    sqlx::query_as(&format!(
      "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?"
    ))
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| not_found("workflow run", run_id))
  }

  async fn update_run(&self, run: &WorkflowRun) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
            UPDATE workflow_runs
            SET status = ?, outputs = ?, error = ?, elapsed_time = ?, total_tokens = ?,
                total_steps = ?, finished_at = ?
            WHERE id = ?
            "#,
    )
    .bind(run.status)
    .bind(&run.outputs)
    .bind(&run.error)
    .bind(run.elapsed_time)
    .bind(run.total_tokens)
    .bind(run.total_steps)
    .bind(run.finished_at)
    .bind(&run.id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(not_found("workflow run", &run.id));
    }

    Ok(())
  }

  async fn list_runs(&self, app_id: &str) -> Result<Vec<WorkflowRun>, Error> {
    let runs = sqlx::query_as(&format!(
      "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE app_id = ? ORDER BY sequence_number DESC"
    ))
    .bind(app_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(runs)
  }

  async fn create_node_execution(&self, execution: &WorkflowNodeExecution) -> Result<(), Error> {
    sqlx::query(&format!(
      "INSERT INTO workflow_node_executions ({NODE_EXECUTION_COLUMNS}) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&execution.id)
    .bind(&execution.app_id)
    .bind(&execution.workflow_id)
    .bind(&execution.workflow_run_id)
    .bind(execution.index)
    .bind(&execution.predecessor_node_id)
    .bind(&execution.node_id)
    .bind(&execution.node_type)
    .bind(&execution.title)
    .bind(&execution.inputs)
    .bind(&execution.process_data)
    .bind(&execution.outputs)
    .bind(execution.status)
    .bind(&execution.error)
    .bind(execution.elapsed_time)
    .bind(&execution.execution_metadata)
    .bind(&execution.created_by)
    .bind(execution.created_at)
    .bind(execution.finished_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_node_execution(&self, execution_id: &str) -> Result<WorkflowNodeExecution, Error> {
    sqlx::query_as(&format!(
      "SELECT {NODE_EXECUTION_COLUMNS} FROM workflow_node_executions WHERE id = ?"
    ))
    .bind(execution_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| not_found("node execution", execution_id))
  }

  async fn update_node_execution(&self, execution: &WorkflowNodeExecution) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
            UPDATE workflow_node_executions
            SET inputs = ?, process_data = ?, outputs = ?, status = ?, error = ?,
                elapsed_time = ?, execution_metadata = ?, finished_at = ?
            WHERE id = ?
            "#,
    )
    .bind(&execution.inputs)
    .bind(&execution.process_data)
    .bind(&execution.outputs)
    .bind(execution.status)
    .bind(&execution.error)
    .bind(execution.elapsed_time)
    .bind(&execution.execution_metadata)
    .bind(execution.finished_at)
    .bind(&execution.id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(not_found("node execution", &execution.id));
    }

    Ok(())
  }

  async fn list_node_executions(&self, run_id: &str) -> Result<Vec<WorkflowNodeExecution>, Error> {
    let executions = sqlx::query_as(&format!(
      "SELECT {NODE_EXECUTION_COLUMNS} FROM workflow_node_executions \
       WHERE workflow_run_id = ? ORDER BY execution_index ASC"
    ))
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(executions)
  }

  async fn save_message(&self, message: &Message) -> Result<(), Error> {
    sqlx::query(&format!(
      "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
       ON CONFLICT (id) DO UPDATE SET answer = excluded.answer, status = excluded.status, \
       error = excluded.error, metadata = excluded.metadata, \
       workflow_run_id = excluded.workflow_run_id, updated_at = excluded.updated_at"
    ))
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(&message.app_id)
    .bind(&message.query)
    .bind(&message.answer)
    .bind(message.status)
    .bind(&message.error)
    .bind(&message.metadata)
    .bind(&message.workflow_run_id)
    .bind(message.created_at)
    .bind(message.updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_message(&self, message_id: &str) -> Result<Message, Error> {
    sqlx::query_as(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
      .bind(message_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| not_found("message", message_id))
  }

  async fn create_conversation(&self, conversation: &Conversation) -> Result<(), Error> {
    sqlx::query(
      r#"
            INSERT INTO conversations (id, app_id, name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
    )
    .bind(&conversation.id)
    .bind(&conversation.app_id)
    .bind(&conversation.name)
    .bind(conversation.created_at)
    .bind(conversation.updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, Error> {
    sqlx::query_as(
      r#"
            SELECT id, app_id, name, created_at, updated_at
            FROM conversations
            WHERE id = ?
            "#,
    )
    .bind(conversation_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| not_found("conversation", conversation_id))
  }

  async fn rename_conversation(&self, conversation_id: &str, name: &str) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
            UPDATE conversations
            SET name = ?, updated_at = ?
            WHERE id = ?
            "#,
    )
    .bind(name)
    .bind(chrono::Utc::now())
    .bind(conversation_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(not_found("conversation", conversation_id));
    }

    Ok(())
  }
}
