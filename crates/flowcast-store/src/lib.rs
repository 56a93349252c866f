//! Flowcast Store
//!
//! This crate provides the storage trait and implementations for the records
//! the streaming pipeline writes: workflow runs, node executions, messages
//! and conversations.
//!
//! The [`Store`] trait defines operations for:
//! - Creating, updating and listing workflow runs
//! - Creating, updating and listing node executions of a run
//! - Upserting finalized messages
//! - Creating and renaming conversations
//!
//! [`SqliteStore`] persists to SQLite through a connection pool, so every
//! clone hands out independent connections. [`MemoryStore`] keeps everything
//! in process and is meant for tests and dry runs.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use sqlx::types::Json;
pub use types::{
  Conversation, Message, MessageStatus, NodeExecutionStatus, RunStatus, WorkflowNodeExecution,
  WorkflowRun,
};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Storage trait for runs, node executions, messages and conversations.
#[async_trait]
pub trait Store: Send + Sync {
  /// Highest sequence number assigned to a run of this app, if any.
  async fn max_sequence_number(&self, app_id: &str) -> Result<Option<i64>, Error>;

  /// Create a new workflow run.
  async fn create_run(&self, run: &WorkflowRun) -> Result<(), Error>;

  /// Get a workflow run by ID.
  async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, Error>;

  /// Update the mutable fields of a workflow run.
  async fn update_run(&self, run: &WorkflowRun) -> Result<(), Error>;

  /// List runs for an app, newest sequence first.
  async fn list_runs(&self, app_id: &str) -> Result<Vec<WorkflowRun>, Error>;

  /// Create a new node execution.
  async fn create_node_execution(&self, execution: &WorkflowNodeExecution) -> Result<(), Error>;

  /// Get a node execution by ID.
  async fn get_node_execution(&self, execution_id: &str) -> Result<WorkflowNodeExecution, Error>;

  /// Update the mutable fields of a node execution.
  async fn update_node_execution(&self, execution: &WorkflowNodeExecution) -> Result<(), Error>;

  /// List node executions for a run, ordered by index.
  async fn list_node_executions(&self, run_id: &str) -> Result<Vec<WorkflowNodeExecution>, Error>;

  /// Insert a message, or replace the stored one with the same ID.
  async fn save_message(&self, message: &Message) -> Result<(), Error>;

  /// Get a message by ID.
  async fn get_message(&self, message_id: &str) -> Result<Message, Error>;

  /// Create a new conversation.
  async fn create_conversation(&self, conversation: &Conversation) -> Result<(), Error>;

  /// Get a conversation by ID.
  async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, Error>;

  /// Rename a conversation.
  async fn rename_conversation(&self, conversation_id: &str, name: &str) -> Result<(), Error>;
}
