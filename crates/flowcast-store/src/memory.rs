use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{Conversation, Error, Message, Store, WorkflowNodeExecution, WorkflowRun};

#[derive(Default)]
struct Tables {
  runs: HashMap<String, WorkflowRun>,
  node_executions: HashMap<String, WorkflowNodeExecution>,
  messages: HashMap<String, Message>,
  conversations: HashMap<String, Conversation>,
}

/// In-process store. Useful for tests and dry-run replays.
#[derive(Default)]
pub struct MemoryStore {
  tables: Mutex<Tables>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn tables(&self) -> MutexGuard<'_, Tables> {
    self.tables.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn max_sequence_number(&self, app_id: &str) -> Result<Option<i64>, Error> {
    Ok(
      self
        .tables()
        .runs
        .values()
        .filter(|run| run.app_id == app_id)
        .map(|run| run.sequence_number)
        .max(),
    )
  }

  async fn create_run(&self, run: &WorkflowRun) -> Result<(), Error> {
    self.tables().runs.insert(run.id.clone(), run.clone());
    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, Error> {
    self
      .tables()
      .runs
      .get(run_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("workflow run {run_id}")))
  }

  async fn update_run(&self, run: &WorkflowRun) -> Result<(), Error> {
    let mut tables = self.tables();
    let stored = tables
      .runs
      .get_mut(&run.id)
      .ok_or_else(|| Error::NotFound(format!("workflow run {}", run.id)))?;
    *stored = run.clone();
    Ok(())
  }

  async fn list_runs(&self, app_id: &str) -> Result<Vec<WorkflowRun>, Error> {
    let mut runs: Vec<_> = self
      .tables()
      .runs
      .values()
      .filter(|run| run.app_id == app_id)
      .cloned()
      .collect();
    runs.sort_by(|a, b| b.sequence_number.cmp(&a.sequence_number));
    Ok(runs)
  }

  async fn create_node_execution(&self, execution: &WorkflowNodeExecution) -> Result<(), Error> {
    self
      .tables()
      .node_executions
      .insert(execution.id.clone(), execution.clone());
    Ok(())
  }

  async fn get_node_execution(&self, execution_id: &str) -> Result<WorkflowNodeExecution, Error> {
    self
      .tables()
      .node_executions
      .get(execution_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("node execution {execution_id}")))
  }

  async fn update_node_execution(&self, execution: &WorkflowNodeExecution) -> Result<(), Error> {
    let mut tables = self.tables();
    let stored = tables
      .node_executions
      .get_mut(&execution.id)
      .ok_or_else(|| Error::NotFound(format!("node execution {}", execution.id)))?;
    *stored = execution.clone();
    Ok(())
  }

  async fn list_node_executions(&self, run_id: &str) -> Result<Vec<WorkflowNodeExecution>, Error> {
    let mut executions: Vec<_> = self
      .tables()
      .node_executions
      .values()
      .filter(|execution| execution.workflow_run_id == run_id)
      .cloned()
      .collect();
    executions.sort_by_key(|execution| execution.index);
    Ok(executions)
  }

  async fn save_message(&self, message: &Message) -> Result<(), Error> {
    let mut tables = self.tables();
    match tables.messages.get_mut(&message.id) {
      Some(stored) => {
        let created_at = stored.created_at;
        *stored = message.clone();
        stored.created_at = created_at;
      }
      None => {
        tables.messages.insert(message.id.clone(), message.clone());
      }
    }
    Ok(())
  }

  async fn get_message(&self, message_id: &str) -> Result<Message, Error> {
    self
      .tables()
      .messages
      .get(message_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("message {message_id}")))
  }

  async fn create_conversation(&self, conversation: &Conversation) -> Result<(), Error> {
    self
      .tables()
      .conversations
      .insert(conversation.id.clone(), conversation.clone());
    Ok(())
  }

  async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, Error> {
    self
      .tables()
      .conversations
      .get(conversation_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))
  }

  async fn rename_conversation(&self, conversation_id: &str, name: &str) -> Result<(), Error> {
    let mut tables = self.tables();
    let conversation = tables
      .conversations
      .get_mut(conversation_id)
      .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;
    conversation.name = name.to_string();
    conversation.updated_at = chrono::Utc::now();
    Ok(())
  }
}
