//! Best-effort conversation naming.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowcast_store::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CollaboratorError;

const MAX_NAME_CHARS: usize = 75;

/// Generates a display name for a conversation from its first query.
#[async_trait]
pub trait ConversationNamer: Send + Sync {
  async fn generate_name(&self, query: &str) -> Result<String, CollaboratorError>;
}

/// Handle to a spawned naming task.
pub struct NamingTask {
  conversation_id: String,
  cancel: CancellationToken,
  handle: JoinHandle<Result<(), CollaboratorError>>,
}

impl NamingTask {
  /// Spawn the task. It only receives owned ids and text plus its own store
  /// handle.
  pub fn spawn(
    namer: Arc<dyn ConversationNamer>,
    store: Arc<dyn Store>,
    conversation_id: String,
    query: String,
  ) -> Self {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task_conversation_id = conversation_id.clone();

    let handle = tokio::spawn(async move {
      tokio::select! {
        _ = task_cancel.cancelled() => Ok(()),
        result = generate_and_rename(namer.as_ref(), store.as_ref(), &task_conversation_id, &query) => result,
      }
    });

    Self {
      conversation_id,
      cancel,
      handle,
    }
  }

  /// Wait for the task up to `timeout`. Failures are logged and ignored.
  pub async fn join(mut self, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut self.handle).await {
      Ok(Ok(Ok(()))) => {}
      Ok(Ok(Err(e))) => {
        warn!(
          conversation_id = %self.conversation_id,
          error = %e,
          "conversation_naming_failed, ignored"
        );
      }
      Ok(Err(e)) => {
        warn!(
          conversation_id = %self.conversation_id,
          error = %e,
          "conversation_naming_panicked, ignored"
        );
      }
      Err(_) => {
        self.cancel.cancel();
        self.handle.abort();
        warn!(
          conversation_id = %self.conversation_id,
          timeout_ms = timeout.as_millis() as u64,
          "conversation_naming_timed_out, ignored"
        );
      }
    }
  }
}

async fn generate_and_rename(
  namer: &dyn ConversationNamer,
  store: &dyn Store,
  conversation_id: &str,
  query: &str,
) -> Result<(), CollaboratorError> {
  let name = truncate_name(namer.generate_name(query).await?.trim());
  store
    .rename_conversation(conversation_id, &name)
    .await
    .map_err(|e| CollaboratorError::Failed(e.to_string()))?;

  info!(conversation_id = %conversation_id, name = %name, "conversation_named");
  Ok(())
}

/// Cap a name at 75 characters, marking the cut with `...`.
pub fn truncate_name(name: &str) -> String {
  match name.char_indices().nth(MAX_NAME_CHARS) {
    Some((cut, _)) => format!("{}...", &name[..cut]),
    None => name.to_string(),
  }
}
