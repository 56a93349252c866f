//! Inbound lifecycle events and the per-task queue that carries them.
//!
//! The execution engine publishes [`QueueEvent`]s through a [`QueuePublisher`];
//! the pipeline consumes them, in order and exactly once, from the matching
//! [`QueueListener`]. The pipeline can also publish into its own listener,
//! and those events are delivered before anything still queued by the engine.

use std::collections::VecDeque;

use flowcast_config::NodeKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// Lifecycle events produced by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
  WorkflowStarted,
  NodeStarted(NodeStartedEvent),
  NodeSucceeded(NodeFinishedEvent),
  NodeFailed(NodeFinishedEvent),
  IterationStarted(IterationStartedEvent),
  IterationNext(IterationNextEvent),
  IterationCompleted(IterationCompletedEvent),
  TextChunk {
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<ChunkMetadata>,
  },
  MessageReplace {
    text: String,
  },
  RetrieverResources {
    retriever_resources: Vec<Value>,
  },
  AnnotationReply {
    message_annotation_id: String,
    #[serde(default)]
    account_id: String,
    #[serde(default)]
    account_name: String,
  },
  Ping,
  Stop {
    stopped_by: StopBy,
  },
  WorkflowSucceeded {
    #[serde(default)]
    outputs: Option<Value>,
  },
  WorkflowFailed {
    error: String,
  },
  AdvancedMessageEnd,
  Error {
    message: String,
  },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStartedEvent {
  pub node_id: String,
  pub node_type: NodeKind,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub predecessor_node_id: Option<String>,
  /// Run index assigned by the engine. Informational only.
  #[serde(default)]
  pub node_run_index: u32,
  #[serde(default)]
  pub inputs: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFinishedEvent {
  pub node_id: String,
  pub node_type: NodeKind,
  #[serde(default)]
  pub inputs: Option<Value>,
  #[serde(default)]
  pub process_data: Option<Value>,
  #[serde(default)]
  pub outputs: Option<Value>,
  #[serde(default)]
  pub execution_metadata: Option<Value>,
  #[serde(default)]
  pub error: Option<String>,
}

impl NodeFinishedEvent {
  /// Token usage reported in the execution metadata, or zero.
  pub fn total_tokens(&self) -> i64 {
    self
      .execution_metadata
      .as_ref()
      .and_then(|metadata| metadata.get("total_tokens"))
      .and_then(Value::as_i64)
      .unwrap_or(0)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationStartedEvent {
  pub node_id: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub predecessor_node_id: Option<String>,
  /// Resolved inputs. `iterator_selector` holds the list being iterated.
  #[serde(default)]
  pub inputs: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationNextEvent {
  pub node_id: String,
  pub index: u32,
  /// Output of the round that just finished.
  #[serde(default)]
  pub pre_iteration_output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationCompletedEvent {
  pub node_id: String,
  #[serde(default)]
  pub outputs: Option<Value>,
  #[serde(default)]
  pub steps: u32,
  #[serde(default)]
  pub error: Option<String>,
}

/// Origin of a streamed text chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
  pub node_id: String,
  pub node_type: NodeKind,
  #[serde(default)]
  pub value_selector: Vec<String>,
}

/// Why a run was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBy {
  UserManual,
  AnnotationReply,
  OutputModeration,
  InputModeration,
}

impl StopBy {
  /// Human readable reason, stored as the run's error text.
  pub fn reason(&self) -> &'static str {
    match self {
      StopBy::UserManual => "Stopped by user.",
      StopBy::AnnotationReply => "Stopped by annotation reply.",
      StopBy::OutputModeration => "Stopped by output moderation.",
      StopBy::InputModeration => "Stopped by input moderation.",
    }
  }
}

/// An event stamped with the task it belongs to.
#[derive(Debug, Clone)]
struct QueueMessage {
  task_id: String,
  event: QueueEvent,
}

/// Create the queue for one task.
pub fn channel(task_id: impl Into<String>) -> (QueuePublisher, QueueListener) {
  let task_id = task_id.into();
  let (sender, receiver) = mpsc::unbounded_channel();

  (
    QueuePublisher {
      task_id: task_id.clone(),
      sender,
    },
    QueueListener {
      task_id,
      receiver,
      local: VecDeque::new(),
    },
  )
}

/// Engine-side handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueuePublisher {
  task_id: String,
  // Unbounded so the engine never waits on a slow client.
  sender: mpsc::UnboundedSender<QueueMessage>,
}

impl QueuePublisher {
  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  /// Publish an event for this task.
  pub fn publish(&self, event: QueueEvent) {
    // Ignore send errors - the pipeline may already have terminated
    let _ = self.sender.send(QueueMessage {
      task_id: self.task_id.clone(),
      event,
    });
  }
}

/// Pipeline-side handle.
#[derive(Debug)]
pub struct QueueListener {
  task_id: String,
  receiver: mpsc::UnboundedReceiver<QueueMessage>,
  local: VecDeque<QueueEvent>,
}

impl QueueListener {
  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  /// Publish from the pipeline itself. Delivered before queued engine events.
  pub(crate) fn publish_local(&mut self, event: QueueEvent) {
    self.local.push_back(event);
  }

  /// Receive the next event, or `None` once every publisher is gone.
  pub async fn recv(&mut self) -> Option<QueueEvent> {
    if let Some(event) = self.local.pop_front() {
      return Some(event);
    }

    loop {
      let message = self.receiver.recv().await?;
      if message.task_id == self.task_id {
        return Some(message.event);
      }
      warn!(
        task_id = %self.task_id,
        foreign_task_id = %message.task_id,
        "queue_event_for_foreign_task_ignored"
      );
    }
  }
}
