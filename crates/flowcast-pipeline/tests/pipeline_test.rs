//! End-to-end tests of the consumption loop against the in-memory store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flowcast_config::{
  GraphDef, IterationErrorPolicy, ModerationConfig, NodeKind, PipelineConfig, TtsConfig,
};
use flowcast_pipeline::{
  ApplicationContext, ChunkMetadata, CollaboratorError, ConversationNamer, IterationCompletedEvent,
  IterationNextEvent, IterationStartedEvent, NodeFinishedEvent, NodeStartedEvent, PipelineError,
  QueueEvent, QueuePublisher, SpeechSynthesizer, StreamEvent, StreamResponse,
  WorkflowStreamPipeline, channel, into_stream, to_blocking_response,
};
use flowcast_store::{MemoryStore, MessageStatus, NodeExecutionStatus, RunStatus, Store};
use flowcast_workflow::Workflow;
use futures::StreamExt;
use serde_json::{Value, json};

struct Harness {
  context: ApplicationContext,
  publisher: QueuePublisher,
  store: Arc<MemoryStore>,
  pipeline: WorkflowStreamPipeline,
}

fn harness(graph: Value, config: PipelineConfig) -> Harness {
  let def: GraphDef = serde_json::from_value(graph).unwrap();
  let workflow = Arc::new(Workflow::from_def(def).unwrap());
  let context = ApplicationContext::new("app", "user", "hello");
  let (publisher, listener) = channel(context.task_id.clone());
  let store = Arc::new(MemoryStore::new());
  let pipeline = WorkflowStreamPipeline::new(context.clone(), workflow, store.clone(), listener, config);

  Harness {
    context,
    publisher,
    store,
    pipeline,
  }
}

fn publish_all(publisher: &QueuePublisher, events: Vec<QueueEvent>) {
  for event in events {
    publisher.publish(event);
  }
}

async fn collect(pipeline: &mut WorkflowStreamPipeline) -> Vec<StreamResponse> {
  let mut responses = Vec::new();
  while let Some(response) = pipeline.next().await {
    responses.push(response);
  }
  responses
}

fn label(event: &StreamEvent) -> String {
  match event {
    StreamEvent::WorkflowStarted(_) => "workflow_started".to_string(),
    StreamEvent::WorkflowFinished(data) => format!("workflow_finished:{:?}", data.status),
    StreamEvent::NodeStarted(data) => format!("node_started:{}", data.node_id),
    StreamEvent::NodeFinished(data) => format!("node_finished:{}", data.node_id),
    StreamEvent::IterationStarted(data) => format!("iteration_started:{}", data.node_id),
    StreamEvent::IterationNext(data) => format!("iteration_next:{}", data.index),
    StreamEvent::IterationCompleted(data) => format!("iteration_completed:{}", data.node_id),
    StreamEvent::IterationException(data) => format!("iteration_exception:{}", data.failed_node_id),
    StreamEvent::TextDelta { answer, .. } => format!("message:{answer}"),
    StreamEvent::MessageReplace { answer } => format!("message_replace:{answer}"),
    StreamEvent::MessageEnd(_) => "message_end".to_string(),
    StreamEvent::AudioChunk { .. } => "tts_message".to_string(),
    StreamEvent::AudioEnd { .. } => "tts_message_end".to_string(),
    StreamEvent::Ping => "ping".to_string(),
    StreamEvent::Error(data) => format!("error:{}", data.code),
  }
}

fn labels(responses: &[StreamResponse]) -> Vec<String> {
  responses.iter().map(|response| label(&response.event)).collect()
}

fn deltas(responses: &[StreamResponse]) -> Vec<String> {
  responses
    .iter()
    .filter_map(|response| match &response.event {
      StreamEvent::TextDelta { answer, .. } => Some(answer.clone()),
      _ => None,
    })
    .collect()
}

fn node_started(node_id: &str, node_type: NodeKind) -> QueueEvent {
  QueueEvent::NodeStarted(NodeStartedEvent {
    node_id: node_id.to_string(),
    node_type,
    title: String::new(),
    predecessor_node_id: None,
    node_run_index: 0,
    inputs: None,
  })
}

fn finished(node_id: &str, node_type: NodeKind, outputs: Value) -> NodeFinishedEvent {
  NodeFinishedEvent {
    node_id: node_id.to_string(),
    node_type,
    inputs: None,
    process_data: None,
    outputs: Some(outputs),
    execution_metadata: None,
    error: None,
  }
}

fn node_succeeded(node_id: &str, node_type: NodeKind, outputs: Value) -> QueueEvent {
  QueueEvent::NodeSucceeded(finished(node_id, node_type, outputs))
}

fn node_failed(node_id: &str, node_type: NodeKind, error: &str) -> QueueEvent {
  let mut event = finished(node_id, node_type, json!({}));
  event.error = Some(error.to_string());
  QueueEvent::NodeFailed(event)
}

fn llm_chunk(text: &str, selector: &[&str]) -> QueueEvent {
  QueueEvent::TextChunk {
    text: text.to_string(),
    metadata: Some(ChunkMetadata {
      node_id: "llm".to_string(),
      node_type: NodeKind::Llm,
      value_selector: selector.iter().map(|s| s.to_string()).collect(),
    }),
  }
}

fn workflow_succeeded() -> QueueEvent {
  QueueEvent::WorkflowSucceeded {
    outputs: Some(json!({"answer": "hi"})),
  }
}

fn start_answer_graph(answer: &str) -> Value {
  json!({
    "workflow_id": "wf",
    "nodes": [
      {"node_id": "start", "type": "start", "title": "Start"},
      {"node_id": "answer", "type": "answer", "title": "Answer", "answer": answer}
    ],
    "edges": [{"from": "start", "to": "answer"}]
  })
}

fn start_answer_events() -> Vec<QueueEvent> {
  vec![
    QueueEvent::WorkflowStarted,
    node_started("start", NodeKind::Start),
    node_succeeded("start", NodeKind::Start, json!({"x": "hi"})),
    node_started("answer", NodeKind::Answer),
    node_succeeded("answer", NodeKind::Answer, json!({"answer": "hi"})),
    workflow_succeeded(),
    QueueEvent::AdvancedMessageEnd,
  ]
}

fn llm_graph() -> Value {
  json!({
    "workflow_id": "wf",
    "nodes": [
      {"node_id": "start", "type": "start"},
      {"node_id": "llm", "type": "llm"},
      {"node_id": "answer", "type": "answer", "answer": "{{#llm.text#}}"}
    ],
    "edges": [
      {"from": "start", "to": "llm"},
      {"from": "llm", "to": "answer"}
    ]
  })
}

fn iteration_graph() -> Value {
  json!({
    "workflow_id": "wf",
    "nodes": [
      {"node_id": "start", "type": "start"},
      {"node_id": "iter", "type": "iteration", "start_node_id": "inner", "iterator_selector": ["start", "items"]},
      {"node_id": "inner", "type": "code", "iteration_id": "iter"},
      {"node_id": "answer", "type": "answer", "answer": "done"}
    ],
    "edges": [
      {"from": "start", "to": "iter"},
      {"from": "iter", "to": "answer"}
    ]
  })
}

fn iteration_events() -> Vec<QueueEvent> {
  vec![
    QueueEvent::WorkflowStarted,
    node_started("start", NodeKind::Start),
    node_succeeded("start", NodeKind::Start, json!({"items": ["a", "b"]})),
    QueueEvent::IterationStarted(IterationStartedEvent {
      node_id: "iter".to_string(),
      title: "Loop".to_string(),
      predecessor_node_id: Some("start".to_string()),
      inputs: Some(json!({"iterator_selector": ["a", "b"]})),
    }),
    node_started("inner", NodeKind::Code),
    node_failed("inner", NodeKind::Code, "bad input"),
    QueueEvent::IterationNext(IterationNextEvent {
      node_id: "iter".to_string(),
      index: 1,
      pre_iteration_output: None,
    }),
    node_started("inner", NodeKind::Code),
    node_succeeded("inner", NodeKind::Code, json!({"result": "B"})),
    QueueEvent::IterationCompleted(IterationCompletedEvent {
      node_id: "iter".to_string(),
      outputs: Some(json!({"output": [null, "B"]})),
      steps: 2,
      error: None,
    }),
    node_started("answer", NodeKind::Answer),
    node_succeeded("answer", NodeKind::Answer, json!({"answer": "done"})),
    workflow_succeeded(),
    QueueEvent::AdvancedMessageEnd,
  ]
}

#[tokio::test]
async fn test_start_answer_scenario() {
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(&harness.publisher, start_answer_events());

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses),
    vec![
      "workflow_started",
      "node_started:start",
      "message:hi",
      "node_finished:start",
      "node_started:answer",
      "node_finished:answer",
      "workflow_finished:Succeeded",
      "message_end",
    ]
  );

  let runs = harness.store.list_runs("app").await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].status, RunStatus::Succeeded);
  assert_eq!(runs[0].sequence_number, 1);
  assert_eq!(runs[0].total_steps, 2);

  let message = harness.store.get_message(&harness.context.message_id).await.unwrap();
  assert_eq!(message.answer, "hi");
  assert_eq!(message.status, MessageStatus::Normal);
  assert_eq!(message.workflow_run_id.as_deref(), Some(runs[0].id.as_str()));
}

#[tokio::test]
async fn test_branch_answer_streams_between_its_start_and_finish() {
  let graph = json!({
    "workflow_id": "wf",
    "nodes": [
      {"node_id": "start", "type": "start"},
      {"node_id": "branch", "type": "if-else"},
      {"node_id": "answer", "type": "answer", "answer": "{{#start.x#}}"}
    ],
    "edges": [
      {"from": "start", "to": "branch"},
      {"from": "branch", "to": "answer", "source_handle": "true"}
    ]
  });
  let mut harness = harness(graph, PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      node_succeeded("start", NodeKind::Start, json!({"x": "hi"})),
      node_started("branch", NodeKind::IfElse),
      node_succeeded("branch", NodeKind::IfElse, json!({"result": true})),
      node_started("answer", NodeKind::Answer),
      node_succeeded("answer", NodeKind::Answer, json!({"answer": "hi"})),
      workflow_succeeded(),
      QueueEvent::AdvancedMessageEnd,
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses),
    vec![
      "workflow_started",
      "node_started:start",
      "node_finished:start",
      "node_started:branch",
      "node_finished:branch",
      "node_started:answer",
      "message:hi",
      "node_finished:answer",
      "workflow_finished:Succeeded",
      "message_end",
    ]
  );
}

#[tokio::test]
async fn test_blocking_response_aggregates_answer() {
  let harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(&harness.publisher, start_answer_events());

  let response = to_blocking_response(harness.pipeline).await.unwrap();
  assert_eq!(response.task_id, harness.context.task_id);
  assert_eq!(response.data.answer, "hi");
  assert_eq!(response.data.mode, "advanced-chat");
  assert_eq!(response.data.message_id, harness.context.message_id);
  assert_eq!(response.data.conversation_id, harness.context.conversation_id);
  let metadata = response.data.metadata.unwrap();
  assert_eq!(metadata["usage"], json!({"total_tokens": 0}));
}

#[tokio::test]
async fn test_task_id_is_constant() {
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(&harness.publisher, start_answer_events());

  let responses = collect(&mut harness.pipeline).await;
  assert!(!responses.is_empty());
  assert!(
    responses
      .iter()
      .all(|response| response.task_id == harness.context.task_id)
  );
}

#[tokio::test]
async fn test_engine_error_emits_single_error() {
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      QueueEvent::Error {
        message: "model quota exceeded".to_string(),
      },
      node_succeeded("start", NodeKind::Start, json!({"x": "hi"})),
      workflow_succeeded(),
      QueueEvent::AdvancedMessageEnd,
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses),
    vec![
      "workflow_started",
      "node_started:start",
      "error:completion_request_error",
    ]
  );
  let StreamEvent::Error(data) = &responses[2].event else {
    panic!("expected error response");
  };
  assert_eq!(data.status, 400);
  assert_eq!(data.message, "model quota exceeded");

  let runs = harness.store.list_runs("app").await.unwrap();
  assert_eq!(runs[0].status, RunStatus::Failed);
  assert_eq!(runs[0].error.as_deref(), Some("model quota exceeded"));
  let message = harness.store.get_message(&harness.context.message_id).await.unwrap();
  assert_eq!(message.status, MessageStatus::Error);
}

#[tokio::test]
async fn test_blocking_response_raises_error() {
  let harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      QueueEvent::Error {
        message: "boom".to_string(),
      },
    ],
  );

  let err = to_blocking_response(harness.pipeline).await.unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Reported { ref code, status: 400, ref message }
      if code == "completion_request_error" && message == "boom"
  ));
}

#[tokio::test]
async fn test_workflow_failed_finishes_then_errors() {
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      node_failed("start", NodeKind::Start, "invalid inputs"),
      QueueEvent::WorkflowFailed {
        error: "invalid inputs".to_string(),
      },
      QueueEvent::AdvancedMessageEnd,
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses),
    vec![
      "workflow_started",
      "node_started:start",
      "node_finished:start",
      "workflow_finished:Failed",
      "error:invalid_param",
    ]
  );
  let StreamEvent::Error(data) = &responses[4].event else {
    panic!("expected error response");
  };
  assert_eq!(data.message, "Run failed: invalid inputs");

  let message = harness.store.get_message(&harness.context.message_id).await.unwrap();
  assert_eq!(message.status, MessageStatus::Error);
}

#[tokio::test]
async fn test_text_only_route_streams_at_node_start() {
  let mut harness = harness(start_answer_graph("Hello world"), PipelineConfig::default());
  publish_all(&harness.publisher, start_answer_events());

  let responses = collect(&mut harness.pipeline).await;
  let labels = labels(&responses);
  let text = labels.iter().position(|l| l == "message:Hello world").unwrap();
  let first_finish = labels
    .iter()
    .position(|l| l.starts_with("node_finished"))
    .unwrap();
  assert!(text < first_finish);
  assert_eq!(labels[text + 1], "node_started:start");
  assert_eq!(deltas(&responses), vec!["Hello world"]);
}

#[tokio::test]
async fn test_scalar_and_file_values_render_as_text() {
  let graph = json!({
    "workflow_id": "wf",
    "nodes": [
      {"node_id": "start", "type": "start"},
      {"node_id": "code", "type": "code"},
      {"node_id": "answer", "type": "answer", "answer": "{{#code.n#}} {{#code.file#}}"}
    ],
    "edges": [
      {"from": "start", "to": "code"},
      {"from": "code", "to": "answer"}
    ]
  });
  let mut harness = harness(graph, PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      node_succeeded("start", NodeKind::Start, json!({})),
      node_started("code", NodeKind::Code),
      node_succeeded(
        "code",
        NodeKind::Code,
        json!({
          "n": 42,
          "file": {
            "model_identity": "__file__",
            "type": "image",
            "filename": "cat.png",
            "url": "https://files.example.com/cat.png"
          }
        }),
      ),
      workflow_succeeded(),
      QueueEvent::AdvancedMessageEnd,
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    deltas(&responses),
    vec!["42", " ", "![cat.png](https://files.example.com/cat.png)"]
  );
}

#[tokio::test]
async fn test_mismatched_llm_chunks_are_suppressed() {
  let mut harness = harness(llm_graph(), PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      node_succeeded("start", NodeKind::Start, json!({})),
      node_started("llm", NodeKind::Llm),
      llm_chunk("stray", &["other", "text"]),
      llm_chunk("stray", &["other", "text"]),
      llm_chunk("stray", &["other", "text"]),
      QueueEvent::TextChunk {
        text: "code output".to_string(),
        metadata: Some(ChunkMetadata {
          node_id: "code".to_string(),
          node_type: NodeKind::Code,
          value_selector: vec!["llm".to_string(), "text".to_string()],
        }),
      },
      llm_chunk("Hel", &["llm", "text"]),
      llm_chunk("lo", &["llm", "text"]),
      node_succeeded("llm", NodeKind::Llm, json!({"text": "Hello"})),
      QueueEvent::TextChunk {
        text: " (raw)".to_string(),
        metadata: None,
      },
      workflow_succeeded(),
      QueueEvent::AdvancedMessageEnd,
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  // The finished LLM output is not repeated by the route walk.
  assert_eq!(deltas(&responses), vec!["Hel", "lo", " (raw)"]);
  assert_eq!(harness.pipeline.state().answer, "Hello (raw)");
}

#[tokio::test]
async fn test_iteration_failure_emits_exception_and_purges() {
  let mut harness = harness(iteration_graph(), PipelineConfig::default());
  publish_all(&harness.publisher, iteration_events());

  let mut responses = Vec::new();
  while let Some(response) = harness.pipeline.next().await {
    if let StreamEvent::IterationNext(_) = &response.event {
      assert!(
        !harness
          .pipeline
          .state()
          .ran_node_execution_infos
          .contains_key("inner")
      );
    }
    responses.push(response);
  }

  assert_eq!(
    labels(&responses),
    vec![
      "workflow_started",
      "node_started:start",
      "node_finished:start",
      "iteration_started:iter",
      "node_started:inner",
      "node_finished:inner",
      "iteration_exception:inner",
      "iteration_next:1",
      "node_started:inner",
      "node_finished:inner",
      "iteration_completed:iter",
      "message:done",
      "node_started:answer",
      "node_finished:answer",
      "workflow_finished:Succeeded",
      "message_end",
    ]
  );

  let StreamEvent::IterationException(exception) = &responses[6].event else {
    panic!("expected iteration exception");
  };
  assert_eq!(exception.node_id, "iter");
  assert_eq!(exception.iteration_index, 0);
  assert_eq!(exception.error, "Child node failed: bad input");
  assert!(!exception.aborted);

  let StreamEvent::NodeStarted(inner) = &responses[4].event else {
    panic!("expected node start");
  };
  assert_eq!(inner.iteration_id.as_deref(), Some("iter"));

  let StreamEvent::NodeFinished(failed) = &responses[5].event else {
    panic!("expected node finish");
  };
  assert_eq!(failed.status, NodeExecutionStatus::Failed);
}

#[tokio::test]
async fn test_node_execution_indexes_are_dense() {
  let mut harness = harness(iteration_graph(), PipelineConfig::default());
  publish_all(&harness.publisher, iteration_events());
  collect(&mut harness.pipeline).await;

  let runs = harness.store.list_runs("app").await.unwrap();
  let executions = harness.store.list_node_executions(&runs[0].id).await.unwrap();
  let indexes: Vec<i64> = executions.iter().map(|execution| execution.index).collect();
  assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
  assert_eq!(runs[0].total_steps, 5);

  let iteration = executions.iter().find(|e| e.node_id == "iter").unwrap();
  assert_eq!(iteration.status, NodeExecutionStatus::Succeeded);
  assert_eq!(iteration.node_type, "iteration");
}

#[tokio::test]
async fn test_abort_policy_ignores_rest_of_iteration() {
  let config = PipelineConfig {
    iteration_error_policy: IterationErrorPolicy::Abort,
    ..Default::default()
  };
  let mut harness = harness(iteration_graph(), config);
  publish_all(&harness.publisher, iteration_events());

  let responses = collect(&mut harness.pipeline).await;
  let labels = labels(&responses);
  assert!(labels.contains(&"iteration_exception:inner".to_string()));
  assert!(!labels.iter().any(|l| l.starts_with("iteration_next")));
  assert!(!labels.iter().any(|l| l.starts_with("iteration_completed")));
  assert_eq!(labels.last().map(String::as_str), Some("message_end"));

  let runs = harness.store.list_runs("app").await.unwrap();
  let executions = harness.store.list_node_executions(&runs[0].id).await.unwrap();
  let iteration = executions.iter().find(|e| e.node_id == "iter").unwrap();
  assert_eq!(iteration.status, NodeExecutionStatus::Failed);
  assert_eq!(iteration.error.as_deref(), Some("Child node failed: bad input"));
}

#[tokio::test]
async fn test_iteration_item_resolves_while_running() {
  let graph = json!({
    "workflow_id": "wf",
    "nodes": [
      {"node_id": "start", "type": "start"},
      {"node_id": "iter", "type": "iteration", "start_node_id": "inner"},
      {"node_id": "inner", "type": "code", "iteration_id": "iter"},
      {"node_id": "echo", "type": "answer", "iteration_id": "iter", "answer": "Item {{#iter.item#}}"}
    ],
    "edges": [
      {"from": "start", "to": "iter"},
      {"from": "inner", "to": "echo"}
    ]
  });
  let mut harness = harness(graph, PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      node_succeeded("start", NodeKind::Start, json!({})),
      QueueEvent::IterationStarted(IterationStartedEvent {
        node_id: "iter".to_string(),
        title: String::new(),
        predecessor_node_id: None,
        inputs: Some(json!({"iterator_selector": ["apple", "pear"]})),
      }),
      node_started("inner", NodeKind::Code),
      node_succeeded("inner", NodeKind::Code, json!({})),
      workflow_succeeded(),
      QueueEvent::AdvancedMessageEnd,
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(deltas(&responses), vec!["Item ", "apple"]);
}

#[tokio::test]
async fn test_output_moderation_stops_the_run() {
  let config = PipelineConfig {
    moderation: Some(ModerationConfig {
      keywords: vec!["secret".to_string()],
      preset_response: "Sorry, I can't help with that.".to_string(),
    }),
    ..Default::default()
  };
  let mut harness = harness(llm_graph(), config);
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      node_succeeded("start", NodeKind::Start, json!({})),
      node_started("llm", NodeKind::Llm),
      llm_chunk("the secret", &["llm", "text"]),
      llm_chunk(" plan", &["llm", "text"]),
      llm_chunk(" continues", &["llm", "text"]),
      node_succeeded("llm", NodeKind::Llm, json!({"text": "the secret plan continues"})),
      workflow_succeeded(),
      QueueEvent::AdvancedMessageEnd,
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses)[4..],
    [
      "message:the secret",
      "message_replace:Sorry, I can't help with that.",
      "workflow_finished:Stopped",
      "message_end",
    ]
  );

  let runs = harness.store.list_runs("app").await.unwrap();
  assert_eq!(runs[0].status, RunStatus::Stopped);
  assert_eq!(runs[0].error.as_deref(), Some("Stopped by output moderation."));
  let message = harness.store.get_message(&harness.context.message_id).await.unwrap();
  assert_eq!(message.answer, "Sorry, I can't help with that.");
}

#[tokio::test]
async fn test_user_stop_finalizes_message() {
  let mut harness = harness(llm_graph(), PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      node_succeeded("start", NodeKind::Start, json!({})),
      node_started("llm", NodeKind::Llm),
      llm_chunk("partial", &["llm", "text"]),
      QueueEvent::Stop {
        stopped_by: flowcast_pipeline::StopBy::UserManual,
      },
      llm_chunk(" ignored", &["llm", "text"]),
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  let labels = labels(&responses);
  assert_eq!(
    labels[labels.len() - 3..],
    ["message:partial", "workflow_finished:Stopped", "message_end"]
  );

  let runs = harness.store.list_runs("app").await.unwrap();
  assert_eq!(runs[0].error.as_deref(), Some("Stopped by user."));
  let message = harness.store.get_message(&harness.context.message_id).await.unwrap();
  assert_eq!(message.answer, "partial");
}

#[tokio::test]
async fn test_metadata_events_reach_message_end() {
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  let mut events = start_answer_events();
  events.insert(
    1,
    QueueEvent::RetrieverResources {
      retriever_resources: vec![json!({"dataset_id": "ds", "score": 0.9})],
    },
  );
  events.insert(
    2,
    QueueEvent::AnnotationReply {
      message_annotation_id: "ann".to_string(),
      account_id: "acc".to_string(),
      account_name: "Ada".to_string(),
    },
  );
  events.insert(3, QueueEvent::Ping);
  publish_all(&harness.publisher, events);

  let responses = collect(&mut harness.pipeline).await;
  assert!(labels(&responses).contains(&"ping".to_string()));

  let Some(StreamEvent::MessageEnd(end)) = responses.last().map(|r| &r.event) else {
    panic!("expected message end");
  };
  assert_eq!(end.id, harness.context.message_id);
  assert_eq!(
    end.metadata["retriever_resources"],
    json!([{"dataset_id": "ds", "score": 0.9}])
  );
  assert_eq!(
    end.metadata["annotation_reply"],
    json!({"id": "ann", "account": {"id": "acc", "name": "Ada"}})
  );
  assert_eq!(end.metadata["usage"], json!({"total_tokens": 0}));
}

#[tokio::test]
async fn test_closed_source_stops_the_run() {
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
    ],
  );
  drop(harness.publisher);

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses),
    vec![
      "workflow_started",
      "node_started:start",
      "workflow_finished:Stopped",
      "message_end",
    ]
  );
  let runs = harness.store.list_runs("app").await.unwrap();
  assert_eq!(runs[0].error.as_deref(), Some("event source closed"));
}

#[tokio::test]
async fn test_engine_error_after_success_marks_run_failed() {
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      QueueEvent::WorkflowSucceeded { outputs: None },
      QueueEvent::Error {
        message: "boom".to_string(),
      },
    ],
  );

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses),
    vec![
      "workflow_started",
      "workflow_finished:Succeeded",
      "error:completion_request_error",
    ]
  );

  let runs = harness.store.list_runs("app").await.unwrap();
  assert_eq!(runs[0].status, RunStatus::Failed);
  assert_eq!(runs[0].error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_early_message_end_stops_the_run() {
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(
    &harness.publisher,
    vec![QueueEvent::WorkflowStarted, QueueEvent::AdvancedMessageEnd],
  );

  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses),
    vec!["workflow_started", "workflow_finished:Stopped", "message_end"]
  );

  let runs = harness.store.list_runs("app").await.unwrap();
  assert_eq!(runs[0].status, RunStatus::Stopped);
  assert_eq!(
    runs[0].error.as_deref(),
    Some("message ended before the workflow finished")
  );
}

#[tokio::test]
async fn test_stop_closes_running_iteration() {
  let mut harness = harness(iteration_graph(), PipelineConfig::default());
  let mut events: Vec<QueueEvent> = iteration_events().into_iter().take(5).collect();
  events.push(QueueEvent::Stop {
    stopped_by: flowcast_pipeline::StopBy::UserManual,
  });
  publish_all(&harness.publisher, events);

  let responses = collect(&mut harness.pipeline).await;
  let labels = labels(&responses);
  assert_eq!(
    labels[labels.len() - 3..],
    ["node_started:inner", "workflow_finished:Stopped", "message_end"]
  );

  let runs = harness.store.list_runs("app").await.unwrap();
  let executions = harness.store.list_node_executions(&runs[0].id).await.unwrap();
  let iteration = executions.iter().find(|e| e.node_id == "iter").unwrap();
  assert_eq!(iteration.status, NodeExecutionStatus::Failed);
  assert_eq!(iteration.error.as_deref(), Some("Stopped by user."));
}

#[tokio::test(start_paused = true)]
async fn test_missing_message_end_times_out() {
  let config = PipelineConfig {
    finalize_timeout_ms: Some(1_000),
    ..Default::default()
  };
  let mut harness = harness(start_answer_graph("{{#start.x#}}"), config);
  publish_all(
    &harness.publisher,
    vec![
      QueueEvent::WorkflowStarted,
      node_started("start", NodeKind::Start),
      node_succeeded("start", NodeKind::Start, json!({"x": "hi"})),
      workflow_succeeded(),
    ],
  );

  // The publisher stays alive, so only the timeout ends the wait.
  let responses = collect(&mut harness.pipeline).await;
  assert_eq!(
    labels(&responses)[labels(&responses).len() - 2..],
    ["workflow_finished:Succeeded", "message_end"]
  );
  drop(harness.publisher);
}

#[derive(Default)]
struct EchoSynthesizer {
  calls: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
  async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>, CollaboratorError> {
    self.calls.lock().unwrap().push(text.to_string());
    Ok(text.as_bytes().to_vec())
  }
}

#[tokio::test]
async fn test_stream_ends_with_audio_end_when_tts_enabled() {
  let config = PipelineConfig {
    tts: Some(TtsConfig {
      voice: "alloy".to_string(),
      auto_play: true,
    }),
    ..Default::default()
  };
  let harness = harness(start_answer_graph("Hello there."), config);
  publish_all(&harness.publisher, start_answer_events());
  let synthesizer = Arc::new(EchoSynthesizer::default());
  let pipeline = harness.pipeline.with_synthesizer(synthesizer.clone());

  let responses: Vec<StreamResponse> = into_stream(pipeline).collect().await;
  let labels = labels(&responses);
  assert_eq!(labels.last().map(String::as_str), Some("tts_message_end"));
  assert_eq!(labels.iter().filter(|l| *l == "tts_message").count(), 1);
  assert!(labels.contains(&"message_end".to_string()));
  assert_eq!(*synthesizer.calls.lock().unwrap(), vec!["Hello there.".to_string()]);
}

#[tokio::test]
async fn test_message_replace_is_spoken() {
  let config = PipelineConfig {
    tts: Some(TtsConfig {
      voice: "alloy".to_string(),
      auto_play: true,
    }),
    ..Default::default()
  };
  let harness = harness(start_answer_graph("Hello there."), config);
  let mut events = start_answer_events();
  events.insert(
    5,
    QueueEvent::MessageReplace {
      text: "Replaced.".to_string(),
    },
  );
  publish_all(&harness.publisher, events);
  let synthesizer = Arc::new(EchoSynthesizer::default());
  let pipeline = harness.pipeline.with_synthesizer(synthesizer.clone());

  let responses: Vec<StreamResponse> = into_stream(pipeline).collect().await;
  let labels = labels(&responses);
  assert_eq!(labels.iter().filter(|l| *l == "tts_message").count(), 2);
  assert_eq!(labels.last().map(String::as_str), Some("tts_message_end"));
  assert_eq!(
    *synthesizer.calls.lock().unwrap(),
    vec!["Hello there.".to_string(), "Replaced.".to_string()]
  );
}

#[tokio::test]
async fn test_stream_without_tts_has_no_audio_end() {
  let harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(&harness.publisher, start_answer_events());

  let responses: Vec<StreamResponse> = into_stream(harness.pipeline).collect().await;
  assert_eq!(labels(&responses).last().map(String::as_str), Some("message_end"));
}

struct FixedNamer;

#[async_trait]
impl ConversationNamer for FixedNamer {
  async fn generate_name(&self, _query: &str) -> Result<String, CollaboratorError> {
    Ok("Greeting".to_string())
  }
}

#[tokio::test]
async fn test_new_conversation_is_named() {
  let harness = harness(start_answer_graph("{{#start.x#}}"), PipelineConfig::default());
  publish_all(&harness.publisher, start_answer_events());
  let mut pipeline = harness.pipeline.with_namer(Arc::new(FixedNamer));

  collect(&mut pipeline).await;
  let conversation = harness
    .store
    .get_conversation(&harness.context.conversation_id)
    .await
    .unwrap();
  assert_eq!(conversation.name, "Greeting");
}

#[tokio::test]
async fn test_process_in_blocking_mode() {
  let harness = harness(start_answer_graph("{{#sys.query#}}!"), PipelineConfig::default());
  publish_all(&harness.publisher, start_answer_events());

  let output = harness.pipeline.process(false).await.unwrap();
  let flowcast_pipeline::PipelineOutput::Blocking(response) = output else {
    panic!("expected blocking output");
  };
  assert_eq!(response.data.answer, "hello!");
}
