//! The event consumption loop.
//!
//! [`WorkflowStreamPipeline`] pulls [`QueueEvent`]s from its listener one at a
//! time, records them through the [`WorkflowRecorder`], and turns them into
//! [`StreamResponse`]s. Responses produced by one event are buffered in an
//! outbox and handed out before the next event is received, so the output
//! order is exactly the causal order of the input.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use flowcast_config::{IterationErrorPolicy, NodeKind, PipelineConfig};
use flowcast_store::{Conversation, Json, Message, MessageStatus, NodeExecutionStatus, Store};
use flowcast_workflow::Workflow;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::audio::{AudioPoll, AudioPublisher, SpeechSynthesizer};
use crate::context::ApplicationContext;
use crate::error::PipelineError;
use crate::iteration::{IterationState, IterationTracker};
use crate::moderation::{KeywordModeration, OutputModeration};
use crate::naming::{ConversationNamer, NamingTask};
use crate::queue::{
  ChunkMetadata, IterationCompletedEvent, IterationNextEvent, IterationStartedEvent,
  NodeFinishedEvent, NodeStartedEvent, QueueEvent, QueueListener, StopBy,
};
use crate::recorder::{IterationScope, NodeCompletion, RunOutcome, WorkflowRecorder};
use crate::response::{
  IterationCompletedData, IterationExceptionData, IterationNextData, IterationStartedData,
  MessageEndData, NodeFinishedData, NodeStartedData, StreamEvent, StreamResponse,
  WorkflowFinishedData, WorkflowStartedData,
};
use crate::route::{RouteChunk, StreamRoutes};
use crate::state::{StreamGenerateState, TaskState};

const DEFAULT_CONVERSATION_NAME: &str = "New conversation";
const SOURCE_CLOSED_REASON: &str = "event source closed";
const EARLY_MESSAGE_END_REASON: &str = "message ended before the workflow finished";

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Records and collaborators are not set up yet.
  Pending,
  Listening,
  /// The workflow finished; waiting for the message-level end event.
  AwaitingMessageFinalize {
    deadline: Option<tokio::time::Instant>,
  },
  Finished,
}

/// Consumes one task's queue and produces its client-facing responses.
///
/// A pipeline serves exactly one run. Once [`next`](Self::next) returns
/// `None` it stays exhausted.
pub struct WorkflowStreamPipeline {
  pub(crate) context: ApplicationContext,
  pub(crate) workflow: Arc<Workflow>,
  pub(crate) routes: Arc<StreamRoutes>,
  pub(crate) config: PipelineConfig,
  pub(crate) store: Arc<dyn Store>,
  recorder: WorkflowRecorder,
  listener: QueueListener,
  pub(crate) state: TaskState,
  pub(crate) iterations: IterationTracker,
  moderation: Option<Box<dyn OutputModeration>>,
  moderation_directed: bool,
  synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
  audio_enabled: bool,
  audio: Option<AudioPublisher>,
  namer: Option<Arc<dyn ConversationNamer>>,
  naming: Option<NamingTask>,
  outbox: VecDeque<StreamEvent>,
  phase: Phase,
  run_finished: bool,
  shut_down: bool,
}

impl WorkflowStreamPipeline {
  /// Create a pipeline. Stream routes are resolved here, once per run.
  pub fn new(
    context: ApplicationContext,
    workflow: Arc<Workflow>,
    store: Arc<dyn Store>,
    listener: QueueListener,
    config: PipelineConfig,
  ) -> Self {
    let routes = Arc::new(StreamRoutes::resolve(&workflow));
    let recorder = WorkflowRecorder::new(
      store.clone(),
      workflow.clone(),
      context.app_id.clone(),
      context.user_id.clone(),
    );
    let moderation = config
      .moderation
      .as_ref()
      .map(|moderation| Box::new(KeywordModeration::new(moderation)) as Box<dyn OutputModeration>);

    Self {
      context,
      workflow,
      routes,
      config,
      store,
      recorder,
      listener,
      state: TaskState::new(),
      iterations: IterationTracker::new(),
      moderation,
      moderation_directed: false,
      synthesizer: None,
      audio_enabled: true,
      audio: None,
      namer: None,
      naming: None,
      outbox: VecDeque::new(),
      phase: Phase::Pending,
      run_finished: false,
      shut_down: false,
    }
  }

  /// Replace the moderation gate built from the configuration.
  pub fn with_moderation(mut self, moderation: Box<dyn OutputModeration>) -> Self {
    self.moderation = Some(moderation);
    self
  }

  pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
    self.synthesizer = Some(synthesizer);
    self
  }

  pub fn with_namer(mut self, namer: Arc<dyn ConversationNamer>) -> Self {
    self.namer = Some(namer);
    self
  }

  /// Run without the audio side-channel, e.g. for blocking responses.
  pub fn disable_audio(&mut self) {
    self.audio_enabled = false;
    self.audio = None;
  }

  pub fn task_id(&self) -> &str {
    &self.context.task_id
  }

  pub fn context(&self) -> &ApplicationContext {
    &self.context
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn state(&self) -> &TaskState {
    &self.state
  }

  pub fn has_audio(&self) -> bool {
    self.audio.is_some()
  }

  /// Non-blocking poll of the audio side-channel. `None` when it is inactive.
  pub fn poll_audio(&mut self) -> Option<AudioPoll> {
    self.audio.as_mut().map(AudioPublisher::poll)
  }

  pub(crate) fn respond(&self, event: StreamEvent) -> StreamResponse {
    StreamResponse {
      task_id: self.context.task_id.clone(),
      event,
    }
  }

  /// Next response, or `None` once the run is finalized.
  ///
  /// Audio chunks that are already available are interleaved between the
  /// main responses.
  pub async fn next(&mut self) -> Option<StreamResponse> {
    loop {
      if let Some(AudioPoll::Chunk(audio)) = self.poll_audio() {
        return Some(self.respond(StreamEvent::AudioChunk { audio }));
      }
      if let Some(event) = self.outbox.pop_front() {
        return Some(self.respond(event));
      }
      if self.phase == Phase::Finished {
        self.shutdown().await;
        return None;
      }
      self.step().await;
    }
  }

  /// Signal end of input to the audio side-channel and join the naming task.
  /// Safe to call more than once.
  pub async fn shutdown(&mut self) {
    if self.shut_down {
      return;
    }
    self.shut_down = true;

    if let Some(audio) = self.audio.as_mut() {
      audio.publish(None);
    }
    if let Some(naming) = self.naming.take() {
      naming.join(self.config.naming_join_timeout()).await;
    }

    info!(
      task_id = %self.context.task_id,
      total_steps = self.state.total_steps,
      total_tokens = self.state.total_tokens,
      "pipeline_finished"
    );
  }

  async fn step(&mut self) {
    match self.phase {
      Phase::Pending => match self.bootstrap().await {
        Ok(()) => self.phase = Phase::Listening,
        Err(e) => self.fail(e).await,
      },
      Phase::Listening => {
        let event = self.listener.recv().await;
        self.consume(event).await;
      }
      Phase::AwaitingMessageFinalize {
        deadline: Some(deadline),
      } => match tokio::time::timeout_at(deadline, self.listener.recv()).await {
        Ok(event) => self.consume(event).await,
        Err(_) => {
          warn!(
            task_id = %self.context.task_id,
            "message_end_not_received, finalizing anyway"
          );
          if let Err(e) = self.finalize().await {
            self.fail(e).await;
          }
        }
      },
      Phase::AwaitingMessageFinalize { deadline: None } => {
        let event = self.listener.recv().await;
        self.consume(event).await;
      }
      Phase::Finished => {}
    }
  }

  async fn consume(&mut self, event: Option<QueueEvent>) {
    let result = match event {
      Some(event) => self.dispatch(event).await,
      None => self.on_source_closed().await,
    };
    if let Err(e) = result {
      self.fail(e).await;
    }
  }

  async fn bootstrap(&mut self) -> Result<(), PipelineError> {
    if self.context.is_new_conversation {
      let now = Utc::now();
      self
        .store
        .create_conversation(&Conversation {
          id: self.context.conversation_id.clone(),
          app_id: self.context.app_id.clone(),
          name: DEFAULT_CONVERSATION_NAME.to_string(),
          created_at: now,
          updated_at: now,
        })
        .await?;
    }
    self.save_message(MessageStatus::Normal, None).await?;

    if self.audio_enabled && self.config.tts_enabled() {
      if let (Some(synthesizer), Some(tts)) = (&self.synthesizer, &self.config.tts) {
        self.audio = Some(AudioPublisher::spawn(
          synthesizer.clone(),
          tts.voice.clone(),
          self.config.audio_queue_capacity,
        ));
      }
    }

    if self.context.is_new_conversation && self.config.auto_generate_name {
      if let Some(namer) = &self.namer {
        self.naming = Some(NamingTask::spawn(
          namer.clone(),
          self.store.clone(),
          self.context.conversation_id.clone(),
          self.context.query.clone(),
        ));
      }
    }

    info!(
      task_id = %self.context.task_id,
      conversation_id = %self.context.conversation_id,
      routes = self.routes.iter().count(),
      audio = self.audio.is_some(),
      "pipeline_started"
    );
    Ok(())
  }

  #[instrument(skip_all, fields(task_id = %self.context.task_id))]
  async fn dispatch(&mut self, event: QueueEvent) -> Result<(), PipelineError> {
    match event {
      QueueEvent::Error { message } => {
        self.fail(PipelineError::Engine(message)).await;
      }
      QueueEvent::WorkflowStarted => {
        let run = self
          .recorder
          .start_run(&mut self.state, self.context.run_inputs())
          .await?;
        self
          .outbox
          .push_back(StreamEvent::WorkflowStarted(WorkflowStartedData::from(&run)));
      }
      QueueEvent::NodeStarted(event) => self.on_node_started(event).await?,
      QueueEvent::NodeSucceeded(event) => {
        self
          .on_node_finished(event, NodeExecutionStatus::Succeeded)
          .await?
      }
      QueueEvent::NodeFailed(event) => self.on_node_finished(event, NodeExecutionStatus::Failed).await?,
      QueueEvent::IterationStarted(event) => self.on_iteration_started(event).await?,
      QueueEvent::IterationNext(event) => self.on_iteration_next(event),
      QueueEvent::IterationCompleted(event) => self.on_iteration_completed(event).await?,
      QueueEvent::TextChunk { text, metadata } => {
        if self.is_stream_supported(metadata.as_ref()) {
          self.emit_answer_text(text);
        } else {
          debug!(node_id = ?metadata.map(|m| m.node_id), "text_chunk_suppressed");
        }
      }
      QueueEvent::MessageReplace { text } => self.replace_answer(text),
      QueueEvent::RetrieverResources {
        retriever_resources,
      } => {
        self
          .state
          .metadata
          .insert("retriever_resources".to_string(), Value::Array(retriever_resources));
      }
      QueueEvent::AnnotationReply {
        message_annotation_id,
        account_id,
        account_name,
      } => {
        self.state.metadata.insert(
          "annotation_reply".to_string(),
          json!({
            "id": message_annotation_id,
            "account": {"id": account_id, "name": account_name},
          }),
        );
      }
      QueueEvent::Ping => self.outbox.push_back(StreamEvent::Ping),
      QueueEvent::Stop { stopped_by } => self.on_stop(stopped_by).await?,
      QueueEvent::WorkflowSucceeded { outputs } => self.on_workflow_succeeded(outputs).await?,
      QueueEvent::WorkflowFailed { error } => self.on_workflow_failed(error).await?,
      QueueEvent::AdvancedMessageEnd => self.on_message_end().await?,
    }
    Ok(())
  }

  async fn on_node_started(&mut self, event: NodeStartedEvent) -> Result<(), PipelineError> {
    let scope = self.iteration_scope(&event.node_id);
    let execution = self
      .recorder
      .start_node(&mut self.state, &event, scope.as_ref())
      .await?;

    self.activate_route(&event.node_id);
    self.outbox.push_back(StreamEvent::NodeStarted(NodeStartedData::new(
      &execution,
      scope.map(|scope| scope.iteration_id),
    )));
    Ok(())
  }

  async fn on_node_finished(
    &mut self,
    event: NodeFinishedEvent,
    status: NodeExecutionStatus,
  ) -> Result<(), PipelineError> {
    let execution = self
      .recorder
      .finish_node(&mut self.state, &mut self.iterations, &event, status)
      .await?;

    self.generate_stream_on_node_finished().await?;
    self
      .outbox
      .push_back(StreamEvent::NodeFinished(NodeFinishedData::from(&execution)));

    if status == NodeExecutionStatus::Failed {
      self
        .on_iteration_child_failed(&event.node_id, event.error.as_deref())
        .await?;
    }
    Ok(())
  }

  async fn on_iteration_child_failed(
    &mut self,
    node_id: &str,
    error: Option<&str>,
  ) -> Result<(), PipelineError> {
    let Some(iteration_id) = self.workflow.enclosing_iteration(node_id).map(str::to_string) else {
      return Ok(());
    };
    let Some(iteration) = self.iterations.get(&iteration_id) else {
      return Ok(());
    };

    let error = format!("Child node failed: {}", error.unwrap_or("unknown error"));
    let aborted = self.config.iteration_error_policy == IterationErrorPolicy::Abort;
    warn!(
      iteration_id = %iteration_id,
      failed_node_id = %node_id,
      iteration_index = iteration.current_index,
      aborted,
      "iteration_child_failed"
    );
    self
      .outbox
      .push_back(StreamEvent::IterationException(IterationExceptionData {
        id: iteration.node_execution_id.clone(),
        node_id: iteration_id.clone(),
        iteration_index: iteration.current_index,
        failed_node_id: node_id.to_string(),
        error: error.clone(),
        aborted,
      }));

    if aborted {
      if let Some(iteration) = self.iterations.abort(&iteration_id) {
        self
          .recorder
          .finish_iteration(
            &mut self.state,
            &iteration_id,
            NodeCompletion {
              execution_metadata: Some(json!({"total_tokens": iteration.total_tokens})),
              error: Some(error),
              ..Default::default()
            },
          )
          .await?;
      }
    }
    Ok(())
  }

  async fn on_iteration_started(&mut self, event: IterationStartedEvent) -> Result<(), PipelineError> {
    let node_type = self
      .workflow
      .get_node(&event.node_id)
      .map(|node| node.kind())
      .filter(NodeKind::is_iteration)
      .unwrap_or(NodeKind::Iteration);
    let started = NodeStartedEvent {
      node_id: event.node_id.clone(),
      node_type,
      title: event.title,
      predecessor_node_id: event.predecessor_node_id,
      node_run_index: 0,
      inputs: event.inputs.clone(),
    };

    let scope = self.iteration_scope(&event.node_id);
    let execution = self
      .recorder
      .start_node(&mut self.state, &started, scope.as_ref())
      .await?;

    let parent = self
      .workflow
      .enclosing_iteration(&event.node_id)
      .map(str::to_string);
    self.iterations.start(
      &event.node_id,
      IterationState::new(execution.id.clone(), parent, event.inputs.as_ref()),
    );

    self.activate_route(&event.node_id);
    self
      .outbox
      .push_back(StreamEvent::IterationStarted(IterationStartedData::from(&execution)));
    Ok(())
  }

  fn on_iteration_next(&mut self, event: IterationNextEvent) {
    if self.iterations.is_aborted(&event.node_id) {
      debug!(node_id = %event.node_id, "iteration_aborted, next ignored");
      return;
    }
    let Some(iteration) = self.iterations.next(&event.node_id, event.index) else {
      warn!(node_id = %event.node_id, "iteration_not_started, next ignored");
      return;
    };
    let id = iteration.node_execution_id.clone();

    // The next round starts the nested nodes again from scratch.
    for node_id in self.routes.nested_nodes(&event.node_id) {
      self.state.ran_node_execution_infos.remove(node_id);
    }

    self.outbox.push_back(StreamEvent::IterationNext(IterationNextData {
      id,
      node_id: event.node_id,
      index: event.index,
      pre_iteration_output: event.pre_iteration_output,
    }));
  }

  async fn on_iteration_completed(&mut self, event: IterationCompletedEvent) -> Result<(), PipelineError> {
    if self.iterations.is_aborted(&event.node_id) {
      debug!(node_id = %event.node_id, "iteration_aborted, completion ignored");
      return Ok(());
    }
    let total_tokens = self
      .iterations
      .complete(&event.node_id)
      .map(|iteration| iteration.total_tokens)
      .unwrap_or(0);

    let execution = self
      .recorder
      .finish_iteration(
        &mut self.state,
        &event.node_id,
        NodeCompletion {
          outputs: event.outputs,
          execution_metadata: Some(json!({"total_tokens": total_tokens})),
          error: event.error,
          ..Default::default()
        },
      )
      .await?;

    self.generate_stream_on_node_finished().await?;
    self
      .outbox
      .push_back(StreamEvent::IterationCompleted(IterationCompletedData::new(
        &execution,
        total_tokens,
        event.steps,
      )));
    Ok(())
  }

  async fn on_stop(&mut self, stopped_by: StopBy) -> Result<(), PipelineError> {
    info!(task_id = %self.context.task_id, stopped_by = ?stopped_by, "workflow_stopped");
    self.stop_run(stopped_by.reason()).await?;
    self.finalize().await
  }

  async fn on_message_end(&mut self) -> Result<(), PipelineError> {
    if !matches!(self.phase, Phase::AwaitingMessageFinalize { .. }) {
      warn!(task_id = %self.context.task_id, "message_end before the workflow finished");
      self.stop_run(EARLY_MESSAGE_END_REASON).await?;
    }
    self.finalize().await
  }

  async fn on_workflow_succeeded(&mut self, outputs: Option<Value>) -> Result<(), PipelineError> {
    if self.run_finished {
      warn!(task_id = %self.context.task_id, "workflow_already_finished, event ignored");
      return Ok(());
    }
    let run = self
      .recorder
      .finish_run(&self.state, RunOutcome::Succeeded { outputs })
      .await?;
    self.run_finished = true;
    self
      .outbox
      .push_back(StreamEvent::WorkflowFinished(WorkflowFinishedData::from(&run)));

    self.phase = Phase::AwaitingMessageFinalize {
      deadline: self
        .config
        .finalize_timeout()
        .map(|timeout| tokio::time::Instant::now() + timeout),
    };
    Ok(())
  }

  async fn on_workflow_failed(&mut self, error: String) -> Result<(), PipelineError> {
    self.fail_active_iterations(&error).await;
    let run = self
      .recorder
      .finish_run(&self.state, RunOutcome::Failed { error: error.clone() })
      .await?;
    self.run_finished = true;
    self
      .outbox
      .push_back(StreamEvent::WorkflowFinished(WorkflowFinishedData::from(&run)));

    let err = PipelineError::RunFailed(error);
    error!(task_id = %self.context.task_id, error = %err, "workflow_run_failed");
    if let Err(e) = self.save_message(MessageStatus::Error, Some(err.to_string())).await {
      warn!(error = %e, "message_save_failed, ignored");
    }
    self.outbox.push_back(StreamEvent::Error(err.to_error_data()));
    self.phase = Phase::Finished;
    Ok(())
  }

  async fn on_source_closed(&mut self) -> Result<(), PipelineError> {
    if !matches!(self.phase, Phase::AwaitingMessageFinalize { .. }) {
      warn!(task_id = %self.context.task_id, "event_source_closed before the workflow finished");
      self.stop_run(SOURCE_CLOSED_REASON).await?;
    }
    self.finalize().await
  }

  /// Record the run as stopped, closing any iteration still in flight.
  async fn stop_run(&mut self, reason: &str) -> Result<(), PipelineError> {
    self.fail_active_iterations(reason).await;
    self
      .finish_run_if_running(RunOutcome::Stopped {
        reason: reason.to_string(),
      })
      .await
  }

  async fn finish_run_if_running(&mut self, outcome: RunOutcome) -> Result<(), PipelineError> {
    if self.run_finished || self.state.workflow_run_id.is_none() {
      return Ok(());
    }
    let run = self.recorder.finish_run(&self.state, outcome).await?;
    self.run_finished = true;
    self
      .outbox
      .push_back(StreamEvent::WorkflowFinished(WorkflowFinishedData::from(&run)));
    Ok(())
  }

  /// Persist the answer and emit the message end. Terminates the loop.
  async fn finalize(&mut self) -> Result<(), PipelineError> {
    if !self.moderation_directed {
      if let Some(output) = self.directed_output() {
        self.moderation_directed = true;
        self.replace_answer(output);
      }
    }

    self.state.metadata.insert(
      "usage".to_string(),
      json!({"total_tokens": self.state.total_tokens}),
    );
    self.save_message(MessageStatus::Normal, None).await?;

    self.outbox.push_back(StreamEvent::MessageEnd(MessageEndData {
      id: self.context.message_id.clone(),
      conversation_id: self.context.conversation_id.clone(),
      metadata: self.state.metadata.clone(),
    }));
    self.phase = Phase::Finished;

    info!(
      task_id = %self.context.task_id,
      message_id = %self.context.message_id,
      answer_chars = self.state.answer.chars().count(),
      "message_finalized"
    );
    Ok(())
  }

  /// Terminal failure: record what can be recorded and emit one error.
  async fn fail(&mut self, err: PipelineError) {
    error!(task_id = %self.context.task_id, error = %err, "pipeline_failed");

    let message = err.to_string();
    self.fail_active_iterations(&message).await;
    // Also overwrites a run already recorded as succeeded.
    if self.state.workflow_run_id.is_some() {
      let outcome = RunOutcome::Failed {
        error: message.clone(),
      };
      match self.recorder.finish_run(&self.state, outcome).await {
        Ok(_) => self.run_finished = true,
        Err(e) => warn!(error = %e, "workflow_run_not_recorded_as_failed"),
      }
    }
    if let Err(e) = self.save_message(MessageStatus::Error, Some(message)).await {
      warn!(error = %e, "message_save_failed, ignored");
    }

    self.outbox.push_back(StreamEvent::Error(err.to_error_data()));
    self.phase = Phase::Finished;
  }

  async fn fail_active_iterations(&mut self, error: &str) {
    for (node_id, iteration) in self.iterations.drain() {
      let completion = NodeCompletion {
        execution_metadata: Some(json!({"total_tokens": iteration.total_tokens})),
        error: Some(error.to_string()),
        ..Default::default()
      };
      if let Err(e) = self
        .recorder
        .finish_iteration(&mut self.state, &node_id, completion)
        .await
      {
        warn!(node_id = %node_id, error = %e, "iteration_not_recorded_as_failed");
      }
    }
  }

  async fn save_message(&self, status: MessageStatus, error: Option<String>) -> Result<(), PipelineError> {
    let message = Message {
      id: self.context.message_id.clone(),
      conversation_id: self.context.conversation_id.clone(),
      app_id: self.context.app_id.clone(),
      query: self.context.query.clone(),
      answer: self.state.answer.clone(),
      status,
      error,
      metadata: Json(Value::Object(self.state.metadata.clone())),
      workflow_run_id: self.state.workflow_run_id.clone(),
      created_at: self.context.created_at,
      updated_at: Utc::now(),
    };
    self.store.save_message(&message).await?;
    Ok(())
  }

  fn iteration_scope(&self, node_id: &str) -> Option<IterationScope> {
    let iteration_id = self.workflow.enclosing_iteration(node_id)?;
    let iteration = self.iterations.get(iteration_id)?;
    Some(IterationScope {
      iteration_id: iteration_id.to_string(),
      index: iteration.current_index,
    })
  }

  /// Install the route registered under `node_id` unless one is active.
  fn activate_route(&mut self, node_id: &str) {
    if self.state.current_stream_generate_state.is_some() || self.routes.get(node_id).is_none() {
      return;
    }
    debug!(node_id = %node_id, "stream_route_activated");
    self.state.current_stream_generate_state = Some(StreamGenerateState {
      route_key: node_id.to_string(),
      position: 0,
    });
    self.generate_stream_on_node_started();
  }

  /// Whether a raw text chunk may be forwarded as is.
  ///
  /// Chunks without an origin always pass. LLM chunks pass only while the
  /// active route is waiting on exactly their selector; everything else is
  /// emitted by the route walk once its node finishes.
  fn is_stream_supported(&self, metadata: Option<&ChunkMetadata>) -> bool {
    let Some(metadata) = metadata else {
      return true;
    };
    if metadata.node_type != NodeKind::Llm {
      return false;
    }
    let Some(generate_state) = &self.state.current_stream_generate_state else {
      return false;
    };

    match self
      .routes
      .get(&generate_state.route_key)
      .and_then(|route| route.chunks.get(generate_state.position))
    {
      Some(RouteChunk::Var { value_selector }) => *value_selector == metadata.value_selector,
      _ => false,
    }
  }

  /// Accept a text delta: moderate, accumulate, forward to audio, emit.
  pub(crate) fn emit_answer_text(&mut self, text: String) {
    if self.moderation_directed || text.is_empty() {
      return;
    }

    if let Some(output) = self.directed_output() {
      self.moderation_directed = true;
      self.replace_answer(output);
      // Terminate through the regular stop path.
      self.listener.publish_local(QueueEvent::Stop {
        stopped_by: StopBy::OutputModeration,
      });
      info!(task_id = %self.context.task_id, "output_moderation_directed");
      return;
    }
    if let Some(moderation) = self.moderation.as_mut() {
      moderation.append_new_token(&text);
    }

    self.state.answer.push_str(&text);
    if let Some(audio) = self.audio.as_mut() {
      audio.publish(Some(text.clone()));
    }
    self.outbox.push_back(StreamEvent::TextDelta {
      id: self.context.message_id.clone(),
      answer: text,
    });
  }

  fn directed_output(&self) -> Option<String> {
    self
      .moderation
      .as_ref()
      .filter(|moderation| moderation.should_direct_output())
      .map(|moderation| moderation.final_output())
  }

  /// Replace the whole answer. Audio already synthesized is not retracted;
  /// the replacement is spoken after it.
  fn replace_answer(&mut self, answer: String) {
    self.state.answer = answer.clone();
    if let Some(audio) = self.audio.as_mut() {
      audio.publish(Some(answer.clone()));
    }
    self.outbox.push_back(StreamEvent::MessageReplace { answer });
  }
}
