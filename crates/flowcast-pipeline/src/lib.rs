//! Flowcast Pipeline
//!
//! This crate turns the lifecycle events of one workflow run into a persisted
//! execution history and a client-facing response stream.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 execution engine (external)                 │
//! │  - QueuePublisher::publish(QueueEvent)                      │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowStreamPipeline                    │
//! │  - StreamRoutes resolved once from the locked Workflow      │
//! │  - WorkflowRecorder writes runs and node executions         │
//! │  - IterationTracker, OutputModeration, TaskState            │
//! │  - next() → StreamResponse, in causal order                 │
//! └─────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────────┐ ┌────────────────────────────┐
//! │ AudioPublisher (worker task) │ │ NamingTask (worker task)   │
//! │  - SpeechSynthesizer         │ │  - ConversationNamer       │
//! └──────────────────────────────┘ └────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  into_stream → BoxStream<StreamResponse>                    │
//! │  to_blocking_response → BlockingResponse                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use flowcast_pipeline::{ApplicationContext, WorkflowStreamPipeline, channel, into_stream};
//!
//! let context = ApplicationContext::new("app", "user", "hello");
//! let (publisher, listener) = channel(context.task_id.clone());
//!
//! // Hand `publisher` to the engine, then consume the responses.
//! let pipeline = WorkflowStreamPipeline::new(context, workflow, store, listener, config);
//! let mut responses = into_stream(pipeline);
//! while let Some(response) = responses.next().await {
//!     println!("{}", serde_json::to_string(&response)?);
//! }
//! ```

mod assembler;
mod audio;
mod context;
mod error;
mod generate;
mod iteration;
mod moderation;
mod naming;
mod pipeline;
mod queue;
mod recorder;
mod response;
mod route;
mod state;
mod variable;

pub use assembler::{
  BlockingResponse, BlockingResponseData, PipelineOutput, into_stream, to_blocking_response,
};
pub use audio::{AudioPoll, AudioPublisher, SpeechSynthesizer};
pub use context::ApplicationContext;
pub use error::{CollaboratorError, PipelineError};
pub use iteration::{IterationState, IterationTracker};
pub use moderation::{KeywordModeration, OutputModeration};
pub use naming::{ConversationNamer, NamingTask, truncate_name};
pub use pipeline::{Phase, WorkflowStreamPipeline};
pub use queue::{
  ChunkMetadata, IterationCompletedEvent, IterationNextEvent, IterationStartedEvent,
  NodeFinishedEvent, NodeStartedEvent, QueueEvent, QueueListener, QueuePublisher, StopBy, channel,
};
pub use recorder::{IterationScope, NodeCompletion, RunOutcome, WorkflowRecorder};
pub use response::{
  ErrorData, IterationCompletedData, IterationExceptionData, IterationNextData,
  IterationStartedData, MessageEndData, NodeFinishedData, NodeStartedData, StreamEvent,
  StreamResponse, WorkflowFinishedData, WorkflowStartedData,
};
pub use route::{RouteChunk, StreamGenerateRoute, StreamRoutes, extract_route_chunks};
pub use state::{NodeExecutionInfo, StreamGenerateState, TaskState};
pub use variable::{FileValue, collect_files, lookup_path, value_to_text};
