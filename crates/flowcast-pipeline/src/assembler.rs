//! Delivering a pipeline's output as a stream or a single blocking response.

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::warn;

use crate::audio::AudioPoll;
use crate::error::PipelineError;
use crate::pipeline::WorkflowStreamPipeline;
use crate::response::{StreamEvent, StreamResponse};

const BLOCKING_MODE: &str = "advanced-chat";

/// Aggregated answer returned when streaming is not requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingResponse {
  pub task_id: String,
  pub data: BlockingResponseData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingResponseData {
  pub id: String,
  pub mode: String,
  pub conversation_id: String,
  pub message_id: String,
  pub answer: String,
  pub created_at: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub metadata: Option<Map<String, Value>>,
}

/// Output of [`WorkflowStreamPipeline::process`].
pub enum PipelineOutput {
  Blocking(BlockingResponse),
  Stream(BoxStream<'static, StreamResponse>),
}

impl WorkflowStreamPipeline {
  /// Consume the pipeline in the requested mode.
  pub async fn process(self, stream: bool) -> Result<PipelineOutput, PipelineError> {
    if stream {
      Ok(PipelineOutput::Stream(into_stream(self)))
    } else {
      to_blocking_response(self).await.map(PipelineOutput::Blocking)
    }
  }
}

/// Drive the pipeline to its message end and aggregate the answer.
///
/// An `error` response anywhere in the stream becomes the returned error.
pub async fn to_blocking_response(mut pipeline: WorkflowStreamPipeline) -> Result<BlockingResponse, PipelineError> {
  pipeline.disable_audio();
  let mut answer = String::new();

  while let Some(response) = pipeline.next().await {
    match response.event {
      StreamEvent::TextDelta { answer: delta, .. } => answer.push_str(&delta),
      StreamEvent::MessageReplace { answer: replaced } => answer = replaced,
      StreamEvent::Error(data) => {
        pipeline.shutdown().await;
        return Err(data.into());
      }
      StreamEvent::MessageEnd(end) => {
        pipeline.shutdown().await;
        return Ok(BlockingResponse {
          task_id: response.task_id,
          data: BlockingResponseData {
            id: end.id.clone(),
            mode: BLOCKING_MODE.to_string(),
            conversation_id: end.conversation_id,
            message_id: end.id,
            answer,
            created_at: pipeline.context().created_at.timestamp(),
            metadata: (!end.metadata.is_empty()).then_some(end.metadata),
          },
        });
      }
      _ => {}
    }
  }

  Err(PipelineError::StreamEnded)
}

enum Stage {
  Main(Box<WorkflowStreamPipeline>),
  Drain(Box<WorkflowStreamPipeline>, Instant),
  Done,
}

/// Turn the pipeline into a response stream.
///
/// After the main responses end, remaining audio is drained until the worker
/// finishes or no chunk arrived for the drain timeout, then `tts_message_end`
/// closes the stream. Nothing follows an `error` response.
pub fn into_stream(pipeline: WorkflowStreamPipeline) -> BoxStream<'static, StreamResponse> {
  stream::unfold(Stage::Main(Box::new(pipeline)), |stage| async move {
    match stage {
      Stage::Main(mut pipeline) => match pipeline.next().await {
        Some(response) if matches!(response.event, StreamEvent::Error(_)) => {
          pipeline.shutdown().await;
          Some((response, Stage::Done))
        }
        Some(response) => Some((response, Stage::Main(pipeline))),
        None if pipeline.has_audio() => {
          let deadline = Instant::now() + pipeline.config().audio_drain_timeout();
          drain_audio(pipeline, deadline).await
        }
        None => None,
      },
      Stage::Drain(pipeline, deadline) => drain_audio(pipeline, deadline).await,
      Stage::Done => None,
    }
  })
  .boxed()
}

async fn drain_audio(
  mut pipeline: Box<WorkflowStreamPipeline>,
  deadline: Instant,
) -> Option<(StreamResponse, Stage)> {
  let poll_interval = pipeline.config().audio_poll_interval();

  loop {
    match pipeline.poll_audio() {
      Some(AudioPoll::Chunk(audio)) => {
        let response = pipeline.respond(StreamEvent::AudioChunk { audio });
        let deadline = Instant::now() + pipeline.config().audio_drain_timeout();
        return Some((response, Stage::Drain(pipeline, deadline)));
      }
      Some(AudioPoll::Pending) if Instant::now() < deadline => {
        tokio::time::sleep(poll_interval).await;
      }
      Some(AudioPoll::Pending) => {
        warn!(task_id = %pipeline.task_id(), "audio_drain_timed_out, remaining audio ignored");
        break;
      }
      Some(AudioPoll::Finished) | None => break,
    }
  }

  let response = pipeline.respond(StreamEvent::AudioEnd {
    audio: String::new(),
  });
  Some((response, Stage::Done))
}
