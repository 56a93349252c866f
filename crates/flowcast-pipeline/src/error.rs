//! Error types for the streaming pipeline.

use thiserror::Error;

use crate::response::ErrorData;

/// Errors that terminate a pipeline run.
///
/// Every variant can be rendered as the client-facing `error` response via
/// [`PipelineError::to_error_data`].
#[derive(Debug, Error)]
pub enum PipelineError {
  /// The execution engine reported an error.
  #[error("{0}")]
  Engine(String),

  /// The workflow itself failed.
  #[error("Run failed: {0}")]
  RunFailed(String),

  /// Reading or writing a record failed.
  #[error("store error: {0}")]
  Store(#[from] flowcast_store::Error),

  /// A finish event arrived for a node that was never started.
  #[error("node '{0}' finished without a recorded start")]
  NodeNotStarted(String),

  /// A run-level event arrived before `workflow_started`.
  #[error("workflow run has not started")]
  RunNotStarted,

  /// The response stream ended without a message end.
  #[error("response stream ended before the message was finalized")]
  StreamEnded,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// An `error` response surfaced while assembling a blocking response.
  #[error("{message}")]
  Reported {
    code: String,
    status: u16,
    message: String,
  },
}

impl PipelineError {
  pub fn code(&self) -> &str {
    match self {
      PipelineError::Engine(_) => "completion_request_error",
      PipelineError::RunFailed(_) => "invalid_param",
      PipelineError::Reported { code, .. } => code,
      _ => "internal_server_error",
    }
  }

  pub fn status(&self) -> u16 {
    match self {
      PipelineError::Engine(_) | PipelineError::RunFailed(_) => 400,
      PipelineError::Reported { status, .. } => *status,
      _ => 500,
    }
  }

  /// Payload of the `error` stream response. Internal failures do not leak
  /// their details to the client.
  pub fn to_error_data(&self) -> ErrorData {
    let message = match self.status() {
      500 => "Internal Server Error, please contact support.".to_string(),
      _ => self.to_string(),
    };

    ErrorData {
      code: self.code().to_string(),
      status: self.status(),
      message,
    }
  }
}

impl From<ErrorData> for PipelineError {
  fn from(data: ErrorData) -> Self {
    PipelineError::Reported {
      code: data.code,
      status: data.status,
      message: data.message,
    }
  }
}

/// Errors returned by auxiliary collaborators (speech synthesis, naming).
///
/// These are logged and ignored by the pipeline.
#[derive(Debug, Error)]
pub enum CollaboratorError {
  #[error("collaborator unavailable: {0}")]
  Unavailable(String),

  #[error("{0}")]
  Failed(String),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_engine_error_is_client_visible() {
    let data = PipelineError::Engine("model quota exceeded".to_string()).to_error_data();
    assert_eq!(data.code, "completion_request_error");
    assert_eq!(data.status, 400);
    assert_eq!(data.message, "model quota exceeded");
  }

  #[test]
  fn test_run_failed_message() {
    let data = PipelineError::RunFailed("node crashed".to_string()).to_error_data();
    assert_eq!(data.code, "invalid_param");
    assert_eq!(data.message, "Run failed: node crashed");
  }

  #[test]
  fn test_internal_errors_are_masked() {
    let err = PipelineError::Store(flowcast_store::Error::NotFound("run x".to_string()));
    let data = err.to_error_data();
    assert_eq!(data.code, "internal_server_error");
    assert_eq!(data.status, 500);
    assert!(!data.message.contains("run x"));
  }

  #[test]
  fn test_reported_round_trips_error_data() {
    let data = ErrorData {
      code: "invalid_param".to_string(),
      status: 400,
      message: "Run failed: boom".to_string(),
    };
    let err = PipelineError::from(data.clone());
    assert_eq!(err.to_error_data(), data);
  }
}
