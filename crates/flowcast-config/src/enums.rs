use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of a node, without its configuration.
///
/// Carried on queue events and persisted on node execution records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
  Start,
  End,
  Answer,
  Llm,
  IfElse,
  QuestionClassifier,
  Iteration,
  IterationStart,
  Loop,
  LoopStart,
  KnowledgeRetrieval,
  Code,
  TemplateTransform,
  HttpRequest,
  Tool,
  VariableAggregator,
  ParameterExtractor,
  #[serde(other)]
  Other,
}

impl NodeKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      NodeKind::Start => "start",
      NodeKind::End => "end",
      NodeKind::Answer => "answer",
      NodeKind::Llm => "llm",
      NodeKind::IfElse => "if-else",
      NodeKind::QuestionClassifier => "question-classifier",
      NodeKind::Iteration => "iteration",
      NodeKind::IterationStart => "iteration-start",
      NodeKind::Loop => "loop",
      NodeKind::LoopStart => "loop-start",
      NodeKind::KnowledgeRetrieval => "knowledge-retrieval",
      NodeKind::Code => "code",
      NodeKind::TemplateTransform => "template-transform",
      NodeKind::HttpRequest => "http-request",
      NodeKind::Tool => "tool",
      NodeKind::VariableAggregator => "variable-aggregator",
      NodeKind::ParameterExtractor => "parameter-extractor",
      NodeKind::Other => "other",
    }
  }

  /// Iteration and loop nodes own a nested body of nodes.
  pub fn is_iteration(&self) -> bool {
    matches!(self, NodeKind::Iteration | NodeKind::Loop)
  }

  /// Nodes after which an answer's stream must start fresh at the successor,
  /// because they either branch or emit their own answer.
  pub fn is_stream_barrier(&self) -> bool {
    matches!(
      self,
      NodeKind::Answer
        | NodeKind::IfElse
        | NodeKind::QuestionClassifier
        | NodeKind::Iteration
        | NodeKind::Loop
    )
  }
}

impl fmt::Display for NodeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What the pipeline does when a node fails inside an active iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationErrorPolicy {
  /// Report the failure and keep the iteration live.
  #[default]
  Continue,
  /// Report the failure, record the iteration as failed, and ignore any
  /// further events for it.
  Abort,
}
