use serde::{Deserialize, Serialize};

use crate::enums::NodeKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  pub node_id: String,
  #[serde(default)]
  pub title: String,
  #[serde(flatten)]
  pub node_type: NodeType,
  /// The iteration or loop node this node is nested in, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub iteration_id: Option<String>,
}

impl NodeDef {
  pub fn kind(&self) -> NodeKind {
    self.node_type.kind()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeType {
  /// Entry point of the graph.
  Start,
  End,
  /// Emits `answer` to the client. The template mixes literal text with
  /// `{{#node_id.field#}}` variable references.
  Answer {
    answer: String,
  },
  Llm,
  IfElse,
  QuestionClassifier,
  Iteration {
    /// First node of the iteration body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_node_id: Option<String>,
    /// Selector of the list being iterated.
    #[serde(default)]
    iterator_selector: Vec<String>,
  },
  IterationStart,
  Loop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_node_id: Option<String>,
  },
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

impl NodeType {
  pub fn kind(&self) -> NodeKind {
    match self {
      NodeType::Start => NodeKind::Start,
      NodeType::End => NodeKind::End,
      NodeType::Answer { .. } => NodeKind::Answer,
      NodeType::Llm => NodeKind::Llm,
      NodeType::IfElse => NodeKind::IfElse,
      NodeType::QuestionClassifier => NodeKind::QuestionClassifier,
      NodeType::Iteration { .. } => NodeKind::Iteration,
      NodeType::IterationStart => NodeKind::IterationStart,
      NodeType::Loop { .. } => NodeKind::Loop,
      NodeType::LoopStart => NodeKind::LoopStart,
      NodeType::KnowledgeRetrieval => NodeKind::KnowledgeRetrieval,
      NodeType::Code => NodeKind::Code,
      NodeType::TemplateTransform => NodeKind::TemplateTransform,
      NodeType::HttpRequest => NodeKind::HttpRequest,
      NodeType::Tool => NodeKind::Tool,
      NodeType::VariableAggregator => NodeKind::VariableAggregator,
      NodeType::ParameterExtractor => NodeKind::ParameterExtractor,
      NodeType::Other => NodeKind::Other,
    }
  }

  /// The declared body start node for iteration and loop nodes.
  pub fn start_node_id(&self) -> Option<&str> {
    match self {
      NodeType::Iteration { start_node_id, .. } | NodeType::Loop { start_node_id } => {
        start_node_id.as_deref()
      }
      _ => None,
    }
  }
}
