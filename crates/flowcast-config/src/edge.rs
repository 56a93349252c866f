use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
  pub from: String,
  pub to: String,
  /// Branch handle on the source node (e.g. `"true"` for an if-else branch).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_handle: Option<String>,
}
