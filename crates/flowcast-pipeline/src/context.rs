use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable description of the request a pipeline serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationContext {
  pub task_id: String,
  pub app_id: String,
  pub user_id: String,
  pub conversation_id: String,
  pub message_id: String,
  pub query: String,
  #[serde(default)]
  pub inputs: Value,
  #[serde(default)]
  pub files: Vec<Value>,
  /// The conversation record does not exist yet.
  #[serde(default)]
  pub is_new_conversation: bool,
  pub created_at: DateTime<Utc>,
}

impl ApplicationContext {
  /// A fresh context with generated ids for a new conversation.
  pub fn new(app_id: impl Into<String>, user_id: impl Into<String>, query: impl Into<String>) -> Self {
    Self {
      task_id: uuid::Uuid::new_v4().to_string(),
      app_id: app_id.into(),
      user_id: user_id.into(),
      conversation_id: uuid::Uuid::new_v4().to_string(),
      message_id: uuid::Uuid::new_v4().to_string(),
      query: query.into(),
      inputs: Value::Object(Default::default()),
      files: Vec::new(),
      is_new_conversation: true,
      created_at: Utc::now(),
    }
  }

  /// Value of a `sys.*` variable.
  pub fn system_variable(&self, name: &str) -> Option<Value> {
    match name {
      "query" => Some(Value::String(self.query.clone())),
      "files" => Some(Value::Array(self.files.clone())),
      "conversation_id" => Some(Value::String(self.conversation_id.clone())),
      "user_id" => Some(Value::String(self.user_id.clone())),
      _ => None,
    }
  }

  /// Inputs recorded on the run: the user inputs plus the system variables.
  pub fn run_inputs(&self) -> Value {
    let mut inputs = match &self.inputs {
      Value::Object(map) => map.clone(),
      _ => Default::default(),
    };
    for name in ["query", "files", "conversation_id", "user_id"] {
      if let Some(value) = self.system_variable(name) {
        inputs.insert(format!("sys.{name}"), value);
      }
    }
    Value::Object(inputs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_system_variables() {
    let context = ApplicationContext::new("app", "user", "hello");
    assert_eq!(context.system_variable("query"), Some(json!("hello")));
    assert_eq!(context.system_variable("files"), Some(json!([])));
    assert_eq!(context.system_variable("user_id"), Some(json!("user")));
    assert_eq!(context.system_variable("unknown"), None);
  }

  #[test]
  fn test_run_inputs_include_system_variables() {
    let mut context = ApplicationContext::new("app", "user", "hello");
    context.inputs = json!({"topic": "rust"});

    let inputs = context.run_inputs();
    assert_eq!(inputs["topic"], "rust");
    assert_eq!(inputs["sys.query"], "hello");
  }
}
