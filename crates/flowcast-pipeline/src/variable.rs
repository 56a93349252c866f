//! Conversion of resolved variable values into streamable answer text.

use serde::Deserialize;
use serde_json::Value;

/// Marker carried by serialized file objects.
const FILE_MODEL_IDENTITY: &str = "__file__";

/// A file reference as it appears in node outputs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileValue {
  #[serde(rename = "type", default)]
  pub file_type: String,
  #[serde(default)]
  pub filename: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
}

impl FileValue {
  /// Parse a file object. Returns `None` for anything that is not one.
  pub fn from_value(value: &Value) -> Option<Self> {
    let identity = value.get("model_identity")?.as_str()?;
    if identity != FILE_MODEL_IDENTITY {
      return None;
    }
    serde_json::from_value(value.clone()).ok()
  }

  /// Markdown reference: an inline image for images, a link otherwise.
  pub fn to_markdown(&self) -> String {
    let url = self.url.as_deref().unwrap_or_default();
    if self.file_type == "image" {
      format!("![{}]({url})", self.filename.as_deref().unwrap_or_default())
    } else {
      format!("[{}]({url})", self.filename.as_deref().unwrap_or(url))
    }
  }
}

/// Render a value as answer text. `None` means there is nothing to emit.
pub fn value_to_text(value: &Value) -> Option<String> {
  match value {
    Value::Null => None,
    Value::String(text) if text.is_empty() => None,
    Value::String(text) => Some(text.clone()),
    Value::Number(number) => Some(number.to_string()),
    Value::Bool(flag) => Some(flag.to_string()),
    Value::Array(items) if items.is_empty() => None,
    Value::Array(items) => {
      let files: Vec<_> = items.iter().filter_map(FileValue::from_value).collect();
      if files.len() == items.len() {
        Some(
          files
            .iter()
            .map(FileValue::to_markdown)
            .collect::<Vec<_>>()
            .join(" "),
        )
      } else {
        Some(value.to_string())
      }
    }
    Value::Object(_) => match FileValue::from_value(value) {
      Some(file) => Some(file.to_markdown()),
      None => Some(value.to_string()),
    },
  }
}

/// Follow `path` through nested objects.
pub fn lookup_path(value: &Value, path: &[String]) -> Option<Value> {
  path
    .iter()
    .try_fold(value, |current, key| current.get(key.as_str()))
    .cloned()
}

/// File objects found among the top-level output values.
pub fn collect_files(outputs: &Value) -> Vec<Value> {
  let Some(outputs) = outputs.as_object() else {
    return Vec::new();
  };

  let mut files = Vec::new();
  for value in outputs.values() {
    match value {
      Value::Array(items) => files.extend(
        items
          .iter()
          .filter(|item| FileValue::from_value(item).is_some())
          .cloned(),
      ),
      _ if FileValue::from_value(value).is_some() => files.push(value.clone()),
      _ => {}
    }
  }
  files
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn image() -> Value {
    json!({
      "model_identity": "__file__",
      "type": "image",
      "filename": "cat.png",
      "url": "https://files.example/cat.png"
    })
  }

  fn document() -> Value {
    json!({
      "model_identity": "__file__",
      "type": "document",
      "filename": "report.pdf",
      "url": "https://files.example/report.pdf"
    })
  }

  #[test]
  fn test_scalars_stringify() {
    assert_eq!(value_to_text(&json!(42)).as_deref(), Some("42"));
    assert_eq!(value_to_text(&json!("42")).as_deref(), Some("42"));
    assert_eq!(value_to_text(&json!(1.5)).as_deref(), Some("1.5"));
    assert_eq!(value_to_text(&json!(false)).as_deref(), Some("false"));
  }

  #[test]
  fn test_empty_values_emit_nothing() {
    assert_eq!(value_to_text(&Value::Null), None);
    assert_eq!(value_to_text(&json!("")), None);
    assert_eq!(value_to_text(&json!([])), None);
  }

  #[test]
  fn test_file_renders_markdown() {
    assert_eq!(
      value_to_text(&image()).as_deref(),
      Some("![cat.png](https://files.example/cat.png)")
    );
    assert_eq!(
      value_to_text(&document()).as_deref(),
      Some("[report.pdf](https://files.example/report.pdf)")
    );
  }

  #[test]
  fn test_file_list_joins_with_spaces() {
    assert_eq!(
      value_to_text(&json!([image(), document()])).as_deref(),
      Some("![cat.png](https://files.example/cat.png) [report.pdf](https://files.example/report.pdf)")
    );
  }

  #[test]
  fn test_composites_serialize_as_json() {
    assert_eq!(
      value_to_text(&json!({"a": 1})).as_deref(),
      Some(r#"{"a":1}"#)
    );
    assert_eq!(
      value_to_text(&json!([1, image()])).as_deref(),
      Some(json!([1, image()]).to_string().as_str())
    );
  }

  #[test]
  fn test_lookup_path() {
    let outputs = json!({"result": {"text": "hi"}});
    assert_eq!(
      lookup_path(&outputs, &["result".to_string(), "text".to_string()]),
      Some(json!("hi"))
    );
    assert_eq!(lookup_path(&outputs, &["missing".to_string()]), None);
    assert_eq!(lookup_path(&outputs, &[]), Some(outputs.clone()));
  }

  #[test]
  fn test_collect_files() {
    let outputs = json!({"files": [image(), {"not": "a file"}], "cover": document(), "text": "x"});
    let files = collect_files(&outputs);
    assert_eq!(files.len(), 2);
  }
}
