//! Output moderation gate.

use flowcast_config::ModerationConfig;

/// Policy that can short-circuit the streamed answer.
///
/// The pipeline checks [`should_direct_output`](Self::should_direct_output)
/// before accepting each text delta. While it returns `false` the delta is
/// passed to [`append_new_token`](Self::append_new_token) and streamed.
pub trait OutputModeration: Send + Sync {
  fn should_direct_output(&self) -> bool;

  /// Answer that replaces everything streamed so far.
  fn final_output(&self) -> String;

  fn append_new_token(&mut self, text: &str);
}

/// Directs output to a preset response once a keyword shows up.
#[derive(Debug, Clone)]
pub struct KeywordModeration {
  keywords: Vec<String>,
  preset_response: String,
  buffer: String,
  flagged: bool,
}

impl KeywordModeration {
  pub fn new(config: &ModerationConfig) -> Self {
    Self {
      keywords: config
        .keywords
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .collect(),
      preset_response: config.preset_response.clone(),
      buffer: String::new(),
      flagged: false,
    }
  }
}

impl OutputModeration for KeywordModeration {
  fn should_direct_output(&self) -> bool {
    self.flagged
  }

  fn final_output(&self) -> String {
    self.preset_response.clone()
  }

  fn append_new_token(&mut self, text: &str) {
    if self.flagged {
      return;
    }
    self.buffer.push_str(&text.to_lowercase());
    // Keywords may straddle token boundaries, so match on the whole buffer.
    self.flagged = self
      .keywords
      .iter()
      .any(|keyword| self.buffer.contains(keyword.as_str()));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn moderation() -> KeywordModeration {
    KeywordModeration::new(&ModerationConfig {
      keywords: vec!["Secret".to_string(), " ".to_string()],
      preset_response: "I can't talk about that.".to_string(),
    })
  }

  #[test]
  fn test_flags_keyword_across_tokens() {
    let mut moderation = moderation();
    moderation.append_new_token("the sec");
    assert!(!moderation.should_direct_output());

    moderation.append_new_token("RET plan");
    assert!(moderation.should_direct_output());
    assert_eq!(moderation.final_output(), "I can't talk about that.");
  }

  #[test]
  fn test_blank_keywords_are_ignored() {
    let mut moderation = moderation();
    moderation.append_new_token("hello world");
    assert!(!moderation.should_direct_output());
  }
}
