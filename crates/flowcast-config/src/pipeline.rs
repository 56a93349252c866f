//! Per-run pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enums::IterationErrorPolicy;

/// Configuration for one pipeline invocation.
///
/// Every field has a default so a partial JSON file (or `{}`) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Text-to-speech settings. The audio side-channel runs only when this is
  /// set and `auto_play` is enabled.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tts: Option<TtsConfig>,
  /// How long to keep draining audio after the main stream ends.
  pub audio_drain_timeout_ms: u64,
  /// Sleep between audio polls while draining.
  pub audio_poll_interval_ms: u64,
  /// Capacity of the audio worker's input queue.
  pub audio_queue_capacity: usize,
  /// Bound on waiting for the message-level end event after the workflow
  /// finished. `None` waits indefinitely.
  pub finalize_timeout_ms: Option<u64>,
  /// Bound on joining the conversation naming task at loop exit.
  pub naming_join_timeout_ms: u64,
  /// Generate a conversation name for new conversations.
  pub auto_generate_name: bool,
  pub iteration_error_policy: IterationErrorPolicy,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub moderation: Option<ModerationConfig>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      tts: None,
      audio_drain_timeout_ms: 5_000,
      audio_poll_interval_ms: 20,
      audio_queue_capacity: 256,
      finalize_timeout_ms: Some(30_000),
      naming_join_timeout_ms: 2_000,
      auto_generate_name: true,
      iteration_error_policy: IterationErrorPolicy::default(),
      moderation: None,
    }
  }
}

impl PipelineConfig {
  pub fn tts_enabled(&self) -> bool {
    self.tts.as_ref().is_some_and(|tts| tts.auto_play)
  }

  pub fn audio_drain_timeout(&self) -> Duration {
    Duration::from_millis(self.audio_drain_timeout_ms)
  }

  pub fn audio_poll_interval(&self) -> Duration {
    Duration::from_millis(self.audio_poll_interval_ms)
  }

  pub fn finalize_timeout(&self) -> Option<Duration> {
    self.finalize_timeout_ms.map(Duration::from_millis)
  }

  pub fn naming_join_timeout(&self) -> Duration {
    Duration::from_millis(self.naming_join_timeout_ms)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsConfig {
  pub voice: String,
  #[serde(default)]
  pub auto_play: bool,
}

/// Keyword-based output moderation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationConfig {
  pub keywords: Vec<String>,
  pub preset_response: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config: PipelineConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, PipelineConfig::default());
    assert!(!config.tts_enabled());
    assert_eq!(config.audio_drain_timeout(), Duration::from_secs(5));
    assert_eq!(config.finalize_timeout(), Some(Duration::from_secs(30)));
  }

  #[test]
  fn test_tts_requires_auto_play() {
    let config: PipelineConfig =
      serde_json::from_str(r#"{"tts": {"voice": "alloy"}}"#).unwrap();
    assert!(!config.tts_enabled());

    let config: PipelineConfig =
      serde_json::from_str(r#"{"tts": {"voice": "alloy", "auto_play": true}}"#).unwrap();
    assert!(config.tts_enabled());
  }

  #[test]
  fn test_partial_config_overrides() {
    let config: PipelineConfig = serde_json::from_str(
      r#"{"iteration_error_policy": "abort", "finalize_timeout_ms": null}"#,
    )
    .unwrap();
    assert_eq!(config.iteration_error_policy, IterationErrorPolicy::Abort);
    assert_eq!(config.finalize_timeout(), None);
    assert_eq!(config.audio_poll_interval_ms, 20);
  }
}
