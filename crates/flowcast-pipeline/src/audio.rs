//! Audio side-channel.
//!
//! A background worker turns answer fragments into audio. Fragments are
//! buffered until a sentence terminator shows up, then each sentence is handed
//! to the [`SpeechSynthesizer`]. The consumption loop polls the worker without
//! blocking; once the end marker is published the worker flushes the
//! remainder and reports [`AudioPoll::Finished`].

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CollaboratorError;

const SENTENCE_TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// Text-to-speech backend.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
  async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// Result of a non-blocking poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPoll {
  /// Base64-encoded audio.
  Chunk(String),
  Finished,
  Pending,
}

enum AudioMessage {
  Chunk(String),
  Finished,
}

/// Handle to the audio worker.
pub struct AudioPublisher {
  input: Option<mpsc::Sender<String>>,
  output: mpsc::UnboundedReceiver<AudioMessage>,
  handle: JoinHandle<()>,
}

impl AudioPublisher {
  /// Spawn the worker. `capacity` bounds the fragments waiting for synthesis.
  pub fn spawn(synthesizer: Arc<dyn SpeechSynthesizer>, voice: String, capacity: usize) -> Self {
    let (input, input_rx) = mpsc::channel(capacity.max(1));
    let (output_tx, output) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_worker(synthesizer, voice, input_rx, output_tx));

    Self {
      input: Some(input),
      output,
      handle,
    }
  }

  /// Enqueue a fragment. `None` is the end marker.
  pub fn publish(&mut self, fragment: Option<String>) {
    let Some(fragment) = fragment else {
      // Dropping the sender lets the worker drain what is queued, then stop.
      self.input = None;
      return;
    };
    let Some(input) = &self.input else {
      return;
    };

    match input.try_send(fragment) {
      Ok(()) => {}
      Err(TrySendError::Full(_)) => {
        warn!("audio_queue_full, fragment ignored");
      }
      Err(TrySendError::Closed(_)) => {
        debug!("audio_worker_gone, fragment ignored");
      }
    }
  }

  pub fn poll(&mut self) -> AudioPoll {
    match self.output.try_recv() {
      Ok(AudioMessage::Chunk(audio)) => AudioPoll::Chunk(audio),
      Ok(AudioMessage::Finished) => AudioPoll::Finished,
      Err(TryRecvError::Empty) => AudioPoll::Pending,
      // The worker exited, either after finishing or by panicking.
      Err(TryRecvError::Disconnected) => AudioPoll::Finished,
    }
  }
}

impl Drop for AudioPublisher {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

async fn run_worker(
  synthesizer: Arc<dyn SpeechSynthesizer>,
  voice: String,
  mut input: mpsc::Receiver<String>,
  output: mpsc::UnboundedSender<AudioMessage>,
) {
  let mut buffer = String::new();

  while let Some(fragment) = input.recv().await {
    buffer.push_str(&fragment);
    while let Some(end) = sentence_end(&buffer) {
      let sentence: String = buffer.drain(..end).collect();
      synthesize_into(synthesizer.as_ref(), &voice, &sentence, &output).await;
    }
  }

  synthesize_into(synthesizer.as_ref(), &voice, &buffer, &output).await;
  let _ = output.send(AudioMessage::Finished);
}

async fn synthesize_into(
  synthesizer: &dyn SpeechSynthesizer,
  voice: &str,
  text: &str,
  output: &mpsc::UnboundedSender<AudioMessage>,
) {
  let text = text.trim();
  if text.is_empty() {
    return;
  }

  match synthesizer.synthesize(text, voice).await {
    Ok(audio) if audio.is_empty() => {}
    Ok(audio) => {
      let _ = output.send(AudioMessage::Chunk(STANDARD.encode(audio)));
    }
    Err(e) => {
      warn!(error = %e, "speech_synthesis_failed, sentence ignored");
    }
  }
}

/// Byte offset just past the first sentence terminator.
fn sentence_end(text: &str) -> Option<usize> {
  text
    .char_indices()
    .find(|(_, c)| SENTENCE_TERMINATORS.contains(c))
    .map(|(index, c)| index + c.len_utf8())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;
  use std::time::Duration;

  /// Records every sentence and echoes it back as audio bytes.
  #[derive(Default)]
  struct EchoSynthesizer {
    sentences: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>, CollaboratorError> {
      self.sentences.lock().unwrap().push(text.to_string());
      if text.contains("fail") {
        return Err(CollaboratorError::Failed("synthesis failed".to_string()));
      }
      Ok(text.as_bytes().to_vec())
    }
  }

  async fn drain(publisher: &mut AudioPublisher) -> Vec<String> {
    let mut chunks = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
      match publisher.poll() {
        AudioPoll::Chunk(audio) => chunks.push(audio),
        AudioPoll::Finished => return chunks,
        AudioPoll::Pending => {
          assert!(tokio::time::Instant::now() < deadline, "audio worker never finished");
          tokio::time::sleep(Duration::from_millis(5)).await;
        }
      }
    }
  }

  #[test]
  fn test_sentence_end() {
    assert_eq!(sentence_end("Hello. World"), Some(6));
    assert_eq!(sentence_end("你好。世界"), Some("你好。".len()));
    assert_eq!(sentence_end("no terminator"), None);
  }

  #[tokio::test]
  async fn test_sentences_are_synthesized_in_order() {
    let synthesizer = Arc::new(EchoSynthesizer::default());
    let mut publisher = AudioPublisher::spawn(synthesizer.clone(), "alloy".to_string(), 16);

    publisher.publish(Some("Hello wor".to_string()));
    publisher.publish(Some("ld! How are".to_string()));
    publisher.publish(Some(" you".to_string()));
    publisher.publish(None);

    let chunks = drain(&mut publisher).await;
    assert_eq!(
      *synthesizer.sentences.lock().unwrap(),
      vec!["Hello world!".to_string(), "How are you".to_string()]
    );
    assert_eq!(chunks, vec![STANDARD.encode("Hello world!"), STANDARD.encode("How are you")]);
  }

  #[tokio::test]
  async fn test_synthesis_failures_are_skipped() {
    let synthesizer = Arc::new(EchoSynthesizer::default());
    let mut publisher = AudioPublisher::spawn(synthesizer, "alloy".to_string(), 16);

    publisher.publish(Some("This will fail. This works.".to_string()));
    publisher.publish(None);

    assert_eq!(drain(&mut publisher).await, vec![STANDARD.encode("This works.")]);
  }

  #[tokio::test]
  async fn test_poll_is_pending_before_end_marker() {
    let synthesizer = Arc::new(EchoSynthesizer::default());
    let mut publisher = AudioPublisher::spawn(synthesizer, "alloy".to_string(), 16);
    assert_eq!(publisher.poll(), AudioPoll::Pending);

    publisher.publish(None);
    assert!(drain(&mut publisher).await.is_empty());
    // Stays finished once the worker is gone.
    assert_eq!(publisher.poll(), AudioPoll::Finished);
  }
}
