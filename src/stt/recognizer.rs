//! Speech recognizer boundary.
//!
//! Vendor recognizers deliver results on their own callback threads. Adapters
//! push them into a [`RecognizerSink`], which hands them to the async pump in
//! [`SpeechInputStream`](super::SpeechInputStream).

use tokio::sync::mpsc;

use crate::error::Result;

/// One result from a continuous recognizer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    /// Interim hypothesis for the utterance in progress.
    Partial(String),
    /// Final text for one utterance.
    Final {
        text: String,
        confidence: Option<f32>,
    },
    /// The recognizer cancelled the session, e.g. on a transport error.
    Canceled { reason: String, is_error: bool },
    /// The recognizer session ended.
    SessionStopped,
}

/// Silence and language settings handed to the recognizer on start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizerSettings {
    pub language: String,
    pub end_silence_ms: u32,
    pub initial_silence_ms: u32,
    pub min_speech_ms: u32,
}

/// Thread-safe handle for pushing recognizer results. Cheap to clone and
/// usable from any thread.
#[derive(Debug, Clone)]
pub struct RecognizerSink {
    tx: mpsc::UnboundedSender<RecognizerEvent>,
}

impl RecognizerSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<RecognizerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once the input stream has shut down.
    pub fn push(&self, event: RecognizerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn partial(&self, text: impl Into<String>) -> bool {
        self.push(RecognizerEvent::Partial(text.into()))
    }

    pub fn final_text(&self, text: impl Into<String>, confidence: Option<f32>) -> bool {
        self.push(RecognizerEvent::Final {
            text: text.into(),
            confidence,
        })
    }
}

/// A continuous-mode speech recognizer.
pub trait SpeechRecognizer: Send + Sync {
    /// Begin continuous recognition, pushing results into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the recognizer cannot be started.
    fn start(&self, settings: &RecognizerSettings, sink: RecognizerSink) -> Result<()>;

    /// End recognition. Further results are not expected.
    fn stop(&self);

    /// Suspend delivery without tearing the session down.
    fn pause(&self) {}

    fn resume(&self) {}
}
