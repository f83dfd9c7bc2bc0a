//! Speech input: continuous recognition to transcript events.
//!
//! Recognizer callbacks are marshalled through a [`RecognizerSink`] into one
//! pump task, which shapes them into [`TranscriptEvent`]s on the bus. While
//! the agent is speaking, partials are also screened for barge-in; a trigger
//! is dispatched immediately, ahead of the partial that caused it.

pub mod barge_in;
pub mod recognizer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::events::{BargeInEvent, TranscriptEvent, TranscriptKind};
use crate::bus::{Event, EventBus};
use crate::config::{BargeInConfig, SttConfig};
use crate::error::Result;

pub use barge_in::{BargeInDetector, SpeakingFlag};
pub use recognizer::{RecognizerEvent, RecognizerSettings, RecognizerSink, SpeechRecognizer};

const SOURCE: &str = "stt";

struct Inner {
    bus: EventBus,
    recognizer: Arc<dyn SpeechRecognizer>,
    config: SttConfig,
    language: String,
    speaking: SpeakingFlag,
    barge_in_enabled: AtomicBool,
    detector: Mutex<BargeInDetector>,
    paused: AtomicBool,
    last_partial: Mutex<String>,
    transcript: Mutex<String>,
    pump: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Speech input handle. Clones share the recognizer session.
#[derive(Clone)]
pub struct SpeechInputStream {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SpeechInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechInputStream")
            .field("language", &self.inner.language)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SpeechInputStream {
    pub fn new(
        bus: EventBus,
        recognizer: Arc<dyn SpeechRecognizer>,
        config: SttConfig,
        barge_in: &BargeInConfig,
        language: impl Into<String>,
        speaking: SpeakingFlag,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                recognizer,
                config,
                language: language.into(),
                speaking,
                barge_in_enabled: AtomicBool::new(barge_in.enabled),
                detector: Mutex::new(BargeInDetector::new(barge_in)),
                paused: AtomicBool::new(false),
                last_partial: Mutex::new(String::new()),
                transcript: Mutex::new(String::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Start continuous recognition. Calling it again while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the recognizer refuses to start.
    pub fn start(&self) -> Result<()> {
        let mut pump = lock(&self.inner.pump);
        if pump.is_some() {
            return Ok(());
        }
        let (sink, rx) = RecognizerSink::channel();
        let settings = RecognizerSettings {
            language: self.inner.language.clone(),
            end_silence_ms: self.inner.config.end_silence_ms,
            initial_silence_ms: self.inner.config.initial_silence_ms,
            min_speech_ms: self.inner.config.min_speech_ms,
        };
        self.inner.recognizer.start(&settings, sink)?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_pump(Arc::clone(&self.inner), rx, cancel.clone()));
        *pump = Some((cancel, handle));
        self.inner.paused.store(false, Ordering::SeqCst);
        info!(
            "speech input started (language={}, end_silence={}ms)",
            self.inner.language, self.inner.config.end_silence_ms
        );
        Ok(())
    }

    /// Stop recognition and the pump task.
    pub fn stop(&self) {
        let pump = lock(&self.inner.pump).take();
        if let Some((cancel, _handle)) = pump {
            self.inner.recognizer.stop();
            cancel.cancel();
            info!("speech input stopped");
        }
    }

    /// Suspend transcript delivery. Results arriving while paused are dropped.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.recognizer.pause();
        debug!("speech input paused");
    }

    pub fn resume(&self) {
        self.inner.recognizer.resume();
        self.inner.paused.store(false, Ordering::SeqCst);
        debug!("speech input resumed");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.pump).is_some()
    }

    /// Tell the input side whether the agent is currently speaking.
    pub fn set_speaking(&self, speaking: bool) {
        self.inner.speaking.set(speaking);
    }

    pub fn enable_barge_in(&self, enabled: bool) {
        self.inner.barge_in_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            lock(&self.inner.detector).reset();
        }
    }

    /// Latest partial or final text for the utterance in progress.
    pub fn current_transcript(&self) -> String {
        lock(&self.inner.transcript).clone()
    }

    pub fn clear_transcript(&self) {
        lock(&self.inner.transcript).clear();
        lock(&self.inner.last_partial).clear();
    }

    /// Process one recognizer result in the caller's task, bypassing the sink.
    pub async fn handle(&self, event: RecognizerEvent) {
        self.inner.handle(event).await;
    }
}

async fn run_pump(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<RecognizerEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => inner.handle(event).await,
                None => {
                    debug!("recognizer sink closed");
                    break;
                }
            },
        }
    }
}

impl Inner {
    async fn handle(&self, event: RecognizerEvent) {
        match event {
            RecognizerEvent::Partial(text) => self.on_partial(text).await,
            RecognizerEvent::Final { text, confidence } => self.on_final(text, confidence),
            RecognizerEvent::Canceled { reason, is_error } => {
                if is_error {
                    error!("recognition canceled: {reason}");
                } else {
                    warn!("recognition canceled: {reason}");
                }
            }
            RecognizerEvent::SessionStopped => debug!("recognizer session stopped"),
        }
    }

    async fn on_partial(&self, text: String) {
        let text = text.trim().to_owned();
        if text.is_empty() || self.paused.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut last = lock(&self.last_partial);
            if *last == text {
                return;
            }
            last.clone_from(&text);
        }
        lock(&self.transcript).clone_from(&text);

        if self.barge_in_enabled.load(Ordering::SeqCst)
            && self.speaking.get()
            && lock(&self.detector).check(&text)
        {
            let position = self.speaking.elapsed_ms();
            info!("barge-in detected at {position}ms: {text:?}");
            self.bus
                .publish_immediate(Event::new(
                    SOURCE,
                    BargeInEvent {
                        trigger: "speech_detected".to_owned(),
                        user_text: text.clone(),
                        playback_position_ms: position,
                    }
                    .into(),
                ))
                .await;
        }

        let words = text.split_whitespace().count();
        let (kind, confidence) = if words >= self.config.stable_min_words {
            (TranscriptKind::Stable, self.config.stable_confidence)
        } else {
            (TranscriptKind::Partial, self.config.partial_confidence)
        };
        let mut event = TranscriptEvent::new(text, kind, confidence);
        event.language.clone_from(&self.language);
        self.bus.publish(Event::new(SOURCE, event.into()));
    }

    fn on_final(&self, text: String, confidence: Option<f32>) {
        lock(&self.last_partial).clear();
        let text = text.trim().to_owned();
        if text.is_empty() || self.paused.load(Ordering::SeqCst) {
            return;
        }
        lock(&self.transcript).clone_from(&text);
        debug!("final transcript: {text:?}");

        let confidence = confidence.unwrap_or(self.config.default_final_confidence);
        let mut event = TranscriptEvent::final_text(text, confidence);
        event.silence_duration_ms = self.config.end_silence_ms;
        event.language.clone_from(&self.language);
        self.bus.publish(Event::new(SOURCE, event.into()));
    }
}
