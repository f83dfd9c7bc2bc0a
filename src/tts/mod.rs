//! Speech output: chunked synthesis with cooperative and forceful stop.
//!
//! A response is split into sentence-aligned chunks, each wrapped in speech
//! markup and played through a [`SpeechSynthesizer`]. Only one `speak` runs at
//! a time. While a chunk plays, the stop flag (and the caller's response
//! ticket, if any) is polled; on a stop the in-flight call is aborted and the
//! speak ends as [`SpeakOutcome::Interrupted`], which callers must not retry.

pub mod chunking;
pub mod ssml;
pub mod synthesizer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::events::SpeechChunkEvent;
use crate::bus::{Event, EventBus};
use crate::config::TtsConfig;
use crate::response::ResponseTicket;
use crate::stt::barge_in::SpeakingFlag;

pub use chunking::split_text;
pub use ssml::build_ssml;
pub use synthesizer::SpeechSynthesizer;

const SOURCE: &str = "tts";

/// Playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsState {
    Idle,
    Speaking,
    /// A stop was requested; cleared by the next `speak`.
    Stopped,
}

/// How a `speak` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakOutcome {
    /// Every chunk played.
    Completed,
    /// Stopped, or the response was superseded. Not an error.
    Interrupted,
    /// A chunk failed twice; the remaining chunks were skipped.
    Failed,
}

impl SpeakOutcome {
    pub fn is_completed(self) -> bool {
        self == Self::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkResult {
    Played,
    Cancelled,
    Error,
}

struct Inner {
    bus: EventBus,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    config: TtsConfig,
    speak_lock: tokio::sync::Mutex<()>,
    stop_requested: AtomicBool,
    /// `true` once audio has fully stopped.
    audio_stopped: watch::Sender<bool>,
    speaking: SpeakingFlag,
    state: Mutex<TtsState>,
    synthesis_id: Mutex<String>,
    spoken: Mutex<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Speech output handle. Clones share playback state.
#[derive(Clone)]
pub struct SpeechOutputStream {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SpeechOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechOutputStream")
            .field("voice", &self.inner.config.voice)
            .field("state", &self.state())
            .finish()
    }
}

/// Restores idle state when a speak ends, however it ends.
struct Playback<'a> {
    inner: &'a Inner,
    finished: bool,
}

impl Drop for Playback<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // The speak future was dropped while a chunk was playing.
            self.inner.synthesizer.abort();
        }
        self.inner.speaking.set(false);
        {
            let mut state = lock(&self.inner.state);
            if *state == TtsState::Speaking {
                *state = TtsState::Idle;
            }
        }
        self.inner.audio_stopped.send_replace(true);
    }
}

impl SpeechOutputStream {
    /// `speaking` is raised for the duration of each `speak` so the speech
    /// input side knows when to watch for barge-in.
    pub fn new(
        bus: EventBus,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        config: TtsConfig,
        speaking: SpeakingFlag,
    ) -> Self {
        let (audio_stopped, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                bus,
                synthesizer,
                config,
                speak_lock: tokio::sync::Mutex::new(()),
                stop_requested: AtomicBool::new(false),
                audio_stopped,
                speaking,
                state: Mutex::new(TtsState::Idle),
                synthesis_id: Mutex::new(String::new()),
                spoken: Mutex::new(String::new()),
            }),
        }
    }

    /// Speak `text` to completion or until stopped.
    pub async fn speak(&self, text: &str) -> SpeakOutcome {
        self.speak_for(text, None).await
    }

    /// Speak on behalf of a response. Once `ticket` goes stale the call ends
    /// as [`SpeakOutcome::Interrupted`] at the next poll.
    pub async fn speak_for(&self, text: &str, ticket: Option<&ResponseTicket>) -> SpeakOutcome {
        if text.trim().is_empty() {
            return SpeakOutcome::Completed;
        }
        let inner = &*self.inner;

        let mut stopped = inner.audio_stopped.subscribe();
        // The sender lives in `inner`, so this cannot observe a closed channel.
        let _ = stopped.wait_for(|stopped| *stopped).await;
        let _serial = inner.speak_lock.lock().await;

        if ticket.is_some_and(ResponseTicket::is_stale) {
            debug!("response superseded before speech started");
            return SpeakOutcome::Interrupted;
        }

        inner.audio_stopped.send_replace(false);
        let mut playback = Playback {
            inner,
            finished: false,
        };
        inner.stop_requested.store(false, Ordering::SeqCst);
        *lock(&inner.state) = TtsState::Speaking;
        inner.speaking.set(true);
        lock(&inner.spoken).clear();
        let synthesis_id = format!("tts_{}", chrono::Utc::now().timestamp_millis());
        *lock(&inner.synthesis_id) = synthesis_id.clone();

        let chunks = split_text(text, inner.config.max_chunk_chars);
        debug!("speaking {} chunk(s) as {synthesis_id}", chunks.len());
        let outcome = inner.play(&chunks, &synthesis_id, ticket).await;
        playback.finished = true;

        match outcome {
            SpeakOutcome::Completed => debug!("speech {synthesis_id} completed"),
            SpeakOutcome::Interrupted => info!("speech {synthesis_id} interrupted"),
            SpeakOutcome::Failed => error!("speech {synthesis_id} failed"),
        }
        outcome
    }

    /// Stop playback.
    ///
    /// The stop flag is always set. With `force`, the in-flight synthesis is
    /// also aborted (without waiting) and audio is reported as stopped at
    /// once, so a following `speak` does not wait on the interrupted one.
    pub fn stop(&self, force: bool) {
        let inner = &*self.inner;
        inner.stop_requested.store(true, Ordering::SeqCst);
        let was_speaking = {
            let mut state = lock(&inner.state);
            let was = *state == TtsState::Speaking;
            *state = TtsState::Stopped;
            was
        };
        if !force {
            return;
        }
        inner.synthesizer.abort();
        inner.speaking.set(false);
        inner.audio_stopped.send_replace(true);
        if was_speaking {
            let synthesis_id = lock(&inner.synthesis_id).clone();
            info!("speech {synthesis_id} force-stopped");
            inner.bus.publish(Event::new(
                SOURCE,
                SpeechChunkEvent {
                    text: String::new(),
                    is_first: false,
                    is_last: true,
                    synthesis_id,
                    duration_ms: 0,
                }
                .into(),
            ));
        }
    }

    /// Text whose playback has started during the current (or last) speak.
    pub fn spoken_text(&self) -> String {
        lock(&self.inner.spoken).clone()
    }

    /// Milliseconds since the current speak began, or 0 when silent.
    pub fn playback_position_ms(&self) -> u64 {
        self.inner.speaking.elapsed_ms()
    }

    pub fn is_speaking(&self) -> bool {
        self.state() == TtsState::Speaking
    }

    pub fn state(&self) -> TtsState {
        *lock(&self.inner.state)
    }
}

impl Inner {
    fn should_stop(&self, ticket: Option<&ResponseTicket>) -> bool {
        self.stop_requested.load(Ordering::SeqCst) || ticket.is_some_and(ResponseTicket::is_stale)
    }

    async fn play(
        &self,
        chunks: &[String],
        synthesis_id: &str,
        ticket: Option<&ResponseTicket>,
    ) -> SpeakOutcome {
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            if self.should_stop(ticket) {
                return SpeakOutcome::Interrupted;
            }
            {
                let mut spoken = lock(&self.spoken);
                if !spoken.is_empty() {
                    spoken.push(' ');
                }
                spoken.push_str(chunk);
            }

            let markup = build_ssml(chunk, &self.config);
            let started = Instant::now();
            let mut result = self.synth_chunk(&markup, ticket).await;
            if result == ChunkResult::Error {
                warn!("chunk {i} of {synthesis_id} failed, retrying once");
                tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
                if self.should_stop(ticket) {
                    return SpeakOutcome::Interrupted;
                }
                result = self.synth_chunk(&markup, ticket).await;
            }

            match result {
                ChunkResult::Played => {
                    let duration_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    self.bus.publish(Event::new(
                        SOURCE,
                        SpeechChunkEvent {
                            text: chunk.clone(),
                            is_first: i == 0,
                            is_last: i == last,
                            synthesis_id: synthesis_id.to_owned(),
                            duration_ms,
                        }
                        .into(),
                    ));
                }
                ChunkResult::Cancelled => return SpeakOutcome::Interrupted,
                ChunkResult::Error => {
                    error!("chunk {i} of {synthesis_id} failed after retry, skipping the rest");
                    return SpeakOutcome::Failed;
                }
            }
        }
        SpeakOutcome::Completed
    }

    async fn synth_chunk(&self, markup: &str, ticket: Option<&ResponseTicket>) -> ChunkResult {
        if self.should_stop(ticket) {
            return ChunkResult::Cancelled;
        }
        let speak = self.synthesizer.speak_markup(markup);
        tokio::pin!(speak);
        let deadline = tokio::time::sleep(Duration::from_millis(self.config.chunk_timeout_ms));
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                result = &mut speak => {
                    return match result {
                        Ok(()) => ChunkResult::Played,
                        // An abort usually surfaces as an error from the synthesizer.
                        Err(_) if self.should_stop(ticket) => ChunkResult::Cancelled,
                        Err(e) => {
                            warn!("synthesis error: {e}");
                            ChunkResult::Error
                        }
                    };
                }
                () = &mut deadline => {
                    self.synthesizer.abort();
                    warn!("synthesis timed out after {} ms", self.config.chunk_timeout_ms);
                    return ChunkResult::Error;
                }
                _ = poll.tick() => {
                    if self.should_stop(ticket) {
                        self.synthesizer.abort();
                        return ChunkResult::Cancelled;
                    }
                }
            }
        }
    }
}
