//! Streaming response generation.
//!
//! [`GenerationStream`] wraps a [`ChatBackend`] with the policies the
//! conversation loop needs: adaptive response length, a single retry on
//! transient failures, cooperative cancellation between fragments, and a
//! [`TokenEvent`] on the bus for every fragment.

pub mod backend;
pub mod error;
pub mod message;
pub mod openai;
pub mod sse;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::bus::events::TokenEvent;
use crate::bus::{Event, EventBus};
use crate::config::LlmConfig;
use crate::response::ResponseTicket;

pub use backend::{ChatBackend, ChatChunk, ChatRequest, ChatStream};
pub use error::LlmError;
pub use message::{Message, Role};
pub use openai::OpenAiChatBackend;

const SOURCE: &str = "llm";

/// Lifecycle of the most recent generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Idle,
    Generating,
    Completed,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    pub total_tokens: u64,
    pub generations: u64,
    pub avg_tokens: f64,
}

/// Input for one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    /// Explicit cap. `None` applies the adaptive policy.
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// The raw user utterance for the adaptive policy. Falls back to the
    /// last user message.
    pub utterance: Option<String>,
    /// Response this generation belongs to. Token events are guarded by it
    /// and carry its id.
    pub ticket: Option<ResponseTicket>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
            utterance: None,
            ticket: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_utterance(mut self, utterance: impl Into<String>) -> Self {
        self.utterance = Some(utterance.into());
        self
    }

    pub fn with_ticket(mut self, ticket: ResponseTicket) -> Self {
        self.ticket = Some(ticket);
        self
    }
}

/// Collected output of [`GenerationStream::generate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub content: String,
    pub tokens_generated: usize,
    pub generation_time_ms: f64,
    pub finish_reason: String,
    pub was_cancelled: bool,
}

struct Inner {
    bus: EventBus,
    backend: Arc<dyn ChatBackend>,
    config: LlmConfig,
    state: Mutex<GenerationState>,
    cancel: Mutex<Arc<AtomicBool>>,
    next_id: AtomicU64,
    total_tokens: AtomicU64,
    generations: AtomicU64,
}

impl Inner {
    fn set_state(&self, state: GenerationState) {
        *lock(&self.state) = state;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Records stats when a generation ends, however it ends. A stream dropped
/// mid-flight (its task aborted) counts as cancelled.
struct Finish {
    inner: Arc<Inner>,
    tokens: u64,
    started: Instant,
}

impl Drop for Finish {
    fn drop(&mut self) {
        self.inner.total_tokens.fetch_add(self.tokens, Ordering::Relaxed);
        self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let mut state = lock(&self.inner.state);
        if *state == GenerationState::Generating {
            *state = GenerationState::Cancelled;
        }
        debug!(
            "generated {} fragments in {:.0}ms ({:?})",
            self.tokens,
            self.started.elapsed().as_secs_f64() * 1000.0,
            *state
        );
    }
}

/// Streaming generation client. Clones share state and stats.
#[derive(Clone)]
pub struct GenerationStream {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl GenerationStream {
    pub fn new(bus: EventBus, backend: Arc<dyn ChatBackend>, config: LlmConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                backend,
                config,
                state: Mutex::new(GenerationState::Idle),
                cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
                next_id: AtomicU64::new(1),
                total_tokens: AtomicU64::new(0),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> GenerationState {
        *lock(&self.inner.state)
    }

    pub fn stats(&self) -> GenerationStats {
        let total_tokens = self.inner.total_tokens.load(Ordering::Relaxed);
        let generations = self.inner.generations.load(Ordering::Relaxed);
        GenerationStats {
            total_tokens,
            generations,
            avg_tokens: if generations == 0 {
                0.0
            } else {
                total_tokens as f64 / generations as f64
            },
        }
    }

    /// Stop the current generation at its next fragment boundary.
    pub fn cancel(&self) {
        lock(&self.inner.cancel).store(true, Ordering::SeqCst);
    }

    /// Token cap for `utterance` under the adaptive policy.
    ///
    /// Very short utterances containing a trigger word ("yes", "thanks") get
    /// the short cap; utterances up to the medium word count get at most the
    /// medium cap; everything else gets the default.
    pub fn adaptive_max_tokens(&self, utterance: &str) -> u32 {
        let config = &self.inner.config;
        let policy = &config.adaptive;
        if !policy.enabled {
            return config.max_tokens;
        }
        let lowered = utterance.to_lowercase();
        let words = lowered.split_whitespace().count();
        if words <= policy.short_max_words
            && policy.short_triggers.iter().any(|t| lowered.contains(t.as_str()))
        {
            return policy.short_max_tokens;
        }
        if words <= policy.medium_max_words {
            return config.max_tokens.min(policy.medium_max_tokens);
        }
        config.max_tokens
    }

    fn build_request(&self, request: &GenerationRequest) -> ChatRequest {
        let config = &self.inner.config;
        let max_tokens = request.max_tokens.unwrap_or_else(|| {
            let utterance = request.utterance.as_deref().unwrap_or_else(|| {
                request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default()
            });
            self.adaptive_max_tokens(utterance)
        });
        ChatRequest {
            messages: request.messages.clone(),
            max_tokens,
            temperature: request.temperature.unwrap_or(config.temperature),
            top_p: config.top_p,
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
        }
    }

    /// Stream response fragments.
    ///
    /// Each fragment is also published as a [`TokenEvent`], followed by a
    /// terminal `is_last` event on completion. A retryable failure before
    /// any fragment was produced is retried once after a fixed backoff; a
    /// failure after output has started is returned, since a retry would
    /// repeat text already handed to speech. Cancellation ends the stream
    /// without an error.
    pub fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> impl Stream<Item = Result<String, LlmError>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let chat_request = self.build_request(&request);
        let ticket = request.ticket;
        let generation_id = ticket
            .as_ref()
            .map(ResponseTicket::id)
            .unwrap_or_else(|| inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancelled = Arc::new(AtomicBool::new(false));
        *lock(&inner.cancel) = Arc::clone(&cancelled);
        inner.set_state(GenerationState::Generating);
        let backoff = Duration::from_millis(inner.config.retry_backoff_ms);

        async_stream::stream! {
            let mut finish = Finish {
                inner: Arc::clone(&inner),
                tokens: 0,
                started: Instant::now(),
            };
            let publish = |event: TokenEvent| {
                let event = Event::new(SOURCE, event.into());
                let event = match &ticket {
                    Some(t) => event.with_guard(t.clone()),
                    None => event,
                };
                inner.bus.publish(event);
            };

            let mut accumulated = String::new();
            let mut index = 0usize;
            let mut finish_reason = None;
            let mut attempt = 0u32;

            'attempts: loop {
                attempt += 1;
                let failure = match inner.backend.stream_chat(&chat_request).await {
                    Err(e) => e,
                    Ok(mut chunks) => loop {
                        if cancelled.load(Ordering::SeqCst) {
                            inner.set_state(GenerationState::Cancelled);
                            return;
                        }
                        let next = chunks.next().await;
                        if cancelled.load(Ordering::SeqCst) {
                            inner.set_state(GenerationState::Cancelled);
                            return;
                        }
                        match next {
                            None => break 'attempts,
                            Some(Err(e)) => break e,
                            Some(Ok(chunk)) => {
                                if chunk.finish_reason.is_some() {
                                    finish_reason = chunk.finish_reason;
                                }
                                if chunk.text.is_empty() {
                                    continue;
                                }
                                accumulated.push_str(&chunk.text);
                                publish(TokenEvent {
                                    token: chunk.text.clone(),
                                    index,
                                    is_first: index == 0,
                                    is_last: false,
                                    accumulated: accumulated.clone(),
                                    finish_reason: None,
                                    generation_id,
                                });
                                index += 1;
                                finish.tokens += 1;
                                yield Ok(chunk.text);
                            }
                        }
                    },
                };

                if attempt == 1 && index == 0 && failure.is_retryable() {
                    warn!("generation failed (attempt 1/2): {failure}, retrying");
                    tokio::time::sleep(backoff).await;
                    if cancelled.load(Ordering::SeqCst) {
                        inner.set_state(GenerationState::Cancelled);
                        return;
                    }
                    continue 'attempts;
                }
                error!("generation failed: {failure}");
                inner.set_state(GenerationState::Error);
                yield Err(failure);
                return;
            }

            publish(TokenEvent {
                token: String::new(),
                index,
                is_first: index == 0,
                is_last: true,
                accumulated,
                finish_reason: Some(finish_reason.unwrap_or_else(|| "stop".to_owned())),
                generation_id,
            });
            inner.set_state(GenerationState::Completed);
        }
    }

    /// Collect a whole response. Cancellation is reported in the result, not
    /// as an error.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, LlmError> {
        let started = Instant::now();
        let mut content = String::new();
        let mut tokens_generated = 0;
        let mut stream = std::pin::pin!(self.generate_stream(request));
        while let Some(fragment) = stream.next().await {
            content.push_str(&fragment?);
            tokens_generated += 1;
        }
        let was_cancelled = self.state() == GenerationState::Cancelled;
        Ok(GenerationResult {
            content,
            tokens_generated,
            generation_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            finish_reason: if was_cancelled { "cancelled" } else { "stop" }.to_owned(),
            was_cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::bus::EventKind;
    use crate::bus::handler_fn;
    use crate::error::AgentError;
    use crate::response::ResponseIds;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays scripted attempts: each is either an immediate error or a
    /// list of chunk results.
    struct ScriptedBackend {
        attempts: Mutex<VecDeque<Result<Vec<Result<ChatChunk, LlmError>>, LlmError>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(
            attempts: Vec<Result<Vec<Result<ChatChunk, LlmError>>, LlmError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(attempts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self
                .attempts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::ProviderError("script exhausted".into())));
            next.map(|chunks| Box::pin(futures_util::stream::iter(chunks)) as ChatStream)
        }
    }

    fn words(parts: &[&str]) -> Vec<Result<ChatChunk, LlmError>> {
        let mut chunks: Vec<_> = parts.iter().map(|p| Ok(ChatChunk::text(*p))).collect();
        chunks.push(Ok(ChatChunk::finished("stop")));
        chunks
    }

    fn stream(backend: Arc<ScriptedBackend>, bus: EventBus) -> GenerationStream {
        let config = LlmConfig {
            retry_backoff_ms: 1,
            ..LlmConfig::default()
        };
        GenerationStream::new(bus, backend, config)
    }

    fn request(text: &str) -> GenerationRequest {
        GenerationRequest::new(vec![Message::system("sys"), Message::user(text)])
    }

    #[tokio::test]
    async fn fragments_stream_and_complete() {
        let backend = ScriptedBackend::new(vec![Ok(words(&["Your ", "bill ", "is $50."]))]);
        let generation = stream(Arc::clone(&backend), EventBus::default());

        let result = generation.generate(request("what is my bill")).await.unwrap();
        assert_eq!(result.content, "Your bill is $50.");
        assert_eq!(result.tokens_generated, 3);
        assert!(!result.was_cancelled);
        assert_eq!(generation.state(), GenerationState::Completed);
        assert_eq!(generation.stats().total_tokens, 3);
        assert_eq!(generation.stats().generations, 1);
    }

    #[tokio::test]
    async fn one_retry_before_output() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::RequestError("connection reset".into())),
            Ok(words(&["ok"])),
        ]);
        let generation = stream(Arc::clone(&backend), EventBus::default());
        let result = generation.generate(request("hello there friend")).await.unwrap();
        assert_eq!(result.content, "ok");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn second_failure_propagates() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::ProviderError("HTTP 503".into())),
            Err(LlmError::ProviderError("HTTP 503".into())),
        ]);
        let generation = stream(Arc::clone(&backend), EventBus::default());
        let err = generation.generate(request("hi")).await.unwrap_err();
        assert_eq!(err.code(), "PROVIDER_ERROR");
        assert_eq!(backend.calls(), 2);
        assert_eq!(generation.state(), GenerationState::Error);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::AuthError("bad key".into()))]);
        let generation = stream(Arc::clone(&backend), EventBus::default());
        assert!(generation.generate(request("hi")).await.is_err());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_is_not_retried() {
        let backend = ScriptedBackend::new(vec![
            Ok(vec![
                Ok(ChatChunk::text("Half a ")),
                Err(LlmError::StreamError("reset".into())),
            ]),
            Ok(words(&["never"])),
        ]);
        let generation = stream(Arc::clone(&backend), EventBus::default());
        let mut fragments = std::pin::pin!(generation.generate_stream(request("x")));
        assert_eq!(fragments.next().await.unwrap().unwrap(), "Half a ");
        assert!(fragments.next().await.unwrap().is_err());
        assert!(fragments.next().await.is_none());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_yielding_without_error() {
        let backend = ScriptedBackend::new(vec![Ok(words(&["one ", "two ", "three"]))]);
        let generation = stream(Arc::clone(&backend), EventBus::default());
        let mut fragments = std::pin::pin!(generation.generate_stream(request("x")));
        assert_eq!(fragments.next().await.unwrap().unwrap(), "one ");
        generation.cancel();
        assert!(fragments.next().await.is_none());
        assert_eq!(generation.state(), GenerationState::Cancelled);
    }

    #[tokio::test]
    async fn dropped_stream_counts_as_cancelled() {
        let backend = ScriptedBackend::new(vec![Ok(words(&["one ", "two"]))]);
        let generation = stream(Arc::clone(&backend), EventBus::default());
        {
            let mut fragments = std::pin::pin!(generation.generate_stream(request("x")));
            fragments.next().await;
        }
        assert_eq!(generation.state(), GenerationState::Cancelled);
        assert_eq!(generation.stats().total_tokens, 1);
    }

    #[test]
    fn adaptive_length_policy() {
        let generation = stream(ScriptedBackend::new(vec![]), EventBus::default());
        assert_eq!(generation.adaptive_max_tokens("yes please"), 80);
        assert_eq!(generation.adaptive_max_tokens("Thanks!"), 80);
        assert_eq!(generation.adaptive_max_tokens("what is my bill"), 200);
        let long = "could you please explain every single line item on my latest invoice";
        assert_eq!(generation.adaptive_max_tokens(long), 300);
    }

    #[tokio::test]
    async fn explicit_max_tokens_overrides_policy() {
        let backend = ScriptedBackend::new(vec![Ok(words(&["a"])), Ok(words(&["b"]))]);
        let generation = stream(Arc::clone(&backend), EventBus::default());
        generation
            .generate(request("yes").with_max_tokens(42))
            .await
            .unwrap();
        generation
            .generate(request("Context:\nlong text here\n\nCustomer: \"ok\"").with_utterance("ok"))
            .await
            .unwrap();
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].max_tokens, 42);
        assert_eq!(requests[1].max_tokens, 80);
    }

    #[tokio::test]
    async fn token_events_carry_ticket_id_and_terminal_marker() {
        let bus = EventBus::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            EventKind::Token,
            handler_fn(move |event| {
                let tx = tx.clone();
                async move {
                    if let Some(t) = event.as_token() {
                        let _ = tx.send(t.clone());
                    }
                    Ok::<(), AgentError>(())
                }
            }),
        );
        let ids = ResponseIds::new();
        let ticket = ids.issue();
        let backend = ScriptedBackend::new(vec![Ok(words(&["a", "b"]))]);
        let generation = stream(backend, bus.clone());
        generation
            .generate(request("x").with_ticket(ticket))
            .await
            .unwrap();
        assert_eq!(bus.queue_len(), 3);

        let runner = tokio::spawn({
            let bus = bus.clone();
            async move { bus.run().await }
        });
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        bus.stop();
        runner.await.unwrap();

        assert!(seen.iter().all(|t| t.generation_id == ids.current()));
        assert_eq!(seen[0].index, 0);
        assert!(seen[0].is_first);
        assert_eq!(seen[1].accumulated, "ab");
        assert!(seen[2].is_last);
        assert_eq!(seen[2].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn superseded_tokens_are_not_dispatched() {
        let bus = EventBus::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u64>();
        bus.subscribe(
            EventKind::Token,
            handler_fn(move |event| {
                let tx = tx.clone();
                async move {
                    if let Some(t) = event.as_token() {
                        let _ = tx.send(t.generation_id);
                    }
                    Ok::<(), AgentError>(())
                }
            }),
        );
        let ids = ResponseIds::new();
        let stale = ids.issue();
        let backend = ScriptedBackend::new(vec![Ok(words(&["old"]))]);
        let generation = stream(backend, bus.clone());
        generation
            .generate(request("x").with_ticket(stale))
            .await
            .unwrap();
        ids.advance();

        let runner = tokio::spawn({
            let bus = bus.clone();
            async move { bus.run().await }
        });
        assert!(bus.drain(Duration::from_secs(1)).await);
        bus.stop();
        runner.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
