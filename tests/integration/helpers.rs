//! Shared fakes and harness for integration tests.
//!
//! Every external service a conversation talks to is replaced by an
//! in-process double: speech is fed through the recognizer sink, synthesis
//! is recorded, completions are scripted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley::config::AgentConfig;
use parley::llm::{ChatBackend, ChatChunk, ChatRequest, ChatStream, LlmError};
use parley::pipeline::Backends;
use parley::retrieval::{Document, EmbeddingProvider, InMemoryVectorStore};
use parley::stt::{RecognizerSettings, RecognizerSink, SpeechRecognizer};
use parley::tts::SpeechSynthesizer;
use parley::tts::ssml::strip_markup;
use parley::{AgentError, ConversationController};
use tokio::sync::Notify;

/// Config for fast, deterministic sessions: no greeting, no idle timer.
pub(crate) fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.llm.api_key = Some("test-key".into());
    config.llm.retry_backoff_ms = 1;
    config.controller.auto_greet = false;
    config.controller.no_speech_timeout_s = 0;
    config.controller.retrieval_timeout_ms = 2_000;
    config.tts.poll_interval_ms = 10;
    config.tts.retry_backoff_ms = 1;
    config
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ── Recognizer ────────────────────────────────────────────────

/// Hands its sink to the test so speech can be injected.
#[derive(Default)]
pub(crate) struct ScriptedRecognizer {
    sink: Mutex<Option<RecognizerSink>>,
}

impl ScriptedRecognizer {
    fn sink(&self) -> RecognizerSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("recognizer not started")
    }

    pub(crate) fn partial(&self, text: &str) {
        assert!(self.sink().partial(text));
    }

    pub(crate) fn final_text(&self, text: &str) {
        assert!(self.sink().final_text(text, Some(0.95)));
    }

    /// A partial followed by its final, as a short utterance arrives.
    pub(crate) fn say(&self, text: &str) {
        self.partial(text);
        self.final_text(text);
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn start(&self, _settings: &RecognizerSettings, sink: RecognizerSink) -> parley::Result<()> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&self) {}
}

// ── Synthesizer ───────────────────────────────────────────────

/// Holds each chunk for `chunk_delay` and records what started and finished.
pub(crate) struct RecordingSynthesizer {
    chunk_delay: Duration,
    started: Mutex<Vec<String>>,
    played: Mutex<Vec<String>>,
    aborts: AtomicUsize,
    aborted: Notify,
}

impl RecordingSynthesizer {
    pub(crate) fn new(chunk_delay: Duration) -> Self {
        Self {
            chunk_delay,
            started: Mutex::new(Vec::new()),
            played: Mutex::new(Vec::new()),
            aborts: AtomicUsize::new(0),
            aborted: Notify::new(),
        }
    }

    pub(crate) fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub(crate) fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub(crate) fn played_text(&self) -> String {
        self.played().join(" ")
    }

    pub(crate) fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn speak_markup(&self, markup: &str) -> parley::Result<()> {
        let text = strip_markup(markup);
        self.started.lock().unwrap().push(text.clone());
        tokio::select! {
            () = tokio::time::sleep(self.chunk_delay) => {
                self.played.lock().unwrap().push(text);
                Ok(())
            }
            () = self.aborted.notified() => Err(AgentError::Tts("aborted".into())),
        }
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.aborted.notify_waiters();
    }
}

// ── Chat ──────────────────────────────────────────────────────

pub(crate) enum ScriptedReply {
    Text(Vec<&'static str>),
    Fail(LlmError),
}

/// Replies from a script, then "Okay." once the script runs out.
#[derive(Default)]
pub(crate) struct ScriptedChat {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub(crate) fn push(&self, reply: ScriptedReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn reply_with(&self, fragments: Vec<&'static str>) {
        self.push(ScriptedReply::Text(fragments));
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedReply::Text(vec!["Okay."]));
        match reply {
            ScriptedReply::Fail(e) => Err(e),
            ScriptedReply::Text(fragments) => {
                let mut chunks: Vec<Result<ChatChunk, LlmError>> =
                    fragments.into_iter().map(|f| Ok(ChatChunk::text(f))).collect();
                chunks.push(Ok(ChatChunk::finished("stop")));
                Ok(Box::pin(futures_util::stream::iter(chunks)))
            }
        }
    }
}

// ── Retrieval ─────────────────────────────────────────────────

const DIMENSIONS: usize = 32;

/// Hashed bag-of-words vectors: texts sharing words score closer.
#[derive(Default)]
pub(crate) struct BagOfWordsEmbedder {
    calls: AtomicUsize,
}

impl BagOfWordsEmbedder {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for BagOfWordsEmbedder {
    fn embed(&self, text: &str) -> parley::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vector = vec![0.0; DIMENSIONS];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            let slot = word.bytes().map(usize::from).sum::<usize>() % DIMENSIONS;
            vector[slot] += 1.0;
        }
        Ok(vector)
    }
}

pub(crate) const BILLING_DOC: &str =
    "Your balance is shown on the first page of every invoice.";
pub(crate) const ROAMING_DOC: &str = "Roaming packages cover data in forty countries.";

fn knowledge(embedder: &BagOfWordsEmbedder) -> InMemoryVectorStore {
    let store = InMemoryVectorStore::new();
    for (text, source) in [(BILLING_DOC, "billing-faq"), (ROAMING_DOC, "packages")] {
        let embedding = embedder.embed(text).unwrap();
        store.insert(Document::new(text).with_source(source), embedding);
    }
    store
}

// ── Session ───────────────────────────────────────────────────

pub(crate) struct Session {
    pub(crate) controller: ConversationController,
    pub(crate) recognizer: Arc<ScriptedRecognizer>,
    pub(crate) synth: Arc<RecordingSynthesizer>,
    pub(crate) chat: Arc<ScriptedChat>,
    pub(crate) embedder: Arc<BagOfWordsEmbedder>,
}

/// Build (but do not start) a controller over fresh fakes.
pub(crate) fn session(config: AgentConfig, chunk_delay: Duration) -> Session {
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let synth = Arc::new(RecordingSynthesizer::new(chunk_delay));
    let chat = Arc::new(ScriptedChat::default());
    let embedder = Arc::new(BagOfWordsEmbedder::default());
    let vectors = Arc::new(knowledge(&embedder));
    let backends = Backends {
        recognizer: Arc::clone(&recognizer) as Arc<dyn SpeechRecognizer>,
        synthesizer: Arc::clone(&synth) as Arc<dyn SpeechSynthesizer>,
        chat: Arc::clone(&chat) as Arc<dyn ChatBackend>,
        embedder: Arc::clone(&embedder) as Arc<dyn EmbeddingProvider>,
        vectors,
    };
    let controller = ConversationController::new(config, backends).expect("build controller");
    Session {
        controller,
        recognizer,
        synth,
        chat,
        embedder,
    }
}

/// Build and start a session with default test settings.
pub(crate) async fn started_session(chunk_delay: Duration) -> Session {
    let session = session(test_config(), chunk_delay);
    session.controller.start().await.expect("start session");
    session
}
