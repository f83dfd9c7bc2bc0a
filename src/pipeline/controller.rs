//! Conversation controller: the state machine that owns a session.
//!
//! The controller subscribes to transcripts, intents, retrieval results, turn
//! boundaries and barge-in signals. Each turn gets at most one response task
//! (retrieval, generation, speech) stamped with a fresh response ticket.
//! Barge-in engages both cancellation tiers at once: the ticket is
//! invalidated and speech, the response task and generation are stopped
//! forcefully.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::Backends;
use super::state::ConversationState;
use crate::bus::events::{
    BargeInEvent, IntentEvent, RetrievalEvent, TranscriptEvent, TurnEvent, TurnState,
};
use crate::bus::{BusStats, Event, EventBus, EventHandler, EventKind, EventPayload, SubscriptionId};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::intent::IntentClassifier;
use crate::llm::{GenerationRequest, GenerationStats, GenerationStream};
use crate::memory::LayeredMemory;
use crate::response::{ResponseIds, ResponseTicket};
use crate::retrieval::{RetrievalEngine, RetrievalStats};
use crate::stt::{SpeakingFlag, SpeechInputStream};
use crate::tts::{SpeakOutcome, SpeechOutputStream};

const SUBSCRIBED: [EventKind; 5] = [
    EventKind::Transcript,
    EventKind::Intent,
    EventKind::Retrieval,
    EventKind::Turn,
    EventKind::BargeIn,
];

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Words that may ride along with a greeting without asking anything.
const GREETING_COURTESIES: &[&str] = &[
    "there", "again", "everyone", "all", "good", "morning", "afternoon", "evening", "day",
];

/// Snapshot of a session for observability consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: ConversationState,
    pub turn_count: u64,
    pub session_topics: Vec<String>,
    pub retrieval: RetrievalStats,
    pub generation: GenerationStats,
    pub bus: BusStats,
}

/// What a response task says.
#[derive(Debug)]
enum Reply {
    /// Retrieve, generate and speak.
    Generated,
    /// Speak fixed text, then keep listening.
    Canned(String),
    /// Speak fixed text, then end the session.
    Farewell(String),
}

struct Inner {
    config: AgentConfig,
    bus: EventBus,
    stt: SpeechInputStream,
    intent: IntentClassifier,
    retrieval: RetrievalEngine,
    llm: GenerationStream,
    tts: SpeechOutputStream,
    memory: LayeredMemory,
    ids: ResponseIds,
    state: watch::Sender<ConversationState>,
    /// Bumped on every transcript; the idle timer watches it.
    activity: watch::Sender<u64>,
    greeted: AtomicBool,
    response_started: AtomicBool,
    /// Incremented at each turn start so a late response cannot finalize a
    /// turn that is no longer the one it answered.
    turn_seq: AtomicU64,
    turn_started: Mutex<Option<Instant>>,
    response_task: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<(EventKind, SubscriptionId)>>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// True when `text` is only greeting words, e.g. "hello there" but not
/// "hi, what is my balance".
fn is_bare_greeting(text: &str, keywords: &[String]) -> bool {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect();
    let greeting_words: Vec<String> = keywords
        .iter()
        .flat_map(|k| k.split_whitespace())
        .map(str::to_lowercase)
        .collect();
    normalized.split_whitespace().all(|word| {
        greeting_words.iter().any(|g| g == word) || GREETING_COURTESIES.contains(&word)
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns one voice conversation session.
#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConversationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationController")
            .field("state", &self.state())
            .field("turns", &self.turn_count())
            .finish()
    }
}

impl ConversationController {
    /// Build every component on a fresh bus.
    ///
    /// # Errors
    ///
    /// Returns a config error if `config` fails validation (missing
    /// credentials, zero limits) or the intent pattern set does not compile.
    pub fn new(config: AgentConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new(&config.bus);
        let speaking = SpeakingFlag::new();
        let stt = SpeechInputStream::new(
            bus.clone(),
            backends.recognizer,
            config.stt.clone(),
            &config.barge_in,
            config.speech.language.clone(),
            speaking.clone(),
        );
        let intent = IntentClassifier::new(bus.clone(), &config.intent)?;
        let retrieval = RetrievalEngine::new(
            bus.clone(),
            backends.embedder,
            backends.vectors,
            &config.retrieval,
        );
        let llm = GenerationStream::new(bus.clone(), backends.chat, config.llm.clone());
        let tts = SpeechOutputStream::new(
            bus.clone(),
            backends.synthesizer,
            config.tts.clone(),
            speaking,
        );
        let memory = LayeredMemory::new(&config.memory);
        let (state, _) = watch::channel(ConversationState::Initializing);
        let (activity, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                bus,
                stt,
                intent,
                retrieval,
                llm,
                tts,
                memory,
                ids: ResponseIds::new(),
                state,
                activity,
                greeted: AtomicBool::new(false),
                response_started: AtomicBool::new(false),
                turn_seq: AtomicU64::new(0),
                turn_started: Mutex::new(None),
                response_task: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Start every component, greet if configured, and begin listening.
    ///
    /// # Errors
    ///
    /// Returns an error (and enters [`ConversationState::Error`]) if speech
    /// recognition cannot start.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Pipeline("conversation already started".into()));
        }
        info!("starting conversation");

        {
            let handler: Arc<dyn EventHandler> = Arc::new(ControllerHandler(Arc::clone(inner)));
            let mut subscriptions = lock(&inner.subscriptions);
            for kind in SUBSCRIBED {
                let id = inner.bus.subscribe(kind, Arc::clone(&handler));
                subscriptions.push((kind, id));
            }
        }
        inner.intent.start();
        inner.retrieval.start();
        let bus = inner.bus.clone();
        inner.tasks.spawn(async move { bus.run().await });

        if let Err(e) = inner.stt.start() {
            error!("speech input failed to start: {e}");
            inner.force_state(ConversationState::Error);
            return Err(e);
        }
        inner.transition(ConversationState::Ready);

        if inner.config.controller.auto_greet {
            inner.greeted.store(true, Ordering::SeqCst);
            inner.transition(ConversationState::Responding);
            inner.tts.speak(&inner.config.controller.greeting_text).await;
        }
        inner.transition_when(
            |s| matches!(s, ConversationState::Ready | ConversationState::Responding),
            ConversationState::Listening,
        );
        *lock(&inner.turn_started) = Some(Instant::now());

        let timer = Arc::clone(inner);
        inner.tasks.spawn(async move { timer.run_idle_timer().await });
        info!("conversation listening");
        Ok(())
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping conversation");
        inner.transition(ConversationState::Ending);
        inner.shutdown.cancel();
        inner.ids.advance();
        inner.tts.stop(true);
        inner.abort_response();
        inner.llm.cancel();
        inner.stt.stop();
        inner.intent.stop();
        inner.retrieval.stop().await;
        for (kind, id) in lock(&inner.subscriptions).drain(..) {
            inner.bus.unsubscribe(kind, id);
        }
        inner.bus.stop();
        inner.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, inner.tasks.wait())
            .await
            .is_err()
        {
            warn!("conversation tasks still running after {SHUTDOWN_GRACE:?}");
        }
        info!(
            "conversation stopped after {} turn(s)",
            inner.memory.turn_count()
        );
    }

    /// Resolve once the session reaches a terminal state, returning it.
    pub async fn wait_for_completion(&self) -> ConversationState {
        let mut state = self.inner.state.subscribe();
        match state.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            Err(_) => self.state(),
        }
    }

    pub fn state(&self) -> ConversationState {
        *self.inner.state.borrow()
    }

    pub fn turn_count(&self) -> u64 {
        self.inner.memory.turn_count()
    }

    pub fn session_topics(&self) -> Vec<String> {
        self.inner.memory.session_topics()
    }

    /// Whether a response task for the current turn is still running.
    pub fn response_in_flight(&self) -> bool {
        lock(&self.inner.response_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            turn_count: self.turn_count(),
            session_topics: self.session_topics(),
            retrieval: self.inner.retrieval.stats(),
            generation: self.inner.llm.stats(),
            bus: self.inner.bus.stats(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn memory(&self) -> &LayeredMemory {
        &self.inner.memory
    }

    pub fn speech_input(&self) -> &SpeechInputStream {
        &self.inner.stt
    }

    pub fn speech_output(&self) -> &SpeechOutputStream {
        &self.inner.tts
    }
}

// ── Event handling ────────────────────────────────────────────

struct ControllerHandler(Arc<Inner>);

#[async_trait]
impl EventHandler for ControllerHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let inner = &self.0;
        if inner.state().is_terminal() {
            return Ok(());
        }
        match &event.payload {
            EventPayload::Transcript(t) => inner.on_transcript(t).await,
            EventPayload::Intent(i) => inner.on_intent(i).await,
            EventPayload::Retrieval(r) => inner.on_retrieval(r).await,
            EventPayload::Turn(t) => inner.on_turn(t).await,
            EventPayload::BargeIn(b) => inner.on_barge_in(b).await,
            EventPayload::Token(_) | EventPayload::SpeechChunk(_) => {}
        }
        Ok(())
    }
}

impl Inner {
    fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// Move to `next` unless the session already ended.
    fn transition(&self, next: ConversationState) {
        self.transition_when(|_| true, next);
    }

    fn transition_when(&self, allowed: impl Fn(ConversationState) -> bool, next: ConversationState) {
        self.state.send_if_modified(|state| {
            if *state == next || state.is_terminal() || !allowed(*state) {
                return false;
            }
            debug!("conversation {state} -> {next}");
            *state = next;
            true
        });
    }

    fn force_state(&self, next: ConversationState) {
        self.state.send_replace(next);
    }

    fn abort_response(&self) {
        if let Some(task) = lock(&self.response_task).take() {
            task.abort();
        }
    }

    fn turn_elapsed(&self) -> Duration {
        let started = *lock(&self.turn_started);
        started.map_or(Duration::ZERO, |t| t.elapsed())
    }

    async fn on_transcript(&self, transcript: &TranscriptEvent) {
        self.memory
            .update_transcript(&transcript.text, transcript.is_final())
            .await;
        self.activity.send_modify(|n| *n = n.wrapping_add(1));
        if transcript.is_final() {
            self.transition_when(
                |s| s == ConversationState::Listening,
                ConversationState::Processing,
            );
        }
    }

    async fn on_intent(self: &Arc<Self>, intent: &IntentEvent) {
        let confirmed = intent.is_confirmed();
        self.memory
            .update_intent(&intent.intent, confirmed, &intent.entities)
            .await;
        if !confirmed {
            return;
        }
        let controller = &self.config.controller;
        match intent.intent.as_str() {
            "farewell" => {
                info!("farewell detected, ending conversation");
                self.start_response(Reply::Farewell(controller.farewell_text.clone()));
            }
            "greeting" if !self.greeted.swap(true, Ordering::SeqCst) => {
                if is_bare_greeting(&intent.transcript_text, &intent.keywords) {
                    self.start_response(Reply::Canned(controller.greeting_reply.clone()));
                } else {
                    debug!("greeting carries a request, leaving it to generation");
                }
            }
            _ => {}
        }
    }

    async fn on_retrieval(&self, retrieval: &RetrievalEvent) {
        if !retrieval.result.has_results() {
            return;
        }
        let context = retrieval
            .result
            .format_context(self.config.retrieval.context_token_budget);
        debug!(
            "context ready: {} document(s), speculative={}",
            retrieval.result.documents.len(),
            retrieval.speculative
        );
        self.memory.update_context(&context).await;
    }

    async fn on_turn(self: &Arc<Self>, turn: &TurnEvent) {
        match turn.state {
            TurnState::UserSpeaking => {
                self.turn_seq.fetch_add(1, Ordering::SeqCst);
                self.memory.start_turn().await;
                self.response_started.store(false, Ordering::SeqCst);
                *lock(&self.turn_started) = Some(Instant::now());
            }
            TurnState::Processing => {
                if !turn.user_transcript.is_empty() {
                    self.memory.update_transcript(&turn.user_transcript, true).await;
                }
                self.start_response(Reply::Generated);
            }
            _ => {}
        }
    }

    /// Barge-in runs inside the immediate dispatch, ahead of anything queued.
    async fn on_barge_in(&self, barge_in: &BargeInEvent) {
        info!(
            "barge-in ({}) at {}ms: {:?}",
            barge_in.trigger, barge_in.playback_position_ms, barge_in.user_text
        );
        self.transition(ConversationState::Interrupted);
        self.ids.advance();
        self.tts.stop(true);
        self.abort_response();
        self.llm.cancel();
        self.memory.update_context("").await;

        self.memory.update_spoken(&self.tts.spoken_text(), true).await;
        let turn = self.memory.end_turn().await;
        debug!("interrupted turn recorded: {:?}", turn.agent_text);

        self.response_started.store(false, Ordering::SeqCst);
        *lock(&self.turn_started) = Some(Instant::now());
        self.transition(ConversationState::Listening);
    }

    /// Spawn this turn's response task unless one already started.
    fn start_response(self: &Arc<Self>, reply: Reply) {
        if self.response_started.swap(true, Ordering::SeqCst) {
            debug!("response already started for this turn");
            return;
        }
        let ticket = self.ids.issue();
        let turn = self.turn_seq.load(Ordering::SeqCst);
        debug!("response {} started", ticket.id());
        let inner = Arc::clone(self);
        let task = self
            .tasks
            .spawn(async move { inner.respond(ticket, turn, reply).await });
        *lock(&self.response_task) = Some(task);
    }

    async fn respond(&self, ticket: ResponseTicket, turn: u64, reply: Reply) {
        if ticket.is_stale() {
            return;
        }
        self.transition(ConversationState::Processing);
        let result = match &reply {
            Reply::Generated => self.generate(&ticket).await,
            Reply::Canned(text) | Reply::Farewell(text) => Ok(Some(text.clone())),
        };
        let response = match result {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => {
                if ticket.is_stale() {
                    debug!("response {} superseded: {e}", ticket.id());
                    return;
                }
                error!("response {} failed: {e}", ticket.id());
                self.transition(ConversationState::Responding);
                self.tts
                    .speak_for(&self.config.controller.apology_text, Some(&ticket))
                    .await;
                if ticket.is_current() {
                    self.transition(ConversationState::Listening);
                }
                return;
            }
        };

        if ticket.is_stale() {
            return;
        }
        self.memory.update_generation(&response).await;
        self.transition(ConversationState::Responding);
        match self.tts.speak_for(&response, Some(&ticket)).await {
            SpeakOutcome::Interrupted => return,
            SpeakOutcome::Failed => warn!("response {} was not fully spoken", ticket.id()),
            SpeakOutcome::Completed => {}
        }
        if ticket.is_stale() {
            return;
        }
        self.memory.update_spoken(&self.tts.spoken_text(), false).await;

        if self.turn_seq.load(Ordering::SeqCst) == turn {
            let finished = self.memory.end_turn().await;
            info!(
                "turn finished in {:?} (intent={:?})",
                self.turn_elapsed(),
                finished.intent
            );
            self.memory.update_context("").await;
        } else {
            debug!("newer turn started, not recording response {}", ticket.id());
        }

        match reply {
            Reply::Farewell(_) => self.transition(ConversationState::Ending),
            Reply::Generated | Reply::Canned(_) => {
                self.transition(ConversationState::Listening);
            }
        }
    }

    /// Retrieval (when no context arrived yet) and streaming generation.
    /// `Ok(None)` means the response was superseded along the way.
    async fn generate(&self, ticket: &ResponseTicket) -> Result<Option<String>> {
        let working = self.memory.working().snapshot().await;
        let user_text = working.user_text().to_owned();

        if working.retrieval_context.is_empty() && !user_text.trim().is_empty() {
            let timeout = Duration::from_millis(self.config.controller.retrieval_timeout_ms);
            let result = self.retrieval.retrieve_with_timeout(&user_text, timeout).await;
            if result.has_results() && ticket.is_current() {
                let context = result.format_context(self.config.retrieval.context_token_budget);
                self.memory.update_context(&context).await;
            }
        }
        if ticket.is_stale() {
            debug!("response {} superseded before generation", ticket.id());
            return Ok(None);
        }

        let messages = self
            .memory
            .build_messages(&self.config.controller.system_prompt, None, None)
            .await;
        let mut request = GenerationRequest::new(messages)
            .with_utterance(user_text)
            .with_ticket(ticket.clone());
        if self.config.controller.max_response_tokens > 0 {
            request = request.with_max_tokens(self.config.controller.max_response_tokens);
        }

        let mut stream = std::pin::pin!(self.llm.generate_stream(request));
        let mut response = String::new();
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            if ticket.is_stale() {
                debug!("response {} superseded during generation", ticket.id());
                return Ok(None);
            }
            response.push_str(&fragment);
            self.memory.update_generation(&response).await;
        }
        if ticket.is_stale() {
            return Ok(None);
        }
        if response.trim().is_empty() {
            return Err(AgentError::Llm("empty response".into()));
        }
        Ok(Some(response))
    }

    async fn run_idle_timer(&self) {
        let timeout = Duration::from_secs(self.config.controller.no_speech_timeout_s);
        if timeout.is_zero() {
            return;
        }
        let mut activity = self.activity.subscribe();
        let mut prompted = false;
        loop {
            let timed_out = tokio::select! {
                () = self.shutdown.cancelled() => return,
                changed = activity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    false
                }
                () = tokio::time::sleep(timeout) => true,
            };
            let state = self.state();
            if state.is_terminal() {
                return;
            }
            if !timed_out {
                prompted = false;
                continue;
            }
            if state != ConversationState::Listening {
                continue;
            }
            if !prompted {
                info!("no speech for {timeout:?}, prompting");
                prompted = true;
                self.tts.speak(&self.config.controller.idle_prompt_text).await;
                continue;
            }
            info!("still no speech, ending conversation");
            self.tts.speak(&self.config.controller.idle_goodbye_text).await;
            let spoke_meanwhile = activity.has_changed().unwrap_or(true);
            if self.state() == ConversationState::Listening && !spoke_meanwhile {
                self.transition(ConversationState::Ending);
                return;
            }
            prompted = false;
        }
    }
}
