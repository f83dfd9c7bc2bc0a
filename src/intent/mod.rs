//! Zero-latency intent classification and turn boundary tracking.
//!
//! The classifier subscribes to transcript events. Each transcript is matched
//! against an ordered pattern set; the confidence tier follows transcript
//! stability (partial → speculative, stable → likely, final → confirmed).
//! The first transcript of a turn publishes `Turn(UserSpeaking)` and a final
//! or end-of-turn transcript publishes `Turn(Processing)`.

pub mod entities;
pub mod patterns;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bus::events::{
    IntentConfidence, IntentEvent, TranscriptEvent, TranscriptKind, TurnEvent, TurnState,
};
use crate::bus::{Event, EventBus, EventHandler, EventKind, EventPayload, SubscriptionId};
use crate::config::IntentConfig;
use crate::error::Result;

use entities::EntityExtractor;
use patterns::CompiledPattern;

pub use patterns::{IntentPattern, ResponseStyle};

const SOURCE: &str = "intent";

/// Label used for substantive text that matched no pattern.
pub const GENERAL_QUERY: &str = "general_query";

#[derive(Debug)]
struct Tracking {
    turn_state: TurnState,
    turn_started: Option<Instant>,
    current_transcript: String,
    last_emitted: Option<(String, IntentConfidence)>,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            turn_state: TurnState::Idle,
            turn_started: None,
            current_transcript: String::new(),
            last_emitted: None,
        }
    }
}

impl Tracking {
    /// Emit only new labels or strictly higher tiers within a turn.
    fn should_emit(&self, intent: &IntentEvent) -> bool {
        match &self.last_emitted {
            None => true,
            Some((label, tier)) => *label != intent.intent || intent.confidence > *tier,
        }
    }
}

struct Inner {
    bus: EventBus,
    patterns: Vec<CompiledPattern>,
    entities: EntityExtractor,
    general_query_min_words: usize,
    tracking: Mutex<Tracking>,
    subscription: Mutex<Option<SubscriptionId>>,
}

/// Pattern-based intent classifier.
#[derive(Clone)]
pub struct IntentClassifier {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IntentClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentClassifier")
            .field("patterns", &self.inner.patterns.len())
            .finish()
    }
}

impl IntentClassifier {
    /// Compile the configured patterns and entity rules.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Intent`](crate::error::AgentError::Intent) if any
    /// regex fails to compile.
    pub fn new(bus: EventBus, config: &IntentConfig) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .cloned()
            .map(CompiledPattern::compile)
            .collect::<Result<Vec<_>>>()?;
        let entities = EntityExtractor::new(&config.entity_rules)?;
        Ok(Self {
            inner: Arc::new(Inner {
                bus,
                patterns,
                entities,
                general_query_min_words: config.general_query_min_words,
                tracking: Mutex::new(Tracking::default()),
                subscription: Mutex::new(None),
            }),
        })
    }

    /// Subscribe to transcript events.
    pub fn start(&self) {
        let mut subscription = lock(&self.inner.subscription);
        if subscription.is_none() {
            let handler: Arc<dyn EventHandler> = self.inner.clone();
            *subscription = Some(self.inner.bus.subscribe(EventKind::Transcript, handler));
            info!("intent classifier started ({} patterns)", self.inner.patterns.len());
        }
    }

    pub fn stop(&self) {
        if let Some(id) = lock(&self.inner.subscription).take() {
            self.inner.bus.unsubscribe(EventKind::Transcript, id);
            info!("intent classifier stopped");
        }
    }

    /// Classify `text` at the given tier without publishing anything.
    pub fn detect(&self, text: &str, confidence: IntentConfidence) -> Option<IntentEvent> {
        self.inner.detect(text, confidence)
    }

    /// Return to idle, forgetting the current turn.
    pub fn reset(&self) {
        *lock(&self.inner.tracking) = Tracking::default();
    }

    pub fn turn_state(&self) -> TurnState {
        lock(&self.inner.tracking).turn_state
    }

    pub fn current_transcript(&self) -> String {
        lock(&self.inner.tracking).current_transcript.clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn tier_for(kind: TranscriptKind) -> IntentConfidence {
    match kind {
        TranscriptKind::Partial => IntentConfidence::Speculative,
        TranscriptKind::Stable => IntentConfidence::Likely,
        TranscriptKind::Final | TranscriptKind::Endpoint => IntentConfidence::Confirmed,
    }
}

impl Inner {
    fn detect(&self, text: &str, confidence: IntentConfidence) -> Option<IntentEvent> {
        // Strictly greater: ties go to the first registered pattern.
        let best = self.patterns.iter().fold(None::<&CompiledPattern>, |best, p| {
            let better = best.is_none_or(|b| p.spec.priority > b.spec.priority);
            if better && p.matches(text) { Some(p) } else { best }
        });

        let entities = self.entities.extract(text);
        if let Some(pattern) = best {
            return Some(IntentEvent {
                intent: pattern.spec.name.clone(),
                confidence,
                entities,
                keywords: pattern.spec.keywords.iter().take(3).cloned().collect(),
                requires_retrieval: pattern.spec.requires_retrieval,
                suggested_response: pattern.spec.response_style.as_str().to_owned(),
                transcript_text: text.to_owned(),
            });
        }

        (text.split_whitespace().count() >= self.general_query_min_words).then(|| IntentEvent {
            intent: GENERAL_QUERY.to_owned(),
            confidence,
            entities,
            keywords: Vec::new(),
            requires_retrieval: true,
            suggested_response: ResponseStyle::Informational.as_str().to_owned(),
            transcript_text: text.to_owned(),
        })
    }

    fn classify(&self, transcript: &TranscriptEvent) -> Vec<EventPayload> {
        let text = transcript.text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut tracking = lock(&self.tracking);
        tracking.current_transcript = text.to_owned();

        if tracking.turn_state == TurnState::Idle {
            tracking.turn_state = TurnState::UserSpeaking;
            tracking.turn_started = Some(Instant::now());
            tracking.last_emitted = None;
            out.push(TurnEvent::new(TurnState::UserSpeaking, TurnState::Idle).into());
        }

        if let Some(intent) = self.detect(text, tier_for(transcript.kind)) {
            if tracking.should_emit(&intent) {
                debug!("intent detected: {} ({:?})", intent.intent, intent.confidence);
                tracking.last_emitted = Some((intent.intent.clone(), intent.confidence));
                out.push(intent.into());
            }
        }

        if transcript.is_final() || transcript.is_end_of_turn {
            let duration = tracking
                .turn_started
                .map(|t| t.elapsed())
                .unwrap_or_default();
            out.push(
                TurnEvent {
                    user_transcript: text.to_owned(),
                    duration,
                    ..TurnEvent::new(TurnState::Processing, tracking.turn_state)
                }
                .into(),
            );
            tracking.turn_state = TurnState::Idle;
            tracking.turn_started = None;
        }
        out
    }
}

#[async_trait]
impl EventHandler for Inner {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let Some(transcript) = event.as_transcript() else {
            return Ok(());
        };
        for payload in self.classify(transcript) {
            self.bus.publish(Event::new(SOURCE, payload));
        }
        Ok(())
    }
}
