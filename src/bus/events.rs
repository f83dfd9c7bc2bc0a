//! Event types carried on the [`EventBus`](super::EventBus).
//!
//! Every event is an [`Event`] envelope (id, creation instant, priority,
//! cancelled flag, source tag) around one [`EventPayload`] variant. Handlers
//! subscribe by [`EventKind`], the payload's tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::response::ResponseTicket;
use crate::retrieval::types::RetrievalResult;

/// Dispatch priority. Lower values are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Barge-in and other must-handle-now signals.
    Critical = 0,
    /// Intent and turn boundary signals.
    High = 1,
    /// Transcripts, retrieval results, tokens.
    Normal = 2,
    /// Background telemetry.
    Low = 3,
}

/// Tag identifying an [`EventPayload`] variant. Subscriptions are keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Transcript,
    Intent,
    Retrieval,
    Token,
    SpeechChunk,
    BargeIn,
    Turn,
}

// ── Transcript ────────────────────────────────────────────────

/// Stability of a transcript hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    /// Early hypothesis, likely to change.
    Partial,
    /// Partial long enough to act on speculatively.
    Stable,
    /// Recognizer's final result for an utterance.
    Final,
    /// Endpoint detected after silence.
    Endpoint,
}

/// Text recognized from the user's speech.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub kind: TranscriptKind,
    pub confidence: f32,
    pub is_end_of_turn: bool,
    pub silence_duration_ms: u32,
    pub language: String,
}

impl TranscriptEvent {
    /// A transcript with no end-of-turn flag and default language.
    pub fn new(text: impl Into<String>, kind: TranscriptKind, confidence: f32) -> Self {
        Self {
            text: text.into(),
            kind,
            confidence,
            is_end_of_turn: false,
            silence_duration_ms: 0,
            language: "en-US".to_owned(),
        }
    }

    /// A final, end-of-turn transcript.
    pub fn final_text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            is_end_of_turn: true,
            ..Self::new(text, TranscriptKind::Final, confidence)
        }
    }

    /// Whether the recognizer considers this utterance complete.
    pub fn is_final(&self) -> bool {
        matches!(self.kind, TranscriptKind::Final | TranscriptKind::Endpoint)
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    /// Whether the transcript carries enough signal to act on.
    pub fn is_actionable(&self) -> bool {
        self.is_final()
            || self.is_end_of_turn
            || (self.kind == TranscriptKind::Stable && self.word_count() >= 3)
    }
}

// ── Intent ────────────────────────────────────────────────────

/// Confidence tier of a detected intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentConfidence {
    /// From an unstable partial.
    Speculative,
    /// From a stable partial.
    Likely,
    /// From a final transcript.
    Confirmed,
}

/// An intent detected from a transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentEvent {
    pub intent: String,
    pub confidence: IntentConfidence,
    pub entities: HashMap<String, String>,
    pub keywords: Vec<String>,
    pub requires_retrieval: bool,
    pub suggested_response: String,
    pub transcript_text: String,
}

impl IntentEvent {
    pub fn is_confirmed(&self) -> bool {
        self.confidence == IntentConfidence::Confirmed
    }
}

// ── Retrieval ─────────────────────────────────────────────────

/// Documents retrieved for an intent.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalEvent {
    pub result: RetrievalResult,
    /// Triggered from a `Likely` intent rather than a confirmed one.
    pub speculative: bool,
}

// ── Generation ────────────────────────────────────────────────

/// One generated text fragment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEvent {
    pub token: String,
    pub index: usize,
    pub is_first: bool,
    pub is_last: bool,
    pub accumulated: String,
    pub finish_reason: Option<String>,
    pub generation_id: u64,
}

// ── Speech output ─────────────────────────────────────────────

/// Progress of speech synthesis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechChunkEvent {
    pub text: String,
    pub is_first: bool,
    pub is_last: bool,
    pub synthesis_id: String,
    pub duration_ms: u64,
}

// ── Barge-in ──────────────────────────────────────────────────

/// The user started speaking over the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BargeInEvent {
    pub trigger: String,
    /// What the user said that triggered the interruption.
    pub user_text: String,
    /// How far into agent playback the interruption landed.
    pub playback_position_ms: u64,
}

// ── Turn ──────────────────────────────────────────────────────

/// Conversational turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    UserSpeaking,
    UserPaused,
    Processing,
    AgentSpeaking,
    Interrupted,
}

/// Turn boundary signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnEvent {
    pub state: TurnState,
    pub previous_state: TurnState,
    pub user_transcript: String,
    pub agent_response: String,
    pub duration: Duration,
}

impl TurnEvent {
    pub fn new(state: TurnState, previous_state: TurnState) -> Self {
        Self {
            state,
            previous_state,
            user_transcript: String::new(),
            agent_response: String::new(),
            duration: Duration::ZERO,
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────

/// The closed set of event payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Transcript(TranscriptEvent),
    Intent(IntentEvent),
    Retrieval(RetrievalEvent),
    Token(TokenEvent),
    SpeechChunk(SpeechChunkEvent),
    BargeIn(BargeInEvent),
    Turn(TurnEvent),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Transcript(_) => EventKind::Transcript,
            Self::Intent(_) => EventKind::Intent,
            Self::Retrieval(_) => EventKind::Retrieval,
            Self::Token(_) => EventKind::Token,
            Self::SpeechChunk(_) => EventKind::SpeechChunk,
            Self::BargeIn(_) => EventKind::BargeIn,
            Self::Turn(_) => EventKind::Turn,
        }
    }

    /// Priority used when the publisher does not override it.
    pub fn default_priority(&self) -> EventPriority {
        match self {
            Self::BargeIn(_) => EventPriority::Critical,
            Self::Intent(_) | Self::Turn(_) => EventPriority::High,
            _ => EventPriority::Normal,
        }
    }
}

/// An event envelope.
#[derive(Debug)]
pub struct Event {
    /// Short unique id (8 hex chars).
    pub id: String,
    pub created_at: Instant,
    pub priority: EventPriority,
    /// Component that produced the event.
    pub source: &'static str,
    pub payload: EventPayload,
    cancelled: AtomicBool,
    guard: Option<ResponseTicket>,
}

impl Event {
    pub fn new(source: &'static str, payload: EventPayload) -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self {
            id,
            created_at: Instant::now(),
            priority: payload.default_priority(),
            source,
            payload,
            cancelled: AtomicBool::new(false),
            guard: None,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Tie the event to a response. Once the response is superseded the
    /// event counts as cancelled.
    pub fn with_guard(mut self, ticket: ResponseTicket) -> Self {
        self.guard = Some(ticket);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Mark the event cancelled. Cancelled events are never dispatched.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.guard.as_ref().is_some_and(ResponseTicket::is_stale)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn as_transcript(&self) -> Option<&TranscriptEvent> {
        match &self.payload {
            EventPayload::Transcript(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_intent(&self) -> Option<&IntentEvent> {
        match &self.payload {
            EventPayload::Intent(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_retrieval(&self) -> Option<&RetrievalEvent> {
        match &self.payload {
            EventPayload::Retrieval(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&TokenEvent> {
        match &self.payload {
            EventPayload::Token(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_speech_chunk(&self) -> Option<&SpeechChunkEvent> {
        match &self.payload {
            EventPayload::SpeechChunk(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_barge_in(&self) -> Option<&BargeInEvent> {
        match &self.payload {
            EventPayload::BargeIn(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_turn(&self) -> Option<&TurnEvent> {
        match &self.payload {
            EventPayload::Turn(t) => Some(t),
            _ => None,
        }
    }
}

macro_rules! impl_into_event {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for EventPayload {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_into_event! {
    TranscriptEvent => Transcript,
    IntentEvent => Intent,
    RetrievalEvent => Retrieval,
    TokenEvent => Token,
    SpeechChunkEvent => SpeechChunk,
    BargeInEvent => BargeIn,
    TurnEvent => Turn,
}
