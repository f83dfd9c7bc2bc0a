//! Turn-scoped working memory.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::Turn;

/// Mutable state of the turn in progress.
#[derive(Debug, Clone, Default)]
pub struct WorkingState {
    pub started_at: Option<Instant>,
    pub partial_transcript: String,
    pub final_transcript: String,
    pub confirmed_intent: String,
    pub entities: HashMap<String, String>,
    pub retrieval_context: String,
    pub generated_text: String,
    pub spoken_text: String,
    pub interrupted: bool,
}

impl WorkingState {
    /// The final transcript if there is one, otherwise the latest partial.
    pub fn user_text(&self) -> &str {
        if self.final_transcript.is_empty() {
            &self.partial_transcript
        } else {
            &self.final_transcript
        }
    }

    /// What the agent said this turn. An interrupted turn records only what
    /// was actually spoken.
    pub fn agent_text(&self) -> &str {
        if self.interrupted || self.generated_text.is_empty() {
            &self.spoken_text
        } else {
            &self.generated_text
        }
    }
}

/// Working memory shared by every handler touching the current turn.
#[derive(Debug, Default)]
pub struct WorkingMemory {
    state: Mutex<WorkingState>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to a fresh turn.
    pub async fn start_turn(&self) {
        *self.state.lock().await = WorkingState {
            started_at: Some(Instant::now()),
            ..WorkingState::default()
        };
    }

    pub async fn update_transcript(&self, text: &str, is_final: bool) {
        let mut state = self.state.lock().await;
        if is_final {
            state.final_transcript = text.to_owned();
        } else {
            state.partial_transcript = text.to_owned();
        }
    }

    /// Record an intent. Only confirmed intents become the turn's intent;
    /// entities merge either way.
    pub async fn update_intent(
        &self,
        intent: &str,
        confirmed: bool,
        entities: &HashMap<String, String>,
    ) {
        let mut state = self.state.lock().await;
        if confirmed {
            state.confirmed_intent = intent.to_owned();
        }
        state
            .entities
            .extend(entities.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub async fn update_context(&self, context: &str) {
        self.state.lock().await.retrieval_context = context.to_owned();
    }

    pub async fn update_generation(&self, text: &str) {
        self.state.lock().await.generated_text = text.to_owned();
    }

    pub async fn update_spoken(&self, text: &str, interrupted: bool) {
        let mut state = self.state.lock().await;
        state.spoken_text = text.to_owned();
        state.interrupted = interrupted;
    }

    /// Build the finalized turn record. Does not persist it or reset state.
    pub async fn end_turn(&self) -> Turn {
        let state = self.state.lock().await;
        Turn {
            id: 0,
            user_text: state.user_text().to_owned(),
            agent_text: state.agent_text().to_owned(),
            intent: state.confirmed_intent.clone(),
            entities: state.entities.clone(),
            interrupted: state.interrupted,
            timestamp: chrono::Utc::now(),
        }
    }

    pub async fn snapshot(&self) -> WorkingState {
        self.state.lock().await.clone()
    }
}
