//! Layered conversation memory.
//!
//! - **Working memory**: the turn in progress, mutated by every pipeline stage.
//! - **Session memory**: bounded history of finalized turns, plus the entity
//!   map and topic list accumulated across the session.
//!
//! [`LayeredMemory::build_messages`] is the only place generation context is
//! assembled.

pub mod session;
pub mod working;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::MemoryConfig;
use crate::llm::message::Message;

pub use session::SessionMemory;
pub use working::{WorkingMemory, WorkingState};

/// One finalized user-utterance / agent-response exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    /// Assigned by session memory; `0` until stored.
    pub id: u64,
    pub user_text: String,
    pub agent_text: String,
    pub intent: String,
    pub entities: HashMap<String, String>,
    pub interrupted: bool,
    pub timestamp: DateTime<Utc>,
}

/// Working + session memory behind one handle.
#[derive(Debug)]
pub struct LayeredMemory {
    working: WorkingMemory,
    session: Mutex<SessionMemory>,
    history_turns: usize,
}

impl Default for LayeredMemory {
    fn default() -> Self {
        Self::new(&MemoryConfig::default())
    }
}

impl LayeredMemory {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            working: WorkingMemory::new(),
            session: Mutex::new(SessionMemory::new(config.session_capacity)),
            history_turns: config.history_turns,
        }
    }

    fn session(&self) -> MutexGuard<'_, SessionMemory> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn working(&self) -> &WorkingMemory {
        &self.working
    }

    pub async fn start_turn(&self) {
        self.working.start_turn().await;
    }

    pub async fn update_transcript(&self, text: &str, is_final: bool) {
        self.working.update_transcript(text, is_final).await;
    }

    pub async fn update_intent(
        &self,
        intent: &str,
        confirmed: bool,
        entities: &HashMap<String, String>,
    ) {
        self.working.update_intent(intent, confirmed, entities).await;
    }

    pub async fn update_context(&self, context: &str) {
        self.working.update_context(context).await;
    }

    pub async fn update_generation(&self, text: &str) {
        self.working.update_generation(text).await;
    }

    pub async fn update_spoken(&self, text: &str, interrupted: bool) {
        self.working.update_spoken(text, interrupted).await;
    }

    /// Finalize the working turn. It is stored in session memory only when
    /// both sides said something.
    pub async fn end_turn(&self) -> Turn {
        let mut turn = self.working.end_turn().await;
        if !turn.user_text.trim().is_empty() && !turn.agent_text.trim().is_empty() {
            turn.id = self.session().add_turn(turn.clone());
            debug!(
                "turn {} stored (intent={}, interrupted={})",
                turn.id, turn.intent, turn.interrupted
            );
        } else {
            debug!("turn discarded: missing user or agent text");
        }
        turn
    }

    /// System prompt, recent history, then the current user message with
    /// retrieved context prepended when there is any.
    ///
    /// `user_text` and `context` fall back to working memory when `None`.
    pub async fn build_messages(
        &self,
        system_prompt: &str,
        user_text: Option<&str>,
        context: Option<&str>,
    ) -> Vec<Message> {
        let working = self.working.snapshot().await;
        let current = user_text.unwrap_or_else(|| working.user_text());
        let context = context
            .filter(|c| !c.is_empty())
            .unwrap_or(working.retrieval_context.as_str());

        let mut messages = vec![Message::system(system_prompt)];
        messages.extend(self.session().history(self.history_turns));
        let content = if context.is_empty() {
            format!("Customer: \"{current}\"")
        } else {
            format!("Context:\n{context}\n\nCustomer: \"{current}\"")
        };
        messages.push(Message::user(content));
        messages
    }

    pub fn history(&self, max_turns: usize) -> Vec<Message> {
        self.session().history(max_turns)
    }

    pub fn turn_count(&self) -> u64 {
        self.session().turn_count()
    }

    pub fn last_turn(&self) -> Option<Turn> {
        self.session().last_turn().cloned()
    }

    pub fn session_topics(&self) -> Vec<String> {
        self.session().topics().to_vec()
    }

    pub fn session_entities(&self) -> HashMap<String, String> {
        self.session().entities().clone()
    }

    pub fn clear_session(&self) {
        self.session().clear();
    }
}
