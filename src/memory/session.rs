//! Bounded history of finalized turns for one connection.

use std::collections::{HashMap, VecDeque};

use super::Turn;
use crate::llm::message::Message;

/// Ring buffer of finalized turns plus session-wide entities and topics.
#[derive(Debug)]
pub struct SessionMemory {
    turns: VecDeque<Turn>,
    capacity: usize,
    counter: u64,
    entities: HashMap<String, String>,
    topics: Vec<String>,
}

impl SessionMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            counter: 0,
            entities: HashMap::new(),
            topics: Vec::new(),
        }
    }

    /// Append a turn, dropping the oldest at capacity. Assigns the turn id.
    pub fn add_turn(&mut self, mut turn: Turn) -> u64 {
        self.counter += 1;
        turn.id = self.counter;
        self.entities
            .extend(turn.entities.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !turn.intent.is_empty() && !self.topics.contains(&turn.intent) {
            self.topics.push(turn.intent.clone());
        }
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
        self.counter
    }

    /// The most recent `max_turns` turns as alternating user/assistant messages.
    pub fn history(&self, max_turns: usize) -> Vec<Message> {
        let skip = self.turns.len().saturating_sub(max_turns);
        self.turns
            .iter()
            .skip(skip)
            .flat_map(|turn| {
                [
                    Message::user(turn.user_text.clone()),
                    Message::assistant(turn.agent_text.clone()),
                ]
            })
            .collect()
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.back()
    }

    /// Total turns added this session, including evicted ones.
    pub fn turn_count(&self) -> u64 {
        self.counter
    }

    pub fn entities(&self) -> &HashMap<String, String> {
        &self.entities
    }

    /// Distinct intents in first-seen order.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.counter = 0;
        self.entities.clear();
        self.topics.clear();
    }
}
