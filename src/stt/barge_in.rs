//! Barge-in detection: deciding whether a partial transcript heard while the
//! agent is speaking is genuine user speech.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::BargeInConfig;

/// Shared "agent is speaking" flag. Speech output raises it for the duration
/// of playback; speech input reads it to decide when to watch for barge-in.
/// The flag remembers when it was raised so an interruption can report how
/// far into playback it landed.
#[derive(Debug, Clone, Default)]
pub struct SpeakingFlag(Arc<Mutex<Option<Instant>>>);

impl SpeakingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, speaking: bool) {
        let mut since = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match (speaking, since.is_some()) {
            (true, false) => *since = Some(Instant::now()),
            (false, true) => *since = None,
            _ => {}
        }
    }

    pub fn get(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Milliseconds since the flag was raised, or 0 when lowered.
    pub fn elapsed_ms(&self) -> u64 {
        let since = *self.0.lock().unwrap_or_else(|e| e.into_inner());
        since.map_or(0, |t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX))
    }
}

/// Counts real words in partial transcripts and debounces triggers.
#[derive(Debug)]
pub struct BargeInDetector {
    min_words: usize,
    cooldown: Duration,
    fillers: HashSet<String>,
    last_trigger: Option<Instant>,
}

impl BargeInDetector {
    pub fn new(config: &BargeInConfig) -> Self {
        Self {
            min_words: config.min_words.max(1),
            cooldown: Duration::from_millis(u64::from(config.cooldown_ms)),
            fillers: config
                .filler_words
                .iter()
                .map(|w| w.to_lowercase())
                .collect(),
            last_trigger: None,
        }
    }

    /// Words that count as real speech: longer than one character once
    /// punctuation is trimmed, and not a filler.
    pub fn real_word_count(&self, text: &str) -> usize {
        text.split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| w.chars().count() > 1 && !self.fillers.contains(w))
            .count()
    }

    /// Returns `true` (and starts the cooldown) when `text` should interrupt.
    pub fn check(&mut self, text: &str) -> bool {
        let in_cooldown = self
            .last_trigger
            .is_some_and(|t| t.elapsed() < self.cooldown);
        if in_cooldown || self.real_word_count(text) < self.min_words {
            return false;
        }
        self.last_trigger = Some(Instant::now());
        true
    }

    /// Forget the cooldown.
    pub fn reset(&mut self) {
        self.last_trigger = None;
    }
}
