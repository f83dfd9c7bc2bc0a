//! Conversation state machine states.

use serde::Serialize;

/// Where the conversation is.
///
/// `Listening ⇄ Processing → Responding → Listening` is the normal loop. Any
/// state may drop to `Interrupted` on barge-in, which returns to `Listening`.
/// `Ending` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Initializing,
    Ready,
    Listening,
    Processing,
    Responding,
    Interrupted,
    Ending,
    Error,
}

impl ConversationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ending | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Responding => "responding",
            Self::Interrupted => "interrupted",
            Self::Ending => "ending",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
