//! Error types for the conversation engine.

/// Top-level error type for the voice conversation engine.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Speech recognition error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Intent pattern or entity rule error.
    #[error("intent error: {0}")]
    Intent(String),

    /// Embedding or vector search error.
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// Chat completion error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Working or session memory error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Event bus error (handler failure, shutdown).
    #[error("event bus error: {0}")]
    Bus(String),

    /// Controller coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl From<crate::llm::error::LlmError> for AgentError {
    fn from(e: crate::llm::error::LlmError) -> Self {
        Self::Llm(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
