//! Conversation pipeline: the controller that wires the components together
//! over the event bus, and the bundle of external services it drives.

pub mod controller;
pub mod state;

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::llm::{ChatBackend, OpenAiChatBackend};
use crate::retrieval::{EmbeddingProvider, HttpEmbeddingProvider, VectorStore};
use crate::stt::SpeechRecognizer;
use crate::tts::SpeechSynthesizer;

pub use controller::{ConversationController, SessionStats};
pub use state::ConversationState;

/// External services a conversation runs against.
#[derive(Clone)]
pub struct Backends {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub chat: Arc<dyn ChatBackend>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vectors: Arc<dyn VectorStore>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

impl Backends {
    /// Speech adapters and a vector store supplied by the caller; chat and
    /// embeddings over HTTP as configured.
    ///
    /// # Errors
    ///
    /// Returns a config error if the chat backend cannot be built.
    pub fn http(
        config: &AgentConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        vectors: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        Ok(Self {
            recognizer,
            synthesizer,
            chat: Arc::new(OpenAiChatBackend::new(&config.llm)?),
            embedder: Arc::new(HttpEmbeddingProvider::new(config.embedding.clone())),
            vectors,
        })
    }
}
