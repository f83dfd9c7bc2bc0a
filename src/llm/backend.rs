//! Chat completion backend boundary.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;

use super::error::LlmError;
use super::message::Message;

/// One streamed piece of a completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatChunk {
    /// Text delta; may be empty on the terminal chunk.
    pub text: String,
    /// Set on the terminal chunk (`stop`, `length`, ...).
    pub finish_reason: Option<String>,
}

impl ChatChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: None,
        }
    }

    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            finish_reason: Some(reason.into()),
        }
    }
}

/// Messages plus sampling parameters for one completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

/// A boxed stream of completion chunks.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

/// Streams chat completions from a hosted model.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a completion. Errors before the first byte (connection, HTTP
    /// status) are returned here; later failures arrive on the stream.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, LlmError>;
}
