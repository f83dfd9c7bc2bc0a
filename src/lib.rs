//! Parley: real-time full-duplex voice conversation engine.
//!
//! A session is a set of components that talk only through an event bus:
//! Recognizer → transcripts → intents → retrieval → generation → speech
//!
//! # Architecture
//!
//! - **Event bus**: priority-queued publish/subscribe with an immediate path
//!   for barge-in
//! - **Speech input**: continuous recognition shaped into partial, stable and
//!   final transcripts, plus barge-in detection while the agent speaks
//! - **Intent classifier**: keyword and regex patterns with entity extraction
//! - **Retrieval**: cached embedding and vector search
//! - **Generation**: streaming chat completion with retry and adaptive length
//! - **Speech output**: chunked, stoppable synthesis
//! - **Memory**: turn-scoped working memory and bounded session history
//! - **Controller**: the conversation state machine and barge-in handling

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod response;
pub mod retrieval;
pub mod stt;
pub mod tts;

pub use agent::VoiceAgent;
pub use bus::{Event, EventBus, EventKind, EventPayload};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use pipeline::{Backends, ConversationController, ConversationState, SessionStats};
pub use response::{ResponseIds, ResponseTicket};
