//! Top-level voice agent: one controller run to completion.

use std::future::Future;

use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::pipeline::{Backends, ConversationController, ConversationState, SessionStats};

/// Resolves when `signal` reports an interrupt. A signal listener that
/// fails to install never resolves, leaving the session to end on its own.
async fn interrupted(signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = signal.await {
        warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Runs a conversation session until it ends or the process is interrupted.
#[derive(Debug, Clone)]
pub struct VoiceAgent {
    controller: ConversationController,
}

impl VoiceAgent {
    /// # Errors
    ///
    /// Returns an error if the controller cannot be built from `config`.
    pub fn new(config: AgentConfig, backends: Backends) -> Result<Self> {
        Ok(Self {
            controller: ConversationController::new(config, backends)?,
        })
    }

    /// Start the session, wait for it to end (or for Ctrl-C), then tear it
    /// down. Returns the stats at the end of the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails to start.
    pub async fn run(&self) -> Result<SessionStats> {
        if let Err(e) = self.controller.start().await {
            self.controller.stop().await;
            return Err(e);
        }
        tokio::select! {
            state = self.controller.wait_for_completion() => {
                info!("conversation ended ({state})");
            }
            () = interrupted(tokio::signal::ctrl_c()) => {
                info!("interrupted, shutting down");
            }
        }
        self.controller.stop().await;
        let stats = self.controller.stats();
        info!(
            "session summary: {} turn(s), topics {:?}, cache hit rate {:.1}%, avg tokens {:.1}, bus latency {:.2}ms",
            stats.turn_count,
            stats.session_topics,
            stats.retrieval.hit_rate,
            stats.generation.avg_tokens,
            stats.bus.avg_latency_ms
        );
        Ok(stats)
    }

    /// Stop the session from another task.
    pub async fn stop(&self) {
        self.controller.stop().await;
    }

    pub fn controller(&self) -> &ConversationController {
        &self.controller
    }

    pub fn state(&self) -> ConversationState {
        self.controller.state()
    }

    pub fn turn_count(&self) -> u64 {
        self.controller.turn_count()
    }

    pub fn session_topics(&self) -> Vec<String> {
        self.controller.session_topics()
    }

    pub fn stats(&self) -> SessionStats {
        self.controller.stats()
    }
}
