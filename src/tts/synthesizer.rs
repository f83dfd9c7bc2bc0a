//! Speech synthesizer boundary.

use async_trait::async_trait;

use crate::error::Result;

/// Renders speech markup to the playback device.
///
/// Vendor SDKs deliver completion on their own threads; adapters resolve the
/// future from that callback (for example through a oneshot channel).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize and play `markup`. Resolves once playback of this markup
    /// has finished, or with an error if synthesis failed or was aborted.
    async fn speak_markup(&self, markup: &str) -> Result<()>;

    /// Stop any in-flight synthesis and playback. Must not block; the
    /// pending [`speak_markup`](Self::speak_markup) call resolves on its own.
    fn abort(&self);
}
