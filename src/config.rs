//! Configuration types for the conversation engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AgentError, Result};
use crate::intent::entities::{EntityRule, default_entity_rules};
use crate::intent::patterns::{IntentPattern, default_patterns};

/// Top-level configuration for a voice conversation session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Event bus queue and latency settings.
    pub bus: BusConfig,
    /// Speech service credentials shared by recognizer and synthesizer adapters.
    pub speech: SpeechServiceConfig,
    /// Speech-to-text transcript shaping.
    pub stt: SttConfig,
    /// Barge-in (interrupt) detection while the agent is speaking.
    pub barge_in: BargeInConfig,
    /// Intent pattern set and entity rules.
    pub intent: IntentConfig,
    /// Retrieval cache and timeout settings.
    pub retrieval: RetrievalConfig,
    /// Embedding provider endpoint.
    pub embedding: EmbeddingConfig,
    /// Chat completion backend and generation parameters.
    pub llm: LlmConfig,
    /// Speech synthesis settings.
    pub tts: TtsConfig,
    /// Session memory bounds.
    pub memory: MemoryConfig,
    /// Conversation controller behaviour and canned phrases.
    pub controller: ControllerConfig,
    /// Log filter defaults for binaries.
    pub logging: LoggingConfig,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of queued events. Publishing beyond this drops the event.
    pub queue_capacity: usize,
    /// Number of recent dispatch latencies averaged for the latency gauge.
    pub latency_window: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            latency_window: 100,
        }
    }
}

/// Speech service credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechServiceConfig {
    /// Whether a hosted speech service is in use. When true, `api_key` and
    /// `region` must both be set.
    pub required: bool,
    /// Subscription key (prefer the `PARLEY_SPEECH_API_KEY` env var).
    pub api_key: Option<String>,
    /// Service region, e.g. `eastus`.
    pub region: Option<String>,
    /// Recognition language (BCP-47).
    pub language: String,
}

impl Default for SpeechServiceConfig {
    fn default() -> Self {
        Self {
            required: false,
            api_key: None,
            region: None,
            language: "en-US".to_owned(),
        }
    }
}

/// Transcript shaping for the speech input stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Silence (ms) after speech that ends an utterance.
    pub end_silence_ms: u32,
    /// Silence (ms) before any speech after which the recognizer gives up.
    pub initial_silence_ms: u32,
    /// Minimum speech duration (ms) for an utterance to count.
    pub min_speech_ms: u32,
    /// Partials with at least this many words are reported as stable.
    pub stable_min_words: usize,
    /// Confidence assigned to unstable partials.
    pub partial_confidence: f32,
    /// Confidence assigned to stable partials.
    pub stable_confidence: f32,
    /// Confidence used for finals when the recognizer does not report one.
    pub default_final_confidence: f32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            end_silence_ms: 800,
            initial_silence_ms: 5000,
            min_speech_ms: 200,
            stable_min_words: 3,
            partial_confidence: 0.5,
            stable_confidence: 0.7,
            default_final_confidence: 0.9,
        }
    }
}

/// Barge-in configuration (user interrupts the agent by speaking).
///
/// These thresholds are a heuristic speech/noise discriminator, not a
/// guarantee against false triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether barge-in is enabled.
    pub enabled: bool,
    /// Minimum number of real (non-filler, multi-character) words.
    pub min_words: usize,
    /// Ignore further triggers for this long after one fires (ms).
    pub cooldown_ms: u32,
    /// Words never counted as real speech.
    pub filler_words: Vec<String>,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_words: 2,
            cooldown_ms: 1000,
            filler_words: ["uh", "um", "hmm", "mm", "ah"]
                .iter()
                .map(|w| (*w).to_owned())
                .collect(),
        }
    }
}

/// Intent classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Unmatched text with at least this many words becomes `general_query`.
    pub general_query_min_words: usize,
    /// Ordered pattern set. Registration order breaks priority ties.
    pub patterns: Vec<IntentPattern>,
    /// Named regex rules used to extract entities from transcripts.
    pub entity_rules: Vec<EntityRule>,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            general_query_min_words: 3,
            patterns: default_patterns(),
            entity_rules: default_entity_rules(),
        }
    }
}

/// Retrieval engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of documents fetched per query.
    pub top_k: usize,
    /// Maximum cached queries (LRU eviction beyond this).
    pub cache_size: usize,
    /// Cache entry lifetime in seconds.
    pub cache_ttl_s: u64,
    /// Timeout for retrievals triggered by intent events (ms).
    pub event_timeout_ms: u64,
    /// Token budget for formatted context (about four characters per token).
    pub context_token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            cache_size: 50,
            cache_ttl_s: 300,
            event_timeout_ms: 25_000,
            context_token_budget: 2000,
        }
    }
}

/// Which wire dialect an OpenAI-compatible endpoint speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFlavor {
    /// `{base}/v1/...` with a bearer token.
    #[default]
    OpenAi,
    /// `{base}/openai/deployments/{deployment}/...?api-version=` with an `api-key` header.
    Azure,
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Wire dialect.
    pub flavor: ApiFlavor,
    /// Base URL of the endpoint.
    pub base_url: String,
    /// API key (prefer the `PARLEY_EMBEDDING_API_KEY` env var).
    pub api_key: Option<String>,
    /// Model name (OpenAI) or deployment name (Azure).
    pub model: String,
    /// API version query parameter (Azure only).
    pub api_version: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            flavor: ApiFlavor::OpenAi,
            base_url: "https://api.openai.com".to_owned(),
            api_key: None,
            model: "text-embedding-3-small".to_owned(),
            api_version: "2024-08-01-preview".to_owned(),
            timeout_ms: 10_000,
        }
    }
}

/// Chat completion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Wire dialect.
    pub flavor: ApiFlavor,
    /// Base URL of the endpoint.
    pub base_url: String,
    /// API key (prefer the `PARLEY_LLM_API_KEY` env var).
    pub api_key: Option<String>,
    /// Model name (OpenAI) or deployment name (Azure).
    pub model: String,
    /// API version query parameter (Azure only).
    pub api_version: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Default maximum tokens per response.
    pub max_tokens: u32,
    /// Presence penalty.
    pub presence_penalty: f32,
    /// Frequency penalty.
    pub frequency_penalty: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// TCP connect timeout (ms).
    pub connect_timeout_ms: u64,
    /// Maximum gap between streamed chunks (ms).
    pub read_timeout_ms: u64,
    /// Fixed backoff before the single retry (ms).
    pub retry_backoff_ms: u64,
    /// Adaptive length policy for short utterances.
    pub adaptive: AdaptiveLengthConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            flavor: ApiFlavor::OpenAi,
            base_url: "https://api.openai.com".to_owned(),
            api_key: None,
            model: "gpt-4o-mini".to_owned(),
            api_version: "2024-08-01-preview".to_owned(),
            temperature: 0.7,
            max_tokens: 300,
            presence_penalty: 0.1,
            frequency_penalty: 0.1,
            top_p: 0.95,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            retry_backoff_ms: 300,
            adaptive: AdaptiveLengthConfig::default(),
        }
    }
}

/// Caps response length for short user utterances to keep latency low.
///
/// Trigger words are matched as substrings of the lowercased utterance, so the
/// policy can misfire on short but complex inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveLengthConfig {
    /// Whether the policy is applied at all.
    pub enabled: bool,
    /// Utterances with at most this many words may get the short cap.
    pub short_max_words: usize,
    /// Token cap for short utterances containing a trigger word.
    pub short_max_tokens: u32,
    /// Utterances with at most this many words get the medium cap.
    pub medium_max_words: usize,
    /// Token cap for medium-length utterances.
    pub medium_max_tokens: u32,
    /// Words that mark an utterance as needing only a brief reply.
    pub short_triggers: Vec<String>,
}

impl Default for AdaptiveLengthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            short_max_words: 3,
            short_max_tokens: 80,
            medium_max_words: 10,
            medium_max_tokens: 200,
            short_triggers: ["yes", "no", "thanks", "ok", "sure", "hi", "hello"]
                .iter()
                .map(|w| (*w).to_owned())
                .collect(),
        }
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Voice name placed in the markup.
    pub voice: String,
    /// Markup language tag.
    pub language: String,
    /// Prosody rate (e.g. `1.0`, `+10%`).
    pub rate: String,
    /// Prosody pitch.
    pub pitch: String,
    /// Prosody volume.
    pub volume: String,
    /// Maximum characters per synthesized chunk.
    pub max_chunk_chars: usize,
    /// Interval at which the stop flag is polled during playback (ms).
    pub poll_interval_ms: u64,
    /// Per-chunk synthesis timeout (ms). Expiry counts as an error.
    pub chunk_timeout_ms: u64,
    /// Backoff before retrying a failed chunk (ms).
    pub retry_backoff_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice: "en-US-JennyNeural".to_owned(),
            language: "en-US".to_owned(),
            rate: "1.0".to_owned(),
            pitch: "+0%".to_owned(),
            volume: "medium".to_owned(),
            max_chunk_chars: 300,
            poll_interval_ms: 50,
            chunk_timeout_ms: 30_000,
            retry_backoff_ms: 200,
        }
    }
}

/// Layered memory bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Finalized turns retained in session memory.
    pub session_capacity: usize,
    /// Most recent turns flattened into the generation prompt.
    pub history_turns: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            session_capacity: 20,
            history_turns: 5,
        }
    }
}

/// Conversation controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Maximum tokens per generated response. `0` (default) lets the adaptive
    /// length policy in `llm.adaptive` decide.
    pub max_response_tokens: u32,
    /// Seconds without user speech before the idle prompt. Doubled for the goodbye.
    pub no_speech_timeout_s: u64,
    /// Timeout for the direct retrieval call before generation (ms).
    pub retrieval_timeout_ms: u64,
    /// Speak `greeting_text` on start.
    pub auto_greet: bool,
    /// Opening line.
    pub greeting_text: String,
    /// Reply to a user greeting when no greeting has been spoken yet.
    pub greeting_reply: String,
    /// Spoken before ending on a confirmed farewell.
    pub farewell_text: String,
    /// Spoken after the first idle period.
    pub idle_prompt_text: String,
    /// Spoken after the second idle period, before ending.
    pub idle_goodbye_text: String,
    /// Spoken when a turn fails.
    pub apology_text: String,
    /// System prompt for generation.
    pub system_prompt: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_response_tokens: 0,
            no_speech_timeout_s: 30,
            retrieval_timeout_ms: 10_000,
            auto_greet: true,
            greeting_text:
                "Hello! I'm your customer support assistant. How can I help you today?"
                    .to_owned(),
            greeting_reply: "Hello! How can I help you today?".to_owned(),
            farewell_text: "Goodbye! Have a great day!".to_owned(),
            idle_prompt_text: "Are you still there? Let me know if you need any help."
                .to_owned(),
            idle_goodbye_text: "It seems you've stepped away. Goodbye!".to_owned(),
            apology_text: "I'm sorry, I encountered an error. Could you please repeat that?"
                .to_owned(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
        }
    }
}

/// Default system prompt for spoken customer support.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly customer support voice assistant. \
Answer using the provided context when it is relevant. Keep replies short and conversational: \
they will be spoken aloud, so avoid lists, markdown and long numbers. If the context does not \
contain the answer, say so and offer to help another way.";

/// Logging defaults for binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AgentError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/parley/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("parley").join("config.toml")
        } else if let Some(dir) = dirs::config_dir() {
            dir.join("parley").join("config.toml")
        } else {
            PathBuf::from("/tmp/parley-config/config.toml")
        }
    }

    /// Fill credentials from `PARLEY_*` environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty("PARLEY_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(key) = non_empty("PARLEY_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(key);
        }
        if let Some(key) = non_empty("PARLEY_SPEECH_API_KEY") {
            self.speech.api_key = Some(key);
        }
        if let Some(region) = non_empty("PARLEY_SPEECH_REGION") {
            self.speech.region = Some(region);
        }
    }

    /// Check the settings a session cannot start without.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] naming the first missing or invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.llm.base_url.trim().is_empty() {
            return Err(AgentError::Config("llm.base_url is required".into()));
        }
        if self.llm.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(AgentError::Config(
                "llm.api_key is required (set PARLEY_LLM_API_KEY)".into(),
            ));
        }
        if self.speech.required {
            if self.speech.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
                return Err(AgentError::Config(
                    "speech.api_key is required (set PARLEY_SPEECH_API_KEY)".into(),
                ));
            }
            if self.speech.region.as_deref().is_none_or(|r| r.trim().is_empty()) {
                return Err(AgentError::Config(
                    "speech.region is required (set PARLEY_SPEECH_REGION)".into(),
                ));
            }
        }
        if self.bus.queue_capacity == 0 {
            return Err(AgentError::Config("bus.queue_capacity must be positive".into()));
        }
        if self.tts.max_chunk_chars == 0 {
            return Err(AgentError::Config("tts.max_chunk_chars must be positive".into()));
        }
        if self.retrieval.top_k == 0 {
            return Err(AgentError::Config("retrieval.top_k must be positive".into()));
        }
        if self.memory.session_capacity == 0 {
            return Err(AgentError::Config(
                "memory.session_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
