//! OpenAI-compatible streaming chat backend.
//!
//! Speaks the Chat Completions SSE protocol, either against OpenAI-style
//! `{base}/v1/chat/completions` with a bearer token or an Azure deployment at
//! `{base}/openai/deployments/{model}/chat/completions?api-version=...` with an
//! `api-key` header.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::debug;

use super::backend::{ChatBackend, ChatChunk, ChatRequest, ChatStream};
use super::error::LlmError;
use super::sse::SseLineParser;
use crate::config::{ApiFlavor, LlmConfig};

pub struct OpenAiChatBackend {
    flavor: ApiFlavor,
    base_url: String,
    api_key: String,
    model: String,
    api_version: String,
    read_timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiChatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatBackend")
            .field("flavor", &self.flavor)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiChatBackend {
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] when the API key is missing or the
    /// HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::ConfigError("llm.api_key is not set".into()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| LlmError::ConfigError(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            flavor: config.flavor,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key,
            model: config.model.clone(),
            api_version: config.api_version.clone(),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            client,
        })
    }

    fn url(&self) -> String {
        match self.flavor {
            ApiFlavor::OpenAi => format!("{}/v1/chat/completions", self.base_url),
            ApiFlavor::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, self.model, self.api_version
            ),
        }
    }

    fn body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "messages": request.messages,
            "stream": true,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "presence_penalty": request.presence_penalty,
            "frequency_penalty": request.frequency_penalty,
        });
        if self.flavor == ApiFlavor::OpenAi {
            body["model"] = serde_json::json!(self.model);
        }
        body
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        let message = extract_error_message(body);
        match status.as_u16() {
            401 | 403 => LlmError::AuthError(format!("authentication failed: {message}")),
            429 => LlmError::RequestError(format!("rate limited: {message}")),
            code => LlmError::ProviderError(format!("HTTP {code}: {message}")),
        }
    }
}

/// `error.message` from a JSON error body, or the body itself.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

#[async_trait]
impl ChatBackend for OpenAiChatBackend {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let mut http = self.client.post(self.url()).json(&self.body(request));
        http = match self.flavor {
            ApiFlavor::OpenAi => http.bearer_auth(&self.api_key),
            ApiFlavor::Azure => http.header("api-key", &self.api_key),
        };

        let response = tokio::time::timeout(self.read_timeout, http.send())
            .await
            .map_err(|_| LlmError::TimeoutError("no response from chat endpoint".into()))?
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LlmError::TimeoutError(format!("chat request failed: {e}"))
                } else {
                    LlmError::RequestError(format!("chat request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &body));
        }
        debug!("chat stream opened ({})", self.model);
        Ok(Box::pin(chunk_stream(
            response.bytes_stream(),
            self.read_timeout,
        )))
    }
}

struct StreamState<S> {
    bytes: std::pin::Pin<Box<S>>,
    parser: SseLineParser,
    ready: VecDeque<Result<ChatChunk, LlmError>>,
    read_timeout: Duration,
    finished: bool,
}

impl<S> StreamState<S> {
    fn absorb(&mut self, events: Vec<super::sse::SseEvent>) {
        for event in events {
            if event.is_done() {
                self.finished = true;
                continue;
            }
            if let Some(item) = parse_chunk(&event.data) {
                self.ready.push_back(item);
            }
        }
    }
}

fn chunk_stream(
    bytes: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    read_timeout: Duration,
) -> impl Stream<Item = Result<ChatChunk, LlmError>> + Send {
    futures_util::stream::unfold(
        StreamState {
            bytes: Box::pin(bytes),
            parser: SseLineParser::new(),
            ready: VecDeque::new(),
            read_timeout,
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.ready.pop_front() {
                    if item.is_err() {
                        state.finished = true;
                        state.ready.clear();
                    }
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match tokio::time::timeout(state.read_timeout, state.bytes.next()).await {
                    Err(_) => {
                        state.finished = true;
                        let err = LlmError::TimeoutError("chat stream stalled".into());
                        return Some((Err(err), state));
                    }
                    Ok(Some(Ok(chunk))) => {
                        let events = state.parser.push(&chunk);
                        state.absorb(events);
                    }
                    Ok(Some(Err(e))) => {
                        state.finished = true;
                        let err = LlmError::StreamError(format!("stream read error: {e}"));
                        return Some((Err(err), state));
                    }
                    Ok(None) => {
                        let tail = state.parser.flush().into_iter().collect();
                        state.absorb(tail);
                        state.finished = true;
                    }
                }
            }
        },
    )
}

/// Decode one `data:` payload. Chunks with neither text nor a finish reason
/// (role preambles, usage records) are skipped.
fn parse_chunk(data: &str) -> Option<Result<ChatChunk, LlmError>> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!("skipping unparseable stream chunk: {e}");
            return None;
        }
    };
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown stream error");
        return Some(Err(LlmError::StreamError(message.to_owned())));
    }
    let choice = value.get("choices")?.as_array()?.first()?;
    let text = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .map(String::from);
    if text.is_empty() && finish_reason.is_none() {
        return None;
    }
    Some(Ok(ChatChunk {
        text: text.to_owned(),
        finish_reason,
    }))
}
