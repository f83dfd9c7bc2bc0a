//! Blocking HTTP embedding client for OpenAI-compatible endpoints.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::backends::EmbeddingProvider;
use crate::config::{ApiFlavor, EmbeddingConfig};
use crate::error::{AgentError, Result};

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Calls `/v1/embeddings` (OpenAI) or the Azure deployment equivalent.
pub struct HttpEmbeddingProvider {
    config: EmbeddingConfig,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingProvider")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl HttpEmbeddingProvider {
    pub fn new(config: EmbeddingConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self { config, agent }
    }

    fn url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.flavor {
            ApiFlavor::OpenAi => format!("{base}/v1/embeddings"),
            ApiFlavor::Azure => format!(
                "{base}/openai/deployments/{}/embeddings?api-version={}",
                self.config.model, self.config.api_version
            ),
        }
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self.agent.post(&self.url());
        if let Some(key) = &self.config.api_key {
            request = match self.config.flavor {
                ApiFlavor::OpenAi => request.set("Authorization", &format!("Bearer {key}")),
                ApiFlavor::Azure => request.set("api-key", key),
            };
        }
        let body = match self.config.flavor {
            ApiFlavor::OpenAi => serde_json::json!({ "input": text, "model": self.config.model }),
            ApiFlavor::Azure => serde_json::json!({ "input": text }),
        };

        let response = request.send_json(body).map_err(|e| match e {
            ureq::Error::Status(code, resp) => {
                let detail = resp.into_string().unwrap_or_default();
                AgentError::Retrieval(format!("embedding HTTP {code}: {detail}"))
            }
            other => AgentError::Retrieval(format!("embedding request failed: {other}")),
        })?;
        let parsed: EmbeddingResponse = response
            .into_json()
            .map_err(|e| AgentError::Retrieval(format!("bad embedding response: {e}")))?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AgentError::Retrieval("embedding response had no data".into()))?;
        debug!("embedded {} chars into {} dims", text.len(), vector.len());
        Ok(vector)
    }
}
