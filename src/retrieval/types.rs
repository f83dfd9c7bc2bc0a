//! Retrieved documents and their prompt formatting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Label used when a document carries no `source` metadata.
pub const DEFAULT_SOURCE: &str = "Knowledge Base";

const SEPARATOR: &str = "\n\n---\n\n";
const TRUNCATION_MARKER: &str = "...";

/// One ranked document from the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub score: f32,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
            score: 0.0,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.insert("source".to_owned(), source.into());
        self
    }

    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .map(String::as_str)
            .unwrap_or(DEFAULT_SOURCE)
    }
}

/// Documents for one query, in rank order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub documents: Vec<Document>,
    pub query: String,
    pub latency_ms: f64,
    pub cache_hit: bool,
}

impl RetrievalResult {
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn has_results(&self) -> bool {
        !self.documents.is_empty()
    }

    /// Render documents as numbered, source-tagged blocks capped at roughly
    /// `max_tokens` tokens (four characters each). The tail is cut and
    /// marked with `...` when over budget.
    ///
    /// The budget counts `char`s, not bytes: the output holds at most
    /// `4 * max_tokens` chars plus the marker, however many bytes those take.
    pub fn format_context(&self, max_tokens: usize) -> String {
        if self.documents.is_empty() {
            return String::new();
        }
        let context = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, doc)| format!("[{}. {}]\n{}", i + 1, doc.source(), doc.text))
            .collect::<Vec<_>>()
            .join(SEPARATOR);

        let budget = max_tokens.saturating_mul(4);
        match context.char_indices().nth(budget) {
            Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &context[..cut]),
            None => context,
        }
    }
}
