//! Intent pattern definitions and matching.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// What kind of reply an intent usually calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStyle {
    Acknowledgement,
    #[default]
    Informational,
    Action,
    Farewell,
    Clarification,
}

impl ResponseStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledgement => "acknowledgement",
            Self::Informational => "informational",
            Self::Action => "action",
            Self::Farewell => "farewell",
            Self::Clarification => "clarification",
        }
    }
}

/// One intent: keywords and regexes that select it, and how to respond.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentPattern {
    pub name: String,
    /// Whole words or phrases, matched case-insensitively.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regular expressions, matched case-insensitively.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub response_style: ResponseStyle,
    #[serde(default = "default_requires_retrieval")]
    pub requires_retrieval: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_requires_retrieval() -> bool {
    true
}

impl IntentPattern {
    fn new(
        name: &str,
        keywords: &[&str],
        patterns: &[&str],
        response_style: ResponseStyle,
        requires_retrieval: bool,
        priority: i32,
    ) -> Self {
        Self {
            name: name.to_owned(),
            keywords: keywords.iter().map(|k| (*k).to_owned()).collect(),
            patterns: patterns.iter().map(|p| (*p).to_owned()).collect(),
            response_style,
            requires_retrieval,
            priority,
        }
    }
}

/// The built-in customer-support pattern set, in registration order.
pub fn default_patterns() -> Vec<IntentPattern> {
    use ResponseStyle::*;
    vec![
        IntentPattern::new(
            "greeting",
            &["hello", "hi", "hey", "good morning", "good afternoon"],
            &[r"^(hi|hello|hey)\b", r"good (morning|afternoon|evening)"],
            Acknowledgement,
            false,
            10,
        ),
        IntentPattern::new(
            "farewell",
            &["bye", "goodbye", "thanks", "thank you", "see you"],
            &[r"\b(bye|goodbye|see you)\b", r"^thanks?\b", r"that'?s all"],
            Farewell,
            false,
            10,
        ),
        IntentPattern::new(
            "billing",
            &["bill", "balance", "payment", "charge", "invoice", "price", "cost", "fee"],
            &[r"\b(bill|balance|payment|charge|invoice|price|cost|fee)s?\b"],
            Informational,
            true,
            5,
        ),
        IntentPattern::new(
            "technical_support",
            &["not working", "broken", "error", "problem", "issue", "help"],
            &[r"\b(not working|broken|error|problem|issue)\b", r"can'?t\s+\w+"],
            Informational,
            true,
            5,
        ),
        IntentPattern::new(
            "account",
            &["account", "password", "login", "sign in", "profile"],
            &[r"\b(account|password|login|sign.?in|profile)\b"],
            Informational,
            true,
            5,
        ),
        IntentPattern::new(
            "package_inquiry",
            &["package", "plan", "subscription", "data", "minutes", "sms"],
            &[r"\b(package|plan|subscription|data|minutes|sms)\b"],
            Informational,
            true,
            5,
        ),
        IntentPattern::new(
            "confirmation",
            &["yes", "yeah", "correct", "right", "exactly", "sure"],
            &[r"^(yes|yeah|yep|correct|right|exactly|sure)\b"],
            Acknowledgement,
            false,
            3,
        ),
        IntentPattern::new(
            "negation",
            &["no", "nope", "not really", "wrong"],
            &[r"^(no|nope|not really|wrong)\b"],
            Clarification,
            false,
            3,
        ),
    ]
}

/// A pattern with its keywords and regexes compiled.
#[derive(Debug)]
pub(crate) struct CompiledPattern {
    pub spec: IntentPattern,
    matchers: Vec<Regex>,
}

impl CompiledPattern {
    pub fn compile(spec: IntentPattern) -> Result<Self> {
        let keyword_matchers = spec.keywords.iter().map(|k| {
            let phrase = k
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+");
            format!(r"\b{phrase}\b")
        });
        let matchers = keyword_matchers
            .chain(spec.patterns.iter().cloned())
            .map(|source| {
                RegexBuilder::new(&source)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        AgentError::Intent(format!("pattern {:?} in {}: {e}", source, spec.name))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { spec, matchers })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matchers.iter().any(|re| re.is_match(text))
    }
}
