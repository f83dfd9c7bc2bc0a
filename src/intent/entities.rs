//! Regex-based entity extraction.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// A named entity and the expression that captures it. The first capture
/// group is used when present, otherwise the whole match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRule {
    pub name: String,
    pub pattern: String,
}

pub fn default_entity_rules() -> Vec<EntityRule> {
    vec![
        EntityRule {
            name: "amount".to_owned(),
            pattern: r"((?:\$|rs\.?\s?|lkr\s?)\d[\d,]*(?:\.\d+)?)".to_owned(),
        },
        EntityRule {
            name: "phone_number".to_owned(),
            pattern: r"\b(\+?\d[\d\s-]{8,}\d)\b".to_owned(),
        },
    ]
}

#[derive(Debug, Default)]
pub struct EntityExtractor {
    rules: Vec<(String, Regex)>,
}

impl EntityExtractor {
    pub fn new(rules: &[EntityRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (rule.name.clone(), re))
                    .map_err(|e| AgentError::Intent(format!("entity rule {}: {e}", rule.name)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// First match of every rule found in `text`.
    pub fn extract(&self, text: &str) -> HashMap<String, String> {
        self.rules
            .iter()
            .filter_map(|(name, re)| {
                let caps = re.captures(text)?;
                let found = caps.get(1).or_else(|| caps.get(0))?;
                Some((name.clone(), found.as_str().trim().to_owned()))
            })
            .collect()
    }
}
