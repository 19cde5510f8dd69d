use crate::client::LlmClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub const UNCATEGORIZED: &str = "Uncategorized";
pub const GENERAL_BUSINESS: &str = "General Business";

const FALLBACK_CONFIDENCE: f64 = 0.4;
const FALLBACK_DESCRIPTION_MAX: usize = 240;
/// Initial call plus two retries on empty or uncategorized output.
const MAX_ATTEMPTS: usize = 3;

const INSTRUCTION_PREFIX: &str = "You are a content classification engine for an enterprise \
knowledge catalog. Classify the passage below into the controlled vocabulary and answer with \
a single JSON object, no prose, with exactly these fields: entity_type, category_level_1, \
category_level_2_sub, business_concept_name, business_specific_name, primary_process_type, \
title, description, extraction_confidence (0.0-1.0).\n\nPassage:\n";

fn default_entity_type() -> String {
    "content".to_string()
}

fn default_confidence() -> f64 {
    FALLBACK_CONFIDENCE
}

/// The fixed record shape every chunk ends up with, however free-form the
/// model's JSON was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default = "default_entity_type")]
    pub entity_type: String,
    #[serde(default)]
    pub category_level_1: String,
    #[serde(default)]
    pub category_level_2_sub: String,
    #[serde(default)]
    pub business_concept_name: String,
    #[serde(default)]
    pub business_specific_name: String,
    #[serde(default)]
    pub primary_process_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_confidence")]
    pub extraction_confidence: f64,
}

impl Classification {
    pub fn fallback(raw_text: &str) -> Self {
        let description: String = raw_text.chars().take(FALLBACK_DESCRIPTION_MAX).collect();
        let title: String = raw_text.split_whitespace().take(8).collect::<Vec<_>>().join(" ");
        Self {
            entity_type: default_entity_type(),
            category_level_1: UNCATEGORIZED.to_string(),
            category_level_2_sub: GENERAL_BUSINESS.to_string(),
            business_concept_name: String::new(),
            business_specific_name: String::new(),
            primary_process_type: String::new(),
            title,
            description,
            extraction_confidence: FALLBACK_CONFIDENCE,
        }
    }

    fn is_usable(&self) -> bool {
        !self.category_level_1.trim().is_empty() && self.category_level_1 != UNCATEGORIZED
    }

    fn normalized(mut self) -> Self {
        self.extraction_confidence = self.extraction_confidence.clamp(0.0, 1.0);
        if self.category_level_2_sub.trim().is_empty() {
            self.category_level_2_sub = GENERAL_BUSINESS.to_string();
        }
        self
    }
}

/// Sends cleaned chunk text to the external model and always hands a record
/// back. Model outages, garbage JSON and refusals all degrade to the
/// Uncategorized fallback; the orchestrator never sees an error from here.
pub struct ClassifierGateway {
    client: Arc<dyn LlmClient>,
    prompt_version: String,
}

impl ClassifierGateway {
    pub fn new(client: Arc<dyn LlmClient>, prompt_version: impl Into<String>) -> Self {
        Self {
            client,
            prompt_version: prompt_version.into(),
        }
    }

    pub async fn classify(&self, cleaned_text: &str) -> Classification {
        let prompt = format!(
            "{}{}\n\n[prompt:{}]",
            INSTRUCTION_PREFIX, cleaned_text, self.prompt_version
        );

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.complete(&prompt).await {
                Ok(raw) if raw.trim().is_empty() => {
                    warn!(attempt, "classifier returned empty response");
                }
                Ok(raw) => match parse_classification(&raw) {
                    Some(parsed) if parsed.is_usable() => return parsed.normalized(),
                    Some(_) => warn!(attempt, "classifier returned uncategorized result"),
                    None => warn!(attempt, "classifier response was not parseable JSON"),
                },
                Err(e) => {
                    warn!(attempt, error = %format!("{e:#}"), "classifier call failed");
                }
            }
        }
        Classification::fallback(cleaned_text)
    }
}

/// Strict parse first; on failure, the first balanced `{...}` substring is
/// tried before giving up.
fn parse_classification(raw: &str) -> Option<Classification> {
    if let Ok(parsed) = serde_json::from_str::<Classification>(raw) {
        return Some(parsed);
    }
    extract_json_object(raw).and_then(|s| serde_json::from_str(s).ok())
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
