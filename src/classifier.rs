//! NEW/EXISTING classification from the subject line.
//!
//! Two independent methods: the LLM reads the subject with a
//! schema-constrained response, and a pattern match over the canonical
//! ticket shape backs it up. The LLM handles odd casing, punctuation and
//! nonstandard reply prefixes; the pattern handles every compliant subject
//! at zero external cost. The decision is final either way.

use std::sync::Arc;

use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

use crate::context::RoutePath;
use crate::llm::LlmClient;
use crate::ticket::TicketId;

/// Fallback confidence when the pattern finds a ticket identifier.
const FALLBACK_CONFIDENCE_PRESENT: f32 = 0.8;
/// Fallback confidence when it does not.
const FALLBACK_CONFIDENCE_ABSENT: f32 = 0.7;

const SYSTEM_PROMPT_TEMPLATE: &str = r#"# Ticket Classification

You classify inbound support email subjects. Decide whether the subject
references an existing ticket identifier.

## Ticket identifier format
- Pattern: {prefix}-YYYYMMDD-NNNN (e.g. {prefix}-20250531-0001)
- May appear as "Re: {prefix}-20250531-0001", "[{prefix}-20250531-0001]",
  "Ticket: {prefix}-20250531-0001" and similar variations
- Matching is case insensitive

## Rules
- present=false and path=NEW when no ticket identifier is referenced
- present=true and path=EXISTING when one is, with ticket_id set to the
  exact identifier
- Use high confidence only when certain; add brief notes explaining the
  decision"#;

#[derive(Debug, Deserialize, JsonSchema)]
struct ClassifierResponse {
    present: bool,
    path: RoutePath,
    #[serde(default)]
    ticket_id: Option<String>,
    confidence: f32,
    #[serde(default)]
    #[allow(dead_code)]
    notes: Option<String>,
}

/// Final routing decision for one message.
#[derive(Debug, Clone)]
pub struct Classification {
    pub path: RoutePath,
    pub ticket_id: Option<TicketId>,
    pub confidence: f32,
}

pub struct Classifier {
    llm: Arc<LlmClient>,
    pattern: Regex,
    system_prompt: String,
}

impl Classifier {
    pub fn new(llm: Arc<LlmClient>, prefix: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"(?i)\b{}-\d{{8}}-\d{{4}}\b",
            regex::escape(prefix)
        ))?;
        Ok(Self {
            llm,
            pattern,
            system_prompt: SYSTEM_PROMPT_TEMPLATE.replace("{prefix}", prefix),
        })
    }

    /// Classify a subject. Never fails: any LLM problem (error, deadline,
    /// schema violation) drops to the pattern fallback.
    pub async fn classify(&self, subject: &str) -> Classification {
        if self.llm.is_enabled() {
            let user_prompt = format!("EMAIL SUBJECT TO ANALYZE:\n\"{}\"", subject);
            match self
                .llm
                .call_structured::<ClassifierResponse>(
                    "ticket_classification",
                    &self.system_prompt,
                    &user_prompt,
                )
                .await
            {
                Ok(response) => {
                    if let Some(classification) = validate(response) {
                        info!(
                            "classifier decision path={} confidence={:.2}",
                            classification.path, classification.confidence
                        );
                        return classification;
                    }
                    warn!("classifier response failed validation, using pattern fallback");
                }
                Err(err) => {
                    warn!("classifier llm call failed ({}), using pattern fallback", err);
                }
            }
        }
        self.fallback(subject)
    }

    /// Deterministic classification from the subject alone.
    pub fn fallback(&self, subject: &str) -> Classification {
        let normalized = normalize_subject(subject);
        match self
            .pattern
            .find(&normalized)
            .and_then(|found| TicketId::parse(found.as_str()))
        {
            Some(ticket) => Classification {
                path: RoutePath::Existing,
                ticket_id: Some(ticket),
                confidence: FALLBACK_CONFIDENCE_PRESENT,
            },
            None => Classification {
                path: RoutePath::New,
                ticket_id: None,
                confidence: FALLBACK_CONFIDENCE_ABSENT,
            },
        }
    }
}

/// Accept an LLM response only when it is internally consistent: an
/// EXISTING path must carry a parseable ticket identifier.
fn validate(response: ClassifierResponse) -> Option<Classification> {
    let confidence = response.confidence.clamp(0.0, 1.0);
    match response.path {
        RoutePath::Existing => {
            let ticket = response
                .ticket_id
                .as_deref()
                .and_then(TicketId::parse)?;
            if !response.present {
                return None;
            }
            Some(Classification {
                path: RoutePath::Existing,
                ticket_id: Some(ticket),
                confidence,
            })
        }
        RoutePath::New => Some(Classification {
            path: RoutePath::New,
            ticket_id: None,
            confidence,
        }),
    }
}

/// Collapse brackets and peel reply/forward prefixes before matching.
fn normalize_subject(subject: &str) -> String {
    let mut current = subject.replace(['[', ']', '#'], " ").trim().to_string();
    loop {
        let lower = current.to_ascii_lowercase();
        let stripped = ["re:", "fwd:", "fw:"].iter().find_map(|prefix| {
            lower
                .starts_with(prefix)
                .then(|| current[prefix.len()..].trim_start().to_string())
        });
        match stripped {
            Some(next) => current = next,
            None => break,
        }
    }
    current
}
