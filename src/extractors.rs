//! Sender-name and organization extraction.
//!
//! Both extractors are LLM-backed with deterministic fallbacks and swallow
//! every error: nothing in here is allowed to fail the pipeline. The name
//! chain is LLM signature reading, then the display name on the envelope,
//! then a title-cased reading of the address local part.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::context::ContextRecord;
use crate::llm::LlmClient;

/// Confidence assigned when the name comes from the envelope display name.
const DISPLAY_NAME_CONFIDENCE: f32 = 0.8;
/// Confidence assigned when the name is reconstructed from the local part.
const LOCAL_PART_CONFIDENCE: f32 = 0.4;

const NAME_SYSTEM_PROMPT: &str = r#"# Sender Name Extraction

You read an email body and identify the sender's own name.

## Where to look
- Signatures after closing phrases ("Best regards,", "Thanks,", "Sincerely,")
- Introductions ("Hi, this is Mike from ...")
- A name on its own line at the end of the message

## What not to extract
- Company names alone, job titles alone, email addresses, phone numbers
- Names of other people mentioned in the content

Set full_name/first/last when found (first and last may be null when only
one component is visible). Confidence: 1.0 for a clear signature, 0.8 for a
probable name, 0.0 when nothing is found."#;

const ORG_SYSTEM_PROMPT: &str = r#"# Organization Extraction

You read an email body and identify the organization the sender writes on
behalf of, if any: a company name in the signature, letterhead text, or an
explicit "from <company>" introduction. Return org_name null when no
organization is identifiable. Never return the recipient's organization."#;

#[derive(Debug, Deserialize, JsonSchema)]
struct SenderNameResponse {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    first: Option<String>,
    #[serde(default)]
    last: Option<String>,
    confidence: f32,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct OrgResponse {
    #[serde(default)]
    org_name: Option<String>,
}

/// Resolved sender identity used for the record and the ack greeting.
#[derive(Debug, Clone)]
pub struct SenderProfile {
    pub full_name: String,
    pub first: String,
    pub last: String,
    pub confidence: f32,
}

pub struct Extractors {
    llm: Arc<LlmClient>,
}

impl Extractors {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Resolve the sender's name. Never fails.
    pub async fn sender_profile(&self, ctx: &ContextRecord) -> SenderProfile {
        if self.llm.is_enabled() && !ctx.text_body.trim().is_empty() {
            let user_prompt = format!(
                "Extract the sender's name from this email body. Pay attention to the end, where signatures appear.\n\nEMAIL CONTENT:\n{}",
                ctx.text_body
            );
            match self
                .llm
                .call_structured::<SenderNameResponse>(
                    "sender_name",
                    NAME_SYSTEM_PROMPT,
                    &user_prompt,
                )
                .await
            {
                Ok(response) => {
                    if let Some(profile) = profile_from_response(response) {
                        debug!(
                            "sender name extracted '{}' (confidence {:.2})",
                            profile.full_name, profile.confidence
                        );
                        return profile;
                    }
                }
                Err(err) => warn!("sender name extraction failed ({}), using fallback", err),
            }
        }
        fallback_profile(ctx)
    }

    /// Resolve the sender's organization, or empty. Never fails.
    pub async fn organization(&self, ctx: &ContextRecord) -> String {
        if self.llm.is_enabled() && !ctx.text_body.trim().is_empty() {
            let user_prompt = format!(
                "Identify the sender's organization in this email body, if any.\n\nEMAIL CONTENT:\n{}",
                ctx.text_body
            );
            match self
                .llm
                .call_structured::<OrgResponse>("org_name", ORG_SYSTEM_PROMPT, &user_prompt)
                .await
            {
                Ok(response) => {
                    return response
                        .org_name
                        .map(|name| name.trim().to_string())
                        .unwrap_or_default();
                }
                Err(err) => warn!("organization extraction failed ({}), using fallback", err),
            }
        }
        String::new()
    }
}

fn profile_from_response(response: SenderNameResponse) -> Option<SenderProfile> {
    let full_name = response.full_name?.trim().to_string();
    if full_name.is_empty() {
        return None;
    }
    let mut first = response.first.unwrap_or_default().trim().to_string();
    let mut last = response.last.unwrap_or_default().trim().to_string();
    if first.is_empty() && last.is_empty() {
        let mut words = full_name.split_whitespace();
        first = words.next().unwrap_or_default().to_string();
        last = words.last().unwrap_or_default().to_string();
    }
    Some(SenderProfile {
        full_name,
        first,
        last,
        confidence: response.confidence.clamp(0.0, 1.0),
    })
}

/// Deterministic fallback: envelope display name, else the local part of the
/// address split on `.`/`_` and title-cased.
pub fn fallback_profile(ctx: &ContextRecord) -> SenderProfile {
    if let Some(display) = ctx.display_name() {
        let mut words = display.split_whitespace();
        let first = words.next().unwrap_or_default().to_string();
        let last = words.last().unwrap_or_default().to_string();
        return SenderProfile {
            full_name: display,
            first,
            last,
            confidence: DISPLAY_NAME_CONFIDENCE,
        };
    }

    let local = ctx.from_addr.split('@').next().unwrap_or("");
    let words: Vec<String> = local
        .split(['.', '_'])
        .filter(|word| !word.is_empty())
        .map(title_case)
        .collect();
    let full_name = words.join(" ");
    let first = words.first().cloned().unwrap_or_default();
    let last = if words.len() > 1 {
        words.last().cloned().unwrap_or_default()
    } else {
        String::new()
    };
    SenderProfile {
        full_name,
        first,
        last,
        confidence: LOCAL_PART_CONFIDENCE,
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(head) => head.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}
