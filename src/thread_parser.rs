//! Conversation parser: decomposes a reply body into ordered entries.
//!
//! Email clients quote earlier messages on reply, so one inbound body often
//! carries the whole thread. The parser hands the body to the LLM with a
//! schema-constrained response; when that fails the whole body becomes a
//! single synthetic entry so no data is lost.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

use crate::context::ContextRecord;
use crate::conversation::{canonical_datetime, ConversationEntry};
use crate::llm::LlmClient;

const PARSER_SYSTEM_PROMPT: &str = r#"# Email Thread Parser

You decompose an email body into the individual messages of its thread.

## What to extract
One entry per message, oldest first:
- The newest (top) message written by the sender of this email is the final
  entry; its content must not include any quoted material
- Each distinct quoted or forwarded block becomes its own earlier entry with
  the quote markers ("> ", ">>", "On ... wrote:", "-----Original
  Message-----", "From:/Sent:/To:/Subject:" blocks) stripped from the content
- Signatures and legal disclaimers are not content

## Fields
- sender_email: the addr-spec, lowercase; only when no real address can be
  recovered for a quoted block, synthesize name@unknown from the display name
- sender_name: display name when shown, otherwise your best reconstruction
- sender_datetime: as written in the quote header, normalized to
  DD/MM/YYYY HH:MM TZ when the pieces are recoverable; keep the original
  string when they are not
- content: the message text of that entry alone

If the body holds a single message with no recognizable quote boundaries,
return exactly one entry for it."#;

#[derive(Debug, Deserialize, JsonSchema)]
struct ThreadParseResponse {
    entries: Vec<EntryDraft>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EntryDraft {
    sender_email: String,
    #[serde(default)]
    sender_name: String,
    #[serde(default)]
    sender_datetime: String,
    content: String,
}

pub struct ThreadParser {
    llm: Arc<LlmClient>,
    timezone: Tz,
}

impl ThreadParser {
    pub fn new(llm: Arc<LlmClient>, timezone: Tz) -> Self {
        Self { llm, timezone }
    }

    /// Parse the body of `ctx` into chronological entries.
    ///
    /// An empty body yields an empty list. Any LLM failure yields a single
    /// synthetic entry carrying the entire body, attributed to the envelope
    /// sender at the receive time.
    pub async fn parse(
        &self,
        ctx: &ContextRecord,
        existing_history: &[ConversationEntry],
    ) -> Vec<ConversationEntry> {
        if ctx.text_body.trim().is_empty() {
            return Vec::new();
        }

        if self.llm.is_enabled() {
            let user_prompt = build_user_prompt(ctx, existing_history);
            match self
                .llm
                .call_structured::<ThreadParseResponse>(
                    "thread_parse",
                    PARSER_SYSTEM_PROMPT,
                    &user_prompt,
                )
                .await
            {
                Ok(response) => {
                    let entries = finalize(response.entries);
                    if !entries.is_empty() {
                        info!("thread parser extracted {} entries", entries.len());
                        return entries;
                    }
                    warn!("thread parser returned no usable entries, using fallback entry");
                }
                Err(err) => {
                    warn!("thread parser llm call failed ({}), using fallback entry", err);
                }
            }
        }

        vec![self.fallback_entry(ctx)]
    }

    /// Single-entry degradation: the whole body as one message.
    fn fallback_entry(&self, ctx: &ContextRecord) -> ConversationEntry {
        ConversationEntry {
            sender_email: ctx.from_addr.clone(),
            sender_name: fallback_sender_name(ctx),
            sender_datetime: context_entry_datetime(ctx, &self.timezone),
            content: ctx.text_body.clone(),
            order: 1,
        }
    }
}

/// Canonical datetime for an entry built straight from the context record:
/// the `Date:` header when it parses, the receive instant otherwise.
pub fn context_entry_datetime(ctx: &ContextRecord, timezone: &Tz) -> String {
    if let Some(raw) = ctx.date_header() {
        if let Ok(parsed) = DateTime::parse_from_rfc2822(raw.trim()) {
            return canonical_datetime(parsed.with_timezone(&Utc), timezone);
        }
    }
    canonical_datetime(ctx.received_at, timezone)
}

/// Display name from the envelope, falling back to the address local part.
pub fn fallback_sender_name(ctx: &ContextRecord) -> String {
    if let Some(name) = ctx.display_name() {
        return name;
    }
    ctx.from_addr
        .split('@')
        .next()
        .unwrap_or(&ctx.from_addr)
        .to_string()
}

fn build_user_prompt(ctx: &ContextRecord, existing_history: &[ConversationEntry]) -> String {
    let mut prompt = format!(
        "EMAIL THREAD TO PARSE:\n\nFrom: {}\nTo: {}\nSubject: {}\nDate: {}\n\nBODY:\n{}\n",
        ctx.from_raw,
        ctx.to_addr,
        ctx.subject,
        ctx.date_header().unwrap_or("unknown"),
        ctx.text_body,
    );
    if !existing_history.is_empty() {
        if let Ok(history_json) = serde_json::to_string_pretty(existing_history) {
            prompt.push_str(&format!(
                "\nALREADY RECORDED ENTRIES (for date and sender context only):\n{}\n",
                history_json
            ));
        }
    }
    prompt
}

/// Drop unusable drafts, normalize addresses and assign positional order.
fn finalize(drafts: Vec<EntryDraft>) -> Vec<ConversationEntry> {
    let mut entries = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let sender_email = draft.sender_email.trim().to_ascii_lowercase();
        let content = draft.content.trim().to_string();
        if sender_email.is_empty() || content.is_empty() {
            continue;
        }
        let sender_name = if draft.sender_name.trim().is_empty() {
            sender_email
                .split('@')
                .next()
                .unwrap_or(&sender_email)
                .to_string()
        } else {
            draft.sender_name.trim().to_string()
        };
        entries.push(ConversationEntry {
            sender_email,
            sender_name,
            sender_datetime: draft.sender_datetime.trim().to_string(),
            content,
            order: entries.len() as u32 + 1,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmConfig;
    use std::collections::HashMap;
    use std::time::Duration;

    fn context(body: &str, headers: &str) -> ContextRecord {
        let mut fields = HashMap::new();
        fields.insert("to".to_string(), "advice@ops.example".to_string());
        fields.insert(
            "from".to_string(),
            "John Smith <js@client.example>".to_string(),
        );
        fields.insert("text".to_string(), body.to_string());
        fields.insert("headers".to_string(), headers.to_string());
        ContextRecord::from_fields(&fields).unwrap()
    }

    fn offline_parser() -> ThreadParser {
        let llm = Arc::new(LlmClient::new(LlmConfig {
            enabled: false,
            api_url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            model: "test".to_string(),
            deadline: Duration::from_secs(1),
        }));
        ThreadParser::new(llm, chrono_tz::Europe::London)
    }

    #[tokio::test]
    async fn empty_body_yields_no_entries() {
        let parser = offline_parser();
        let ctx = context("   ", "");
        assert!(parser.parse(&ctx, &[]).await.is_empty());
    }

    #[tokio::test]
    async fn offline_parse_degrades_to_single_entry() {
        let parser = offline_parser();
        let ctx = context("Just one message, no quotes.", "");
        let entries = parser.parse(&ctx, &[]).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender_email, "js@client.example");
        assert_eq!(entries[0].sender_name, "John Smith");
        assert_eq!(entries[0].content, "Just one message, no quotes.");
        assert_eq!(entries[0].order, 1);
    }

    #[tokio::test]
    async fn llm_entries_are_normalized_and_numbered() {
        let mut server = mockito::Server::new_async().await;
        let content = r#"{\"entries\":[{\"sender_email\":\"JS@Client.Example\",\"sender_name\":\"John Smith\",\"sender_datetime\":\"01/06/2025 14:02 BST\",\"content\":\"original question\"},{\"sender_email\":\"\",\"sender_name\":\"\",\"sender_datetime\":\"\",\"content\":\"dropped\"},{\"sender_email\":\"ops@desk.example\",\"sender_name\":\"\",\"sender_datetime\":\"02/06/2025 10:30 BST\",\"content\":\"the answer\"}]}"#;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"choices":[{{"message":{{"role":"assistant","content":"{content}"}}}}]}}"#
            ))
            .create_async()
            .await;

        let llm = Arc::new(LlmClient::new(LlmConfig {
            enabled: true,
            api_url: server.url(),
            api_key: Some("key".to_string()),
            model: "test".to_string(),
            deadline: Duration::from_secs(5),
        }));
        let parser = ThreadParser::new(llm, chrono_tz::Europe::London);
        let ctx = context("quoted thread here", "");
        let entries = parser.parse(&ctx, &[]).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sender_email, "js@client.example");
        assert_eq!(entries[0].order, 1);
        assert_eq!(entries[1].sender_name, "ops");
        assert_eq!(entries[1].order, 2);
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_single_entry() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let llm = Arc::new(LlmClient::new(LlmConfig {
            enabled: true,
            api_url: server.url(),
            api_key: Some("key".to_string()),
            model: "test".to_string(),
            deadline: Duration::from_secs(5),
        }));
        let parser = ThreadParser::new(llm, chrono_tz::Europe::London);
        let ctx = context("body survives the failure", "");
        let entries = parser.parse(&ctx, &[]).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "body survives the failure");
    }

    #[test]
    fn date_header_feeds_the_canonical_datetime() {
        let ctx = context(
            "hello",
            "Date: Sun, 01 Jun 2025 14:02:00 +0100\nMessage-Id: <m1@x>",
        );
        let rendered = context_entry_datetime(&ctx, &chrono_tz::Europe::London);
        assert!(rendered.starts_with("01/06/2025 14:02"));
        assert!(rendered.ends_with("BST"));
    }
}
