//! Conversation entries and the merge engine.
//!
//! An entry is one attributable message inside a thread. Merging combines
//! freshly parsed entries with the stored history, deduplicating on a
//! fingerprint over the normalized `(sender, content)` pair and renumbering
//! into a contiguous chronological 1..N run.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::llm::LlmClient;

/// Hex characters kept from the fingerprint digest.
const FINGERPRINT_LEN: usize = 16;

const MERGE_SYSTEM_PROMPT: &str = r#"# Conversation Merge

You merge two JSON lists of email conversation entries into one.

## Rules
- Combine EXISTING and NEW entries into a single chronological list,
  oldest first
- Drop entries whose sender and content duplicate an entry already in the
  list, even when the quoting reformatted the text
- Keep sender_email, sender_name, sender_datetime and content exactly as
  they appear in the better-formed copy of each entry
- Number `order` from 1 upward with no gaps"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConversationEntry {
    /// Addr-spec of the author, lowercase.
    pub sender_email: String,
    /// Display name or best-effort reconstruction.
    pub sender_name: String,
    /// Human-facing canonical form `DD/MM/YYYY HH:MM TZ`.
    pub sender_datetime: String,
    /// Cleaned message text; quoted blocks belong to their own entries.
    pub content: String,
    /// 1-based ordinal within the thread, chronologically ascending.
    #[serde(default)]
    pub order: u32,
}

impl ConversationEntry {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.sender_email, &self.content)
    }
}

/// Collapse runs of whitespace to single spaces and trim.
pub fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fingerprint over `sender_email + "|" + normalized content`.
pub fn fingerprint(sender_email: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender_email.trim().to_ascii_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_content(content).as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(FINGERPRINT_LEN / 2)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Render an instant in the canonical entry form for the installation zone.
pub fn canonical_datetime(instant: DateTime<Utc>, timezone: &Tz) -> String {
    instant
        .with_timezone(timezone)
        .format("%d/%m/%Y %H:%M %Z")
        .to_string()
}

/// Parse the leading `DD/MM/YYYY HH:MM` of an entry datetime; RFC 2822 and
/// RFC 3339 strings (seen on entries built straight from headers) are
/// accepted too.
fn parse_entry_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Some(head) = raw.get(..16) {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(head, "%d/%m/%Y %H:%M") {
            return Some(parsed);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.naive_utc());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }
    None
}

/// Merge freshly parsed entries into the stored history.
///
/// Sort order: parsed datetime first; entries with unparseable dates inherit
/// the datetime of the nearest preceding parseable entry so block position
/// keeps them in place; input order breaks ties, fingerprint after that.
/// The result is renumbered 1..N.
pub fn merge_histories(
    existing: &[ConversationEntry],
    incoming: &[ConversationEntry],
) -> Vec<ConversationEntry> {
    let mut seen: HashSet<String> = existing.iter().map(ConversationEntry::fingerprint).collect();
    let mut combined: Vec<ConversationEntry> = existing.to_vec();
    for entry in incoming {
        if seen.insert(entry.fingerprint()) {
            combined.push(entry.clone());
        }
    }

    let mut keyed: Vec<(NaiveDateTime, usize, String, ConversationEntry)> =
        Vec::with_capacity(combined.len());
    let mut carried = NaiveDateTime::MIN;
    for (input_order, entry) in combined.into_iter().enumerate() {
        if let Some(parsed) = parse_entry_datetime(&entry.sender_datetime) {
            carried = parsed;
        }
        keyed.push((carried, input_order, entry.fingerprint(), entry));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    keyed
        .into_iter()
        .enumerate()
        .map(|(idx, (_, _, _, mut entry))| {
            entry.order = idx as u32 + 1;
            entry
        })
        .collect()
}

/// Normalized `(sender_email, sender_datetime, content)` triple. The stored
/// initial entry is not part of the history, so duplicate checks against it
/// compare the full triple, not just the fingerprint: a quoted copy of the
/// first message usually carries a reformatted date and must survive.
fn triple_key(entry: &ConversationEntry) -> (String, String, String) {
    (
        entry.sender_email.trim().to_ascii_lowercase(),
        normalize_content(&entry.sender_datetime),
        normalize_content(&entry.content),
    )
}

/// Remove entries whose full triple duplicates the initial entry, then
/// renumber so the run stays contiguous.
pub fn drop_initial_duplicates(
    entries: Vec<ConversationEntry>,
    initial: &ConversationEntry,
) -> Vec<ConversationEntry> {
    let initial_key = triple_key(initial);
    let mut kept: Vec<ConversationEntry> = entries
        .into_iter()
        .filter(|entry| triple_key(entry) != initial_key)
        .collect();
    for (idx, entry) in kept.iter_mut().enumerate() {
        entry.order = idx as u32 + 1;
    }
    kept
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MergeResponse {
    entries: Vec<ConversationEntry>,
}

/// Ask the LLM to merge. The result is accepted only if it is a non-empty,
/// fully attributed, duplicate-free entry list; anything else returns `None`
/// and the caller runs [`merge_histories`] instead.
pub async fn merge_with_llm(
    llm: &LlmClient,
    existing: &[ConversationEntry],
    incoming: &[ConversationEntry],
) -> Option<Vec<ConversationEntry>> {
    if !llm.is_enabled() {
        return None;
    }
    let user_prompt = format!(
        "EXISTING JSON:\n{}\n\nNEW JSON:\n{}",
        serde_json::to_string_pretty(existing).ok()?,
        serde_json::to_string_pretty(incoming).ok()?,
    );
    match llm
        .call_structured::<MergeResponse>("conversation_merge", MERGE_SYSTEM_PROMPT, &user_prompt)
        .await
    {
        Ok(response) => validate_merged(response.entries),
        Err(err) => {
            warn!("llm merge failed ({}), using deterministic merge", err);
            None
        }
    }
}

fn validate_merged(entries: Vec<ConversationEntry>) -> Option<Vec<ConversationEntry>> {
    if entries.is_empty() {
        return None;
    }
    if entries
        .iter()
        .any(|entry| entry.sender_email.trim().is_empty() || entry.content.trim().is_empty())
    {
        return None;
    }
    let mut seen = HashSet::new();
    if !entries.iter().all(|entry| seen.insert(entry.fingerprint())) {
        return None;
    }
    Some(
        entries
            .into_iter()
            .enumerate()
            .map(|(idx, mut entry)| {
                entry.order = idx as u32 + 1;
                entry
            })
            .collect(),
    )
}
