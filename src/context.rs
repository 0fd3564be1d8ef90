//! Context Record construction.
//!
//! One context record is built per webhook call from the decoded field map
//! and carried through the whole pipeline. It is discarded when processing
//! ends; nothing in here is persisted directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ticket::TicketId;

/// Sentinel used when no Message-Id header can be recovered.
pub const MESSAGE_ID_UNKNOWN: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("required field '{0}' missing from payload")]
    MissingField(&'static str),
}

/// Which branch of the pipeline a message takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RoutePath {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "EXISTING")]
    Existing,
}

impl std::fmt::Display for RoutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutePath::New => write!(f, "NEW"),
            RoutePath::Existing => write!(f, "EXISTING"),
        }
    }
}

/// Coarse state label used for logging as the orchestrator advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Received,
    Decoded,
    ContextBuilt,
    DedupChecked,
    LoopChecked,
    Classified,
    TicketAllocated,
    Extracted,
    Stored,
    AckSent,
    StatusUpdated,
    RecordFetched,
    Parsed,
    Merged,
    Updated,
    Completed,
    Failed,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProcessingStatus::Received => "received",
            ProcessingStatus::Decoded => "decoded",
            ProcessingStatus::ContextBuilt => "context_built",
            ProcessingStatus::DedupChecked => "dedup_checked",
            ProcessingStatus::LoopChecked => "loop_checked",
            ProcessingStatus::Classified => "classified",
            ProcessingStatus::TicketAllocated => "ticket_allocated",
            ProcessingStatus::Extracted => "extracted",
            ProcessingStatus::Stored => "stored",
            ProcessingStatus::AckSent => "ack_sent",
            ProcessingStatus::StatusUpdated => "status_updated",
            ProcessingStatus::RecordFetched => "record_fetched",
            ProcessingStatus::Parsed => "parsed",
            ProcessingStatus::Merged => "merged",
            ProcessingStatus::Updated => "updated",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Canonical view of one inbound message, assembled from the wire fields.
#[derive(Debug, Clone)]
pub struct ContextRecord {
    pub subject: String,
    pub text_body: String,
    pub from_raw: String,
    pub from_addr: String,
    pub to_addr: String,
    pub headers_blob: String,
    pub message_id: String,
    pub spf: String,
    pub dkim: String,
    pub sender_ip: String,
    pub has_attachments: bool,
    pub attachment_count: u32,
    pub envelope_from: Option<String>,
    pub received_at: DateTime<Utc>,
    pub ticket_id: Option<TicketId>,
    pub path: Option<RoutePath>,
    pub processing_status: ProcessingStatus,
    /// Message id, or a generated UUID when the id is the unknown sentinel.
    pub correlation_id: String,
}

#[derive(Debug, Deserialize)]
struct EnvelopeField {
    #[serde(default)]
    #[allow(dead_code)]
    to: Vec<String>,
    #[serde(default)]
    from: Option<String>,
}

impl ContextRecord {
    /// Build a context record from the decoded multipart field map.
    ///
    /// `to` and `from` are required; everything else degrades to empty or
    /// zero values. When the plain-text body is blank the HTML body is used
    /// instead so that a formatted-only message still carries content.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, ContextError> {
        let to_raw = fields
            .get("to")
            .filter(|value| !value.trim().is_empty())
            .ok_or(ContextError::MissingField("to"))?;
        let from_raw = fields
            .get("from")
            .filter(|value| !value.trim().is_empty())
            .ok_or(ContextError::MissingField("from"))?
            .clone();

        let text = fields.get("text").map(String::as_str).unwrap_or("");
        let text_body = if text.trim().is_empty() {
            fields
                .get("html")
                .map(String::as_str)
                .unwrap_or("")
                .to_string()
        } else {
            text.to_string()
        };

        let headers_blob = fields.get("headers").cloned().unwrap_or_default();
        let message_id = extract_message_id(&headers_blob);
        let correlation_id = if message_id == MESSAGE_ID_UNKNOWN {
            Uuid::new_v4().to_string()
        } else {
            message_id.clone()
        };

        let attachment_count = fields
            .get("attachments")
            .and_then(|value| value.trim().parse::<u32>().ok())
            .unwrap_or(0);

        let envelope_from = fields
            .get("envelope")
            .and_then(|value| serde_json::from_str::<EnvelopeField>(value).ok())
            .and_then(|envelope| envelope.from)
            .map(|addr| addr.trim().to_ascii_lowercase())
            .filter(|addr| !addr.is_empty());

        Ok(ContextRecord {
            subject: fields.get("subject").cloned().unwrap_or_default(),
            text_body,
            from_addr: extract_addr_spec(&from_raw),
            from_raw,
            to_addr: extract_addr_spec(to_raw),
            headers_blob,
            message_id,
            spf: fields.get("SPF").cloned().unwrap_or_default(),
            dkim: fields.get("dkim").cloned().unwrap_or_default(),
            sender_ip: fields.get("sender_ip").cloned().unwrap_or_default(),
            has_attachments: attachment_count > 0,
            attachment_count,
            envelope_from,
            received_at: Utc::now(),
            ticket_id: None,
            path: None,
            processing_status: ProcessingStatus::Received,
            correlation_id,
        })
    }

    /// Display name carried in `from_raw`, if any ("John Smith <js@x>").
    pub fn display_name(&self) -> Option<String> {
        let raw = self.from_raw.trim();
        let open = raw.rfind('<')?;
        let name = raw[..open].trim().trim_matches('"').trim_matches('\'').trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    /// Raw value of the `Date:` header, if one is present in the blob.
    pub fn date_header(&self) -> Option<&str> {
        header_value(&self.headers_blob, "date")
    }
}

/// Pull the addr-spec out of a raw address: the last `<...>` pair wins,
/// otherwise the whole value with quotes stripped. Always lowercased.
pub fn extract_addr_spec(raw: &str) -> String {
    let raw = raw.trim();
    if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>')) {
        if open < close {
            return raw[open + 1..close].trim().to_ascii_lowercase();
        }
    }
    raw.trim_matches(|ch| matches!(ch, '"' | '\'' | ' '))
        .to_ascii_lowercase()
}

/// Case-insensitive scan of the headers blob for a `Message-Id:` value.
pub fn extract_message_id(headers: &str) -> String {
    match header_value(headers, "message-id") {
        Some(value) => {
            let trimmed = value.trim().trim_start_matches('<').trim_end_matches('>');
            if trimmed.is_empty() {
                MESSAGE_ID_UNKNOWN.to_string()
            } else {
                trimmed.to_string()
            }
        }
        None => MESSAGE_ID_UNKNOWN.to_string(),
    }
}

fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    for line in headers.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_addr_spec_from_display_form() {
        assert_eq!(
            extract_addr_spec("John Smith <JS@Client.Example>"),
            "js@client.example"
        );
        assert_eq!(extract_addr_spec("plain@addr.example"), "plain@addr.example");
        assert_eq!(extract_addr_spec("\"quoted@addr.example\""), "quoted@addr.example");
        assert_eq!(
            extract_addr_spec("Weird <first@x> <second@y.example>"),
            "second@y.example"
        );
    }

    #[test]
    fn message_id_scan_is_case_insensitive() {
        assert_eq!(
            extract_message_id("To: a@b\nMESSAGE-ID: <m1@client.example>\n"),
            "m1@client.example"
        );
        assert_eq!(
            extract_message_id("Message-Id: <m2@client.example>"),
            "m2@client.example"
        );
        assert_eq!(extract_message_id("To: a@b\n"), MESSAGE_ID_UNKNOWN);
    }

    #[test]
    fn builds_record_with_defaults() {
        let record = ContextRecord::from_fields(&fields(&[
            ("to", "advice@ops.example"),
            ("from", "John Smith <js@client.example>"),
            ("subject", "Holiday policy question"),
            ("text", "Hi team"),
            ("headers", "Message-Id: <m1@client.example>"),
        ]))
        .unwrap();
        assert_eq!(record.from_addr, "js@client.example");
        assert_eq!(record.to_addr, "advice@ops.example");
        assert_eq!(record.message_id, "m1@client.example");
        assert_eq!(record.correlation_id, "m1@client.example");
        assert!(!record.has_attachments);
        assert_eq!(record.display_name().as_deref(), Some("John Smith"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = ContextRecord::from_fields(&fields(&[("from", "a@b.example")]));
        assert!(matches!(err, Err(ContextError::MissingField("to"))));
    }

    #[test]
    fn html_body_backfills_empty_text() {
        let record = ContextRecord::from_fields(&fields(&[
            ("to", "advice@ops.example"),
            ("from", "a@b.example"),
            ("text", "  "),
            ("html", "<p>formatted only</p>"),
        ]))
        .unwrap();
        assert_eq!(record.text_body, "<p>formatted only</p>");
    }

    #[test]
    fn envelope_from_is_parsed_and_lowercased() {
        let record = ContextRecord::from_fields(&fields(&[
            ("to", "advice@ops.example"),
            ("from", "a@b.example"),
            (
                "envelope",
                r#"{"to":["advice@ops.example"],"from":"Bounce@Relay.Example"}"#,
            ),
        ]))
        .unwrap();
        assert_eq!(record.envelope_from.as_deref(), Some("bounce@relay.example"));
    }

    #[test]
    fn attachment_count_drives_flag() {
        let record = ContextRecord::from_fields(&fields(&[
            ("to", "a@b.example"),
            ("from", "c@d.example"),
            ("attachments", "3"),
        ]))
        .unwrap();
        assert!(record.has_attachments);
        assert_eq!(record.attachment_count, 3);
    }

    #[test]
    fn unknown_message_id_gets_generated_correlation_id() {
        let record = ContextRecord::from_fields(&fields(&[
            ("to", "a@b.example"),
            ("from", "c@d.example"),
        ]))
        .unwrap();
        assert_eq!(record.message_id, MESSAGE_ID_UNKNOWN);
        assert_ne!(record.correlation_id, MESSAGE_ID_UNKNOWN);
    }
}
