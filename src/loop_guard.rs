//! Loop guard: keeps our own acknowledgments out of the pipeline.
//!
//! Recipients' mailboxes sometimes auto-forward our acknowledgment straight
//! back at the webhook. Without this check the EXISTING path would append
//! the ack to the ticket history and, worse, a NEW-path misclassification
//! would ack the ack.

use regex::Regex;
use tracing::info;

use crate::context::ContextRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCheck {
    Proceed,
    Ignore,
}

pub struct LoopGuard {
    outbound_addr: String,
    marker_phrase: String,
    ack_subject: Regex,
}

impl LoopGuard {
    pub fn new(
        outbound_addr: &str,
        prefix: &str,
        short_name: &str,
        marker_phrase: &str,
    ) -> Result<Self, regex::Error> {
        let ack_subject = Regex::new(&format!(
            r"(?i)\[{}-\d{{8}}-\d{{4}}\]\s+{}\s+-\s+Call Logged\s*$",
            regex::escape(prefix),
            regex::escape(short_name)
        ))?;
        Ok(Self {
            outbound_addr: outbound_addr.trim().to_ascii_lowercase(),
            marker_phrase: marker_phrase.to_string(),
            ack_subject,
        })
    }

    /// `Ignore` when the message is one of ours coming back: sender or
    /// envelope-from is the outbound mailbox, or the subject matches the ack
    /// template and the body carries the marker phrase.
    pub fn inspect(&self, ctx: &ContextRecord) -> LoopCheck {
        if ctx.from_addr == self.outbound_addr {
            info!("loop guard: sender is our outbound address");
            return LoopCheck::Ignore;
        }
        if ctx
            .envelope_from
            .as_deref()
            .is_some_and(|envelope_from| envelope_from == self.outbound_addr)
        {
            info!("loop guard: envelope-from is our outbound address");
            return LoopCheck::Ignore;
        }
        if self.ack_subject.is_match(&ctx.subject) && ctx.text_body.contains(&self.marker_phrase) {
            info!("loop guard: ack subject and marker phrase present");
            return LoopCheck::Ignore;
        }
        LoopCheck::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MARKER: &str = "We have received your enquiry and assigned it ticket number";

    fn guard() -> LoopGuard {
        LoopGuard::new("desk@ops.example", "ARG", "Support Desk", MARKER).unwrap()
    }

    fn context(from: &str, subject: &str, body: &str, envelope: Option<&str>) -> ContextRecord {
        let mut fields = HashMap::new();
        fields.insert("to".to_string(), "advice@ops.example".to_string());
        fields.insert("from".to_string(), from.to_string());
        fields.insert("subject".to_string(), subject.to_string());
        fields.insert("text".to_string(), body.to_string());
        if let Some(envelope_from) = envelope {
            fields.insert(
                "envelope".to_string(),
                format!(r#"{{"to":["advice@ops.example"],"from":"{envelope_from}"}}"#),
            );
        }
        ContextRecord::from_fields(&fields).unwrap()
    }

    #[test]
    fn own_sender_address_is_ignored() {
        let ctx = context("Desk <Desk@Ops.Example>", "anything", "anything", None);
        assert_eq!(guard().inspect(&ctx), LoopCheck::Ignore);
    }

    #[test]
    fn own_envelope_from_is_ignored() {
        let ctx = context(
            "forwarder@client.example",
            "anything",
            "anything",
            Some("desk@ops.example"),
        );
        assert_eq!(guard().inspect(&ctx), LoopCheck::Ignore);
    }

    #[test]
    fn ack_subject_with_marker_is_ignored() {
        let ctx = context(
            "forwarder@client.example",
            "[ARG-20250603-0001] Support Desk - Call Logged",
            format!("Hello,\n\n{} ARG-20250603-0001.", MARKER).as_str(),
            None,
        );
        assert_eq!(guard().inspect(&ctx), LoopCheck::Ignore);
    }

    #[test]
    fn ack_subject_without_marker_proceeds() {
        let ctx = context(
            "js@client.example",
            "[ARG-20250603-0001] Support Desk - Call Logged",
            "actually a human reply quoting our subject",
            None,
        );
        assert_eq!(guard().inspect(&ctx), LoopCheck::Proceed);
    }

    #[test]
    fn ordinary_reply_proceeds() {
        let ctx = context(
            "js@client.example",
            "Re: [ARG-20250603-0001] Holiday policy question",
            format!("thanks, {}", MARKER).as_str(),
            None,
        );
        assert_eq!(guard().inspect(&ctx), LoopCheck::Proceed);
    }
}
