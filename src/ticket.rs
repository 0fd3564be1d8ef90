//! Ticket identifiers and the per-day allocator.

use std::sync::Arc;

use chrono::{Timelike, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{StoreError, TicketStore};

/// How many times the allocator re-validates a candidate before giving up
/// and deriving a sequence from the clock.
const MAX_ALLOCATION_RETRIES: u32 = 5;

/// A ticket identifier of the form `P-YYYYMMDD-NNNN`.
///
/// Two identifiers are equal iff they are byte-equal; the store enforces
/// global uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    pub fn format(prefix: &str, date: &str, seq: u32) -> Self {
        TicketId(format!("{}-{}-{:04}", prefix, date, seq))
    }

    /// Parse and canonicalize (uppercase) a candidate identifier.
    pub fn parse(raw: &str) -> Option<Self> {
        let candidate = raw.trim().to_ascii_uppercase();
        let mut parts = candidate.splitn(3, '-');
        let prefix = parts.next()?;
        let date = parts.next()?;
        let seq = parts.next()?;
        if prefix.is_empty() || !prefix.chars().all(|ch| ch.is_ascii_uppercase()) {
            return None;
        }
        if date.len() != 8 || !date.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        if seq.len() != 4 || !seq.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        Some(TicketId(candidate))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trailing `NNNN` sequence of an identifier, if it parses.
fn trailing_seq(ticket_id: &str) -> Option<u32> {
    ticket_id.rsplit('-').next()?.parse().ok()
}

/// Allocates new ticket identifiers against the store.
///
/// Stateless apart from store reads; concurrent allocators racing on the
/// same date converge through the validation retries, and an exhausted
/// retry budget falls back to a clock-derived sequence that the store-side
/// uniqueness check catches in the rare collision case.
pub struct TicketAllocator {
    store: Arc<TicketStore>,
    prefix: String,
    timezone: Tz,
}

impl TicketAllocator {
    pub fn new(store: Arc<TicketStore>, prefix: String, timezone: Tz) -> Self {
        Self {
            store,
            prefix,
            timezone,
        }
    }

    pub async fn allocate(&self) -> Result<TicketId, StoreError> {
        let now_local = Utc::now().with_timezone(&self.timezone);
        let date = now_local.format("%Y%m%d").to_string();
        let date_prefix = format!("{}-{}-", self.prefix, date);

        let existing = self.store.list_by_date_prefix(&date_prefix).await?;
        let max_seq = existing
            .iter()
            .filter_map(|id| trailing_seq(id))
            .max()
            .unwrap_or(0);

        let mut seq = max_seq + 1;
        for _ in 0..MAX_ALLOCATION_RETRIES {
            let candidate = TicketId::format(&self.prefix, &date, seq);
            match self.store.find_by_ticket(&candidate).await? {
                None => {
                    info!("allocated ticket {}", candidate);
                    return Ok(candidate);
                }
                Some(_) => {
                    warn!("ticket candidate {} already taken, retrying", candidate);
                    seq += 1;
                }
            }
        }

        let micros = u64::from(now_local.num_seconds_from_midnight()) * 1_000_000
            + u64::from(now_local.nanosecond() / 1_000);
        let fallback_seq = (micros % 10_000) as u32;
        let fallback = TicketId::format(&self.prefix, &date, fallback_seq);
        warn!(
            "ticket allocation exhausted {} retries, using time-derived {}",
            MAX_ALLOCATION_RETRIES, fallback
        );
        Ok(fallback)
    }
}
