//! At-most-once claim of message identifiers.
//!
//! The gate is a process-wide concurrent set with a per-entry TTL. Expired
//! entries are swept lazily on each claim. A shared cache can replace this
//! for multi-process deployments without changing the contract, provided the
//! claim stays atomic.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::MESSAGE_ID_UNKNOWN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Accepted,
    Duplicate,
}

pub struct DedupGate {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically claim a message identifier.
    ///
    /// Exactly one concurrent caller presenting the same identifier sees
    /// [`Claim::Accepted`]; the unknown sentinel is always accepted because
    /// unknown identity is safer treated as a fresh arrival.
    pub fn claim(&self, message_id: &str) -> Claim {
        self.claim_at(message_id, Instant::now())
    }

    fn claim_at(&self, message_id: &str, now: Instant) -> Claim {
        if message_id == MESSAGE_ID_UNKNOWN {
            return Claim::Accepted;
        }
        let mut entries = self.entries.lock().expect("dedup gate poisoned");
        let before = entries.len();
        entries.retain(|_, claimed_at| now.duration_since(*claimed_at) < self.ttl);
        if entries.len() < before {
            debug!("dedup gate swept {} expired entries", before - entries.len());
        }
        if entries.contains_key(message_id) {
            Claim::Duplicate
        } else {
            entries.insert(message_id.to_string(), now);
            Claim::Accepted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_claim_is_duplicate() {
        let gate = DedupGate::new(Duration::from_secs(60));
        assert_eq!(gate.claim("m1@client.example"), Claim::Accepted);
        assert_eq!(gate.claim("m1@client.example"), Claim::Duplicate);
        assert_eq!(gate.claim("m2@client.example"), Claim::Accepted);
    }

    #[test]
    fn unknown_sentinel_is_always_accepted() {
        let gate = DedupGate::new(Duration::from_secs(60));
        assert_eq!(gate.claim(MESSAGE_ID_UNKNOWN), Claim::Accepted);
        assert_eq!(gate.claim(MESSAGE_ID_UNKNOWN), Claim::Accepted);
    }

    #[test]
    fn expired_entries_are_reclaimable() {
        let gate = DedupGate::new(Duration::from_millis(10));
        let start = Instant::now();
        assert_eq!(gate.claim_at("m1@client.example", start), Claim::Accepted);
        assert_eq!(gate.claim_at("m1@client.example", start), Claim::Duplicate);
        let later = start + Duration::from_millis(11);
        assert_eq!(gate.claim_at("m1@client.example", later), Claim::Accepted);
    }

    #[test]
    fn concurrent_claims_accept_exactly_one() {
        let gate = Arc::new(DedupGate::new(Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(std::thread::spawn(move || {
                gate.claim("race@client.example") == Claim::Accepted
            }));
        }
        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
    }
}
