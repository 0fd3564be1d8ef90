//! Adapter for the external table-oriented document store.
//!
//! All vendor specifics live here: the filter-by-formula query syntax, the
//! record envelope, the write rate ceiling and the retry policy. Callers see
//! find/list/create/update operations over [`TicketFields`] plus a typed
//! error taxonomy (transient, conflict, not-found, fatal) the orchestrator
//! maps to HTTP semantics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OwnedMutexGuard;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::conversation::ConversationEntry;
use crate::ticket::TicketId;

/// Attempts for transient failures, including the first.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_FACTOR: u32 = 2;
/// Longest a caller blocks waiting for a write slot.
const RATE_LIMIT_MAX_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("ticket {0} already has a record")]
    Conflict(String),
    #[error("no record for ticket {0}")]
    NotFound(String),
    #[error("store rejected the request ({status}): {body}")]
    Fatal { status: u16, body: String },
    #[error("timed out waiting for a store write slot")]
    RateLimited,
}

/// Ticket lifecycle states as persisted in `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    New,
    AwaitingClient,
    AwaitingAgent,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::AwaitingClient => "awaiting_client",
            TicketStatus::AwaitingAgent => "awaiting_agent",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }
}

/// Field map of one persistent ticket record, 1-to-1 with the store table.
/// `initial_entry` and `history` hold JSON-encoded conversation entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketFields {
    #[serde(default)]
    pub ticket_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub from_addr: String,
    #[serde(default)]
    pub sender_first: String,
    #[serde(default)]
    pub sender_last: String,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub initial_entry: String,
    #[serde(default)]
    pub history: String,
    #[serde(default)]
    pub raw_headers: String,
    #[serde(default)]
    pub ack_sent: bool,
    #[serde(default)]
    pub spf: String,
    #[serde(default)]
    pub dkim: String,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub attachment_count: u32,
}

impl TicketFields {
    pub fn history_entries(&self) -> Vec<ConversationEntry> {
        serde_json::from_str(&self.history).unwrap_or_default()
    }

    pub fn initial_entry_value(&self) -> Option<ConversationEntry> {
        serde_json::from_str(&self.initial_entry).ok()
    }
}

#[derive(Debug, Clone)]
pub struct StoredTicket {
    pub record_id: String,
    pub fields: TicketFields,
}

#[derive(Debug, Deserialize)]
struct RecordList {
    #[serde(default)]
    records: Vec<RecordResource>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordResource {
    id: String,
    #[serde(default)]
    fields: TicketFields,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub api_url: String,
    pub api_key: String,
    pub base_id: String,
    pub table: String,
    pub deadline: Duration,
    pub write_qps: u32,
}

pub struct TicketStore {
    config: StoreConfig,
    client: Client,
    write_gate: TokenBucket,
    ticket_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TicketStore {
    pub fn new(config: StoreConfig) -> Self {
        let client = Client::builder()
            .timeout(config.deadline)
            .build()
            .unwrap_or_else(|_| Client::new());
        let write_gate = TokenBucket::new(config.write_qps);
        Self {
            config,
            client,
            write_gate,
            ticket_locks: Mutex::new(HashMap::new()),
        }
    }

    fn table_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.base_id,
            self.config.table
        )
    }

    fn record_url(&self, record_id: &str) -> String {
        format!("{}/{}", self.table_url(), record_id)
    }

    pub async fn find_by_ticket(
        &self,
        ticket: &TicketId,
    ) -> Result<Option<StoredTicket>, StoreError> {
        self.find_raw(ticket.as_str()).await
    }

    async fn find_raw(&self, ticket_id: &str) -> Result<Option<StoredTicket>, StoreError> {
        let formula = format!("{{ticket_id}} = '{}'", ticket_id.replace('\'', ""));
        let value = self
            .request_with_retry(|| {
                self.client
                    .get(self.table_url())
                    .bearer_auth(&self.config.api_key)
                    .query(&[
                        ("filterByFormula", formula.as_str()),
                        ("maxRecords", "1"),
                    ])
            })
            .await?;
        let list: RecordList = parse_body(value)?;
        Ok(list
            .records
            .into_iter()
            .next()
            .map(|record| StoredTicket {
                record_id: record.id,
                fields: record.fields,
            }))
    }

    /// Ticket identifiers whose value starts with `prefix`, for the
    /// allocator. Pagination failures after the first page degrade to the
    /// identifiers gathered so far.
    pub async fn list_by_date_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let formula = format!("FIND('{}', {{ticket_id}}) = 1", prefix.replace('\'', ""));
        let mut ids: Vec<String> = Vec::new();
        let mut offset: Option<String> = None;
        loop {
            let mut query: Vec<(String, String)> =
                vec![("filterByFormula".to_string(), formula.clone())];
            if let Some(token) = offset.as_ref() {
                query.push(("offset".to_string(), token.clone()));
            }
            let result = self
                .request_with_retry(|| {
                    self.client
                        .get(self.table_url())
                        .bearer_auth(&self.config.api_key)
                        .query(&query)
                })
                .await;
            let value = match result {
                Ok(value) => value,
                Err(err) if !ids.is_empty() => {
                    warn!(
                        "prefix listing aborted mid-pagination with {} ids: {}",
                        ids.len(),
                        err
                    );
                    break;
                }
                Err(err) => return Err(err),
            };
            let list: RecordList = parse_body(value)?;
            ids.extend(
                list.records
                    .into_iter()
                    .map(|record| record.fields.ticket_id)
                    .filter(|id| !id.is_empty()),
            );
            match list.offset {
                Some(token) => offset = Some(token),
                None => break,
            }
        }
        debug!("prefix {} lists {} tickets", prefix, ids.len());
        Ok(ids)
    }

    /// Create one record with optimistic uniqueness on `ticket_id`: a racing
    /// writer that already stored this identifier surfaces as
    /// [`StoreError::Conflict`] so the allocator can retry.
    pub async fn create(&self, fields: &TicketFields) -> Result<String, StoreError> {
        if self.find_raw(&fields.ticket_id).await?.is_some() {
            return Err(StoreError::Conflict(fields.ticket_id.clone()));
        }
        self.write_gate.acquire(RATE_LIMIT_MAX_WAIT).await?;
        let payload = json!({"records": [{"fields": fields}]});
        let value = self
            .request_with_retry(|| {
                self.client
                    .post(self.table_url())
                    .bearer_auth(&self.config.api_key)
                    .json(&payload)
            })
            .await?;
        let list: RecordList = parse_body(value)?;
        list.records
            .into_iter()
            .next()
            .map(|record| record.id)
            .ok_or_else(|| StoreError::Fatal {
                status: 200,
                body: "create returned no record".to_string(),
            })
    }

    /// Partial update of one record.
    pub async fn update(&self, record_id: &str, patch: Value) -> Result<(), StoreError> {
        self.write_gate.acquire(RATE_LIMIT_MAX_WAIT).await?;
        let payload = json!({"fields": patch});
        self.request_with_retry(|| {
            self.client
                .patch(self.record_url(record_id))
                .bearer_auth(&self.config.api_key)
                .json(&payload)
        })
        .await?;
        Ok(())
    }

    /// Flip a single boolean field on the record for `ticket`.
    pub async fn update_flag(
        &self,
        ticket: &TicketId,
        field: &str,
        value: bool,
    ) -> Result<(), StoreError> {
        let record = self
            .find_by_ticket(ticket)
            .await?
            .ok_or_else(|| StoreError::NotFound(ticket.as_str().to_string()))?;
        self.update(&record.record_id, json!({ field: value })).await
    }

    /// Advisory in-process lock serializing read-modify-write sequences on
    /// one ticket. Concurrent updates to distinct tickets proceed in
    /// parallel; the guard releases on drop.
    pub async fn lock_ticket(&self, ticket: &TicketId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.ticket_locks.lock().expect("ticket lock map poisoned");
            locks
                .entry(ticket.as_str().to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// One cheap read, used by the startup healthcheck.
    pub async fn healthcheck(&self) -> Result<(), StoreError> {
        self.request_with_retry(|| {
            self.client
                .get(self.table_url())
                .bearer_auth(&self.config.api_key)
                .query(&[("maxRecords", "1")])
        })
        .await
        .map(|_| ())
    }

    async fn request_with_retry(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Value, StoreError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match execute(build()).await {
                Ok(value) => return Ok(value),
                Err(err @ StoreError::Transient(_)) if attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * RETRY_FACTOR.pow(attempt - 1);
                    warn!(
                        "store request failed ({}), retry {}/{} in {:?}",
                        err, attempt, MAX_ATTEMPTS, delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn execute(request: RequestBuilder) -> Result<Value, StoreError> {
    let response = request
        .send()
        .await
        .map_err(|err| StoreError::Transient(err.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return response
            .json::<Value>()
            .await
            .map_err(|err| StoreError::Transient(err.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(StoreError::Transient(format!("{}: {}", status, body)))
    } else {
        Err(StoreError::Fatal {
            status: status.as_u16(),
            body,
        })
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|err| StoreError::Fatal {
        status: 200,
        body: format!("unexpected store response shape: {}", err),
    })
}

/// Write rate gate: `write_qps` tokens refilled per second, callers block
/// until a token frees up or the wait budget runs out.
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: tokio::sync::Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(write_qps: u32) -> Self {
        let capacity = f64::from(write_qps.max(1));
        Self {
            capacity,
            refill_per_sec: capacity,
            state: tokio::sync::Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self, max_wait: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            if Instant::now() + wait > deadline {
                return Err(StoreError::RateLimited);
            }
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn store_config(url: &str) -> StoreConfig {
        StoreConfig {
            api_url: url.to_string(),
            api_key: "store-key".to_string(),
            base_id: "baseX".to_string(),
            table: "tickets".to_string(),
            deadline: Duration::from_secs(5),
            write_qps: 5,
        }
    }

    fn record_json(ticket_id: &str) -> String {
        format!(
            r#"{{"records":[{{"id":"rec1","fields":{{"ticket_id":"{ticket_id}","status":"new","history":"[]"}}}}]}}"#
        )
    }

    #[tokio::test]
    async fn find_returns_the_stored_record() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::UrlEncoded(
                "filterByFormula".into(),
                "{ticket_id} = 'ARG-20250603-0001'".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(record_json("ARG-20250603-0001"))
            .create_async()
            .await;

        let store = TicketStore::new(store_config(&server.url()));
        let ticket = TicketId::parse("ARG-20250603-0001").unwrap();
        let found = store.find_by_ticket(&ticket).await.unwrap().unwrap();
        assert_eq!(found.record_id, "rec1");
        assert_eq!(found.fields.ticket_id, "ARG-20250603-0001");
    }

    #[tokio::test]
    async fn find_miss_is_none() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"records":[]}"#)
            .create_async()
            .await;

        let store = TicketStore::new(store_config(&server.url()));
        let ticket = TicketId::parse("ARG-20250603-0001").unwrap();
        assert!(store.find_by_ticket(&ticket).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_fails_typed_on_existing_ticket() {
        let mut server = mockito::Server::new_async().await;
        let _find = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(record_json("ARG-20250603-0001"))
            .create_async()
            .await;

        let store = TicketStore::new(store_config(&server.url()));
        let fields = TicketFields {
            ticket_id: "ARG-20250603-0001".to_string(),
            ..TicketFields::default()
        };
        let err = store.create(&fields).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_posts_the_record() {
        let mut server = mockito::Server::new_async().await;
        let _find = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"records":[]}"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/baseX/tickets")
            .match_header("authorization", "Bearer store-key")
            .match_body(Matcher::Regex("ARG-20250603-0001".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(record_json("ARG-20250603-0001"))
            .expect(1)
            .create_async()
            .await;

        let store = TicketStore::new(store_config(&server.url()));
        let fields = TicketFields {
            ticket_id: "ARG-20250603-0001".to_string(),
            status: TicketStatus::New.as_str().to_string(),
            ..TicketFields::default()
        };
        let record_id = store.create(&fields).await.unwrap();
        assert_eq!(record_id, "rec1");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn update_flag_patches_the_looked_up_record() {
        let mut server = mockito::Server::new_async().await;
        let _find = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(record_json("ARG-20250603-0001"))
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/baseX/tickets/rec1")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "fields": {"ack_sent": true}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"rec1","fields":{"ack_sent":true}}"#)
            .expect(1)
            .create_async()
            .await;

        let store = TicketStore::new(store_config(&server.url()));
        let ticket = TicketId::parse("ARG-20250603-0001").unwrap();
        store.update_flag(&ticket, "ack_sent", true).await.unwrap();
        patch.assert_async().await;
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_retry_budget() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("bad gateway")
            .expect(3)
            .create_async()
            .await;

        let store = TicketStore::new(store_config(&server.url()));
        let ticket = TicketId::parse("ARG-20250603-0001").unwrap();
        let err = store.find_by_ticket(&ticket).await.unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_fatal_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body("forbidden")
            .expect(1)
            .create_async()
            .await;

        let store = TicketStore::new(store_config(&server.url()));
        let ticket = TicketId::parse("ARG-20250603-0001").unwrap();
        let err = store.find_by_ticket(&ticket).await.unwrap_err();
        assert!(matches!(err, StoreError::Fatal { status: 403, .. }));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn pagination_collects_every_page() {
        let mut server = mockito::Server::new_async().await;
        let _page1 = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::UrlEncoded(
                "filterByFormula".into(),
                "FIND('ARG-20250603-', {ticket_id}) = 1".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"records":[{"id":"r1","fields":{"ticket_id":"ARG-20250603-0001"}}],"offset":"page2"}"#,
            )
            .create_async()
            .await;
        let _page2 = server
            .mock("GET", "/baseX/tickets")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded(
                    "filterByFormula".into(),
                    "FIND('ARG-20250603-', {ticket_id}) = 1".into(),
                ),
                Matcher::UrlEncoded("offset".into(), "page2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"records":[{"id":"r2","fields":{"ticket_id":"ARG-20250603-0002"}}]}"#)
            .create_async()
            .await;

        let store = TicketStore::new(store_config(&server.url()));
        let ids = store.list_by_date_prefix("ARG-20250603-").await.unwrap();
        assert_eq!(ids, vec!["ARG-20250603-0001", "ARG-20250603-0002"]);
    }

    #[tokio::test]
    async fn token_bucket_delays_the_burst_overflow() {
        let bucket = TokenBucket::new(2);
        let started = Instant::now();
        bucket.acquire(Duration::from_secs(5)).await.unwrap();
        bucket.acquire(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        bucket.acquire(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn token_bucket_gives_up_past_the_wait_budget() {
        let bucket = TokenBucket::new(1);
        bucket.acquire(Duration::from_secs(5)).await.unwrap();
        let err = bucket.acquire(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, StoreError::RateLimited));
    }

    #[tokio::test]
    async fn distinct_tickets_lock_independently() {
        let store = Arc::new(TicketStore::new(store_config("http://127.0.0.1:1")));
        let a = TicketId::parse("ARG-20250603-0001").unwrap();
        let b = TicketId::parse("ARG-20250603-0002").unwrap();
        let guard_a = store.lock_ticket(&a).await;
        // A second ticket's lock must not block while the first is held.
        let guard_b = tokio::time::timeout(Duration::from_millis(100), store.lock_ticket(&b))
            .await
            .expect("independent lock should be immediate");
        drop(guard_a);
        drop(guard_b);
    }

    #[tokio::test]
    async fn same_ticket_lock_serializes() {
        let store = Arc::new(TicketStore::new(store_config("http://127.0.0.1:1")));
        let ticket = TicketId::parse("ARG-20250603-0001").unwrap();
        let guard = store.lock_ticket(&ticket).await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), store.lock_ticket(&ticket)).await;
        assert!(blocked.is_err(), "second lock should block while held");
        drop(guard);
        let _ = tokio::time::timeout(Duration::from_millis(100), store.lock_ticket(&ticket))
            .await
            .expect("lock should be free after release");
    }
}
