//! The orchestrator: drives one webhook call through decode, dedup, loop
//! check, classification and the NEW or EXISTING path.
//!
//! This is the only place HTTP statuses are decided: 400 for unparseable
//! payloads, 5xx only when a NEW-path store write fails (so the gateway
//! redelivers and the dedup gate suppresses the double work), 200 for
//! everything else so the gateway does not redeliver.

use axum::http::StatusCode;
use chrono::Utc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::ack::{AckRequest, Priority};
use crate::context::{ContextRecord, ProcessingStatus, RoutePath};
use crate::conversation::{self, ConversationEntry};
use crate::dedupe::Claim;
use crate::loop_guard::LoopCheck;
use crate::multipart;
use crate::store::{StoreError, TicketFields, TicketStatus};
use crate::thread_parser;
use crate::ticket::TicketId;

use super::state::AppState;

/// Extra create attempts when an allocation races at the store.
const MAX_CREATE_ATTEMPTS: u32 = 3;

pub async fn process_inbound(
    state: &AppState,
    content_type: Option<&str>,
    body: &[u8],
) -> (StatusCode, String) {
    match timeout(state.config.request_deadline, run(state, content_type, body)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("request deadline exceeded, abandoning task");
            (StatusCode::OK, "deadline exceeded".to_string())
        }
    }
}

async fn run(state: &AppState, content_type: Option<&str>, body: &[u8]) -> (StatusCode, String) {
    let fields = match multipart::decode_form(body, content_type) {
        Ok(fields) => fields,
        Err(err) => {
            warn!("rejecting payload: {}", err);
            return (StatusCode::BAD_REQUEST, "unparseable payload".to_string());
        }
    };

    let mut ctx = match ContextRecord::from_fields(&fields) {
        Ok(ctx) => ctx,
        Err(err) => {
            warn!("rejecting payload: {}", err);
            return (StatusCode::BAD_REQUEST, err.to_string());
        }
    };
    ctx.processing_status = ProcessingStatus::Decoded;
    info!(
        "[{}] inbound from {} to {} subject '{}'",
        ctx.correlation_id, ctx.from_addr, ctx.to_addr, ctx.subject
    );
    ctx.processing_status = ProcessingStatus::ContextBuilt;

    if state.dedupe.claim(&ctx.message_id) == Claim::Duplicate {
        info!("[{}] duplicate message id, skipping", ctx.correlation_id);
        return (StatusCode::OK, "duplicate".to_string());
    }
    ctx.processing_status = ProcessingStatus::DedupChecked;

    if state.loop_guard.inspect(&ctx) == LoopCheck::Ignore {
        info!(
            "[{}] own acknowledgment forwarded back, ignoring",
            ctx.correlation_id
        );
        return (StatusCode::OK, "ignored".to_string());
    }
    ctx.processing_status = ProcessingStatus::LoopChecked;

    let classification = state.classifier.classify(&ctx.subject).await;
    ctx.path = Some(classification.path);
    ctx.ticket_id = classification.ticket_id.clone();
    ctx.processing_status = ProcessingStatus::Classified;
    info!(
        "[{}] classified {} (confidence {:.2})",
        ctx.correlation_id, classification.path, classification.confidence
    );

    match (classification.path, classification.ticket_id) {
        (RoutePath::Existing, Some(ticket)) => handle_existing(state, &mut ctx, ticket).await,
        _ => handle_new(state, &mut ctx).await,
    }
}

async fn handle_new(state: &AppState, ctx: &mut ContextRecord) -> (StatusCode, String) {
    let mut ticket = match state.allocator.allocate().await {
        Ok(ticket) => ticket,
        Err(err) => {
            error!("[{}] ticket allocation failed: {}", ctx.correlation_id, err);
            ctx.processing_status = ProcessingStatus::Failed;
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "store unavailable".to_string(),
            );
        }
    };
    ctx.ticket_id = Some(ticket.clone());
    ctx.processing_status = ProcessingStatus::TicketAllocated;

    let profile = state.extractors.sender_profile(ctx).await;
    let org_name = state.extractors.organization(ctx).await;
    ctx.processing_status = ProcessingStatus::Extracted;

    let sender_name = if profile.full_name.is_empty() {
        thread_parser::fallback_sender_name(ctx)
    } else {
        profile.full_name.clone()
    };
    let initial_entry = ConversationEntry {
        sender_email: ctx.from_addr.clone(),
        sender_name,
        sender_datetime: thread_parser::context_entry_datetime(ctx, &state.config.timezone),
        content: ctx.text_body.clone(),
        order: 1,
    };
    let now = Utc::now().to_rfc3339();
    let mut fields = TicketFields {
        ticket_id: ticket.as_str().to_string(),
        status: TicketStatus::New.as_str().to_string(),
        created_at: now.clone(),
        updated_at: now,
        subject: ctx.subject.clone(),
        body: ctx.text_body.clone(),
        from_addr: ctx.from_addr.clone(),
        sender_first: profile.first.clone(),
        sender_last: profile.last.clone(),
        org_name,
        initial_entry: serde_json::to_string(&initial_entry).unwrap_or_default(),
        history: "[]".to_string(),
        raw_headers: ctx.headers_blob.clone(),
        ack_sent: false,
        spf: ctx.spf.clone(),
        dkim: ctx.dkim.clone(),
        has_attachments: ctx.has_attachments,
        attachment_count: ctx.attachment_count,
    };

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match state.store.create(&fields).await {
            Ok(_record_id) => break,
            Err(StoreError::Conflict(taken)) if attempts < MAX_CREATE_ATTEMPTS => {
                warn!(
                    "[{}] ticket {} raced at the store, re-allocating",
                    ctx.correlation_id, taken
                );
                match state.allocator.allocate().await {
                    Ok(next) => {
                        ticket = next;
                        fields.ticket_id = ticket.as_str().to_string();
                        ctx.ticket_id = Some(ticket.clone());
                    }
                    Err(err) => {
                        error!("[{}] re-allocation failed: {}", ctx.correlation_id, err);
                        ctx.processing_status = ProcessingStatus::Failed;
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "store unavailable".to_string(),
                        );
                    }
                }
            }
            Err(err) => {
                error!(
                    "[{}] store create failed for {}: {}",
                    ctx.correlation_id, ticket, err
                );
                ctx.processing_status = ProcessingStatus::Failed;
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store write failed".to_string(),
                );
            }
        }
    }
    ctx.processing_status = ProcessingStatus::Stored;

    let ack_request = AckRequest {
        ticket_id: ticket.clone(),
        to_addr: ctx.from_addr.clone(),
        first_name: profile.first.clone(),
        name_confidence: profile.confidence,
        original_subject: ctx.subject.clone(),
        original_body: ctx.text_body.clone(),
        priority: Priority::default(),
    };
    match state.ack.send(&ack_request).await {
        Ok(()) => {
            ctx.processing_status = ProcessingStatus::AckSent;
            match state.store.update_flag(&ticket, "ack_sent", true).await {
                Ok(()) => ctx.processing_status = ProcessingStatus::StatusUpdated,
                Err(err) => warn!(
                    "[{}] ack_sent flag update failed for {}: {}",
                    ctx.correlation_id, ticket, err
                ),
            }
        }
        Err(err) => {
            // Non-critical: the record exists and stays discoverable; the
            // sender's replies arrive untied until reconciled.
            warn!(
                "[{}] acknowledgment not sent for {}: {}",
                ctx.correlation_id, ticket, err
            );
        }
    }

    ctx.processing_status = ProcessingStatus::Completed;
    info!("[{}] created ticket {}", ctx.correlation_id, ticket);
    (StatusCode::OK, format!("created {}", ticket))
}

async fn handle_existing(
    state: &AppState,
    ctx: &mut ContextRecord,
    ticket: TicketId,
) -> (StatusCode, String) {
    // Serialize the read-modify-write per ticket; distinct tickets proceed
    // in parallel.
    let _guard = state.store.lock_ticket(&ticket).await;

    let record = match state.store.find_by_ticket(&ticket).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(
                "[{}] no record for referenced ticket {}",
                ctx.correlation_id, ticket
            );
            return (StatusCode::OK, format!("no record for {}", ticket));
        }
        Err(err) => {
            // The webhook was already acknowledged conceptually; never 5xx
            // on the EXISTING path.
            warn!(
                "[{}] record fetch failed for {}: {}",
                ctx.correlation_id, ticket, err
            );
            return (StatusCode::OK, "store unavailable".to_string());
        }
    };
    ctx.processing_status = ProcessingStatus::RecordFetched;

    let existing_history = record.fields.history_entries();
    let parsed = state.thread_parser.parse(ctx, &existing_history).await;
    ctx.processing_status = ProcessingStatus::Parsed;
    info!(
        "[{}] parsed {} entries against {} stored",
        ctx.correlation_id,
        parsed.len(),
        existing_history.len()
    );

    let merged = if existing_history.is_empty() {
        conversation::merge_histories(&existing_history, &parsed)
    } else {
        match conversation::merge_with_llm(&state.llm, &existing_history, &parsed).await {
            Some(entries) => entries,
            None => conversation::merge_histories(&existing_history, &parsed),
        }
    };
    // The initial entry lives outside the history; an exact re-emission of
    // it must not be stored twice.
    let merged = match record.fields.initial_entry_value() {
        Some(initial) => conversation::drop_initial_duplicates(merged, &initial),
        None => merged,
    };
    ctx.processing_status = ProcessingStatus::Merged;

    let history_json = serde_json::to_string(&merged).unwrap_or_else(|_| "[]".to_string());
    let patch = serde_json::json!({
        "history": history_json,
        "raw_headers": ctx.headers_blob,
        "updated_at": Utc::now().to_rfc3339(),
    });
    if let Err(err) = state.store.update(&record.record_id, patch).await {
        warn!(
            "[{}] history update failed for {}: {}",
            ctx.correlation_id, ticket, err
        );
        return (StatusCode::OK, "update failed".to_string());
    }
    ctx.processing_status = ProcessingStatus::Updated;
    info!(
        "[{}] updated {} with {} entries",
        ctx.correlation_id,
        ticket,
        merged.len()
    );
    ctx.processing_status = ProcessingStatus::Completed;
    (
        StatusCode::OK,
        format!("updated {} ({} entries)", ticket, merged.len()),
    )
}
