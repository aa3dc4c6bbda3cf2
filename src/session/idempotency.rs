//! Step idempotency guard.
//!
//! Two-phase record keyed by `(session_id, idempotency_key)`: phase one
//! reserves the key (`in_progress`) or replays a stored success; phase two
//! settles it to `succeeded` or `failed`. The failed transition runs in its
//! own short transaction because it must survive the step rollback.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;

use crate::hashing::sha256_canonical;
use crate::store::{IdempotencyRow, IdempotencyStatus, MemoryStore, StoreData};
use crate::types::{Error, IdempotencyConfig, Result, SessionId};

/// Trim an optional text input; whitespace-only collapses to `None`.
pub fn normalized_optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Canonical request hash over the step payload.
pub fn request_hash(choice_id: Option<&str>, player_input: Option<&str>) -> String {
    let payload = serde_json::json!({
        "choice_id": choice_id,
        "player_input": player_input,
    });
    sha256_canonical(&payload)
}

fn expiry(now: DateTime<Utc>, config: &IdempotencyConfig) -> DateTime<Utc> {
    now + ChronoDuration::from_std(config.step_ttl).unwrap_or(ChronoDuration::seconds(86_400))
}

/// An `in_progress` row older than the stale window may be taken over.
pub fn is_stale_in_progress(
    row: &IdempotencyRow,
    now: DateTime<Utc>,
    config: &IdempotencyConfig,
) -> bool {
    let threshold =
        ChronoDuration::from_std(config.in_progress_stale).unwrap_or(ChronoDuration::seconds(60));
    now - row.updated_at > threshold
}

/// Phase-one outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// Key reserved; run the pipeline.
    Proceed,
    /// A stored success for the same payload; return it unchanged.
    Replay(Value),
}

/// Reserve the key inside the supplied transaction.
pub fn reserve(
    data: &mut StoreData,
    session_id: &SessionId,
    key: &str,
    hash: &str,
    now: DateTime<Utc>,
    config: &IdempotencyConfig,
) -> Result<Reservation> {
    data.session(session_id)?;
    match data.idempotency_row(session_id, key).cloned() {
        None => {
            data.put_idempotency_row(IdempotencyRow {
                session_id: session_id.clone(),
                idempotency_key: key.to_string(),
                request_hash: hash.to_string(),
                status: IdempotencyStatus::InProgress,
                response_json: None,
                error_code: None,
                created_at: now,
                updated_at: now,
                expires_at: expiry(now, config),
            });
            Ok(Reservation::Proceed)
        }
        Some(row) if row.request_hash != hash => Err(Error::IdempotencyKeyReused),
        Some(row) if row.status == IdempotencyStatus::Succeeded => match row.response_json {
            Some(response) => Ok(Reservation::Replay(response)),
            None => Ok(Reservation::Proceed),
        },
        Some(row)
            if row.status == IdempotencyStatus::InProgress
                && !is_stale_in_progress(&row, now, config) =>
        {
            Err(Error::RequestInProgress)
        }
        Some(mut row) => {
            // failed, or stale in_progress: take the key over.
            row.status = IdempotencyStatus::InProgress;
            row.error_code = None;
            row.updated_at = now;
            row.expires_at = expiry(now, config);
            data.put_idempotency_row(row);
            Ok(Reservation::Proceed)
        }
    }
}

/// Settle the row to `succeeded` with the stored response payload. Runs
/// inside the step transaction so the payload commits atomically with it.
pub fn mark_succeeded(
    data: &mut StoreData,
    session_id: &SessionId,
    key: &str,
    hash: &str,
    response: &Value,
    now: DateTime<Utc>,
    config: &IdempotencyConfig,
) {
    let Some(mut row) = data.idempotency_row(session_id, key).cloned() else {
        return;
    };
    if row.request_hash != hash {
        return;
    }
    row.status = IdempotencyStatus::Succeeded;
    row.response_json = Some(response.clone());
    row.error_code = None;
    row.updated_at = now;
    row.expires_at = expiry(now, config);
    data.put_idempotency_row(row);
}

/// Settle the row to `failed` in its own transaction, after the step
/// transaction has already rolled back.
pub fn persist_failed(
    store: &MemoryStore,
    session_id: &SessionId,
    key: &str,
    hash: &str,
    error_code: &str,
    config: &IdempotencyConfig,
) {
    let now = Utc::now();
    let result = store.transaction(|data| {
        match data.idempotency_row(session_id, key).cloned() {
            None => {
                data.put_idempotency_row(IdempotencyRow {
                    session_id: session_id.clone(),
                    idempotency_key: key.to_string(),
                    request_hash: hash.to_string(),
                    status: IdempotencyStatus::Failed,
                    response_json: None,
                    error_code: Some(error_code.to_string()),
                    created_at: now,
                    updated_at: now,
                    expires_at: expiry(now, config),
                });
            }
            Some(row) if row.request_hash != hash => {}
            Some(mut row) => {
                row.status = IdempotencyStatus::Failed;
                row.error_code = Some(error_code.to_string());
                row.updated_at = now;
                row.expires_at = expiry(now, config);
                data.put_idempotency_row(row);
            }
        }
        Ok(())
    });
    if let Err(error) = result {
        tracing::warn!(%error, "failed to persist idempotency failure");
    }
}
