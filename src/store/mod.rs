//! Persisted rows and the transactional store facade.
//!
//! The runtime assumes a transactional key/value+JSON persistence service
//! with the tables modeled here. [`MemoryStore`] is the in-process reference
//! implementation; a database-backed store reuses the same row shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::{ActionLogId, Error, ReportId, Result, SessionId, SnapshotId};

mod memory;

pub use memory::MemoryStore;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

/// One run. Mutated only inside a step/rollback/end transaction.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: SessionId,
    pub status: SessionStatus,
    pub story_id: Option<String>,
    pub story_version: Option<u32>,
    pub story_node_id: Option<String>,
    pub state_json: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One authored story version. Shared, read-only for the runtime.
#[derive(Debug, Clone)]
pub struct StoryRow {
    pub story_id: String,
    pub version: u32,
    pub is_published: bool,
    pub pack_json: Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only per-step audit record.
#[derive(Debug, Clone)]
pub struct ActionLogRow {
    pub id: ActionLogId,
    pub session_id: SessionId,
    /// Node before executing the step.
    pub story_node_id: Option<String>,
    /// Executed choice id.
    pub story_choice_id: Option<String>,
    pub player_input: String,
    pub user_raw_input: Option<String>,
    pub proposed_action: Value,
    pub final_action: Value,
    pub fallback_used: bool,
    pub fallback_reasons: Vec<String>,
    pub action_confidence: Option<f64>,
    pub key_decision: bool,
    pub classification: Value,
    pub state_before: Value,
    pub state_after: Value,
    pub state_delta: Value,
    pub matched_rules: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time session capture used by rollback.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub id: SnapshotId,
    pub session_id: SessionId,
    pub snapshot_name: String,
    pub state_blob: Value,
    pub created_at: DateTime<Utc>,
}

/// Idempotency record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// Two-phase idempotency record keyed by `(session_id, idempotency_key)`.
#[derive(Debug, Clone)]
pub struct IdempotencyRow {
    pub session_id: SessionId,
    pub idempotency_key: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response_json: Option<Value>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Post-run summary, unique per session.
#[derive(Debug, Clone)]
pub struct ReplayReportRow {
    pub id: ReportId,
    pub session_id: SessionId,
    pub report_json: Value,
    pub created_at: DateTime<Utc>,
}

/// The full table set. Cloneable so a transaction can stage its writes and
/// throw them away on error.
#[derive(Debug, Clone, Default)]
pub struct StoreData {
    pub sessions: HashMap<SessionId, SessionRow>,
    pub stories: Vec<StoryRow>,
    pub action_logs: Vec<ActionLogRow>,
    pub snapshots: HashMap<SnapshotId, SnapshotRow>,
    pub idempotency: HashMap<(SessionId, String), IdempotencyRow>,
    pub replay_reports: HashMap<SessionId, ReplayReportRow>,
}

impl StoreData {
    pub fn session(&self, session_id: &SessionId) -> Result<&SessionRow> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))
    }

    pub fn session_mut(&mut self, session_id: &SessionId) -> Result<&mut SessionRow> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))
    }

    /// Fetch a story version; `None` selects the published version.
    pub fn story(&self, story_id: &str, version: Option<u32>) -> Result<&StoryRow> {
        let found = match version {
            Some(version) => self
                .stories
                .iter()
                .find(|s| s.story_id == story_id && s.version == version),
            None => self
                .stories
                .iter()
                .filter(|s| s.story_id == story_id && s.is_published)
                .max_by_key(|s| s.version),
        };
        found.ok_or_else(|| Error::StoryNotFound(story_id.to_string()))
    }

    /// Insert or replace a story version. Publishing one version unpublishes
    /// every other version of the same story id.
    pub fn put_story(&mut self, row: StoryRow) {
        if row.is_published {
            for existing in self
                .stories
                .iter_mut()
                .filter(|s| s.story_id == row.story_id)
            {
                existing.is_published = false;
            }
        }
        if let Some(existing) = self
            .stories
            .iter_mut()
            .find(|s| s.story_id == row.story_id && s.version == row.version)
        {
            *existing = row;
        } else {
            self.stories.push(row);
        }
    }

    /// Action logs of one session, oldest first. The sort is stable, so
    /// same-timestamp rows keep their append order.
    pub fn session_action_logs(&self, session_id: &SessionId) -> Vec<&ActionLogRow> {
        let mut logs: Vec<&ActionLogRow> = self
            .action_logs
            .iter()
            .filter(|log| &log.session_id == session_id)
            .collect();
        logs.sort_by_key(|log| log.created_at);
        logs
    }

    pub fn snapshot(&self, snapshot_id: &SnapshotId) -> Result<&SnapshotRow> {
        self.snapshots
            .get(snapshot_id)
            .ok_or_else(|| Error::not_found(format!("snapshot {snapshot_id}")))
    }

    pub fn idempotency_row(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Option<&IdempotencyRow> {
        self.idempotency
            .get(&(session_id.clone(), key.to_string()))
    }

    pub fn put_idempotency_row(&mut self, row: IdempotencyRow) {
        self.idempotency
            .insert((row.session_id.clone(), row.idempotency_key.clone()), row);
    }

    /// Drop idempotency rows past their expiry; returns how many went away.
    pub fn sweep_expired_idempotency(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.idempotency.len();
        self.idempotency.retain(|_, row| row.expires_at > now);
        before - self.idempotency.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(story_id: &str, version: u32, published: bool) -> StoryRow {
        StoryRow {
            story_id: story_id.to_string(),
            version,
            is_published: published,
            pack_json: Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_published_lookup_prefers_highest_published_version() {
        let mut data = StoreData::default();
        data.put_story(story("s1", 1, true));
        data.put_story(story("s1", 2, true));
        let found = data.story("s1", None).unwrap();
        assert_eq!(found.version, 2);
        // publishing v2 unpublished v1
        assert!(!data.stories.iter().any(|s| s.version == 1 && s.is_published));
    }

    #[test]
    fn test_version_lookup_ignores_published_flag() {
        let mut data = StoreData::default();
        data.put_story(story("s1", 1, false));
        assert_eq!(data.story("s1", Some(1)).unwrap().version, 1);
        assert!(data.story("s1", None).is_err());
    }

    #[test]
    fn test_unknown_story_is_story_not_found() {
        let data = StoreData::default();
        let error = data.story("ghost", None).unwrap_err();
        assert_eq!(error.code(), "STORY_NOT_FOUND");
    }

    #[test]
    fn test_sweep_expired_idempotency() {
        let mut data = StoreData::default();
        let session_id = SessionId::new();
        let now = Utc::now();
        data.put_idempotency_row(IdempotencyRow {
            session_id: session_id.clone(),
            idempotency_key: "old".to_string(),
            request_hash: "h".to_string(),
            status: IdempotencyStatus::Succeeded,
            response_json: None,
            error_code: None,
            created_at: now,
            updated_at: now,
            expires_at: now - chrono::Duration::seconds(1),
        });
        data.put_idempotency_row(IdempotencyRow {
            session_id: session_id.clone(),
            idempotency_key: "fresh".to_string(),
            request_hash: "h".to_string(),
            status: IdempotencyStatus::Succeeded,
            response_json: None,
            error_code: None,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::seconds(60),
        });
        assert_eq!(data.sweep_expired_idempotency(now), 1);
        assert!(data.idempotency_row(&session_id, "fresh").is_some());
    }
}
