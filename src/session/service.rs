//! Session service operations: create, read, snapshot, rollback, end,
//! replay, publish and the idempotency-guarded step entry point.

use chrono::Utc;
use serde_json::Value;

use crate::engine::quest::init_quest_state;
use crate::engine::resolver::StepRequest;
use crate::llm::{LlmTransport, StageEmitter};
use crate::pack::normalize_pack_for_runtime;
use crate::replay;
use crate::session::idempotency::{self, Reservation};
use crate::session::pipeline::{self, CurrentNodeView, StepResponse};
use crate::state::{
    deep_merge, default_initial_state, normalize_state, story_choices_for_response,
};
use crate::store::{
    MemoryStore, ReplayReportRow, SessionRow, SessionStatus, SnapshotRow, StoreData, StoryRow,
};
use crate::types::{Config, Error, ReportId, Result, SessionId, SnapshotId};

/// Reply to `create_session`.
#[derive(Debug, Clone)]
pub struct SessionCreated {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub story_id: String,
    pub story_version: u32,
    pub story_node_id: String,
    pub state_json: Value,
    pub current_node: Option<CurrentNodeView>,
}

/// Full session view returned by `get_session`.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub story_id: Option<String>,
    pub story_version: Option<u32>,
    pub current_node_id: Option<String>,
    pub state_json: Value,
    pub current_node: Option<CurrentNodeView>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Reply to `end_session`.
#[derive(Debug, Clone)]
pub struct SessionEnded {
    pub ended: bool,
    pub replay_report_id: ReportId,
}

/// Publish (or seed) a story version. Publishing keeps the at-most-one
/// published version invariant per story id.
pub fn publish_story(
    store: &MemoryStore,
    story_id: &str,
    version: u32,
    pack_json: Value,
    is_published: bool,
) -> Result<()> {
    store.transaction(|data| {
        data.put_story(StoryRow {
            story_id: story_id.to_string(),
            version,
            is_published,
            pack_json: pack_json.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    })
}

pub fn create_session(
    store: &MemoryStore,
    story_id: &str,
    version: Option<u32>,
) -> Result<SessionCreated> {
    let story_id = story_id.trim();
    if story_id.is_empty() {
        return Err(Error::StoryRequired);
    }
    store.transaction(|data| {
        let story = data.story(story_id, version)?.clone();
        let pack = normalize_pack_for_runtime(&story.pack_json)?;
        let start_node_id = pack.start_node_id.trim().to_string();
        if start_node_id.is_empty() || pack.node(&start_node_id).is_none() {
            return Err(Error::InvalidStoryStartNode(start_node_id));
        }

        let mut initial = serde_json::to_value(default_initial_state())?;
        if let Some(overlay) = &pack.initial_state {
            initial = deep_merge(&initial, overlay);
        }
        let mut state = normalize_state(&initial);
        state.quest_state = init_quest_state(&pack.quests);

        let now = Utc::now();
        let state_json = serde_json::to_value(&state)?;
        let row = SessionRow {
            id: SessionId::new(),
            status: SessionStatus::Active,
            story_id: Some(story.story_id.clone()),
            story_version: Some(story.version),
            story_node_id: Some(start_node_id.clone()),
            state_json: state_json.clone(),
            created_at: now,
            updated_at: now,
        };
        let session_id = row.id.clone();
        data.sessions.insert(session_id.clone(), row);

        let current_node = pack.node(&start_node_id).map(|node| CurrentNodeView {
            id: node.node_id.clone(),
            title: node.title.clone(),
            scene_brief: node.scene_brief.clone(),
            choices: story_choices_for_response(node, &state),
        });

        tracing::info!(%session_id, story_id, version = story.version, "session created");
        Ok(SessionCreated {
            session_id,
            status: SessionStatus::Active,
            story_id: story.story_id,
            story_version: story.version,
            story_node_id: start_node_id,
            state_json,
            current_node,
        })
    })
}

pub fn get_session(store: &MemoryStore, session_id: &SessionId) -> Result<SessionView> {
    store.read(|data| {
        let session = data.session(session_id)?;
        let state = normalize_state(&session.state_json);
        let current_node = match (&session.story_id, &session.story_node_id) {
            (Some(story_id), Some(node_id)) => data
                .story(story_id, session.story_version)
                .ok()
                .and_then(|story| normalize_pack_for_runtime(&story.pack_json).ok())
                .and_then(|pack| {
                    pack.node(node_id).map(|node| CurrentNodeView {
                        id: node.node_id.clone(),
                        title: node.title.clone(),
                        scene_brief: node.scene_brief.clone(),
                        choices: story_choices_for_response(node, &state),
                    })
                }),
            _ => None,
        };
        Ok(SessionView {
            session_id: session.id.clone(),
            status: session.status,
            story_id: session.story_id.clone(),
            story_version: session.story_version,
            current_node_id: session.story_node_id.clone(),
            state_json: serde_json::to_value(&state)?,
            current_node,
            created_at: session.created_at,
            updated_at: session.updated_at,
        })
    })
}

/// Guarded step entry point. With an idempotency key this is the two-phase
/// flow of the guard; without one, a single transaction around the pipeline.
pub fn step_session(
    store: &MemoryStore,
    transport: &LlmTransport,
    config: &Config,
    session_id: &SessionId,
    choice_id: Option<&str>,
    player_input: Option<&str>,
    idempotency_key: Option<&str>,
    emitter: &dyn StageEmitter,
) -> Result<StepResponse> {
    let normalized_choice = idempotency::normalized_optional_text(choice_id);
    let normalized_input = idempotency::normalized_optional_text(player_input);
    let normalized_key = idempotency::normalized_optional_text(idempotency_key);
    let request = StepRequest::from_parts(normalized_choice.as_deref(), normalized_input.as_deref())
        .ok_or(Error::InputConflict)?;

    let Some(key) = normalized_key else {
        return store.transaction(|data| {
            pipeline::run_step(data, session_id, &request, player_input, transport, config, emitter)
        });
    };

    let hash = idempotency::request_hash(normalized_choice.as_deref(), normalized_input.as_deref());

    // Phase one: reserve the key or replay the stored success.
    let reservation = store.transaction(|data| {
        idempotency::reserve(data, session_id, &key, &hash, Utc::now(), &config.idempotency)
    })?;
    if let Reservation::Replay(stored) = reservation {
        return serde_json::from_value(stored).map_err(Error::from);
    }

    // Phase two: run the pipeline; settle the row either way.
    let outcome = store.transaction(|data| {
        let response = pipeline::run_step(
            data,
            session_id,
            &request,
            player_input,
            transport,
            config,
            emitter,
        )?;
        let payload = serde_json::to_value(&response)?;
        idempotency::mark_succeeded(
            data,
            session_id,
            &key,
            &hash,
            &payload,
            Utc::now(),
            &config.idempotency,
        );
        Ok(response)
    });

    if let Err(error) = &outcome {
        idempotency::persist_failed(store, session_id, &key, &hash, error.code(), &config.idempotency);
    }
    outcome
}

pub fn create_snapshot(store: &MemoryStore, session_id: &SessionId) -> Result<SnapshotId> {
    store.transaction(|data| {
        let session = data.session(session_id)?.clone();
        let cutoff = Utc::now();
        let action_log_ids: Vec<String> = data
            .session_action_logs(session_id)
            .iter()
            .map(|log| log.id.to_string())
            .collect();

        let payload = serde_json::json!({
            "session": {
                "status": session.status.as_str(),
                "story_node_id": session.story_node_id,
                "state_json": normalize_state(&session.state_json),
            },
            "action_log_ids": action_log_ids,
            "cutoff_ts": cutoff.to_rfc3339(),
        });

        let snapshot = SnapshotRow {
            id: SnapshotId::new(),
            session_id: session_id.clone(),
            snapshot_name: "manual".to_string(),
            state_blob: payload,
            created_at: cutoff,
        };
        let snapshot_id = snapshot.id.clone();
        data.snapshots.insert(snapshot_id.clone(), snapshot);
        Ok(snapshot_id)
    })
}

/// Restore the session fields captured at snapshot time and prune every
/// ActionLog row whose id was not in the captured set.
pub fn rollback_to_snapshot(
    store: &MemoryStore,
    session_id: &SessionId,
    snapshot_id: &SnapshotId,
) -> Result<SessionView> {
    store.transaction(|data| {
        let snapshot = data.snapshot(snapshot_id)?.clone();
        if &snapshot.session_id != session_id {
            return Err(Error::not_found(format!("snapshot {snapshot_id}")));
        }
        let payload = &snapshot.state_blob;
        let captured = payload
            .get("session")
            .cloned()
            .ok_or_else(|| Error::internal("snapshot payload missing session"))?;

        let session = data.session_mut(session_id)?;
        session.status = match captured.get("status").and_then(Value::as_str) {
            Some("ended") => SessionStatus::Ended,
            _ => SessionStatus::Active,
        };
        session.story_node_id = captured
            .get("story_node_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let state = normalize_state(captured.get("state_json").unwrap_or(&Value::Null));
        session.state_json = serde_json::to_value(&state)?;
        session.updated_at = Utc::now();

        let keep: std::collections::HashSet<String> = payload
            .get("action_log_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        data.action_logs.retain(|log| {
            &log.session_id != session_id || keep.contains(&log.id.to_string())
        });
        Ok(())
    })?;
    get_session(store, session_id)
}

pub fn end_session(store: &MemoryStore, session_id: &SessionId) -> Result<SessionEnded> {
    store.transaction(|data| {
        let session = data.session_mut(session_id)?;
        session.status = SessionStatus::Ended;
        session.updated_at = Utc::now();

        let report = replay::build_report(data, session_id)?;
        let report_id = upsert_replay_report(data, session_id, report);
        tracing::info!(%session_id, "session ended");
        Ok(SessionEnded {
            ended: true,
            replay_report_id: report_id,
        })
    })
}

fn upsert_replay_report(data: &mut StoreData, session_id: &SessionId, report: Value) -> ReportId {
    match data.replay_reports.get_mut(session_id) {
        Some(existing) => {
            existing.report_json = report;
            existing.id.clone()
        }
        None => {
            let row = ReplayReportRow {
                id: ReportId::new(),
                session_id: session_id.clone(),
                report_json: report,
                created_at: Utc::now(),
            };
            let id = row.id.clone();
            data.replay_reports.insert(session_id.clone(), row);
            id
        }
    }
}

pub fn get_replay(store: &MemoryStore, session_id: &SessionId) -> Result<Value> {
    store.read(|data| {
        data.session(session_id)?;
        data.replay_reports
            .get(session_id)
            .map(|row| row.report_json.clone())
            .ok_or(Error::ReplayNotReady)
    })
}

/// Drop idempotency rows past their expiry. The embedding server schedules
/// this; nothing in the runtime calls it automatically.
pub fn sweep_expired_idempotency(store: &MemoryStore) -> Result<usize> {
    store.transaction(|data| Ok(data.sweep_expired_idempotency(Utc::now())))
}
