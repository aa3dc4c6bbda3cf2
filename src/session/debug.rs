//! Dev-only layer inspector.
//!
//! A read model over the most recent ActionLog rows that splits each step
//! into narrative layers (world, characters, plot, scene, action,
//! consequence, ending) and aggregates session-wide health counters:
//! fallback rate, intent mismatches, event turns, guard trips, dominant-route
//! streaks and stalled-recovery turns. Served only in `env=dev`; every other
//! environment gets `DEBUG_DISABLED`.

use serde_json::Value;

use crate::store::{ActionLogRow, MemoryStore, SessionStatus};
use crate::types::{Config, Env, Error, Result, SessionId};

const MAX_INSPECTOR_LIMIT: usize = 200;

/// A choice executed this many times in a row counts as a dominant route.
const DOMINANT_ROUTE_STREAK: usize = 3;

static NULL_VALUE: Value = Value::Null;

fn object_field<'a>(value: &'a Value, key: &str) -> &'a Value {
    match value.get(key) {
        Some(v @ Value::Object(_)) => v,
        _ => &NULL_VALUE,
    }
}

fn layer_debug_of(log: &ActionLogRow) -> &Value {
    object_field(&log.classification, "layer_debug")
}

fn flag(flags: &Value, key: &str) -> bool {
    flags.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn world_layer(state_after: &Value) -> Value {
    serde_json::json!({
        "day": state_after.get("day"),
        "slot": state_after.get("slot"),
        "energy": state_after.get("energy"),
        "money": state_after.get("money"),
        "knowledge": state_after.get("knowledge"),
        "affection": state_after.get("affection"),
    })
}

fn plot_layer(state_after: &Value, fallback_used: bool) -> Value {
    let run_state = object_field(state_after, "run_state");
    let quest_state = object_field(state_after, "quest_state");
    let active = quest_state
        .get("active_quests")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let completed = quest_state
        .get("completed_quests")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    serde_json::json!({
        "step_index": run_state.get("step_index"),
        "fallback_count": run_state.get("fallback_count"),
        "active_quests": active,
        "completed_quests": completed,
        "fallback_used": fallback_used,
    })
}

fn consequence_layer(log: &ActionLogRow, layer_debug: &Value, flags: &Value) -> Value {
    serde_json::json!({
        "state_delta_keypoints": log.state_delta.clone(),
        "matched_rules": log.matched_rules.clone(),
        "fallback_reason": layer_debug.get("fallback_reason"),
        "event_present": flag(flags, "event_present"),
        "all_blocked_guard_triggered": flag(flags, "all_blocked_guard_triggered"),
        "stall_guard_triggered": flag(flags, "stall_guard_triggered"),
    })
}

pub fn layer_inspector(
    store: &MemoryStore,
    config: &Config,
    session_id: &SessionId,
    limit: usize,
) -> Result<Value> {
    if config.env != Env::Dev {
        return Err(Error::DebugDisabled);
    }
    store.read(|data| {
        let session = data.session(session_id)?;
        let bounded_limit = limit.clamp(1, MAX_INSPECTOR_LIMIT);
        let logs = data.session_action_logs(session_id);
        let skip = logs.len().saturating_sub(bounded_limit);
        let window = &logs[skip..];

        let mut steps: Vec<Value> = Vec::with_capacity(window.len());
        let mut fallback_turns = 0usize;
        let mut mismatch_count = 0usize;
        let mut event_turns = 0usize;
        let mut guard_all_blocked_turns = 0usize;
        let mut guard_stall_turns = 0usize;
        let mut dominant_route_alerts = 0usize;
        let mut low_recovery_turns = 0usize;
        let mut latest_ending: Option<String> = None;

        let mut previous_fallback = false;
        let mut route_streak = 0usize;
        let mut last_choice: Option<String> = None;

        for (offset, log) in window.iter().enumerate() {
            let layer_debug = layer_debug_of(log);
            let flags = object_field(layer_debug, "quest_event_ending_flags");
            let prompt_policy = object_field(layer_debug, "prompt_policy");

            let fallback_used = flags
                .get("fallback_used")
                .and_then(Value::as_bool)
                .unwrap_or(log.fallback_used);
            if fallback_used {
                fallback_turns += 1;
                // Two fallback turns back to back mean the previous one did
                // not get the player moving again.
                if previous_fallback {
                    low_recovery_turns += 1;
                }
            }
            previous_fallback = fallback_used;

            let alignment = prompt_policy
                .get("intent_action_alignment")
                .and_then(Value::as_str)
                .unwrap_or("");
            if alignment.eq_ignore_ascii_case("mismatch") {
                mismatch_count += 1;
            }
            if flag(flags, "event_present") {
                event_turns += 1;
            }
            if flag(flags, "all_blocked_guard_triggered") {
                guard_all_blocked_turns += 1;
            }
            if flag(flags, "stall_guard_triggered") {
                guard_stall_turns += 1;
            }

            match (&last_choice, &log.story_choice_id) {
                (Some(last), Some(current)) if last == current => route_streak += 1,
                (_, Some(_)) => route_streak = 1,
                (_, None) => route_streak = 0,
            }
            last_choice = log.story_choice_id.clone();
            if route_streak >= DOMINANT_ROUTE_STREAK {
                dominant_route_alerts += 1;
            }

            if flag(flags, "run_ended") && latest_ending.is_none() {
                latest_ending = Some(
                    flags
                        .get("ending_id")
                        .and_then(Value::as_str)
                        .unwrap_or("ended")
                        .to_string(),
                );
            }

            let step_index = flags
                .get("step_index")
                .and_then(Value::as_u64)
                .or_else(|| {
                    object_field(&log.state_after, "run_state")
                        .get("step_index")
                        .and_then(Value::as_u64)
                })
                .unwrap_or((skip + offset + 1) as u64);

            steps.push(serde_json::json!({
                "step_index": step_index,
                "world_layer": world_layer(&log.state_after),
                "characters_layer": {
                    "affection": log.state_after.get("affection"),
                    "npc_count": object_field(&log.state_after, "npc_state")
                        .as_object()
                        .map(|m| m.len())
                        .unwrap_or(0),
                    "input_mode": layer_debug.get("input_mode"),
                },
                "plot_layer": plot_layer(&log.state_after, fallback_used),
                "scene_layer": {
                    "story_node_id": log.story_node_id.clone(),
                    "executed_choice_id": log.story_choice_id.clone(),
                    "resolved_choice_id": layer_debug.get("resolved_choice_id"),
                    "next_node_id": log.final_action.get("next_node_id"),
                },
                "action_layer": {
                    "input_mode": layer_debug.get("input_mode"),
                    "player_input": layer_debug.get("player_input"),
                    "attempted_choice_id": layer_debug.get("attempted_choice_id"),
                    "executed_choice_id": layer_debug.get("executed_choice_id"),
                    "resolved_choice_id": layer_debug.get("resolved_choice_id"),
                    "mapping_confidence": layer_debug.get("mapping_confidence"),
                    "fallback_reason": layer_debug.get("fallback_reason"),
                    "fallback_markers": layer_debug.get("fallback_markers"),
                    "intent_id": layer_debug.get("intent_id"),
                    "notes": layer_debug.get("notes"),
                },
                "consequence_layer": consequence_layer(log, layer_debug, flags),
                "ending_layer": {
                    "run_ended": flag(flags, "run_ended"),
                    "ending_id": flags.get("ending_id"),
                    "ending_outcome": flags.get("ending_outcome"),
                },
                "raw_refs": {
                    "action_log_id": log.id.to_string(),
                    "created_at": log.created_at.to_rfc3339(),
                },
            }));
        }

        // Newest first for the console, like the timeline views.
        steps.reverse();

        let total_steps = steps.len();
        let fallback_rate = if total_steps > 0 {
            fallback_turns as f64 / total_steps as f64
        } else {
            0.0
        };
        let ending_state = if session.status == SessionStatus::Ended {
            latest_ending.unwrap_or_else(|| "ended".to_string())
        } else {
            "in_progress".to_string()
        };

        Ok(serde_json::json!({
            "session_id": session.id.to_string(),
            "status": session.status.as_str(),
            "story_node_id": session.story_node_id.clone(),
            "steps": steps,
            "summary": {
                "fallback_rate": fallback_rate,
                "mismatch_count": mismatch_count,
                "event_turns": event_turns,
                "guard_all_blocked_turns": guard_all_blocked_turns,
                "guard_stall_turns": guard_stall_turns,
                "dominant_route_alerts": dominant_route_alerts,
                "low_recovery_turns": low_recovery_turns,
                "ending_state": ending_state,
            },
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionRow;
    use crate::types::ActionLogId;
    use chrono::Utc;

    fn seeded_store() -> (MemoryStore, SessionId) {
        let store = MemoryStore::new();
        let id = SessionId::new();
        store
            .transaction(|data| {
                data.sessions.insert(
                    id.clone(),
                    SessionRow {
                        id: id.clone(),
                        status: SessionStatus::Active,
                        story_id: Some("s1".to_string()),
                        story_version: Some(1),
                        story_node_id: Some("n1".to_string()),
                        state_json: serde_json::json!({}),
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    },
                );
                Ok(())
            })
            .unwrap();
        (store, id)
    }

    fn log_row(
        session_id: &SessionId,
        step_index: u64,
        choice: &str,
        fallback_used: bool,
        extra_flags: Value,
    ) -> ActionLogRow {
        let mut flags = serde_json::json!({
            "step_index": step_index,
            "fallback_used": fallback_used,
            "event_present": false,
            "all_blocked_guard_triggered": false,
            "stall_guard_triggered": false,
            "run_ended": false,
        });
        if let (Some(base), Some(extra)) = (flags.as_object_mut(), extra_flags.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        ActionLogRow {
            id: ActionLogId::new(),
            session_id: session_id.clone(),
            story_node_id: Some("n1".to_string()),
            story_choice_id: Some(choice.to_string()),
            player_input: String::new(),
            user_raw_input: None,
            proposed_action: serde_json::json!({}),
            final_action: serde_json::json!({"choice_id": choice, "next_node_id": "n2"}),
            fallback_used,
            fallback_reasons: vec![],
            action_confidence: None,
            key_decision: false,
            classification: serde_json::json!({
                "selection_source": "explicit",
                "layer_debug": {
                    "input_mode": "choice_click",
                    "executed_choice_id": choice,
                    "resolved_choice_id": choice,
                    "prompt_policy": {"intent_action_alignment": "aligned"},
                    "quest_event_ending_flags": flags,
                },
            }),
            state_before: serde_json::json!({}),
            state_after: serde_json::json!({
                "day": 1, "slot": "morning", "energy": 80, "money": 50,
                "knowledge": 0, "affection": 0,
                "run_state": {"step_index": step_index, "fallback_count": 0},
                "quest_state": {"active_quests": [], "completed_quests": []},
            }),
            state_delta: serde_json::json!({}),
            matched_rules: vec![],
            created_at: Utc::now() + chrono::Duration::milliseconds(step_index as i64),
        }
    }

    fn dev_config() -> Config {
        let mut config = Config::for_tests();
        config.env = Env::Dev;
        config
    }

    #[test]
    fn test_inspector_requires_dev_env() {
        let (store, id) = seeded_store();
        let config = Config::for_tests();
        let error = layer_inspector(&store, &config, &id, 10).unwrap_err();
        assert_eq!(error.code(), "DEBUG_DISABLED");
        assert_eq!(error.http_status(), 404);
    }

    #[test]
    fn test_empty_session_has_zeroed_summary() {
        let (store, id) = seeded_store();
        let view = layer_inspector(&store, &dev_config(), &id, 10).unwrap();
        assert!(view["steps"].as_array().unwrap().is_empty());
        let summary = &view["summary"];
        assert_eq!(summary["fallback_rate"], 0.0);
        assert_eq!(summary["mismatch_count"], 0);
        assert_eq!(summary["event_turns"], 0);
        assert_eq!(summary["ending_state"], "in_progress");
    }

    #[test]
    fn test_steps_are_layered_and_newest_first() {
        let (store, id) = seeded_store();
        store
            .transaction(|data| {
                data.action_logs.push(log_row(&id, 1, "c1", false, serde_json::json!({})));
                data.action_logs.push(log_row(&id, 2, "c3", false, serde_json::json!({})));
                Ok(())
            })
            .unwrap();

        let view = layer_inspector(&store, &dev_config(), &id, 10).unwrap();
        let steps = view["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["step_index"], 2);
        assert_eq!(steps[1]["step_index"], 1);

        let latest = &steps[0];
        for layer in [
            "world_layer",
            "characters_layer",
            "plot_layer",
            "scene_layer",
            "action_layer",
            "consequence_layer",
            "ending_layer",
        ] {
            assert!(latest.get(layer).is_some(), "missing layer '{layer}'");
        }
        assert_eq!(latest["world_layer"]["energy"], 80);
        assert_eq!(latest["scene_layer"]["executed_choice_id"], "c3");
        assert_eq!(latest["scene_layer"]["next_node_id"], "n2");
        assert_eq!(latest["action_layer"]["input_mode"], "choice_click");
        assert!(!latest["ending_layer"]["run_ended"].as_bool().unwrap());
    }

    #[test]
    fn test_summary_aggregates_guard_and_event_turns() {
        let (store, id) = seeded_store();
        store
            .transaction(|data| {
                data.action_logs.push(log_row(
                    &id,
                    1,
                    "__fallback__",
                    true,
                    serde_json::json!({
                        "all_blocked_guard_triggered": true,
                        "stall_guard_triggered": true,
                    }),
                ));
                data.action_logs.push(log_row(
                    &id,
                    2,
                    "__fallback__",
                    true,
                    serde_json::json!({"stall_guard_triggered": true}),
                ));
                data.action_logs.push(log_row(
                    &id,
                    3,
                    "c1",
                    false,
                    serde_json::json!({"event_present": true}),
                ));
                Ok(())
            })
            .unwrap();

        let summary = layer_inspector(&store, &dev_config(), &id, 10).unwrap()["summary"].clone();
        assert_eq!(summary["guard_all_blocked_turns"], 1);
        assert_eq!(summary["guard_stall_turns"], 2);
        assert_eq!(summary["event_turns"], 1);
        // second consecutive fallback counts as a failed recovery
        assert_eq!(summary["low_recovery_turns"], 1);
        let rate = summary["fallback_rate"].as_f64().unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_dominant_route_streak_alerts() {
        let (store, id) = seeded_store();
        store
            .transaction(|data| {
                for step in 1..=4 {
                    data.action_logs.push(log_row(&id, step, "c1", false, serde_json::json!({})));
                }
                Ok(())
            })
            .unwrap();
        let summary = layer_inspector(&store, &dev_config(), &id, 10).unwrap()["summary"].clone();
        // streak reaches 3 at step 3 and stays dominant at step 4
        assert_eq!(summary["dominant_route_alerts"], 2);
    }

    #[test]
    fn test_ended_session_reports_ending_state() {
        let (store, id) = seeded_store();
        store
            .transaction(|data| {
                data.action_logs.push(log_row(
                    &id,
                    1,
                    "c1",
                    false,
                    serde_json::json!({"run_ended": true, "ending_id": "ending_success"}),
                ));
                data.session_mut(&id)?.status = SessionStatus::Ended;
                Ok(())
            })
            .unwrap();
        let view = layer_inspector(&store, &dev_config(), &id, 10).unwrap();
        assert_eq!(view["summary"]["ending_state"], "ending_success");
    }

    #[test]
    fn test_limit_bounds_the_window() {
        let (store, id) = seeded_store();
        store
            .transaction(|data| {
                for step in 1..=5 {
                    data.action_logs.push(log_row(&id, step, "c1", false, serde_json::json!({})));
                }
                Ok(())
            })
            .unwrap();
        let view = layer_inspector(&store, &dev_config(), &id, 2).unwrap();
        let steps = view["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        // most recent two steps, newest first
        assert_eq!(steps[0]["step_index"], 5);
        assert_eq!(steps[1]["step_index"], 4);
    }
}
